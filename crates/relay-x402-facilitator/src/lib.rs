//! x402 facilitator server: verifies payment proofs and settles them, either
//! on-chain (exact scheme, EIP-3009) or against the escrow ledger (deferred
//! scheme).
//!
//! Verification, settlement and the ledger live in the core [`x402`] crate;
//! this crate provides the HTTP server, configuration, bootstrap, metrics and
//! webhook notifications.
//!
//! # Modules
//!
//! - [`routes`]: HTTP endpoints (health, supported, verify, settle, deferred escrow, metrics)
//! - [`config`]: environment configuration
//! - [`bootstrap`]: builds the shared [`AppState`](state::AppState) from config
//! - [`webhook`]: SSRF-protected webhook notifications on settlement
//! - [`metrics`]: Prometheus metrics

pub mod bootstrap;
pub mod config;
pub mod metrics;
pub mod routes;
pub mod state;
pub mod webhook;
