//! The long-lived facilitator instance.
//!
//! One [`Facilitator`] is built at process start and shared by every request
//! handler. It owns the registry, the ledger (and with it the per-key locks)
//! and the settlement engine, so locking is effective across requests.

use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::U256;
use serde::Serialize;

use crate::chain::{ChainClient, NoChainClient};
use crate::clock::{Clock, SystemClock};
use crate::constants::{DEFAULT_CONFIRMATION_TIMEOUT_SECS, DEFAULT_MAX_TIMEOUT_SECS, X402_VERSION};
use crate::escrow_ledger::{EscrowAccount, EscrowKey, EscrowLedger, LedgerError};
use crate::escrow_store::{EscrowStore, InMemoryEscrowStore};
use crate::payment::PaymentRequest;
use crate::registry::{DeferredInfo, NetworkRegistry, RegistryError};
use crate::response::{SettleResponse, VerifyResponse};
use crate::scheme::Scheme;
use crate::settlement::SettlementEngine;
use crate::settlement_store::{InMemorySettlementStore, SettlementStore};
use crate::verification::VerificationEngine;
use crate::X402Error;

/// One `(scheme, network)` pair this facilitator can settle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SupportedKind {
    pub x402_version: u32,
    pub scheme: Scheme,
    pub network: String,
}

/// RPC liveness of one network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkHealth {
    pub network: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_number: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl NetworkHealth {
    pub fn is_healthy(&self) -> bool {
        self.error.is_none()
    }
}

pub struct FacilitatorBuilder {
    registry: Arc<NetworkRegistry>,
    chain: Arc<dyn ChainClient>,
    escrow_store: Arc<dyn EscrowStore>,
    settlement_store: Arc<dyn SettlementStore>,
    clock: Arc<dyn Clock>,
    confirmation_timeout: Duration,
    max_timeout_secs: u64,
}

impl FacilitatorBuilder {
    pub fn chain_client(mut self, chain: Arc<dyn ChainClient>) -> Self {
        self.chain = chain;
        self
    }

    pub fn escrow_store(mut self, store: Arc<dyn EscrowStore>) -> Self {
        self.escrow_store = store;
        self
    }

    pub fn settlement_store(mut self, store: Arc<dyn SettlementStore>) -> Self {
        self.settlement_store = store;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn confirmation_timeout(mut self, timeout: Duration) -> Self {
        self.confirmation_timeout = timeout;
        self
    }

    /// Cap on an exact authorization's validity window.
    pub fn max_timeout_secs(mut self, secs: u64) -> Self {
        self.max_timeout_secs = secs;
        self
    }

    pub fn build(self) -> Facilitator {
        let verifier = Arc::new(
            VerificationEngine::new(self.registry.clone(), self.clock.clone())
                .with_max_timeout(self.max_timeout_secs),
        );
        let ledger = Arc::new(EscrowLedger::new(
            self.registry.clone(),
            self.escrow_store,
            self.clock.clone(),
        ));
        let settlement = SettlementEngine::new(
            verifier.clone(),
            ledger.clone(),
            self.chain.clone(),
            self.settlement_store.clone(),
            self.clock.clone(),
            self.confirmation_timeout,
        );

        Facilitator {
            registry: self.registry,
            verifier,
            ledger,
            settlement,
            chain: self.chain,
            settlement_store: self.settlement_store,
            clock: self.clock,
        }
    }
}

pub struct Facilitator {
    registry: Arc<NetworkRegistry>,
    verifier: Arc<VerificationEngine>,
    ledger: Arc<EscrowLedger>,
    settlement: SettlementEngine,
    chain: Arc<dyn ChainClient>,
    settlement_store: Arc<dyn SettlementStore>,
    clock: Arc<dyn Clock>,
}

impl Facilitator {
    /// Start building a facilitator. Defaults: in-memory stores, the system
    /// clock and no chain access (deferred scheme only).
    pub fn builder(registry: Arc<NetworkRegistry>) -> FacilitatorBuilder {
        FacilitatorBuilder {
            registry,
            chain: Arc::new(NoChainClient),
            escrow_store: Arc::new(InMemoryEscrowStore::new()),
            settlement_store: Arc::new(InMemorySettlementStore::new()),
            clock: Arc::new(SystemClock),
            confirmation_timeout: Duration::from_secs(DEFAULT_CONFIRMATION_TIMEOUT_SECS),
            max_timeout_secs: DEFAULT_MAX_TIMEOUT_SECS,
        }
    }

    pub fn registry(&self) -> &NetworkRegistry {
        &self.registry
    }

    pub fn ledger(&self) -> &EscrowLedger {
        &self.ledger
    }

    pub fn verify(&self, request: &PaymentRequest) -> VerifyResponse {
        self.verifier.verify(request)
    }

    pub async fn settle(&self, request: &PaymentRequest) -> Result<SettleResponse, X402Error> {
        self.settlement.settle(request).await
    }

    pub fn deferred_info(&self, network: &str) -> Result<DeferredInfo, RegistryError> {
        let (config, _) = self.registry.resolve_deferred(network)?;
        Ok(config.deferred_info())
    }

    pub fn balance(&self, key: &EscrowKey) -> Result<EscrowAccount, LedgerError> {
        self.ledger.get_balance(key)
    }

    pub async fn deposit(&self, key: &EscrowKey, amount: U256) -> Result<EscrowAccount, LedgerError> {
        self.ledger.deposit(key, amount).await
    }

    /// Every `(scheme, network)` pair this instance can settle: exact where
    /// the chain client has an RPC for the network, deferred where an
    /// escrow is configured.
    pub fn supported(&self) -> Vec<SupportedKind> {
        let mut kinds = Vec::new();
        for network in self.registry.networks() {
            if self.chain.supports(&network.network_id) {
                kinds.push(SupportedKind {
                    x402_version: X402_VERSION,
                    scheme: Scheme::Exact,
                    network: network.network_id.clone(),
                });
            }
            if network.deferred_enabled() {
                kinds.push(SupportedKind {
                    x402_version: X402_VERSION,
                    scheme: Scheme::Deferred,
                    network: network.network_id.clone(),
                });
            }
        }
        kinds
    }

    /// Query the RPC of every network the chain client serves.
    pub async fn health_check(&self) -> Vec<NetworkHealth> {
        let mut out = Vec::new();
        for network in self.registry.networks() {
            if !self.chain.supports(&network.network_id) {
                continue;
            }
            let health = match self.chain.block_number(network).await {
                Ok(block) => NetworkHealth {
                    network: network.network_id.clone(),
                    block_number: Some(block),
                    error: None,
                },
                Err(e) => {
                    tracing::warn!(network = %network.network_id, error = %e, "health check failed");
                    NetworkHealth {
                        network: network.network_id.clone(),
                        block_number: None,
                        error: Some(e.to_string()),
                    }
                }
            };
            out.push(health);
        }
        out
    }

    /// Drop settlement records older than `retention_secs` and idle escrow
    /// key locks. Returns `(records, locks)` purged.
    pub fn purge(&self, retention_secs: u64) -> (usize, usize) {
        let records = self
            .settlement_store
            .purge_expired(self.clock.now(), retention_secs);
        let locks = self.ledger.purge_idle_locks();
        (records, locks)
    }

    /// Run [`Facilitator::purge`] every `interval` on the tokio runtime.
    pub fn start_cleanup(
        self: &Arc<Self>,
        interval: Duration,
        retention_secs: u64,
    ) -> tokio::task::JoinHandle<()> {
        let facilitator = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let (records, locks) = facilitator.purge(retention_secs);
                if records > 0 || locks > 0 {
                    tracing::info!(records, locks, "purged expired settlements and idle escrow locks");
                }
            }
        })
    }
}
