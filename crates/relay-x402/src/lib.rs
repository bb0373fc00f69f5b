//! x402 facilitator core for a multi-chain payment relay.
//!
//! Verifies client-submitted payment proofs and settles them, for two schemes:
//!
//! - **exact**: an EIP-3009 `transferWithAuthorization` signed per request,
//!   broadcast by the facilitator and polled until confirmed
//! - **deferred**: a charge debited from a buyer's pre-funded escrow balance
//!   for a given seller and asset, subject to a per-network deposit cap and
//!   thaw period
//!
//! # Components
//!
//! - [`NetworkRegistry`]: immutable table of supported networks
//! - [`VerificationEngine`]: side-effect-free payload checks
//! - [`EscrowLedger`]: per-key serialized escrow balances
//! - [`SettlementEngine`]: the settlement state machine with idempotent replay
//! - [`Facilitator`]: the long-lived instance the HTTP layer is handed
//!
//! # Quick example (deferred)
//!
//! ```no_run
//! use std::sync::Arc;
//! use x402::{Facilitator, NetworkConfig, NetworkRegistry, KnownNetwork};
//! use alloy::primitives::{Address, U256};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let escrow: Address = "0x00000000000000000000000000000000000e5c20".parse().unwrap();
//! let registry = NetworkRegistry::new(vec![
//!     NetworkConfig::for_known(KnownNetwork::Base).with_escrow(escrow),
//! ])
//! .unwrap();
//! let facilitator = Facilitator::builder(Arc::new(registry)).build();
//!
//! let key = x402::EscrowKey::new("base", Address::repeat_byte(1), Address::repeat_byte(2), Address::repeat_byte(3));
//! let account = facilitator.ledger().deposit(&key, U256::from(5_000_000u64)).await.unwrap();
//! assert_eq!(account.balance, U256::from(5_000_000u64));
//! # }
//! ```

// Core types
pub mod clock;
pub mod constants;
pub mod error;
pub mod hmac;
pub mod payment;
pub mod registry;
pub mod response;
pub mod scheme;
pub mod security;

// Signatures and chain access
pub mod chain;
pub mod eip712;

// Ledger and settlement
pub mod escrow_ledger;
pub mod escrow_store;
pub mod facilitator;
pub mod settlement;
pub mod settlement_store;
pub mod verification;

// Outbound URL checks
pub mod network;

use alloy::sol;

// EIP-3009 typed struct signed by the payer.
// The sol! macro derives SolStruct which provides eip712_signing_hash().
sol! {
    #[derive(Debug)]
    struct TransferWithAuthorization {
        address from;
        address to;
        uint256 value;
        uint256 validAfter;
        uint256 validBefore;
        bytes32 nonce;
    }
}

// EIP-3009 token interface (USDC) for on-chain settlement.
sol! {
    #[sol(rpc)]
    interface IERC3009 {
        function transferWithAuthorization(
            address from,
            address to,
            uint256 value,
            uint256 validAfter,
            uint256 validBefore,
            bytes32 nonce,
            uint8 v,
            bytes32 r,
            bytes32 s
        ) external;
    }
}

// Re-exports
pub use clock::{Clock, ManualClock, SystemClock};
pub use constants::*;
pub use error::X402Error;
pub use payment::*;
pub use registry::{DeferredInfo, NetworkConfig, NetworkRegistry, RegistryError};
pub use response::*;
pub use scheme::{Scheme, SchemePayload};

pub use chain::{AlloyChainClient, ChainClient, ChainError, Confirmation, NoChainClient, SignedTransfer};
pub use escrow_ledger::{EscrowAccount, EscrowKey, EscrowLedger, LedgerError};
pub use escrow_store::{EscrowStore, InMemoryEscrowStore, SqliteEscrowStore};
pub use facilitator::{Facilitator, FacilitatorBuilder, NetworkHealth, SupportedKind};
pub use settlement::{settlement_key, SettlementEngine, SettlementState};
pub use settlement_store::{Claim, InMemorySettlementStore, SettlementStore, SqliteSettlementStore};
pub use verification::{Rejection, VerificationEngine, VerifiedPayment};
