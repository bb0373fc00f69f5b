//! Chain access for exact-scheme settlement.
//!
//! [`ChainClient`] is the seam between the settlement engine and the RPC
//! nodes; [`AlloyChainClient`] is the production implementation, holding one
//! wallet-backed provider per configured network.

use std::collections::HashMap;
use std::time::Duration;

use alloy::network::EthereumWallet;
use alloy::primitives::{Address, TxHash};
use alloy::providers::{
    fillers::{
        BlobGasFiller, ChainIdFiller, FillProvider, GasFiller, JoinFill, NonceFiller, WalletFiller,
    },
    Identity, Provider, ProviderBuilder, RootProvider,
};
use alloy::signers::local::PrivateKeySigner;
use async_trait::async_trait;
use thiserror::Error;

use crate::registry::{NetworkConfig, NetworkRegistry};
use crate::{TransferWithAuthorization, IERC3009};

/// Concrete provider type from `ProviderBuilder::new().wallet(...).connect_http(...)`.
pub type WalletProvider = FillProvider<
    JoinFill<
        JoinFill<
            Identity,
            JoinFill<GasFiller, JoinFill<BlobGasFiller, JoinFill<NonceFiller, ChainIdFiller>>>,
        >,
        WalletFiller<EthereumWallet>,
    >,
    RootProvider,
>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChainError {
    /// The RPC node could not be reached; nothing was submitted.
    #[error("rpc transport failure: {0}")]
    Transport(String),

    /// The node refused the transaction (estimation revert, bad nonce, ...).
    #[error("transaction rejected: {0}")]
    Rejected(String),

    /// Submission outcome unknown; the transaction may still land.
    #[error("transaction submission indeterminate: {0}")]
    Indeterminate(String),

    #[error("no rpc configured for network: {0}")]
    UnknownNetwork(String),
}

/// Outcome of polling for a transaction receipt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmation {
    Confirmed { block_number: Option<u64> },
    Reverted,
    TimedOut,
}

/// Signed EIP-3009 transfer ready for submission.
#[derive(Debug, Clone)]
pub struct SignedTransfer {
    pub asset: Address,
    pub authorization: TransferWithAuthorization,
    pub v: u8,
    pub r: alloy::primitives::B256,
    pub s: alloy::primitives::B256,
}

#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Submit `transferWithAuthorization` and return the transaction hash
    /// once the node has accepted it.
    async fn broadcast_transfer(
        &self,
        network: &NetworkConfig,
        transfer: &SignedTransfer,
    ) -> Result<TxHash, ChainError>;

    /// Poll for the receipt of `tx` until it lands or `timeout` elapses.
    async fn await_confirmation(
        &self,
        network: &NetworkConfig,
        tx: TxHash,
        timeout: Duration,
    ) -> Confirmation;

    /// Latest block number, used as a liveness check.
    async fn block_number(&self, network: &NetworkConfig) -> Result<u64, ChainError>;

    /// Whether this client can submit transactions on `network_id`.
    fn supports(&self, network_id: &str) -> bool;
}

/// Chain client for deployments without RPC access; only the deferred
/// scheme can settle.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoChainClient;

#[async_trait]
impl ChainClient for NoChainClient {
    async fn broadcast_transfer(
        &self,
        network: &NetworkConfig,
        _transfer: &SignedTransfer,
    ) -> Result<TxHash, ChainError> {
        Err(ChainError::UnknownNetwork(network.network_id.clone()))
    }

    async fn await_confirmation(
        &self,
        _network: &NetworkConfig,
        _tx: TxHash,
        _timeout: Duration,
    ) -> Confirmation {
        Confirmation::TimedOut
    }

    async fn block_number(&self, network: &NetworkConfig) -> Result<u64, ChainError> {
        Err(ChainError::UnknownNetwork(network.network_id.clone()))
    }

    fn supports(&self, _network_id: &str) -> bool {
        false
    }
}

/// Production chain client: one provider per network sharing the
/// facilitator's signer, built once at startup.
pub struct AlloyChainClient {
    providers: HashMap<String, WalletProvider>,
    facilitator_address: Address,
    poll_interval: Duration,
    send_timeout: Duration,
}

impl AlloyChainClient {
    /// Connect to every network in `registry` that has an `rpc_url`.
    pub fn connect(
        signer: PrivateKeySigner,
        registry: &NetworkRegistry,
        poll_interval: Duration,
    ) -> Result<Self, ChainError> {
        let facilitator_address = signer.address();
        let wallet = EthereumWallet::from(signer);
        let mut providers = HashMap::new();

        for network in registry.networks() {
            let Some(rpc_url) = network.rpc_url.as_deref() else {
                tracing::warn!(network = %network.network_id, "no RPC URL configured; exact scheme unavailable");
                continue;
            };
            let url: url::Url = rpc_url.parse().map_err(|e| {
                ChainError::Transport(format!("invalid RPC URL for {}: {e}", network.network_id))
            })?;
            let provider = ProviderBuilder::new()
                .wallet(wallet.clone())
                .connect_http(url);
            providers.insert(network.network_id.clone(), provider);
        }

        Ok(Self {
            providers,
            facilitator_address,
            poll_interval,
            send_timeout: Duration::from_secs(30),
        })
    }

    pub fn facilitator_address(&self) -> Address {
        self.facilitator_address
    }

    fn provider(&self, network: &NetworkConfig) -> Result<&WalletProvider, ChainError> {
        self.providers
            .get(&network.network_id)
            .ok_or_else(|| ChainError::UnknownNetwork(network.network_id.clone()))
    }
}

fn classify_send_error(e: alloy::contract::Error) -> ChainError {
    match e {
        alloy::contract::Error::TransportError(rpc) if rpc.is_transport_error() => {
            ChainError::Transport(rpc.to_string())
        }
        other => ChainError::Rejected(other.to_string()),
    }
}

#[async_trait]
impl ChainClient for AlloyChainClient {
    async fn broadcast_transfer(
        &self,
        network: &NetworkConfig,
        transfer: &SignedTransfer,
    ) -> Result<TxHash, ChainError> {
        let provider = self.provider(network)?;
        let contract = IERC3009::new(transfer.asset, provider);
        let a = &transfer.authorization;

        let call = contract.transferWithAuthorization(
            a.from,
            a.to,
            a.value,
            a.validAfter,
            a.validBefore,
            a.nonce,
            transfer.v,
            transfer.r,
            transfer.s,
        );
        let pending = tokio::time::timeout(self.send_timeout, call.send())
            .await
            .map_err(|_| {
                ChainError::Indeterminate(format!(
                    "transferWithAuthorization send timed out after {}s",
                    self.send_timeout.as_secs()
                ))
            })?
            .map_err(classify_send_error)?;

        Ok(*pending.tx_hash())
    }

    async fn await_confirmation(
        &self,
        network: &NetworkConfig,
        tx: TxHash,
        timeout: Duration,
    ) -> Confirmation {
        let Ok(provider) = self.provider(network) else {
            return Confirmation::TimedOut;
        };

        let poll = async {
            loop {
                match provider.get_transaction_receipt(tx).await {
                    Ok(Some(receipt)) => {
                        return if receipt.status() {
                            Confirmation::Confirmed {
                                block_number: receipt.block_number,
                            }
                        } else {
                            Confirmation::Reverted
                        };
                    }
                    Ok(None) => {}
                    Err(e) => {
                        tracing::warn!(network = %network.network_id, tx = %tx, error = %e, "receipt poll failed, retrying");
                    }
                }
                tokio::time::sleep(self.poll_interval).await;
            }
        };

        tokio::time::timeout(timeout, poll)
            .await
            .unwrap_or(Confirmation::TimedOut)
    }

    async fn block_number(&self, network: &NetworkConfig) -> Result<u64, ChainError> {
        self.provider(network)?
            .get_block_number()
            .await
            .map_err(|e| ChainError::Transport(format!("block number failed: {e}")))
    }

    fn supports(&self, network_id: &str) -> bool {
        self.providers.contains_key(network_id)
    }
}
