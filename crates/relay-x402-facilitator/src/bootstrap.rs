//! Assemble a production facilitator from [`FacilitatorConfig`].
//!
//! Opens the SQLite stores (there is no in-memory fallback: losing escrow
//! balances or settlement records on restart would allow double charges),
//! connects one RPC provider per network, validates webhook targets and
//! starts the background purge task.

use std::sync::Arc;
use std::time::Duration;

use alloy::signers::local::PrivateKeySigner;
use x402::{
    AlloyChainClient, ChainError, Facilitator, NetworkRegistry, RegistryError, SqliteEscrowStore,
    SqliteSettlementStore,
};

use crate::config::FacilitatorConfig;
use crate::state::AppState;
use crate::webhook;

const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    #[error("invalid FACILITATOR_PRIVATE_KEY")]
    InvalidPrivateKey,

    #[error("network registry: {0}")]
    Registry(#[from] RegistryError),

    #[error("chain client: {0}")]
    Chain(#[from] ChainError),

    #[error("failed to open SQLite store at {path}: {reason}")]
    Storage { path: String, reason: String },

    #[error("invalid webhook configuration: {0}")]
    Webhook(String),
}

fn storage_err<E: std::fmt::Display>(path: &str) -> impl Fn(E) -> BootstrapError + '_ {
    move |e| BootstrapError::Storage {
        path: path.to_string(),
        reason: e.to_string(),
    }
}

/// Build the shared [`AppState`]. Must run inside a tokio runtime, since
/// it spawns the purge task.
pub fn bootstrap(config: &FacilitatorConfig) -> Result<Arc<AppState>, BootstrapError> {
    let signer: PrivateKeySigner = config
        .private_key
        .trim()
        .parse()
        .map_err(|_| BootstrapError::InvalidPrivateKey)?;
    let facilitator_address = signer.address();

    let registry = Arc::new(NetworkRegistry::new(config.networks.clone())?);
    for network in registry.networks() {
        tracing::info!(
            network = %network.network_id,
            chain_id = network.chain_id,
            deferred = network.deferred_enabled(),
            rpc = network.rpc_url.is_some(),
            "network enabled"
        );
    }

    let chain = AlloyChainClient::connect(signer, &registry, config.confirmation_poll)?;

    let escrow_store =
        SqliteEscrowStore::open(&config.db_path).map_err(storage_err(&config.db_path))?;
    let settlement_store =
        SqliteSettlementStore::open(&config.db_path).map_err(storage_err(&config.db_path))?;
    tracing::info!(path = %config.db_path, "escrow and settlement stores: SQLite");

    if !config.webhook_urls.is_empty() {
        webhook::validate_webhook_urls(&config.webhook_urls).map_err(BootstrapError::Webhook)?;
        tracing::info!(count = config.webhook_urls.len(), "webhook URLs configured");
    }

    let facilitator = Arc::new(
        Facilitator::builder(registry)
            .chain_client(Arc::new(chain))
            .escrow_store(Arc::new(escrow_store))
            .settlement_store(Arc::new(settlement_store))
            .confirmation_timeout(config.confirmation_timeout)
            .max_timeout_secs(config.max_timeout_secs)
            .build(),
    );
    facilitator.start_cleanup(CLEANUP_INTERVAL, config.settlement_retention_secs);

    tracing::info!(address = %facilitator_address, "facilitator signer loaded");

    let webhook_hmac_key = Some(x402::hmac::derive_key(
        &config.shared_secret,
        x402::hmac::WEBHOOK_KEY_LABEL,
    ));

    Ok(Arc::new(AppState {
        facilitator,
        hmac_secret: config.shared_secret.clone(),
        webhook_urls: config.webhook_urls.clone(),
        http_client: webhook::webhook_client(),
        metrics_token: config.metrics_token.clone(),
        public_metrics: config.public_metrics,
        webhook_hmac_key,
    }))
}
