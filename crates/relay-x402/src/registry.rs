//! Network registry: the immutable table of networks the facilitator routes to.
//!
//! Built once at startup and shared read-only for the lifetime of the process,
//! so lookups need no locking.

use std::collections::HashMap;

use alloy::primitives::{Address, U256};
use serde::Serialize;
use thiserror::Error;

use crate::constants::{KnownNetwork, DEFAULT_MAX_DEPOSIT, DEFAULT_THAW_PERIOD_SECONDS};

/// Configuration for one supported network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkConfig {
    pub network_id: String,
    pub chain_id: u64,
    /// Escrow contract for the deferred scheme. `None` disables deferred here.
    pub escrow_address: Option<Address>,
    pub thaw_period_seconds: u64,
    pub max_deposit: U256,
    /// Asset accepted for exact-scheme transfers (USDC).
    pub asset: Address,
    pub asset_domain_name: String,
    pub asset_domain_version: String,
    pub rpc_url: Option<String>,
}

impl NetworkConfig {
    /// Defaults for a known network: its default escrow (if any), no RPC
    /// configured.
    pub fn for_known(network: KnownNetwork) -> Self {
        let (name, version) = network.usdc_domain();
        Self {
            network_id: network.as_str().to_string(),
            chain_id: network.chain_id(),
            escrow_address: network.default_escrow(),
            thaw_period_seconds: DEFAULT_THAW_PERIOD_SECONDS,
            max_deposit: U256::from(DEFAULT_MAX_DEPOSIT),
            asset: network.usdc(),
            asset_domain_name: name.to_string(),
            asset_domain_version: version.to_string(),
            rpc_url: None,
        }
    }

    pub fn with_escrow(mut self, escrow: Address) -> Self {
        self.escrow_address = Some(escrow);
        self
    }

    pub fn with_rpc_url(mut self, url: impl Into<String>) -> Self {
        self.rpc_url = Some(url.into());
        self
    }

    pub fn deferred_enabled(&self) -> bool {
        self.escrow_address.is_some()
    }

    /// Deferred-scheme view of this network, if enabled.
    pub fn deferred_info(&self) -> DeferredInfo {
        DeferredInfo {
            enabled: self.deferred_enabled(),
            escrow_address: self.escrow_address,
            network: self.network_id.clone(),
            chain_id: self.chain_id,
            thaw_period: self.thaw_period_seconds,
            max_deposit: self.max_deposit.to_string(),
        }
    }
}

/// Body of `GET /api/deferred/info`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeferredInfo {
    pub enabled: bool,
    pub escrow_address: Option<Address>,
    pub network: String,
    pub chain_id: u64,
    pub thaw_period: u64,
    pub max_deposit: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("unknown network: {0}")]
    UnknownNetwork(String),

    #[error("deferred scheme not enabled on network: {0}")]
    DeferredDisabled(String),

    #[error("duplicate network id: {0}")]
    DuplicateNetwork(String),

    #[error("chain id {chain_id} configured for both {first} and {second}")]
    DuplicateChainId {
        chain_id: u64,
        first: String,
        second: String,
    },

    #[error("invalid network config for {network}: {reason}")]
    InvalidConfig { network: String, reason: String },
}

/// Read-only lookup table from network id to [`NetworkConfig`].
#[derive(Debug, Clone)]
pub struct NetworkRegistry {
    networks: HashMap<String, NetworkConfig>,
    /// Insertion order, for stable listings.
    order: Vec<String>,
}

impl NetworkRegistry {
    /// Build a registry, validating that ids and chain ids are unique and
    /// that no escrow address is the zero address.
    pub fn new(configs: Vec<NetworkConfig>) -> Result<Self, RegistryError> {
        let mut networks: HashMap<String, NetworkConfig> = HashMap::with_capacity(configs.len());
        let mut order = Vec::with_capacity(configs.len());

        for config in configs {
            if config.chain_id == 0 {
                return Err(RegistryError::InvalidConfig {
                    network: config.network_id,
                    reason: "chain id must be non-zero".to_string(),
                });
            }
            if config.escrow_address == Some(Address::ZERO) {
                return Err(RegistryError::InvalidConfig {
                    network: config.network_id,
                    reason: "escrow address cannot be zero".to_string(),
                });
            }
            if config.max_deposit.is_zero() {
                return Err(RegistryError::InvalidConfig {
                    network: config.network_id,
                    reason: "max deposit must be non-zero".to_string(),
                });
            }
            if networks.contains_key(&config.network_id) {
                return Err(RegistryError::DuplicateNetwork(config.network_id));
            }
            if let Some(existing) = networks.values().find(|n| n.chain_id == config.chain_id) {
                return Err(RegistryError::DuplicateChainId {
                    chain_id: config.chain_id,
                    first: existing.network_id.clone(),
                    second: config.network_id,
                });
            }
            order.push(config.network_id.clone());
            networks.insert(config.network_id.clone(), config);
        }

        Ok(Self { networks, order })
    }

    /// Every known network with default settings and deferred disabled.
    pub fn with_defaults() -> Self {
        let configs = KnownNetwork::ALL
            .into_iter()
            .map(NetworkConfig::for_known)
            .collect::<Vec<_>>();
        let order = configs.iter().map(|c| c.network_id.clone()).collect();
        let networks = configs
            .into_iter()
            .map(|c| (c.network_id.clone(), c))
            .collect();
        Self { networks, order }
    }

    pub fn resolve(&self, network_id: &str) -> Result<&NetworkConfig, RegistryError> {
        self.networks
            .get(network_id)
            .ok_or_else(|| RegistryError::UnknownNetwork(network_id.to_string()))
    }

    /// Resolve a network that must have the deferred scheme enabled.
    /// Returns the config together with its escrow address.
    pub fn resolve_deferred(
        &self,
        network_id: &str,
    ) -> Result<(&NetworkConfig, Address), RegistryError> {
        let config = self.resolve(network_id)?;
        match config.escrow_address {
            Some(escrow) => Ok((config, escrow)),
            None => Err(RegistryError::DeferredDisabled(network_id.to_string())),
        }
    }

    pub fn networks(&self) -> impl Iterator<Item = &NetworkConfig> {
        self.order.iter().filter_map(|id| self.networks.get(id))
    }

    pub fn len(&self) -> usize {
        self.networks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.networks.is_empty()
    }
}
