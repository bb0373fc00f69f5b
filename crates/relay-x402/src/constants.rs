use alloy::primitives::{address, Address};

/// The only x402 protocol version this facilitator speaks.
pub const X402_VERSION: u32 = 1;

/// Default thaw period for deferred escrow deposits (1 day).
pub const DEFAULT_THAW_PERIOD_SECONDS: u64 = 86_400;

/// Default per-account deposit cap in minor units ($10 at 6 decimals).
pub const DEFAULT_MAX_DEPOSIT: u64 = 10_000_000;

/// Upper bound on an exact-scheme authorization's `validBefore - validAfter`.
/// The effective bound is the smaller of this and the requirement's
/// `maxTimeoutSeconds + 60`.
pub const DEFAULT_MAX_TIMEOUT_SECS: u64 = 300;

/// Default bound on confirmation polling for exact-scheme settlement.
pub const DEFAULT_CONFIRMATION_TIMEOUT_SECS: u64 = 60;

/// Default interval between receipt polls.
pub const DEFAULT_CONFIRMATION_POLL_MS: u64 = 1_000;

/// Networks the relay knows how to route to.
///
/// The set is closed: every variant has a chain id and a default asset, so
/// resolving any known network always yields a complete configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KnownNetwork {
    Avalanche,
    AvalancheFuji,
    Celo,
    CeloSepolia,
    Base,
    BaseSepolia,
}

impl KnownNetwork {
    pub const ALL: [KnownNetwork; 6] = [
        KnownNetwork::Avalanche,
        KnownNetwork::AvalancheFuji,
        KnownNetwork::Celo,
        KnownNetwork::CeloSepolia,
        KnownNetwork::Base,
        KnownNetwork::BaseSepolia,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            KnownNetwork::Avalanche => "avalanche",
            KnownNetwork::AvalancheFuji => "avalanche-fuji",
            KnownNetwork::Celo => "celo",
            KnownNetwork::CeloSepolia => "celo-sepolia",
            KnownNetwork::Base => "base",
            KnownNetwork::BaseSepolia => "base-sepolia",
        }
    }

    pub fn chain_id(&self) -> u64 {
        match self {
            KnownNetwork::Avalanche => 43114,
            KnownNetwork::AvalancheFuji => 43113,
            KnownNetwork::Celo => 42220,
            KnownNetwork::CeloSepolia => 11142220,
            KnownNetwork::Base => 8453,
            KnownNetwork::BaseSepolia => 84532,
        }
    }

    /// Canonical USDC deployment on this network.
    pub fn usdc(&self) -> Address {
        match self {
            KnownNetwork::Avalanche => address!("B97EF9Ef8734C71904D8002F8b6Bc66Dd9c48a6E"),
            KnownNetwork::AvalancheFuji => address!("5425890298aed601595a70AB815c96711a31Bc65"),
            KnownNetwork::Celo => address!("cebA9300f2b948710d2653dD7B07f33A8B32118C"),
            KnownNetwork::CeloSepolia => address!("01C5C0122039549AD1493B8220cABEdD739BC44E"),
            KnownNetwork::Base => address!("833589fCD6eDb6E08f4c7C32D4f71b54bdA02913"),
            KnownNetwork::BaseSepolia => address!("036CbD53842c5426634e7929541eC2318f3dCF7e"),
        }
    }

    /// EIP-712 domain `(name, version)` of the USDC contract.
    pub fn usdc_domain(&self) -> (&'static str, &'static str) {
        match self {
            KnownNetwork::Avalanche | KnownNetwork::AvalancheFuji | KnownNetwork::Base => {
                ("USD Coin", "2")
            }
            KnownNetwork::Celo | KnownNetwork::CeloSepolia | KnownNetwork::BaseSepolia => {
                ("USDC", "2")
            }
        }
    }

    /// Escrow contract the deferred scheme is enabled against out of the box.
    /// Only avalanche-fuji ships one; `ESCROW_ADDRESS_<NET>` overrides it.
    pub fn default_escrow(&self) -> Option<Address> {
        match self {
            KnownNetwork::AvalancheFuji => {
                Some(address!("a5f3e2b9c7d1408e6b2c94f0d8e1a7b3c6f52e19"))
            }
            _ => None,
        }
    }

    /// Environment variable suffix, e.g. `AVALANCHE_FUJI`.
    pub fn env_suffix(&self) -> String {
        self.as_str().to_ascii_uppercase().replace('-', "_")
    }
}

impl std::fmt::Display for KnownNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for KnownNetwork {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        KnownNetwork::ALL
            .into_iter()
            .find(|n| n.as_str() == s)
            .ok_or_else(|| format!("unknown network: {s}"))
    }
}
