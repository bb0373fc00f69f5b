use std::time::Duration;

use alloy::primitives::{Address, U256};
use url::Url;
use x402::constants::{
    KnownNetwork, DEFAULT_CONFIRMATION_POLL_MS, DEFAULT_CONFIRMATION_TIMEOUT_SECS,
    DEFAULT_MAX_DEPOSIT, DEFAULT_MAX_TIMEOUT_SECS, DEFAULT_THAW_PERIOD_SECONDS,
};
use x402::NetworkConfig;

const DEFAULT_PORT: u16 = 4022;
const DEFAULT_RATE_LIMIT_RPM: u64 = 120;
const DEFAULT_DB_PATH: &str = "./x402-facilitator.db";
const DEFAULT_SETTLEMENT_RETENTION_SECS: u64 = 7 * 24 * 60 * 60;

#[derive(Clone)]
pub struct FacilitatorConfig {
    /// Gas-paying key used to broadcast exact-scheme transfers
    pub private_key: String,
    /// HMAC shared secret authenticating POST endpoints
    pub shared_secret: Vec<u8>,
    pub port: u16,
    pub rate_limit_rpm: u64,
    /// CORS allowed origins (empty = localhost only)
    pub allowed_origins: Vec<String>,
    /// Bearer token for /metrics
    pub metrics_token: Option<Vec<u8>>,
    /// Serve /metrics without a token when none is configured
    pub public_metrics: bool,
    pub webhook_urls: Vec<String>,
    /// SQLite file holding escrow accounts and settlement records
    pub db_path: String,
    pub confirmation_timeout: Duration,
    pub confirmation_poll: Duration,
    pub settlement_retention_secs: u64,
    /// Cap on an exact authorization's validity window
    pub max_timeout_secs: u64,
    pub networks: Vec<NetworkConfig>,
}

impl std::fmt::Debug for FacilitatorConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FacilitatorConfig")
            .field("private_key", &"[REDACTED]")
            .field("shared_secret", &"[REDACTED]")
            .field("port", &self.port)
            .field("rate_limit_rpm", &self.rate_limit_rpm)
            .field("allowed_origins", &self.allowed_origins)
            .field(
                "metrics_token",
                &self.metrics_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("public_metrics", &self.public_metrics)
            .field("webhook_urls", &self.webhook_urls)
            .field("db_path", &self.db_path)
            .field("confirmation_timeout", &self.confirmation_timeout)
            .field("confirmation_poll", &self.confirmation_poll)
            .field("settlement_retention_secs", &self.settlement_retention_secs)
            .field("max_timeout_secs", &self.max_timeout_secs)
            .field(
                "networks",
                &self.networks.iter().map(|n| &n.network_id).collect::<Vec<_>>(),
            )
            .finish()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingRequired(&'static str),

    #[error("invalid value for {var}: {reason}")]
    Invalid { var: String, reason: String },

    #[error("unknown network in X402_NETWORKS: {0}")]
    UnknownNetwork(String),
}

fn invalid(var: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        var: var.to_string(),
        reason: reason.into(),
    }
}

fn split_list(raw: Option<String>) -> Vec<String> {
    raw.map(|s| {
        s.split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    })
    .unwrap_or_default()
}

fn parse_u64(var: &str, raw: Option<String>, default: u64) -> Result<u64, ConfigError> {
    match raw {
        Some(s) => s.trim().parse().map_err(|_| invalid(var, format!("not an integer: {s}"))),
        None => Ok(default),
    }
}

fn parse_amount(var: &str, raw: &str) -> Result<U256, ConfigError> {
    let raw = raw.trim();
    if raw.is_empty() || !raw.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid(var, format!("not a decimal integer amount: {raw}")));
    }
    U256::from_str_radix(raw, 10).map_err(|e| invalid(var, e.to_string()))
}

impl FacilitatorConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    /// Build the config from an arbitrary variable source. Empty values are
    /// treated as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |k: &str| lookup(k).filter(|v| !v.trim().is_empty());

        let private_key = get("FACILITATOR_PRIVATE_KEY")
            .ok_or(ConfigError::MissingRequired("FACILITATOR_PRIVATE_KEY"))?;

        let shared_secret = get("FACILITATOR_SHARED_SECRET")
            .ok_or(ConfigError::MissingRequired("FACILITATOR_SHARED_SECRET"))?
            .into_bytes();
        if shared_secret.len() < 32 {
            tracing::warn!(
                "FACILITATOR_SHARED_SECRET is only {} bytes (minimum 32 recommended), \
                 use `openssl rand -hex 32` to generate a secure secret",
                shared_secret.len()
            );
        }

        let port = match get("FACILITATOR_PORT").or_else(|| get("PORT")) {
            Some(p) => p
                .trim()
                .parse()
                .map_err(|_| invalid("FACILITATOR_PORT", format!("not a port: {p}")))?,
            None => DEFAULT_PORT,
        };
        let rate_limit_rpm = parse_u64("RATE_LIMIT_RPM", get("RATE_LIMIT_RPM"), DEFAULT_RATE_LIMIT_RPM)?;
        if rate_limit_rpm == 0 {
            return Err(invalid("RATE_LIMIT_RPM", "must be positive"));
        }

        let allowed_origins = split_list(get("ALLOWED_ORIGINS"));
        if allowed_origins.iter().any(|o| o == "*") {
            return Err(invalid(
                "ALLOWED_ORIGINS",
                "wildcard origin is not allowed for payment endpoints",
            ));
        }

        let metrics_token = get("METRICS_TOKEN").map(String::into_bytes);
        let public_metrics = get("X402_PUBLIC_METRICS").is_some_and(|v| v == "true" || v == "1");
        if metrics_token.is_none() && !public_metrics {
            tracing::warn!("METRICS_TOKEN not set, /metrics will refuse requests");
        }

        let webhook_urls = split_list(get("WEBHOOK_URLS"));
        let db_path = get("DB_PATH").unwrap_or_else(|| DEFAULT_DB_PATH.to_string());

        let confirmation_timeout = Duration::from_secs(parse_u64(
            "CONFIRMATION_TIMEOUT_SECS",
            get("CONFIRMATION_TIMEOUT_SECS"),
            DEFAULT_CONFIRMATION_TIMEOUT_SECS,
        )?);
        let confirmation_poll = Duration::from_millis(parse_u64(
            "CONFIRMATION_POLL_MS",
            get("CONFIRMATION_POLL_MS"),
            DEFAULT_CONFIRMATION_POLL_MS,
        )?);
        let settlement_retention_secs = parse_u64(
            "SETTLEMENT_RETENTION_SECS",
            get("SETTLEMENT_RETENTION_SECS"),
            DEFAULT_SETTLEMENT_RETENTION_SECS,
        )?;
        let max_timeout_secs = parse_u64(
            "MAX_TIMEOUT_SECS",
            get("MAX_TIMEOUT_SECS"),
            DEFAULT_MAX_TIMEOUT_SECS,
        )?;
        if max_timeout_secs == 0 {
            return Err(invalid("MAX_TIMEOUT_SECS", "must be positive"));
        }
        // Settled authorizations must expire before their records are purged.
        if settlement_retention_secs <= max_timeout_secs {
            return Err(invalid(
                "SETTLEMENT_RETENTION_SECS",
                format!("must exceed MAX_TIMEOUT_SECS ({max_timeout_secs})"),
            ));
        }

        let networks = network_configs(&get)?;

        Ok(Self {
            private_key,
            shared_secret,
            port,
            rate_limit_rpm,
            allowed_origins,
            metrics_token,
            public_metrics,
            webhook_urls,
            db_path,
            confirmation_timeout,
            confirmation_poll,
            settlement_retention_secs,
            max_timeout_secs,
            networks,
        })
    }
}

/// Per-network settings. `X402_NETWORKS` selects the networks (default: all
/// known); each then reads `RPC_URL_<NET>`, `ESCROW_ADDRESS_<NET>`,
/// `THAW_PERIOD_SECONDS[_<NET>]` and `MAX_DEPOSIT[_<NET>]`.
///
/// `ESCROW_ADDRESS_<NET>` replaces the network's built-in escrow; the value
/// `none` disables the deferred scheme there.
pub fn network_configs(
    get: &impl Fn(&str) -> Option<String>,
) -> Result<Vec<NetworkConfig>, ConfigError> {
    let selected: Vec<KnownNetwork> = match get("X402_NETWORKS") {
        Some(list) => split_list(Some(list))
            .into_iter()
            .map(|id| id.parse().map_err(|_| ConfigError::UnknownNetwork(id)))
            .collect::<Result<_, _>>()?,
        None => KnownNetwork::ALL.to_vec(),
    };

    let default_thaw = parse_u64(
        "THAW_PERIOD_SECONDS",
        get("THAW_PERIOD_SECONDS"),
        DEFAULT_THAW_PERIOD_SECONDS,
    )?;
    let default_cap = match get("MAX_DEPOSIT") {
        Some(raw) => parse_amount("MAX_DEPOSIT", &raw)?,
        None => U256::from(DEFAULT_MAX_DEPOSIT),
    };

    let mut out = Vec::with_capacity(selected.len());
    for network in selected {
        let suffix = network.env_suffix();
        let mut config = NetworkConfig::for_known(network);

        let rpc_var = format!("RPC_URL_{suffix}");
        if let Some(rpc) = get(&rpc_var) {
            Url::parse(&rpc).map_err(|e| invalid(&rpc_var, e.to_string()))?;
            config = config.with_rpc_url(rpc);
        }

        let escrow_var = format!("ESCROW_ADDRESS_{suffix}");
        match get(&escrow_var) {
            Some(raw) if raw.trim().eq_ignore_ascii_case("none") => config.escrow_address = None,
            Some(raw) => {
                let escrow: Address = raw
                    .trim()
                    .parse()
                    .map_err(|_| invalid(&escrow_var, format!("not an address: {raw}")))?;
                config = config.with_escrow(escrow);
            }
            None => {}
        }

        let thaw_var = format!("THAW_PERIOD_SECONDS_{suffix}");
        config.thaw_period_seconds = parse_u64(&thaw_var, get(&thaw_var), default_thaw)?;

        let cap_var = format!("MAX_DEPOSIT_{suffix}");
        config.max_deposit = match get(&cap_var) {
            Some(raw) => parse_amount(&cap_var, &raw)?,
            None => default_cap,
        };

        out.push(config);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<FacilitatorConfig, ConfigError> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        FacilitatorConfig::from_lookup(|k| map.get(k).cloned())
    }

    const REQUIRED: [(&str, &str); 2] = [
        ("FACILITATOR_PRIVATE_KEY", "0x01"),
        ("FACILITATOR_SHARED_SECRET", "a-shared-secret-that-is-long-enough"),
    ];

    #[test]
    fn defaults() {
        let c = config(&REQUIRED).unwrap();
        assert_eq!(c.port, 4022);
        assert_eq!(c.rate_limit_rpm, 120);
        assert_eq!(c.db_path, "./x402-facilitator.db");
        assert_eq!(c.confirmation_timeout, Duration::from_secs(60));
        assert_eq!(c.settlement_retention_secs, 604_800);
        assert_eq!(c.max_timeout_secs, 300);
        assert_eq!(c.networks.len(), 6);
        assert!(c.networks.iter().all(|n| n.thaw_period_seconds == 86_400));

        let deferred: Vec<_> = c
            .networks
            .iter()
            .filter(|n| n.deferred_enabled())
            .map(|n| n.network_id.as_str())
            .collect();
        assert_eq!(deferred, vec!["avalanche-fuji"]);
        let fuji = c.networks.iter().find(|n| n.network_id == "avalanche-fuji").unwrap();
        let main = c.networks.iter().find(|n| n.network_id == "avalanche").unwrap();
        assert_ne!(fuji.escrow_address, main.escrow_address);
        assert_ne!(fuji.chain_id, main.chain_id);
    }

    #[test]
    fn fuji_escrow_can_be_replaced_or_disabled() {
        let mut vars = REQUIRED.to_vec();
        vars.push(("ESCROW_ADDRESS_AVALANCHE_FUJI", "none"));
        let c = config(&vars).unwrap();
        assert!(c.networks.iter().all(|n| !n.deferred_enabled()));

        let mut vars = REQUIRED.to_vec();
        vars.push(("ESCROW_ADDRESS_AVALANCHE_FUJI", "0x00000000000000000000000000000000000fa111"));
        let c = config(&vars).unwrap();
        let fuji = c.networks.iter().find(|n| n.network_id == "avalanche-fuji").unwrap();
        assert_eq!(
            fuji.escrow_address,
            Some("0x00000000000000000000000000000000000fa111".parse().unwrap())
        );
    }

    #[test]
    fn retention_must_outlive_authorizations() {
        let mut vars = REQUIRED.to_vec();
        vars.extend([("MAX_TIMEOUT_SECS", "600"), ("SETTLEMENT_RETENTION_SECS", "600")]);
        assert!(matches!(config(&vars), Err(ConfigError::Invalid { .. })));

        let mut vars = REQUIRED.to_vec();
        vars.push(("MAX_TIMEOUT_SECS", "0"));
        assert!(matches!(config(&vars), Err(ConfigError::Invalid { .. })));

        let mut vars = REQUIRED.to_vec();
        vars.extend([("MAX_TIMEOUT_SECS", "600"), ("SETTLEMENT_RETENTION_SECS", "3600")]);
        assert_eq!(config(&vars).unwrap().max_timeout_secs, 600);
    }

    #[test]
    fn requires_key_and_secret() {
        assert!(matches!(
            config(&[REQUIRED[1]]),
            Err(ConfigError::MissingRequired("FACILITATOR_PRIVATE_KEY"))
        ));
        assert!(matches!(
            config(&[REQUIRED[0], ("FACILITATOR_SHARED_SECRET", "")]),
            Err(ConfigError::MissingRequired("FACILITATOR_SHARED_SECRET"))
        ));
    }

    #[test]
    fn per_network_overrides() {
        let mut vars = REQUIRED.to_vec();
        vars.extend([
            ("X402_NETWORKS", "avalanche-fuji, base"),
            ("ESCROW_ADDRESS_AVALANCHE_FUJI", "0x00000000000000000000000000000000000fa111"),
            ("RPC_URL_AVALANCHE_FUJI", "https://api.avax-test.network/ext/bc/C/rpc"),
            ("MAX_DEPOSIT", "20000000"),
            ("THAW_PERIOD_SECONDS_BASE", "60"),
        ]);
        let c = config(&vars).unwrap();
        assert_eq!(c.networks.len(), 2);

        let fuji = &c.networks[0];
        assert_eq!(fuji.network_id, "avalanche-fuji");
        assert!(fuji.deferred_enabled());
        assert!(fuji.rpc_url.is_some());
        assert_eq!(fuji.max_deposit, U256::from(20_000_000u64));
        assert_eq!(fuji.thaw_period_seconds, 86_400);

        let base = &c.networks[1];
        assert!(!base.deferred_enabled());
        assert_eq!(base.thaw_period_seconds, 60);
    }

    #[test]
    fn rejects_bad_values() {
        let mut vars = REQUIRED.to_vec();
        vars.push(("X402_NETWORKS", "solana"));
        assert!(matches!(config(&vars), Err(ConfigError::UnknownNetwork(_))));

        let mut vars = REQUIRED.to_vec();
        vars.push(("MAX_DEPOSIT", "10.5"));
        assert!(matches!(config(&vars), Err(ConfigError::Invalid { .. })));

        let mut vars = REQUIRED.to_vec();
        vars.push(("ALLOWED_ORIGINS", "*"));
        assert!(matches!(config(&vars), Err(ConfigError::Invalid { .. })));
    }

    #[test]
    fn debug_redacts_secrets() {
        let mut vars = REQUIRED.to_vec();
        vars.push(("METRICS_TOKEN", "metrics-secret"));
        let rendered = format!("{:?}", config(&vars).unwrap());
        assert!(!rendered.contains("a-shared-secret"));
        assert!(!rendered.contains("metrics-secret"));
        assert!(rendered.contains("[REDACTED]"));
    }
}
