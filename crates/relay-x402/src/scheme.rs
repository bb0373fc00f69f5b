//! The closed set of payment schemes.
//!
//! - [`Scheme::Exact`]: a fresh EIP-3009 signed transfer per request, settled on-chain
//! - [`Scheme::Deferred`]: a debit against a pre-funded escrow balance
//!
//! Dispatch is a `match` on [`SchemePayload`]; there is no open-ended registry
//! of schemes.

use serde::{Deserialize, Serialize};

use crate::payment::{DeferredPayload, ExactPayload, PaymentPayload};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    Exact,
    Deferred,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Exact => "exact",
            Scheme::Deferred => "deferred",
        }
    }
}

impl std::fmt::Display for Scheme {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Scheme {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "exact" => Ok(Scheme::Exact),
            "deferred" => Ok(Scheme::Deferred),
            other => Err(format!("unsupported scheme: {other}")),
        }
    }
}

/// A payment payload decoded into its scheme-specific shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemePayload {
    Exact(ExactPayload),
    Deferred(DeferredPayload),
}

impl SchemePayload {
    /// Decode the raw `payload` JSON for an already-parsed scheme tag.
    pub fn decode(scheme: Scheme, payload: &PaymentPayload) -> Result<Self, serde_json::Error> {
        match scheme {
            Scheme::Exact => {
                serde_json::from_value(payload.payload.clone()).map(SchemePayload::Exact)
            }
            Scheme::Deferred => {
                serde_json::from_value(payload.payload.clone()).map(SchemePayload::Deferred)
            }
        }
    }
}
