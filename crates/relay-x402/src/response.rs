use alloy::primitives::Address;
use serde::{Deserialize, Serialize};

/// Machine-readable reason attached to a failed verification or settlement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InvalidReason {
    InvalidX402Version,
    UnsupportedScheme,
    SchemeMismatch,
    NetworkMismatch,
    UnsupportedNetwork,
    DeferredNotEnabled,
    InvalidPayload,
    InvalidRequirements,
    InvalidSignature,
    AuthorizationNotYetValid,
    AuthorizationExpired,
    ValidityWindowTooLarge,
    SelfPayment,
    UnsupportedAsset,
    AssetMismatch,
    RecipientMismatch,
    AmountMismatch,
    AmountExceedsCap,
    InsufficientBalance,
    Thawing,
    DuplicateCharge,
    CapExceeded,
    ZeroAmount,
    BroadcastFailure,
    TransactionReverted,
    ConfirmationTimeout,
    SettlementInProgress,
}

impl InvalidReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvalidReason::InvalidX402Version => "invalid_x402_version",
            InvalidReason::UnsupportedScheme => "unsupported_scheme",
            InvalidReason::SchemeMismatch => "scheme_mismatch",
            InvalidReason::NetworkMismatch => "network_mismatch",
            InvalidReason::UnsupportedNetwork => "unsupported_network",
            InvalidReason::DeferredNotEnabled => "deferred_not_enabled",
            InvalidReason::InvalidPayload => "invalid_payload",
            InvalidReason::InvalidRequirements => "invalid_requirements",
            InvalidReason::InvalidSignature => "invalid_signature",
            InvalidReason::AuthorizationNotYetValid => "authorization_not_yet_valid",
            InvalidReason::AuthorizationExpired => "authorization_expired",
            InvalidReason::ValidityWindowTooLarge => "validity_window_too_large",
            InvalidReason::SelfPayment => "self_payment",
            InvalidReason::UnsupportedAsset => "unsupported_asset",
            InvalidReason::AssetMismatch => "asset_mismatch",
            InvalidReason::RecipientMismatch => "recipient_mismatch",
            InvalidReason::AmountMismatch => "amount_mismatch",
            InvalidReason::AmountExceedsCap => "amount_exceeds_cap",
            InvalidReason::InsufficientBalance => "insufficient_balance",
            InvalidReason::Thawing => "thawing",
            InvalidReason::DuplicateCharge => "duplicate_charge",
            InvalidReason::CapExceeded => "cap_exceeded",
            InvalidReason::ZeroAmount => "zero_amount",
            InvalidReason::BroadcastFailure => "broadcast_failure",
            InvalidReason::TransactionReverted => "transaction_reverted",
            InvalidReason::ConfirmationTimeout => "confirmation_timeout",
            InvalidReason::SettlementInProgress => "settlement_in_progress",
        }
    }
}

impl std::fmt::Display for InvalidReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Response from the facilitator's `/verify` endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyResponse {
    pub is_valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invalid_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payer: Option<Address>,
}

impl VerifyResponse {
    pub fn valid(payer: Address) -> Self {
        Self {
            is_valid: true,
            invalid_reason: None,
            payer: Some(payer),
        }
    }

    pub fn invalid(reason: InvalidReason, payer: Option<Address>) -> Self {
        Self {
            is_valid: false,
            invalid_reason: Some(reason.to_string()),
            payer,
        }
    }
}

/// Response from the facilitator's `/settle` endpoint.
///
/// This is the only artifact a settlement attempt returns; a recorded copy is
/// replayed verbatim for duplicate idempotency keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettleResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payer: Option<Address>,
    /// Transaction hash for exact-scheme settlement. Also present on
    /// `confirmation_timeout` so the caller can re-query the chain.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction: Option<String>,
    pub network: String,
}

impl SettleResponse {
    pub fn failed(
        reason: impl Into<String>,
        payer: Option<Address>,
        network: impl Into<String>,
    ) -> Self {
        Self {
            success: false,
            error_reason: Some(reason.into()),
            payer,
            transaction: None,
            network: network.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_response_omits_empty_fields() {
        let json = serde_json::to_value(VerifyResponse::invalid(InvalidReason::AmountMismatch, None))
            .unwrap();
        assert_eq!(json["isValid"], false);
        assert_eq!(json["invalidReason"], "amount_mismatch");
        assert!(json.get("payer").is_none());
    }

    #[test]
    fn settle_response_wire_shape() {
        let resp = SettleResponse {
            success: true,
            error_reason: None,
            payer: Some(Address::repeat_byte(0x11)),
            transaction: Some("0xabc".to_string()),
            network: "base".to_string(),
        };
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["success"], true);
        assert_eq!(json["transaction"], "0xabc");
        assert_eq!(json["network"], "base");
        assert!(json.get("errorReason").is_none());
    }
}
