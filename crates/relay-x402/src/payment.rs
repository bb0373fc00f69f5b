use alloy::primitives::{Address, FixedBytes};
use serde::{Deserialize, Serialize};

/// Client-submitted payment proof. The scheme-specific `payload` is kept as
/// raw JSON until verification so that structural problems surface as an
/// in-band `invalid_payload` reason rather than a transport-level 400.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x402_version: Option<u32>,
    pub scheme: String,
    pub network: String,
    pub payload: serde_json::Value,
}

/// What the vendor expects the payment to satisfy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequirements {
    pub scheme: String,
    pub network: String,
    /// Amount in minor units as a decimal string. Must be matched exactly.
    #[serde(alias = "amount")]
    pub max_amount_required: String,
    pub asset: Address,
    pub pay_to: Address,
    #[serde(default)]
    pub resource: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub max_timeout_seconds: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<serde_json::Value>,
}

/// Request body for `POST /verify` and `POST /settle`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequest {
    pub x402_version: u32,
    pub payment_payload: PaymentPayload,
    pub payment_requirements: PaymentRequirements,
    /// Caller-chosen idempotency key. Derived from the payload when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
}

/// EIP-3009 `transferWithAuthorization` parameters, as sent on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExactAuthorization {
    pub from: Address,
    pub to: Address,
    pub value: String,
    pub valid_after: String,
    pub valid_before: String,
    pub nonce: FixedBytes<32>,
}

/// Payload of the `exact` scheme: a signed transfer authorization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExactPayload {
    pub signature: String,
    pub authorization: ExactAuthorization,
}

/// Payload of the `deferred` scheme: a charge against a pre-funded escrow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeferredPayload {
    pub buyer: Address,
    pub seller: Address,
    pub asset: Address,
    pub amount: String,
    /// Distinguishes otherwise identical charges.
    pub nonce: FixedBytes<32>,
}

/// Body of `POST /api/deferred/deposit`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DepositRequest {
    pub network: String,
    pub buyer: Address,
    pub seller: Address,
    pub asset: Address,
    pub amount: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requirements_accept_amount_alias() {
        let json = serde_json::json!({
            "scheme": "exact",
            "network": "base",
            "amount": "1000",
            "asset": "0x833589fCD6eDb6E08f4c7C32D4f71b54bdA02913",
            "payTo": "0x0000000000000000000000000000000000000001",
        });
        let req: PaymentRequirements = serde_json::from_value(json).unwrap();
        assert_eq!(req.max_amount_required, "1000");
        assert_eq!(req.max_timeout_seconds, 0);
    }

    #[test]
    fn request_parses_x402_shape() {
        let json = serde_json::json!({
            "x402Version": 1,
            "paymentPayload": {
                "scheme": "deferred",
                "network": "avalanche-fuji",
                "payload": { "anything": true }
            },
            "paymentRequirements": {
                "scheme": "deferred",
                "network": "avalanche-fuji",
                "maxAmountRequired": "5",
                "asset": "0x5425890298aed601595a70AB815c96711a31Bc65",
                "payTo": "0x0000000000000000000000000000000000000002",
            }
        });
        let req: PaymentRequest = serde_json::from_value(json).unwrap();
        assert_eq!(req.x402_version, 1);
        assert!(req.idempotency_key.is_none());
        assert_eq!(req.payment_payload.network, "avalanche-fuji");
    }
}
