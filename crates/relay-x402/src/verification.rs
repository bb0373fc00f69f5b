//! Stateless payment verification.
//!
//! Verification reads the registry and the clock and performs local
//! signature recovery; it never touches the ledger, the settlement store or
//! the chain, so it is safe to call any number of times.

use std::sync::Arc;

use alloy::primitives::{Address, B256, U256};

use crate::chain::SignedTransfer;
use crate::clock::Clock;
use crate::constants::{DEFAULT_MAX_TIMEOUT_SECS, X402_VERSION};
use crate::eip712;
use crate::escrow_ledger::EscrowKey;
use crate::payment::{DeferredPayload, ExactPayload, PaymentRequest, PaymentRequirements};
use crate::registry::{NetworkConfig, NetworkRegistry};
use crate::response::{InvalidReason, VerifyResponse};
use crate::scheme::{Scheme, SchemePayload};
use crate::TransferWithAuthorization;

/// A payment that passed verification, in the shape settlement needs.
#[derive(Debug, Clone)]
pub enum VerifiedPayment {
    Exact {
        network: NetworkConfig,
        payer: Address,
        transfer: SignedTransfer,
    },
    Deferred {
        network: NetworkConfig,
        key: EscrowKey,
        amount: U256,
        nonce: B256,
    },
}

impl VerifiedPayment {
    pub fn payer(&self) -> Address {
        match self {
            VerifiedPayment::Exact { payer, .. } => *payer,
            VerifiedPayment::Deferred { key, .. } => key.buyer,
        }
    }

    pub fn scheme(&self) -> Scheme {
        match self {
            VerifiedPayment::Exact { .. } => Scheme::Exact,
            VerifiedPayment::Deferred { .. } => Scheme::Deferred,
        }
    }

    pub fn network(&self) -> &NetworkConfig {
        match self {
            VerifiedPayment::Exact { network, .. } | VerifiedPayment::Deferred { network, .. } => {
                network
            }
        }
    }
}

/// Why verification failed, with the payer when it was already known.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rejection {
    pub reason: InvalidReason,
    pub payer: Option<Address>,
}

impl Rejection {
    fn new(reason: InvalidReason, payer: Option<Address>) -> Self {
        Self { reason, payer }
    }
}

fn parse_decimal(s: &str) -> Option<U256> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    U256::from_str_radix(s, 10).ok()
}

pub struct VerificationEngine {
    registry: Arc<NetworkRegistry>,
    clock: Arc<dyn Clock>,
    max_timeout_secs: u64,
}

impl VerificationEngine {
    pub fn new(registry: Arc<NetworkRegistry>, clock: Arc<dyn Clock>) -> Self {
        Self {
            registry,
            clock,
            max_timeout_secs: DEFAULT_MAX_TIMEOUT_SECS,
        }
    }

    /// Cap on an exact authorization's validity window, in seconds.
    pub fn with_max_timeout(mut self, secs: u64) -> Self {
        self.max_timeout_secs = secs;
        self
    }

    /// Verify a payment request, reporting the outcome in-band.
    pub fn verify(&self, request: &PaymentRequest) -> VerifyResponse {
        match self.check(request) {
            Ok(verified) => {
                tracing::debug!(
                    payer = %verified.payer(),
                    scheme = %verified.scheme(),
                    network = %verified.network().network_id,
                    "payment verification succeeded"
                );
                VerifyResponse::valid(verified.payer())
            }
            Err(rejection) => {
                tracing::info!(
                    reason = %rejection.reason,
                    payer = ?rejection.payer,
                    network = %request.payment_payload.network,
                    "payment verification failed"
                );
                VerifyResponse::invalid(rejection.reason, rejection.payer)
            }
        }
    }

    /// Full verification, returning the decoded payment on success.
    pub fn check(&self, request: &PaymentRequest) -> Result<VerifiedPayment, Rejection> {
        let payload = &request.payment_payload;
        let requirements = &request.payment_requirements;

        if request.x402_version != X402_VERSION
            || payload.x402_version.is_some_and(|v| v != X402_VERSION)
        {
            return Err(Rejection::new(InvalidReason::InvalidX402Version, None));
        }

        let scheme: Scheme = payload
            .scheme
            .parse()
            .map_err(|_| Rejection::new(InvalidReason::UnsupportedScheme, None))?;
        if requirements.scheme != payload.scheme {
            return Err(Rejection::new(InvalidReason::SchemeMismatch, None));
        }
        if requirements.network != payload.network {
            return Err(Rejection::new(InvalidReason::NetworkMismatch, None));
        }

        let network = self
            .registry
            .resolve(&payload.network)
            .map_err(|_| Rejection::new(InvalidReason::UnsupportedNetwork, None))?;

        if scheme == Scheme::Deferred && !network.deferred_enabled() {
            return Err(Rejection::new(InvalidReason::DeferredNotEnabled, None));
        }

        let decoded = SchemePayload::decode(scheme, payload)
            .map_err(|_| Rejection::new(InvalidReason::InvalidPayload, None))?;

        match decoded {
            SchemePayload::Exact(p) => self.check_exact(network, &p, requirements),
            SchemePayload::Deferred(p) => self.check_deferred(network, &p, requirements),
        }
    }

    fn check_exact(
        &self,
        network: &NetworkConfig,
        payload: &ExactPayload,
        requirements: &PaymentRequirements,
    ) -> Result<VerifiedPayment, Rejection> {
        let a = &payload.authorization;
        let payer = Some(a.from);
        let invalid = |reason| Rejection::new(reason, payer);

        let value = parse_decimal(&a.value).ok_or(invalid(InvalidReason::InvalidPayload))?;
        let valid_after =
            parse_decimal(&a.valid_after).ok_or(invalid(InvalidReason::InvalidPayload))?;
        let valid_before =
            parse_decimal(&a.valid_before).ok_or(invalid(InvalidReason::InvalidPayload))?;
        if a.from == Address::ZERO || a.to == Address::ZERO {
            return Err(invalid(InvalidReason::InvalidPayload));
        }
        let sig_bytes = eip712::decode_signature_hex(&payload.signature)
            .map_err(|_| invalid(InvalidReason::InvalidPayload))?;

        let now = U256::from(self.clock.now());
        if now < valid_after {
            return Err(invalid(InvalidReason::AuthorizationNotYetValid));
        }
        if now >= valid_before {
            return Err(invalid(InvalidReason::AuthorizationExpired));
        }
        // A settled authorization must expire before its idempotency record
        // can be purged.
        let max_window = self
            .max_timeout_secs
            .min(requirements.max_timeout_seconds.saturating_add(60));
        if valid_before.saturating_sub(valid_after) > U256::from(max_window) {
            return Err(invalid(InvalidReason::ValidityWindowTooLarge));
        }
        if a.from == a.to {
            return Err(invalid(InvalidReason::SelfPayment));
        }
        if requirements.asset != network.asset {
            return Err(invalid(InvalidReason::UnsupportedAsset));
        }

        let authorization = TransferWithAuthorization {
            from: a.from,
            to: a.to,
            value,
            validAfter: valid_after,
            validBefore: valid_before,
            nonce: a.nonce,
        };
        match eip712::recover_signer(&authorization, &sig_bytes, network, requirements.asset) {
            Ok(signer) if signer == a.from => {}
            Ok(_) | Err(_) => return Err(Rejection::new(InvalidReason::InvalidSignature, None)),
        }

        if a.to != requirements.pay_to {
            return Err(invalid(InvalidReason::RecipientMismatch));
        }
        let required = parse_decimal(&requirements.max_amount_required)
            .filter(|r| !r.is_zero())
            .ok_or(invalid(InvalidReason::InvalidRequirements))?;
        if value != required {
            return Err(invalid(InvalidReason::AmountMismatch));
        }

        let (v, r, s) =
            eip712::split_signature(&sig_bytes).map_err(|_| invalid(InvalidReason::InvalidSignature))?;

        Ok(VerifiedPayment::Exact {
            network: network.clone(),
            payer: a.from,
            transfer: SignedTransfer {
                asset: requirements.asset,
                authorization,
                v,
                r,
                s,
            },
        })
    }

    fn check_deferred(
        &self,
        network: &NetworkConfig,
        payload: &DeferredPayload,
        requirements: &PaymentRequirements,
    ) -> Result<VerifiedPayment, Rejection> {
        let payer = Some(payload.buyer);
        let invalid = |reason| Rejection::new(reason, payer);

        if payload.buyer == Address::ZERO
            || payload.seller == Address::ZERO
            || payload.asset == Address::ZERO
        {
            return Err(invalid(InvalidReason::InvalidPayload));
        }
        let amount = parse_decimal(&payload.amount).ok_or(invalid(InvalidReason::InvalidPayload))?;
        if amount.is_zero() {
            return Err(invalid(InvalidReason::ZeroAmount));
        }
        if payload.buyer == payload.seller {
            return Err(invalid(InvalidReason::SelfPayment));
        }

        if payload.asset != requirements.asset {
            return Err(invalid(InvalidReason::AssetMismatch));
        }
        if payload.seller != requirements.pay_to {
            return Err(invalid(InvalidReason::RecipientMismatch));
        }
        let required = parse_decimal(&requirements.max_amount_required)
            .filter(|r| !r.is_zero())
            .ok_or(invalid(InvalidReason::InvalidRequirements))?;
        if amount != required {
            return Err(invalid(InvalidReason::AmountMismatch));
        }
        if amount > network.max_deposit {
            return Err(invalid(InvalidReason::AmountExceedsCap));
        }

        Ok(VerifiedPayment::Deferred {
            network: network.clone(),
            key: EscrowKey::new(
                network.network_id.clone(),
                payload.buyer,
                payload.seller,
                payload.asset,
            ),
            amount,
            nonce: payload.nonce,
        })
    }

    pub fn registry(&self) -> &NetworkRegistry {
        &self.registry
    }
}
