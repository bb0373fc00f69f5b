//! Settlement state machine.
//!
//! Every attempt walks `Pending -> Verifying -> {Broadcasting | LedgerMutating}
//! -> {Confirmed | Failed}`. There is no retry inside an attempt; a retry is a
//! new attempt with the same idempotency key, which replays the recorded
//! result instead of executing again.

use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::{keccak256, B256};

use crate::chain::{ChainClient, ChainError, Confirmation};
use crate::clock::Clock;
use crate::escrow_ledger::EscrowLedger;
use crate::payment::PaymentRequest;
use crate::response::{InvalidReason, SettleResponse};
use crate::scheme::{Scheme, SchemePayload};
use crate::settlement_store::{Claim, SettlementStore};
use crate::verification::{VerificationEngine, VerifiedPayment};
use crate::X402Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettlementState {
    Pending,
    Verifying,
    Broadcasting,
    LedgerMutating,
    Confirmed,
    Failed,
}

impl SettlementState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SettlementState::Confirmed | SettlementState::Failed)
    }

    pub fn can_transition_to(self, next: SettlementState) -> bool {
        use SettlementState::*;
        matches!(
            (self, next),
            (Pending, Verifying)
                | (Verifying, Broadcasting)
                | (Verifying, LedgerMutating)
                | (Verifying, Failed)
                | (Broadcasting, Confirmed)
                | (Broadcasting, Failed)
                | (LedgerMutating, Confirmed)
                | (LedgerMutating, Failed)
        )
    }
}

struct Attempt {
    key: B256,
    state: SettlementState,
}

impl Attempt {
    fn new(key: B256) -> Self {
        Self {
            key,
            state: SettlementState::Pending,
        }
    }

    fn advance(&mut self, next: SettlementState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal settlement transition {:?} -> {:?}",
            self.state,
            next
        );
        tracing::debug!(key = %self.key, from = ?self.state, to = ?next, "settlement state transition");
        self.state = next;
    }
}

/// Derive the idempotency key of a settlement request.
///
/// Without an explicit `idempotencyKey` the key is
/// `keccak256(network || 0 || scheme || 0 || 'n' || payer || nonce)`, which is
/// stable across retries of the same signed payload.
///
/// An explicit key is scoped to the payment it names:
/// `keccak256(network || 0 || scheme || 0 || 'k' || payer || payee || amount || 0 || key)`.
/// Reusing it for a different payer, payee or amount yields a different key.
///
/// Returns `None` when the payload cannot be decoded far enough to find the
/// payer and nonce.
pub fn settlement_key(request: &PaymentRequest) -> Option<B256> {
    let payload = &request.payment_payload;
    let scheme: Scheme = payload.scheme.parse().ok()?;
    let (payer, payee, amount, nonce) = match SchemePayload::decode(scheme, payload).ok()? {
        SchemePayload::Exact(p) => (
            p.authorization.from,
            p.authorization.to,
            p.authorization.value,
            p.authorization.nonce,
        ),
        SchemePayload::Deferred(p) => (p.buyer, p.seller, p.amount, p.nonce),
    };

    let mut buf = Vec::with_capacity(payload.network.len() + scheme.as_str().len() + 3 + 20 + 32);
    buf.extend_from_slice(payload.network.as_bytes());
    buf.push(0);
    buf.extend_from_slice(scheme.as_str().as_bytes());
    buf.push(0);
    match request.idempotency_key.as_deref() {
        Some(explicit) => {
            buf.push(b'k');
            buf.extend_from_slice(payer.as_slice());
            buf.extend_from_slice(payee.as_slice());
            buf.extend_from_slice(amount.as_bytes());
            buf.push(0);
            buf.extend_from_slice(explicit.as_bytes());
        }
        None => {
            buf.push(b'n');
            buf.extend_from_slice(payer.as_slice());
            buf.extend_from_slice(nonce.as_slice());
        }
    }
    Some(keccak256(&buf))
}

/// What to do with the claim once an attempt finishes.
enum Outcome {
    /// A mutation happened or may have happened: record the result.
    Record(SettleResponse),
    /// Nothing was mutated: release the claim so the key can be retried.
    Release(SettleResponse),
}

pub struct SettlementEngine {
    verifier: Arc<VerificationEngine>,
    ledger: Arc<EscrowLedger>,
    chain: Arc<dyn ChainClient>,
    store: Arc<dyn SettlementStore>,
    clock: Arc<dyn Clock>,
    confirmation_timeout: Duration,
}

impl SettlementEngine {
    pub fn new(
        verifier: Arc<VerificationEngine>,
        ledger: Arc<EscrowLedger>,
        chain: Arc<dyn ChainClient>,
        store: Arc<dyn SettlementStore>,
        clock: Arc<dyn Clock>,
        confirmation_timeout: Duration,
    ) -> Self {
        Self {
            verifier,
            ledger,
            chain,
            store,
            clock,
            confirmation_timeout,
        }
    }

    /// Settle a payment.
    ///
    /// Protocol failures come back in-band as `success: false`. The only
    /// `Err` cases are infrastructure faults where nothing was mutated: the
    /// RPC node was unreachable before submission, or storage failed.
    pub async fn settle(&self, request: &PaymentRequest) -> Result<SettleResponse, X402Error> {
        let network_id = request.payment_payload.network.clone();

        let Some(key) = settlement_key(request) else {
            let reason = match self.verifier.check(request) {
                Err(rejection) => rejection.reason,
                Ok(_) => InvalidReason::InvalidPayload,
            };
            return Ok(SettleResponse::failed(reason.as_str(), None, network_id));
        };

        match self.store.claim(&key, self.clock.now())? {
            Claim::Acquired => {}
            Claim::Settled(recorded) => {
                tracing::info!(key = %key, success = recorded.success, "replaying recorded settlement");
                return Ok(recorded);
            }
            Claim::InFlight => {
                tracing::warn!(key = %key, "duplicate settlement while first attempt is in flight");
                return Ok(SettleResponse::failed(
                    InvalidReason::SettlementInProgress.as_str(),
                    None,
                    network_id,
                ));
            }
        }

        let mut attempt = Attempt::new(key);
        let outcome = self.run(&mut attempt, request).await;

        match outcome {
            Ok(Outcome::Record(response)) => {
                if let Err(e) = self.store.complete(&key, &response, self.clock.now()) {
                    // The claim stays in flight, so the key still cannot run twice.
                    tracing::error!(key = %key, error = %e, "failed to record settlement result");
                }
                Ok(response)
            }
            Ok(Outcome::Release(response)) => {
                self.store.release(&key);
                Ok(response)
            }
            Err(e) => {
                self.store.release(&key);
                Err(e)
            }
        }
    }

    async fn run(&self, attempt: &mut Attempt, request: &PaymentRequest) -> Result<Outcome, X402Error> {
        attempt.advance(SettlementState::Verifying);
        let verified = match self.verifier.check(request) {
            Ok(v) => v,
            Err(rejection) => {
                tracing::warn!(
                    key = %attempt.key,
                    reason = %rejection.reason,
                    payer = ?rejection.payer,
                    "settlement rejected by verification"
                );
                attempt.advance(SettlementState::Failed);
                return Ok(Outcome::Release(SettleResponse::failed(
                    rejection.reason.as_str(),
                    rejection.payer,
                    request.payment_payload.network.clone(),
                )));
            }
        };

        match verified {
            VerifiedPayment::Exact { .. } => self.settle_exact(attempt, verified).await,
            VerifiedPayment::Deferred { .. } => self.settle_deferred(attempt, verified).await,
        }
    }

    async fn settle_exact(
        &self,
        attempt: &mut Attempt,
        verified: VerifiedPayment,
    ) -> Result<Outcome, X402Error> {
        let VerifiedPayment::Exact {
            network,
            payer,
            transfer,
        } = verified
        else {
            return Err(X402Error::InvalidPayment("expected exact payment".to_string()));
        };
        let network_id = network.network_id.clone();
        attempt.advance(SettlementState::Broadcasting);

        let tx = match self.chain.broadcast_transfer(&network, &transfer).await {
            Ok(tx) => tx,
            Err(ChainError::Transport(e)) => {
                tracing::error!(network = %network_id, payer = %payer, error = %e, "rpc unreachable before broadcast");
                attempt.advance(SettlementState::Failed);
                return Err(X402Error::Transport(e));
            }
            Err(ChainError::UnknownNetwork(_)) => {
                tracing::warn!(network = %network_id, "no chain client for network");
                attempt.advance(SettlementState::Failed);
                return Ok(Outcome::Release(SettleResponse::failed(
                    InvalidReason::UnsupportedNetwork.as_str(),
                    Some(payer),
                    network_id,
                )));
            }
            Err(ChainError::Rejected(e)) => {
                tracing::warn!(network = %network_id, payer = %payer, error = %e, "transfer rejected by node");
                attempt.advance(SettlementState::Failed);
                return Ok(Outcome::Release(SettleResponse::failed(
                    InvalidReason::BroadcastFailure.as_str(),
                    Some(payer),
                    network_id,
                )));
            }
            Err(ChainError::Indeterminate(e)) => {
                // The transaction may still land: record so the key never re-broadcasts.
                tracing::error!(network = %network_id, payer = %payer, error = %e, "broadcast outcome unknown");
                attempt.advance(SettlementState::Failed);
                return Ok(Outcome::Record(SettleResponse::failed(
                    InvalidReason::BroadcastFailure.as_str(),
                    Some(payer),
                    network_id,
                )));
            }
        };

        tracing::info!(network = %network_id, payer = %payer, tx = %tx, "transfer broadcast, awaiting confirmation");
        let tx_str = format!("{tx}");

        let response = match self
            .chain
            .await_confirmation(&network, tx, self.confirmation_timeout)
            .await
        {
            Confirmation::Confirmed { block_number } => {
                tracing::info!(
                    network = %network_id,
                    payer = %payer,
                    amount = %transfer.authorization.value,
                    tx = %tx,
                    block = ?block_number,
                    "payment settled successfully"
                );
                attempt.advance(SettlementState::Confirmed);
                SettleResponse {
                    success: true,
                    error_reason: None,
                    payer: Some(payer),
                    transaction: Some(tx_str),
                    network: network_id,
                }
            }
            Confirmation::Reverted => {
                tracing::warn!(network = %network_id, payer = %payer, tx = %tx, "transfer reverted on-chain");
                attempt.advance(SettlementState::Failed);
                SettleResponse {
                    transaction: Some(tx_str),
                    ..SettleResponse::failed(
                        InvalidReason::TransactionReverted.as_str(),
                        Some(payer),
                        network_id,
                    )
                }
            }
            Confirmation::TimedOut => {
                tracing::warn!(
                    network = %network_id,
                    tx = %tx,
                    timeout_secs = self.confirmation_timeout.as_secs(),
                    "confirmation timed out, transaction may still land"
                );
                attempt.advance(SettlementState::Failed);
                SettleResponse {
                    transaction: Some(tx_str),
                    ..SettleResponse::failed(
                        InvalidReason::ConfirmationTimeout.as_str(),
                        Some(payer),
                        network_id,
                    )
                }
            }
        };
        Ok(Outcome::Record(response))
    }

    async fn settle_deferred(
        &self,
        attempt: &mut Attempt,
        verified: VerifiedPayment,
    ) -> Result<Outcome, X402Error> {
        let VerifiedPayment::Deferred {
            key, amount, nonce, ..
        } = verified
        else {
            return Err(X402Error::InvalidPayment("expected deferred payment".to_string()));
        };
        attempt.advance(SettlementState::LedgerMutating);

        match self.ledger.debit(&key, amount, &nonce).await {
            Ok(account) => {
                tracing::info!(
                    escrow = %key,
                    amount = %amount,
                    balance = %account.balance,
                    "deferred payment settled"
                );
                attempt.advance(SettlementState::Confirmed);
                Ok(Outcome::Record(SettleResponse {
                    success: true,
                    error_reason: None,
                    payer: Some(key.buyer),
                    transaction: None,
                    network: key.network,
                }))
            }
            Err(e) => {
                attempt.advance(SettlementState::Failed);
                match e.reason() {
                    Some(reason) => {
                        tracing::warn!(escrow = %key, nonce = %nonce, reason = %reason, "deferred charge rejected");
                        Ok(Outcome::Release(SettleResponse::failed(
                            reason.as_str(),
                            Some(key.buyer),
                            key.network,
                        )))
                    }
                    None => {
                        tracing::error!(escrow = %key, error = %e, "escrow storage failure during debit");
                        Err(X402Error::Storage(e.to_string()))
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payment::{DeferredPayload, PaymentPayload, PaymentRequirements};
    use alloy::primitives::{Address, FixedBytes};

    fn deferred_request(nonce: u8, idempotency_key: Option<&str>) -> PaymentRequest {
        deferred_request_for(Address::repeat_byte(0x01), "100", nonce, idempotency_key)
    }

    fn deferred_request_for(
        buyer: Address,
        amount: &str,
        nonce: u8,
        idempotency_key: Option<&str>,
    ) -> PaymentRequest {
        PaymentRequest {
            x402_version: 1,
            payment_payload: PaymentPayload {
                x402_version: Some(1),
                scheme: "deferred".to_string(),
                network: "base".to_string(),
                payload: serde_json::to_value(DeferredPayload {
                    buyer,
                    seller: Address::repeat_byte(0x02),
                    asset: Address::repeat_byte(0x03),
                    amount: amount.to_string(),
                    nonce: FixedBytes::repeat_byte(nonce),
                })
                .unwrap(),
            },
            payment_requirements: PaymentRequirements {
                scheme: "deferred".to_string(),
                network: "base".to_string(),
                max_amount_required: "100".to_string(),
                asset: Address::repeat_byte(0x03),
                pay_to: Address::repeat_byte(0x02),
                resource: None,
                description: None,
                mime_type: None,
                max_timeout_seconds: 60,
                extra: None,
            },
            idempotency_key: idempotency_key.map(str::to_string),
        }
    }

    #[test]
    fn legal_transitions() {
        use SettlementState::*;
        assert!(Pending.can_transition_to(Verifying));
        assert!(Verifying.can_transition_to(Broadcasting));
        assert!(Verifying.can_transition_to(LedgerMutating));
        assert!(Broadcasting.can_transition_to(Confirmed));
        assert!(LedgerMutating.can_transition_to(Failed));

        assert!(!Pending.can_transition_to(Confirmed));
        assert!(!Broadcasting.can_transition_to(LedgerMutating));
        assert!(!Confirmed.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Verifying));
    }

    #[test]
    fn terminal_states() {
        assert!(SettlementState::Confirmed.is_terminal());
        assert!(SettlementState::Failed.is_terminal());
        assert!(!SettlementState::Broadcasting.is_terminal());
    }

    #[test]
    fn derived_key_is_stable_and_nonce_sensitive() {
        let a = settlement_key(&deferred_request(1, None)).unwrap();
        assert_eq!(a, settlement_key(&deferred_request(1, None)).unwrap());
        assert_ne!(a, settlement_key(&deferred_request(2, None)).unwrap());
    }

    #[test]
    fn explicit_key_overrides_nonce() {
        let a = settlement_key(&deferred_request(1, Some("order-17"))).unwrap();
        let b = settlement_key(&deferred_request(2, Some("order-17"))).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, keccak256(b"order-17"));
        assert_ne!(a, settlement_key(&deferred_request(1, None)).unwrap());
    }

    #[test]
    fn explicit_key_is_scoped_to_payer_and_amount() {
        let base = settlement_key(&deferred_request(1, Some("order-17"))).unwrap();
        let other_payer = deferred_request_for(Address::repeat_byte(0x09), "100", 1, Some("order-17"));
        let other_amount = deferred_request_for(Address::repeat_byte(0x01), "250", 1, Some("order-17"));
        assert_ne!(base, settlement_key(&other_payer).unwrap());
        assert_ne!(base, settlement_key(&other_amount).unwrap());
    }

    #[test]
    fn explicit_key_still_needs_a_decodable_payload() {
        let mut req = deferred_request(1, Some("order-17"));
        req.payment_payload.payload = serde_json::json!({});
        assert!(settlement_key(&req).is_none());
    }

    #[test]
    fn undecodable_payload_has_no_key() {
        let mut req = deferred_request(1, None);
        req.payment_payload.payload = serde_json::json!({});
        assert!(settlement_key(&req).is_none());
        req.payment_payload.scheme = "upto".to_string();
        assert!(settlement_key(&req).is_none());
    }
}
