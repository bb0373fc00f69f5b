//! Escrow ledger for the deferred scheme.
//!
//! Balances are keyed by `(network, buyer, seller, asset)`. Every mutation of
//! a key runs under that key's mutex, so two concurrent debits can never both
//! observe the same stale balance; distinct keys never contend.
//!
//! Invariants:
//! - `0 <= balance <= max_deposit` for the key's network
//! - an over-cap deposit is rejected whole, never truncated
//! - a charge is rejected whole if it exceeds the balance, or if the last
//!   deposit is still inside the network's thaw period
//! - a charge nonce is applied at most once per key, however long ago

use std::sync::Arc;

use alloy::primitives::{Address, B256, U256};
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::clock::Clock;
use crate::escrow_store::EscrowStore;
use crate::registry::{NetworkConfig, NetworkRegistry, RegistryError};
use crate::response::InvalidReason;

/// Identity of one escrow balance.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EscrowKey {
    pub network: String,
    pub buyer: Address,
    pub seller: Address,
    pub asset: Address,
}

impl EscrowKey {
    pub fn new(network: impl Into<String>, buyer: Address, seller: Address, asset: Address) -> Self {
        Self {
            network: network.into(),
            buyer,
            seller,
            asset,
        }
    }
}

impl std::fmt::Display for EscrowKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}",
            self.network, self.buyer, self.seller, self.asset
        )
    }
}

/// A single escrow balance. A zero balance is a valid state, distinct from
/// "never funded" only through `last_deposit_at`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EscrowAccount {
    pub balance: U256,
    pub last_deposit_at: Option<u64>,
    pub last_mutation_at: Option<u64>,
}

impl EscrowAccount {
    /// Whether funds may leave the account at `now`: the thaw period since
    /// the last deposit has fully elapsed.
    pub fn is_withdrawable(&self, now: u64, thaw_period_seconds: u64) -> bool {
        match self.last_deposit_at {
            Some(deposited) => now.saturating_sub(deposited) >= thaw_period_seconds && now >= deposited,
            None => true,
        }
    }

    /// Unix time at which the account becomes withdrawable.
    pub fn withdrawable_at(&self, thaw_period_seconds: u64) -> Option<u64> {
        self.last_deposit_at
            .map(|d| d.saturating_add(thaw_period_seconds))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    #[error("unknown network: {0}")]
    UnknownNetwork(String),

    #[error("deferred scheme not enabled on network: {0}")]
    DeferredNotEnabled(String),

    #[error("amount must be non-zero")]
    ZeroAmount,

    #[error("deposit of {attempted} would exceed cap {cap} (balance {balance})")]
    CapExceeded {
        balance: U256,
        attempted: U256,
        cap: U256,
    },

    #[error("insufficient balance: {balance} < {requested}")]
    InsufficientBalance { balance: U256, requested: U256 },

    #[error("funds thawing for another {remaining_secs}s")]
    Thawing { remaining_secs: u64 },

    #[error("charge nonce already applied")]
    DuplicateCharge,

    #[error("storage error: {0}")]
    Storage(String),
}

impl LedgerError {
    /// The in-band reason reported to callers, or `None` for storage faults.
    pub fn reason(&self) -> Option<InvalidReason> {
        match self {
            LedgerError::UnknownNetwork(_) => Some(InvalidReason::UnsupportedNetwork),
            LedgerError::DeferredNotEnabled(_) => Some(InvalidReason::DeferredNotEnabled),
            LedgerError::ZeroAmount => Some(InvalidReason::ZeroAmount),
            LedgerError::CapExceeded { .. } => Some(InvalidReason::CapExceeded),
            LedgerError::InsufficientBalance { .. } => Some(InvalidReason::InsufficientBalance),
            LedgerError::Thawing { .. } => Some(InvalidReason::Thawing),
            LedgerError::DuplicateCharge => Some(InvalidReason::DuplicateCharge),
            LedgerError::Storage(_) => None,
        }
    }
}

impl From<RegistryError> for LedgerError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::DeferredDisabled(n) => LedgerError::DeferredNotEnabled(n),
            RegistryError::UnknownNetwork(n) => LedgerError::UnknownNetwork(n),
            other => LedgerError::UnknownNetwork(other.to_string()),
        }
    }
}

/// Deferred-scheme escrow balances with per-key serialization.
pub struct EscrowLedger {
    registry: Arc<NetworkRegistry>,
    store: Arc<dyn EscrowStore>,
    clock: Arc<dyn Clock>,
    /// Per-key mutex; a mutation holds its key's lock across read-modify-write.
    key_locks: Arc<DashMap<EscrowKey, Arc<Mutex<()>>>>,
}

impl EscrowLedger {
    pub fn new(
        registry: Arc<NetworkRegistry>,
        store: Arc<dyn EscrowStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            registry,
            store,
            clock,
            key_locks: Arc::new(DashMap::new()),
        }
    }

    fn deferred_config(&self, network: &str) -> Result<&NetworkConfig, LedgerError> {
        Ok(self.registry.resolve_deferred(network)?.0)
    }

    fn key_lock(&self, key: &EscrowKey) -> Arc<Mutex<()>> {
        self.key_locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Credit `amount` to the account, creating it on first deposit.
    ///
    /// Rejects with [`LedgerError::CapExceeded`] when the resulting balance
    /// would exceed the network's cap; the balance is then left unchanged.
    pub async fn deposit(&self, key: &EscrowKey, amount: U256) -> Result<EscrowAccount, LedgerError> {
        let cap = self.deferred_config(&key.network)?.max_deposit;
        if amount.is_zero() {
            return Err(LedgerError::ZeroAmount);
        }

        let lock = self.key_lock(key);
        let _guard = lock.lock().await;

        let mut account = self.store.load(key)?.unwrap_or_default();
        let new_balance = match account.balance.checked_add(amount) {
            Some(b) if b <= cap => b,
            _ => {
                tracing::info!(
                    escrow = %key,
                    balance = %account.balance,
                    attempted = %amount,
                    cap = %cap,
                    "deposit rejected: cap exceeded"
                );
                return Err(LedgerError::CapExceeded {
                    balance: account.balance,
                    attempted: amount,
                    cap,
                });
            }
        };

        let now = self.clock.now();
        account.balance = new_balance;
        account.last_deposit_at = Some(now);
        account.last_mutation_at = Some(now);
        self.store.store(key, &account)?;

        tracing::info!(escrow = %key, amount = %amount, balance = %account.balance, "escrow deposit applied");
        Ok(account)
    }

    /// Debit `amount` from the account as the charge identified by `nonce`.
    ///
    /// A nonce already charged against this key is
    /// [`LedgerError::DuplicateCharge`], checked before balance and thaw. Balance
    /// is checked before thaw: a debit larger than the balance is
    /// [`LedgerError::InsufficientBalance`] regardless of thaw state, and a
    /// covered debit inside the thaw window is [`LedgerError::Thawing`].
    pub async fn debit(
        &self,
        key: &EscrowKey,
        amount: U256,
        nonce: &B256,
    ) -> Result<EscrowAccount, LedgerError> {
        let thaw = self.deferred_config(&key.network)?.thaw_period_seconds;
        if amount.is_zero() {
            return Err(LedgerError::ZeroAmount);
        }

        let lock = self.key_lock(key);
        let _guard = lock.lock().await;

        if self.store.charge_recorded(key, nonce)? {
            tracing::warn!(escrow = %key, nonce = %nonce, "debit rejected: charge nonce already applied");
            return Err(LedgerError::DuplicateCharge);
        }

        let mut account = self.store.load(key)?.unwrap_or_default();
        if amount > account.balance {
            tracing::info!(
                escrow = %key,
                balance = %account.balance,
                requested = %amount,
                "debit rejected: insufficient balance"
            );
            return Err(LedgerError::InsufficientBalance {
                balance: account.balance,
                requested: amount,
            });
        }

        let now = self.clock.now();
        if !account.is_withdrawable(now, thaw) {
            let remaining_secs = account
                .withdrawable_at(thaw)
                .map(|at| at.saturating_sub(now))
                .unwrap_or(0);
            tracing::info!(escrow = %key, remaining_secs, "debit rejected: funds thawing");
            return Err(LedgerError::Thawing { remaining_secs });
        }

        account.balance -= amount;
        account.last_mutation_at = Some(now);
        self.store.store_charge(key, &account, nonce, now)?;

        tracing::info!(escrow = %key, nonce = %nonce, amount = %amount, balance = %account.balance, "escrow debit applied");
        Ok(account)
    }

    /// Current account state; a never-funded key reads as a zero balance.
    pub fn get_balance(&self, key: &EscrowKey) -> Result<EscrowAccount, LedgerError> {
        self.deferred_config(&key.network)?;
        Ok(self.store.load(key)?.unwrap_or_default())
    }

    /// Whether `account` on `network` is withdrawable at `now`.
    pub fn is_withdrawable(
        &self,
        network: &str,
        account: &EscrowAccount,
        now: u64,
    ) -> Result<bool, LedgerError> {
        let thaw = self.deferred_config(network)?.thaw_period_seconds;
        Ok(account.is_withdrawable(now, thaw))
    }

    pub fn now(&self) -> u64 {
        self.clock.now()
    }

    /// Drop key locks that no request currently holds or waits on.
    pub fn purge_idle_locks(&self) -> usize {
        let before = self.key_locks.len();
        self.key_locks
            .retain(|_, lock| Arc::strong_count(lock) > 1 || lock.try_lock().is_err());
        before - self.key_locks.len()
    }
}
