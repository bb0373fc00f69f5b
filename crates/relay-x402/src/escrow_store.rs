use std::sync::Mutex;

use alloy::primitives::{B256, U256};
use dashmap::DashMap;

use crate::escrow_ledger::{EscrowAccount, EscrowKey, LedgerError};

/// Storage backend for escrow accounts.
///
/// Implementations only load and store whole rows; read-modify-write
/// atomicity per key is provided by [`crate::EscrowLedger`]'s key locks.
///
/// Charge nonces are kept forever. They are independent of the settlement
/// idempotency records, which age out.
pub trait EscrowStore: Send + Sync {
    fn load(&self, key: &EscrowKey) -> Result<Option<EscrowAccount>, LedgerError>;

    fn store(&self, key: &EscrowKey, account: &EscrowAccount) -> Result<(), LedgerError>;

    /// Whether a charge with `nonce` was already applied to `key`.
    fn charge_recorded(&self, key: &EscrowKey, nonce: &B256) -> Result<bool, LedgerError>;

    /// Store `account` and mark `nonce` consumed, both or neither.
    ///
    /// Fails with [`LedgerError::DuplicateCharge`] if the nonce is already
    /// consumed; the account is then left untouched.
    fn store_charge(
        &self,
        key: &EscrowKey,
        account: &EscrowAccount,
        nonce: &B256,
        charged_at: u64,
    ) -> Result<(), LedgerError>;
}

/// In-memory escrow store backed by DashMap. Lost on restart.
#[derive(Default)]
pub struct InMemoryEscrowStore {
    accounts: DashMap<EscrowKey, EscrowAccount>,
    charges: DashMap<(EscrowKey, B256), u64>,
}

impl InMemoryEscrowStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }
}

impl EscrowStore for InMemoryEscrowStore {
    fn load(&self, key: &EscrowKey) -> Result<Option<EscrowAccount>, LedgerError> {
        Ok(self.accounts.get(key).map(|a| a.clone()))
    }

    fn store(&self, key: &EscrowKey, account: &EscrowAccount) -> Result<(), LedgerError> {
        self.accounts.insert(key.clone(), account.clone());
        Ok(())
    }

    fn charge_recorded(&self, key: &EscrowKey, nonce: &B256) -> Result<bool, LedgerError> {
        Ok(self.charges.contains_key(&(key.clone(), *nonce)))
    }

    fn store_charge(
        &self,
        key: &EscrowKey,
        account: &EscrowAccount,
        nonce: &B256,
        charged_at: u64,
    ) -> Result<(), LedgerError> {
        use dashmap::mapref::entry::Entry;
        match self.charges.entry((key.clone(), *nonce)) {
            Entry::Occupied(_) => Err(LedgerError::DuplicateCharge),
            Entry::Vacant(v) => {
                v.insert(charged_at);
                self.accounts.insert(key.clone(), account.clone());
                Ok(())
            }
        }
    }
}

/// Persistent escrow store backed by SQLite. Balances are stored as decimal
/// text so no precision is lost for 256-bit amounts.
pub struct SqliteEscrowStore {
    conn: Mutex<rusqlite::Connection>,
}

impl SqliteEscrowStore {
    /// Open (or create) the escrow table in the database at `path`.
    pub fn open(path: &str) -> Result<Self, rusqlite::Error> {
        let conn = rusqlite::Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
            CREATE TABLE IF NOT EXISTS escrow_accounts (
                network TEXT NOT NULL,
                buyer BLOB NOT NULL,
                seller BLOB NOT NULL,
                asset BLOB NOT NULL,
                balance TEXT NOT NULL,
                last_deposit_at INTEGER,
                last_mutation_at INTEGER,
                PRIMARY KEY (network, buyer, seller, asset)
            );
            CREATE TABLE IF NOT EXISTS escrow_charges (
                network TEXT NOT NULL,
                buyer BLOB NOT NULL,
                seller BLOB NOT NULL,
                asset BLOB NOT NULL,
                nonce BLOB NOT NULL,
                charged_at INTEGER NOT NULL,
                PRIMARY KEY (network, buyer, seller, asset, nonce)
            );",
        )?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Err(e) = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            {
                tracing::warn!(path = %path, error = %e, "failed to restrict escrow database permissions");
            }
        }

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, rusqlite::Connection> {
        match self.conn.lock() {
            Ok(c) => c,
            Err(poisoned) => {
                tracing::error!("escrow store mutex poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }
}

fn storage_err(e: rusqlite::Error) -> LedgerError {
    LedgerError::Storage(e.to_string())
}

fn to_i64(ts: Option<u64>) -> Option<i64> {
    ts.map(|t| i64::try_from(t).unwrap_or(i64::MAX))
}

fn from_i64(ts: Option<i64>) -> Option<u64> {
    ts.map(|t| u64::try_from(t).unwrap_or(0))
}

const UPSERT_ACCOUNT: &str = "INSERT INTO escrow_accounts
        (network, buyer, seller, asset, balance, last_deposit_at, last_mutation_at)
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
     ON CONFLICT (network, buyer, seller, asset) DO UPDATE SET
        balance = excluded.balance,
        last_deposit_at = excluded.last_deposit_at,
        last_mutation_at = excluded.last_mutation_at";

fn upsert_account(
    conn: &rusqlite::Connection,
    key: &EscrowKey,
    account: &EscrowAccount,
) -> Result<(), LedgerError> {
    conn.execute(
        UPSERT_ACCOUNT,
        rusqlite::params![
            key.network,
            key.buyer.as_slice(),
            key.seller.as_slice(),
            key.asset.as_slice(),
            account.balance.to_string(),
            to_i64(account.last_deposit_at),
            to_i64(account.last_mutation_at),
        ],
    )
    .map_err(storage_err)?;
    Ok(())
}

impl EscrowStore for SqliteEscrowStore {
    fn load(&self, key: &EscrowKey) -> Result<Option<EscrowAccount>, LedgerError> {
        let conn = self.conn();
        let row = conn.query_row(
            "SELECT balance, last_deposit_at, last_mutation_at FROM escrow_accounts
             WHERE network = ?1 AND buyer = ?2 AND seller = ?3 AND asset = ?4",
            rusqlite::params![
                key.network,
                key.buyer.as_slice(),
                key.seller.as_slice(),
                key.asset.as_slice()
            ],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<i64>>(1)?,
                    row.get::<_, Option<i64>>(2)?,
                ))
            },
        );

        match row {
            Ok((balance, last_deposit_at, last_mutation_at)) => {
                let balance = balance.parse::<U256>().map_err(|e| {
                    LedgerError::Storage(format!("corrupt balance for {key}: {e}"))
                })?;
                Ok(Some(EscrowAccount {
                    balance,
                    last_deposit_at: from_i64(last_deposit_at),
                    last_mutation_at: from_i64(last_mutation_at),
                }))
            }
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(storage_err(e)),
        }
    }

    fn store(&self, key: &EscrowKey, account: &EscrowAccount) -> Result<(), LedgerError> {
        upsert_account(&self.conn(), key, account)
    }

    fn charge_recorded(&self, key: &EscrowKey, nonce: &B256) -> Result<bool, LedgerError> {
        let conn = self.conn();
        let found = conn.query_row(
            "SELECT 1 FROM escrow_charges
             WHERE network = ?1 AND buyer = ?2 AND seller = ?3 AND asset = ?4 AND nonce = ?5",
            rusqlite::params![
                key.network,
                key.buyer.as_slice(),
                key.seller.as_slice(),
                key.asset.as_slice(),
                nonce.as_slice()
            ],
            |_| Ok(()),
        );
        match found {
            Ok(()) => Ok(true),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(false),
            Err(e) => Err(storage_err(e)),
        }
    }

    fn store_charge(
        &self,
        key: &EscrowKey,
        account: &EscrowAccount,
        nonce: &B256,
        charged_at: u64,
    ) -> Result<(), LedgerError> {
        let mut conn = self.conn();
        let tx = conn.transaction().map_err(storage_err)?;
        let inserted = tx
            .execute(
                "INSERT OR IGNORE INTO escrow_charges
                    (network, buyer, seller, asset, nonce, charged_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![
                    key.network,
                    key.buyer.as_slice(),
                    key.seller.as_slice(),
                    key.asset.as_slice(),
                    nonce.as_slice(),
                    to_i64(Some(charged_at)),
                ],
            )
            .map_err(storage_err)?;
        if inserted == 0 {
            // Dropping the transaction rolls it back.
            return Err(LedgerError::DuplicateCharge);
        }
        upsert_account(&tx, key, account)?;
        tx.commit().map_err(storage_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::Address;

    fn key() -> EscrowKey {
        EscrowKey::new(
            "base",
            Address::repeat_byte(0x01),
            Address::repeat_byte(0x02),
            Address::repeat_byte(0x03),
        )
    }

    fn account(balance: u64) -> EscrowAccount {
        EscrowAccount {
            balance: U256::from(balance),
            last_deposit_at: Some(1_000),
            last_mutation_at: Some(2_000),
        }
    }

    #[test]
    fn in_memory_store_roundtrip() {
        let store = InMemoryEscrowStore::new();
        assert!(store.load(&key()).unwrap().is_none());
        store.store(&key(), &account(5)).unwrap();
        assert_eq!(store.load(&key()).unwrap(), Some(account(5)));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn sqlite_store_upserts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("escrow.db");
        let store = SqliteEscrowStore::open(path.to_str().unwrap()).unwrap();

        store.store(&key(), &account(5)).unwrap();
        store.store(&key(), &account(7)).unwrap();
        assert_eq!(store.load(&key()).unwrap(), Some(account(7)));
    }

    #[test]
    fn sqlite_store_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("escrow.db");
        {
            let store = SqliteEscrowStore::open(path.to_str().unwrap()).unwrap();
            store.store(&key(), &account(10_000_000)).unwrap();
        }
        let store = SqliteEscrowStore::open(path.to_str().unwrap()).unwrap();
        assert_eq!(store.load(&key()).unwrap(), Some(account(10_000_000)));
    }

    #[test]
    fn sqlite_store_keys_are_independent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("escrow.db");
        let store = SqliteEscrowStore::open(path.to_str().unwrap()).unwrap();

        let mut other = key();
        other.network = "celo".to_string();
        store.store(&key(), &account(1)).unwrap();
        assert!(store.load(&other).unwrap().is_none());
    }

    fn charges_are_consumed_once(store: &dyn EscrowStore) {
        let nonce = B256::repeat_byte(0x11);
        assert!(!store.charge_recorded(&key(), &nonce).unwrap());

        store.store_charge(&key(), &account(4), &nonce, 3_000).unwrap();
        assert!(store.charge_recorded(&key(), &nonce).unwrap());
        assert_eq!(store.load(&key()).unwrap(), Some(account(4)));

        assert_eq!(
            store.store_charge(&key(), &account(3), &nonce, 3_001).unwrap_err(),
            LedgerError::DuplicateCharge
        );
        assert_eq!(store.load(&key()).unwrap(), Some(account(4)));

        let mut other = key();
        other.seller = Address::repeat_byte(0x09);
        assert!(!store.charge_recorded(&other, &nonce).unwrap());
    }

    #[test]
    fn in_memory_charges_are_consumed_once() {
        charges_are_consumed_once(&InMemoryEscrowStore::new());
    }

    #[test]
    fn sqlite_charges_are_consumed_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("escrow.db");
        charges_are_consumed_once(&SqliteEscrowStore::open(path.to_str().unwrap()).unwrap());
    }

    #[test]
    fn sqlite_charges_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("escrow.db");
        let nonce = B256::repeat_byte(0x22);
        {
            let store = SqliteEscrowStore::open(path.to_str().unwrap()).unwrap();
            store.store_charge(&key(), &account(9), &nonce, 3_000).unwrap();
        }
        let store = SqliteEscrowStore::open(path.to_str().unwrap()).unwrap();
        assert!(store.charge_recorded(&key(), &nonce).unwrap());
    }
}
