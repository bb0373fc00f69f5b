use std::sync::Mutex;

use alloy::primitives::B256;
use dashmap::DashMap;

use crate::response::SettleResponse;
use crate::X402Error;

/// State of an idempotency key as seen by a new settlement attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Claim {
    /// The caller now owns the key and must `complete` or `release` it.
    Acquired,
    /// Another attempt with the same key is running.
    InFlight,
    /// The key already settled; replay this result.
    Settled(SettleResponse),
}

/// Trait for idempotency-record storage backends.
///
/// Implementations must be thread-safe (`Send + Sync`) and `claim` must be
/// atomic: two concurrent claims for one key never both return `Acquired`.
pub trait SettlementStore: Send + Sync {
    /// Claim `key` at time `now` (unix seconds, from the facilitator clock).
    fn claim(&self, key: &B256, now: u64) -> Result<Claim, X402Error>;

    /// Record the terminal result for a claimed key.
    fn complete(&self, key: &B256, result: &SettleResponse, now: u64) -> Result<(), X402Error>;

    /// Give up a claim without recording a result, so the key can be retried.
    fn release(&self, key: &B256);

    /// Purge records older than `max_age_secs`. Returns number purged.
    fn purge_expired(&self, now: u64, max_age_secs: u64) -> usize;
}

#[derive(Debug, Clone)]
enum Entry {
    Pending { claimed_at: u64 },
    Settled { result: SettleResponse, recorded_at: u64 },
}

/// In-memory settlement store backed by DashMap. Lost on restart.
#[derive(Default)]
pub struct InMemorySettlementStore {
    entries: DashMap<B256, Entry>,
}

impl InMemorySettlementStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SettlementStore for InMemorySettlementStore {
    fn claim(&self, key: &B256, now: u64) -> Result<Claim, X402Error> {
        use dashmap::mapref::entry::Entry as MapEntry;
        match self.entries.entry(*key) {
            MapEntry::Occupied(o) => Ok(match o.get() {
                Entry::Pending { .. } => Claim::InFlight,
                Entry::Settled { result, .. } => Claim::Settled(result.clone()),
            }),
            MapEntry::Vacant(v) => {
                v.insert(Entry::Pending { claimed_at: now });
                Ok(Claim::Acquired)
            }
        }
    }

    fn complete(&self, key: &B256, result: &SettleResponse, now: u64) -> Result<(), X402Error> {
        self.entries.insert(
            *key,
            Entry::Settled {
                result: result.clone(),
                recorded_at: now,
            },
        );
        Ok(())
    }

    fn release(&self, key: &B256) {
        self.entries
            .remove_if(key, |_, e| matches!(e, Entry::Pending { .. }));
    }

    fn purge_expired(&self, now: u64, max_age_secs: u64) -> usize {
        let cutoff = now.saturating_sub(max_age_secs);
        let before = self.entries.len();
        self.entries.retain(|_, e| match e {
            Entry::Settled { recorded_at, .. } => *recorded_at >= cutoff,
            Entry::Pending { claimed_at } => *claimed_at >= cutoff,
        });
        before - self.entries.len()
    }
}

/// Persistent settlement store backed by SQLite. Survives restarts, so a
/// settled key is never re-executed after a crash or redeploy.
pub struct SqliteSettlementStore {
    conn: Mutex<rusqlite::Connection>,
}

impl SqliteSettlementStore {
    /// Open (or create) the settlement table in the database at `path`.
    pub fn open(path: &str) -> Result<Self, rusqlite::Error> {
        let conn = rusqlite::Connection::open(path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS settlements (
                key BLOB PRIMARY KEY,
                result TEXT,
                recorded_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_settlements_recorded_at ON settlements(recorded_at);
            PRAGMA journal_mode=WAL;",
        )?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Err(e) = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            {
                tracing::warn!(path = %path, error = %e, "failed to restrict settlement database permissions");
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
                tracing::error!("settlement store mutex poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }
}

fn as_i64(secs: u64) -> i64 {
    i64::try_from(secs).unwrap_or(i64::MAX)
}

impl SettlementStore for SqliteSettlementStore {
    fn claim(&self, key: &B256, now: u64) -> Result<Claim, X402Error> {
        let conn = self.conn();
        // INSERT OR IGNORE is atomic at the database level, safe across processes.
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO settlements (key, result, recorded_at) VALUES (?1, NULL, ?2)",
            rusqlite::params![key.as_slice(), as_i64(now)],
        )?;
        if inserted == 1 {
            return Ok(Claim::Acquired);
        }

        let existing: Option<String> = conn.query_row(
            "SELECT result FROM settlements WHERE key = ?1",
            [key.as_slice()],
            |row| row.get(0),
        )?;
        match existing {
            Some(json) => Ok(Claim::Settled(serde_json::from_str(&json)?)),
            None => Ok(Claim::InFlight),
        }
    }

    fn complete(&self, key: &B256, result: &SettleResponse, now: u64) -> Result<(), X402Error> {
        let json = serde_json::to_string(result)?;
        let conn = self.conn();
        conn.execute(
            "INSERT INTO settlements (key, result, recorded_at) VALUES (?1, ?2, ?3)
             ON CONFLICT (key) DO UPDATE SET result = excluded.result, recorded_at = excluded.recorded_at",
            rusqlite::params![key.as_slice(), json, as_i64(now)],
        )?;
        Ok(())
    }

    fn release(&self, key: &B256) {
        let conn = self.conn();
        if let Err(e) = conn.execute(
            "DELETE FROM settlements WHERE key = ?1 AND result IS NULL",
            [key.as_slice()],
        ) {
            tracing::error!(error = %e, "failed to release settlement claim; key stays in flight until purged");
        }
    }

    fn purge_expired(&self, now: u64, max_age_secs: u64) -> usize {
        let conn = self.conn();
        let cutoff = as_i64(now.saturating_sub(max_age_secs));
        conn.execute(
            "DELETE FROM settlements WHERE recorded_at < ?1",
            rusqlite::params![cutoff],
        )
        .unwrap_or(0)
    }
}
