//! Per-unit mutual exclusion backed by one `unit_locks` row per unit.
//!
//! A lock is a lease: `locked_until` bounds it in time, so a holder that dies
//! without releasing only blocks the unit until the TTL runs out. Taking over
//! an expired lease is a compare-and-swap on the `locked_until` value read
//! beforehand; whichever writer lands first wins and the other sees zero rows
//! affected.

use anyhow::{Context, Result};
use sqlx::Row;
use tracing::{debug, warn};

use crate::db::Db;

#[derive(Clone)]
pub struct LockManager {
    db: Db,
}

impl LockManager {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Tries to take the lock on `unit_id` until `now + ttl_seconds`.
    /// Returns false if another holder's lease is still valid or another
    /// caller won the race; store errors also count as "not acquired".
    pub async fn acquire(&self, unit_id: &str, ttl_seconds: i64, now: i64) -> bool {
        match self.try_acquire(unit_id, ttl_seconds, now).await {
            Ok(acquired) => acquired,
            Err(e) => {
                warn!(unit = %unit_id, "lock: acquire failed: {e:#}");
                false
            }
        }
    }

    async fn try_acquire(&self, unit_id: &str, ttl_seconds: i64, now: i64) -> Result<bool> {
        let locked_until = now + ttl_seconds;

        let current: Option<i64> = sqlx::query("SELECT locked_until FROM unit_locks WHERE unit_id = ?")
            .bind(unit_id)
            .fetch_optional(self.db.pool())
            .await
            .context("lock: read failed")?
            .map(|r| r.try_get("locked_until"))
            .transpose()?;

        let rows = match current {
            None => sqlx::query(
                "INSERT INTO unit_locks (unit_id, locked_until) VALUES (?, ?)
                 ON CONFLICT(unit_id) DO NOTHING",
            )
            .bind(unit_id)
            .bind(locked_until)
            .execute(self.db.pool())
            .await
            .context("lock: insert failed")?
            .rows_affected(),
            Some(held_until) if held_until > now => {
                debug!(unit = %unit_id, held_until, "lock: busy");
                return Ok(false);
            }
            Some(expired_at) => sqlx::query(
                "UPDATE unit_locks SET locked_until = ? WHERE unit_id = ? AND locked_until = ?",
            )
            .bind(locked_until)
            .bind(unit_id)
            .bind(expired_at)
            .execute(self.db.pool())
            .await
            .context("lock: compare-and-swap failed")?
            .rows_affected(),
        };

        if rows == 0 {
            debug!(unit = %unit_id, "lock: lost race");
        }
        Ok(rows == 1)
    }

    /// Unconditional delete. Returns false only on store errors.
    pub async fn release(&self, unit_id: &str) -> bool {
        match sqlx::query("DELETE FROM unit_locks WHERE unit_id = ?")
            .bind(unit_id)
            .execute(self.db.pool())
            .await
        {
            Ok(_) => true,
            Err(e) => {
                warn!(unit = %unit_id, "lock: release failed: {e}");
                false
            }
        }
    }

    #[cfg(test)]
    pub async fn locked_until(&self, unit_id: &str) -> Result<Option<i64>> {
        let row = sqlx::query("SELECT locked_until FROM unit_locks WHERE unit_id = ?")
            .bind(unit_id)
            .fetch_optional(self.db.pool())
            .await
            .context("lock: read failed")?;
        Ok(row.map(|r| r.try_get("locked_until")).transpose()?)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
