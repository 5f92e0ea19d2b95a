//! Named, TTL-bounded mutexes used for single-flight agent dispatch
//! Grounded in the lease-manager's SQLite-backed
//! claim/renew/release pattern already present in this workspace: a row
//! per lock keyed by name, claimed via an atomic insert-or-replace guarded
//! by an expiry check, released by a status/delete update.

use crate::errors::{LockError, LockResult};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};
use std::time::Duration;

#[async_trait]
pub trait LockService: Send + Sync {
    /// Attempt to acquire `key` for `ttl`. Returns `true` on success,
    /// `false` if already held by a live holder. When the
    /// backing store is unreachable this must return `true` and log a
    /// warning rather than propagate the error — availability over safety,
    /// with the AgentRunner's column pre-flight acting as backstop.
    async fn try_acquire(&self, key: &str, ttl: Duration) -> bool;

    async fn release(&self, key: &str);
}

pub struct SqliteLockService {
    pool: SqlitePool,
}

impl SqliteLockService {
    pub async fn new(pool: SqlitePool) -> LockResult<Self> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS agent_locks (
                lock_key TEXT PRIMARY KEY,
                expires_at TEXT NOT NULL
            )"#,
        )
        .execute(&pool)
        .await?;
        Ok(Self { pool })
    }

    /// Same storage the rest of the engine uses, opened standalone — handy
    /// for tests and for binaries that only need the lock table.
    pub async fn connect(database_url: &str) -> LockResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Self::new(pool).await
    }

    async fn try_acquire_inner(&self, key: &str, ttl: Duration) -> LockResult<bool> {
        let now = Utc::now();
        let expires_at = now + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::minutes(15));

        let mut tx = self.pool.begin().await?;
        let existing = sqlx::query("SELECT expires_at FROM agent_locks WHERE lock_key = ?")
            .bind(key)
            .fetch_optional(&mut *tx)
            .await?;

        if let Some(row) = existing {
            let expires_at_str: String = row.try_get("expires_at")?;
            if let Ok(existing_expiry) = chrono::DateTime::parse_from_rfc3339(&expires_at_str) {
                if existing_expiry.with_timezone(&Utc) > now {
                    tx.rollback().await?;
                    return Ok(false);
                }
            }
        }

        sqlx::query(
            "INSERT INTO agent_locks (lock_key, expires_at) VALUES (?, ?)
             ON CONFLICT(lock_key) DO UPDATE SET expires_at = excluded.expires_at",
        )
        .bind(key)
        .bind(expires_at.to_rfc3339())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }
}

#[async_trait]
impl LockService for SqliteLockService {
    async fn try_acquire(&self, key: &str, ttl: Duration) -> bool {
        match self.try_acquire_inner(key, ttl).await {
            Ok(acquired) => acquired,
            Err(err) => {
                tracing::warn!(lock_key = key, error = %err, "lock service unreachable, granting lock");
                true
            }
        }
    }

    async fn release(&self, key: &str) {
        if let Err(err) = sqlx::query("DELETE FROM agent_locks WHERE lock_key = ?")
            .bind(key)
            .execute(&self.pool)
            .await
        {
            tracing::warn!(lock_key = key, error = %err, "failed to release lock");
        }
    }
}

/// Builds the canonical single-flight key for an agent role on an issue:
/// `agent_lock:<role>:<issue_id>`.
pub fn agent_lock_key(role: &str, issue_id: uuid::Uuid) -> String {
    format!("agent_lock:{role}:{issue_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn service() -> SqliteLockService {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        SqliteLockService::new(pool).await.unwrap()
    }

    #[tokio::test]
    async fn second_acquire_fails_while_first_is_live() {
        let lock = service().await;
        assert!(lock.try_acquire("agent_lock:dev_agent:issue-1", Duration::from_secs(60)).await);
        assert!(!lock.try_acquire("agent_lock:dev_agent:issue-1", Duration::from_secs(60)).await);
    }

    #[tokio::test]
    async fn acquire_succeeds_after_release() {
        let lock = service().await;
        assert!(lock.try_acquire("agent_lock:qa_agent:issue-2", Duration::from_secs(60)).await);
        lock.release("agent_lock:qa_agent:issue-2").await;
        assert!(lock.try_acquire("agent_lock:qa_agent:issue-2", Duration::from_secs(60)).await);
    }

    #[tokio::test]
    async fn acquire_succeeds_after_ttl_expiry() {
        let lock = service().await;
        assert!(lock
            .try_acquire("agent_lock:dev_agent:issue-3", Duration::from_millis(10))
            .await);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(lock
            .try_acquire("agent_lock:dev_agent:issue-3", Duration::from_secs(60))
            .await);
    }
}
