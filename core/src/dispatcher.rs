//! Asynchronous, named-queue job system. Grounded in this
//! workspace's SQLite-table-as-queue pattern (the same pool/transaction
//! idioms as the lease manager and state store): jobs are rows with a
//! `visible_at` column; a worker claims the oldest visible row in its queue
//! by moving `visible_at` forward (the visibility timeout), and deletes it
//! on success. Failures bump `attempts` and reschedule with exponential
//! backoff up to `max_retries`.

use crate::errors::{DispatchError, DispatchResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{Row, SqlitePool};
use std::time::Duration;
use uuid::Uuid;

/// The two named queues: `agent` for lightweight PM replies,
/// `backend` for throughput-bound dev/qa/tech_lead spawns.
pub const QUEUE_AGENT: &str = "agent";
pub const QUEUE_BACKEND: &str = "backend";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobPayload {
    pub issue_id: Uuid,
    #[serde(default)]
    pub extra: Value,
}

impl JobPayload {
    pub fn issue(issue_id: Uuid) -> Self {
        Self {
            issue_id,
            extra: Value::Null,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Job {
    pub id: Uuid,
    pub queue: String,
    pub name: String,
    pub payload: JobPayload,
    pub attempts: u32,
}

pub struct Dispatcher {
    pool: SqlitePool,
    max_retries: u32,
    backoff_base: Duration,
    visibility_timeout: Duration,
}

impl Dispatcher {
    pub async fn new(pool: SqlitePool) -> DispatchResult<Self> {
        Self::with_config(pool, 3, Duration::from_secs(2), Duration::from_secs(60)).await
    }

    pub async fn with_config(
        pool: SqlitePool,
        max_retries: u32,
        backoff_base: Duration,
        visibility_timeout: Duration,
    ) -> DispatchResult<Self> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS dispatcher_jobs (
                id TEXT PRIMARY KEY,
                queue TEXT NOT NULL,
                name TEXT NOT NULL,
                payload TEXT NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                visible_at TEXT NOT NULL,
                created_at TEXT NOT NULL
            )"#,
        )
        .execute(&pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_queue_visible ON dispatcher_jobs(queue, visible_at)")
            .execute(&pool)
            .await?;

        Ok(Self {
            pool,
            max_retries,
            backoff_base,
            visibility_timeout,
        })
    }

    pub async fn enqueue(&self, queue: &str, name: &str, payload: JobPayload) -> DispatchResult<Uuid> {
        self.enqueue_at(queue, name, payload, Utc::now()).await
    }

    /// Delayed execution — used by the StallController to schedule the
    /// next sweep re-check via `stall_check_at`-style deferral.
    pub async fn enqueue_at(
        &self,
        queue: &str,
        name: &str,
        payload: JobPayload,
        visible_at: DateTime<Utc>,
    ) -> DispatchResult<Uuid> {
        let id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO dispatcher_jobs (id, queue, name, payload, attempts, visible_at, created_at)
             VALUES (?,?,?,?,0,?,?)",
        )
        .bind(id.to_string())
        .bind(queue)
        .bind(name)
        .bind(serde_json::to_string(&payload)?)
        .bind(visible_at.to_rfc3339())
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(id)
    }

    /// Claim the oldest visible job on `queue`, bumping `visible_at` past
    /// the visibility timeout so a crashed worker's claim expires and the
    /// job is redelivered.
    pub async fn claim(&self, queue: &str) -> DispatchResult<Option<Job>> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(
            "SELECT * FROM dispatcher_jobs WHERE queue = ? AND visible_at <= ? ORDER BY visible_at ASC LIMIT 1",
        )
        .bind(queue)
        .bind(now.to_rfc3339())
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            tx.rollback().await?;
            return Ok(None);
        };

        let id: String = row.try_get("id")?;
        let next_visible = now + chrono::Duration::from_std(self.visibility_timeout).unwrap();
        sqlx::query("UPDATE dispatcher_jobs SET visible_at = ? WHERE id = ?")
            .bind(next_visible.to_rfc3339())
            .bind(&id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        let payload: String = row.try_get("payload")?;
        Ok(Some(Job {
            id: Uuid::parse_str(&id).map_err(|e| DispatchError::UnknownQueue(e.to_string()))?,
            queue: row.try_get("queue")?,
            name: row.try_get("name")?,
            payload: serde_json::from_str(&payload)?,
            attempts: row.try_get::<i64, _>("attempts")? as u32,
        }))
    }

    pub async fn complete(&self, job_id: Uuid) -> DispatchResult<()> {
        sqlx::query("DELETE FROM dispatcher_jobs WHERE id = ?")
            .bind(job_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Report a failed attempt. Reschedules with exponential backoff until
    /// `max_retries` is exhausted, at which point the job is deleted and
    /// `RetriesExhausted` is returned so the caller can route to
    /// `AgentActionFailed` handling.
    pub async fn fail(&self, job: &Job) -> DispatchResult<()> {
        let attempts = job.attempts + 1;
        if attempts > self.max_retries {
            self.complete(job.id).await?;
            return Err(DispatchError::RetriesExhausted(job.name.clone()));
        }

        let backoff = self.backoff_base * 2u32.pow(attempts.saturating_sub(1));
        let next_visible = Utc::now() + chrono::Duration::from_std(backoff).unwrap();
        sqlx::query("UPDATE dispatcher_jobs SET attempts = ?, visible_at = ? WHERE id = ?")
            .bind(attempts as i64)
            .bind(next_visible.to_rfc3339())
            .bind(job.id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn queue_depth(&self, queue: &str) -> DispatchResult<i64> {
        let row = sqlx::query("SELECT COUNT(*) as c FROM dispatcher_jobs WHERE queue = ?")
            .bind(queue)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("c")?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn dispatcher() -> Dispatcher {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        Dispatcher::with_config(pool, 2, Duration::from_millis(5), Duration::from_millis(50))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn enqueue_then_claim_returns_job() {
        let d = dispatcher().await;
        let issue_id = Uuid::new_v4();
        d.enqueue(QUEUE_BACKEND, "dev_agent.run", JobPayload::issue(issue_id))
            .await
            .unwrap();

        let job = d.claim(QUEUE_BACKEND).await.unwrap().unwrap();
        assert_eq!(job.name, "dev_agent.run");
        assert_eq!(job.payload.issue_id, issue_id);
    }

    #[tokio::test]
    async fn claim_is_empty_for_other_queue() {
        let d = dispatcher().await;
        d.enqueue(QUEUE_AGENT, "pm_agent.reply", JobPayload::issue(Uuid::new_v4()))
            .await
            .unwrap();
        assert!(d.claim(QUEUE_BACKEND).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn fail_exhausts_retries_and_drops_job() {
        let d = dispatcher().await;
        d.enqueue(QUEUE_BACKEND, "dev_agent.run", JobPayload::issue(Uuid::new_v4()))
            .await
            .unwrap();

        let job1 = d.claim(QUEUE_BACKEND).await.unwrap().unwrap();
        d.fail(&job1).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let job2 = d.claim(QUEUE_BACKEND).await.unwrap().unwrap();
        assert_eq!(job2.attempts, 1);
        let result = d.fail(&job2).await;
        assert!(matches!(result, Err(DispatchError::RetriesExhausted(_))));
        assert_eq!(d.queue_depth(QUEUE_BACKEND).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn crashed_worker_job_is_redelivered_after_visibility_timeout() {
        let d = dispatcher().await;
        d.enqueue(QUEUE_BACKEND, "qa_agent.run", JobPayload::issue(Uuid::new_v4()))
            .await
            .unwrap();
        let _claimed = d.claim(QUEUE_BACKEND).await.unwrap().unwrap();
        assert!(d.claim(QUEUE_BACKEND).await.unwrap().is_none());

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(d.claim(QUEUE_BACKEND).await.unwrap().is_some());
    }
}
