//! Transactional persistence for issues, transitions, chat messages, and
//! agent actions, with a mandatory per-tenant row filter. Grounded in the
//! SQLite pool/init pattern used elsewhere in this workspace for the lease
//! manager and state store: `SqliteConnectOptions` with `create_if_missing`
//! and `foreign_keys(true)`, `CREATE TABLE IF NOT EXISTS` schema setup run
//! once at startup, and explicit `pool.begin()`/`tx.commit()` transactions
//! around any multi-row write.

use crate::errors::{StoreError, StoreResult};
use crate::models::*;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use std::str::FromStr;
use uuid::Uuid;

/// A single logical write applied together inside one transaction: the
/// transition row, the column/resolved_at update, and an optional chat
/// message. Matches the "transition + chat append + column update succeed
together" ordering guarantee.
pub struct TransitionWrite {
    pub issue_id: Uuid,
    pub customer_id: Uuid,
    pub from_col: Option<KanbanColumn>,
    pub to_col: KanbanColumn,
    pub actor_type: ActorType,
    pub actor_id: Option<String>,
    pub note: Option<String>,
    pub dev_fail_count_delta: i64,
    pub chat_message: Option<(SenderType, Option<AgentRole>, String)>,
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn get_issue(&self, customer_id: Uuid, issue_id: Uuid) -> StoreResult<Issue>;

    /// Tenant-unscoped lookup used only by internal dispatch workers, which
    /// learn an issue id from a job payload before they know its tenant.
    /// Never exposed over HTTP.
    async fn get_issue_by_id(&self, issue_id: Uuid) -> StoreResult<Issue>;

    async fn list_stall_candidates(&self) -> StoreResult<Vec<Issue>>;
    async fn last_activity_at(&self, issue_id: Uuid) -> StoreResult<DateTime<Utc>>;

    async fn apply_transition(&self, write: TransitionWrite) -> StoreResult<TicketTransition>;

    async fn append_chat(
        &self,
        issue_id: Uuid,
        sender_type: SenderType,
        agent_role: Option<AgentRole>,
        content: &str,
    ) -> StoreResult<ChatMessage>;

    async fn list_chat(&self, issue_id: Uuid, limit: i64) -> StoreResult<Vec<ChatMessage>>;

    async fn list_transitions(&self, issue_id: Uuid) -> StoreResult<Vec<TicketTransition>>;

    async fn record_action(&self, action: AgentAction) -> StoreResult<()>;

    /// Number of agent actions recorded against an issue so far — used by
    /// the real-time gateway's initial connection snapshot.
    async fn count_actions(&self, issue_id: Uuid) -> StoreResult<i64>;

    async fn set_stall_check_at(
        &self,
        issue_id: Uuid,
        at: DateTime<Utc>,
    ) -> StoreResult<()>;

    async fn save_credential(&self, credential: SiteCredential) -> StoreResult<()>;
}

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn new(db_path: &Path) -> StoreResult<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let options = SqliteConnectOptions::from_str(&format!(
            "sqlite://{}",
            db_path.display()
        ))?
        .create_if_missing(true)
        .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.initialize().await?;
        Ok(store)
    }

    #[cfg(test)]
    pub async fn new_in_memory() -> StoreResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect("sqlite::memory:")
            .await?;
        let store = Self { pool };
        store.initialize().await?;
        Ok(store)
    }

    async fn initialize(&self) -> StoreResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS customers (
                id TEXT PRIMARY KEY,
                email TEXT NOT NULL,
                plan TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS sites (
                id TEXT PRIMARY KEY,
                customer_id TEXT NOT NULL,
                url TEXT NOT NULL,
                name TEXT NOT NULL,
                status TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS issue_sequences (
                customer_id TEXT PRIMARY KEY,
                next_number INTEGER NOT NULL DEFAULT 1
            );

            CREATE TABLE IF NOT EXISTS issues (
                id TEXT PRIMARY KEY,
                site_id TEXT NOT NULL,
                customer_id TEXT NOT NULL,
                title TEXT NOT NULL,
                description TEXT NOT NULL,
                priority TEXT NOT NULL,
                issue_type TEXT NOT NULL,
                kanban_column TEXT NOT NULL,
                confidence_score REAL NOT NULL DEFAULT 0,
                dev_fail_count INTEGER NOT NULL DEFAULT 0,
                ticket_number INTEGER NOT NULL,
                pm_agent_id TEXT,
                dev_agent_id TEXT,
                stall_check_at TEXT,
                created_at TEXT NOT NULL,
                resolved_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_issues_customer ON issues(customer_id);
            CREATE INDEX IF NOT EXISTS idx_issues_column ON issues(kanban_column);

            CREATE TABLE IF NOT EXISTS ticket_transitions (
                id TEXT PRIMARY KEY,
                issue_id TEXT NOT NULL,
                customer_id TEXT NOT NULL,
                from_col TEXT,
                to_col TEXT NOT NULL,
                actor_type TEXT NOT NULL,
                actor_id TEXT,
                note TEXT,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_transitions_issue ON ticket_transitions(issue_id, created_at);

            CREATE TABLE IF NOT EXISTS chat_messages (
                id TEXT PRIMARY KEY,
                issue_id TEXT NOT NULL,
                customer_id TEXT NOT NULL,
                sender_type TEXT NOT NULL,
                agent_role TEXT,
                content TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_chat_issue ON chat_messages(issue_id, created_at);

            CREATE TABLE IF NOT EXISTS agent_actions (
                id TEXT PRIMARY KEY,
                issue_id TEXT NOT NULL,
                action_type TEXT NOT NULL,
                description TEXT NOT NULL,
                status TEXT NOT NULL,
                before_state TEXT,
                after_state TEXT,
                model_used TEXT,
                prompt_tokens INTEGER,
                completion_tokens INTEGER,
                total_tokens INTEGER,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_actions_issue ON agent_actions(issue_id);

            CREATE TABLE IF NOT EXISTS site_credentials (
                id TEXT PRIMARY KEY,
                site_id TEXT NOT NULL,
                customer_id TEXT NOT NULL,
                credential_type TEXT NOT NULL,
                ciphertext BLOB NOT NULL,
                nonce BLOB NOT NULL,
                tag BLOB NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_credentials_site ON site_credentials(site_id);
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    fn row_to_issue(row: &sqlx::sqlite::SqliteRow) -> StoreResult<Issue> {
        let kanban_column: String = row.try_get("kanban_column")?;
        let issue_type: String = row.try_get("issue_type")?;
        let created_at: String = row.try_get("created_at")?;
        let stall_check_at: Option<String> = row.try_get("stall_check_at")?;
        let resolved_at: Option<String> = row.try_get("resolved_at")?;

        Ok(Issue {
            id: Uuid::parse_str(row.try_get::<String, _>("id")?.as_str())
                .map_err(|e| StoreError::NotFound(e.to_string()))?,
            site_id: Uuid::parse_str(row.try_get::<String, _>("site_id")?.as_str())
                .map_err(|e| StoreError::NotFound(e.to_string()))?,
            customer_id: Uuid::parse_str(row.try_get::<String, _>("customer_id")?.as_str())
                .map_err(|e| StoreError::NotFound(e.to_string()))?,
            title: row.try_get("title")?,
            description: row.try_get("description")?,
            priority: row.try_get("priority")?,
            issue_type: match issue_type.as_str() {
                "site_build" => IssueType::SiteBuild,
                _ => IssueType::Maintenance,
            },
            kanban_column: KanbanColumn::parse(&kanban_column)
                .ok_or_else(|| StoreError::NotFound(format!("bad column {kanban_column}")))?,
            confidence_score: row.try_get("confidence_score")?,
            dev_fail_count: row.try_get("dev_fail_count")?,
            ticket_number: row.try_get("ticket_number")?,
            pm_agent_id: row.try_get("pm_agent_id")?,
            dev_agent_id: row.try_get("dev_agent_id")?,
            stall_check_at: stall_check_at
                .map(|s| DateTime::parse_from_rfc3339(&s).map(|d| d.with_timezone(&Utc)))
                .transpose()
                .map_err(|e| StoreError::NotFound(e.to_string()))?,
            created_at: DateTime::parse_from_rfc3339(&created_at)
                .map_err(|e| StoreError::NotFound(e.to_string()))?
                .with_timezone(&Utc),
            resolved_at: resolved_at
                .map(|s| DateTime::parse_from_rfc3339(&s).map(|d| d.with_timezone(&Utc)))
                .transpose()
                .map_err(|e| StoreError::NotFound(e.to_string()))?,
        })
    }

    /// Allocate the next monotonic, per-tenant ticket number.
    pub async fn next_ticket_number(&self, customer_id: Uuid) -> StoreResult<i64> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO issue_sequences (customer_id, next_number) VALUES (?, 2)
             ON CONFLICT(customer_id) DO UPDATE SET next_number = next_number + 1",
        )
        .bind(customer_id.to_string())
        .execute(&mut *tx)
        .await?;
        let row = sqlx::query("SELECT next_number FROM issue_sequences WHERE customer_id = ?")
            .bind(customer_id.to_string())
            .fetch_one(&mut *tx)
            .await?;
        let next: i64 = row.try_get("next_number")?;
        tx.commit().await?;
        Ok(next - 1)
    }

    pub async fn insert_issue(&self, issue: &Issue) -> StoreResult<()> {
        sqlx::query(
            r#"INSERT INTO issues
            (id, site_id, customer_id, title, description, priority, issue_type,
             kanban_column, confidence_score, dev_fail_count, ticket_number,
             pm_agent_id, dev_agent_id, stall_check_at, created_at, resolved_at)
            VALUES (?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?)"#,
        )
        .bind(issue.id.to_string())
        .bind(issue.site_id.to_string())
        .bind(issue.customer_id.to_string())
        .bind(&issue.title)
        .bind(&issue.description)
        .bind(&issue.priority)
        .bind(match issue.issue_type {
            IssueType::Maintenance => "maintenance",
            IssueType::SiteBuild => "site_build",
        })
        .bind(issue.kanban_column.as_str())
        .bind(issue.confidence_score)
        .bind(issue.dev_fail_count)
        .bind(issue.ticket_number)
        .bind(&issue.pm_agent_id)
        .bind(&issue.dev_agent_id)
        .bind(issue.stall_check_at.map(|t| t.to_rfc3339()))
        .bind(issue.created_at.to_rfc3339())
        .bind(issue.resolved_at.map(|t| t.to_rfc3339()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn get_issue(&self, customer_id: Uuid, issue_id: Uuid) -> StoreResult<Issue> {
        let row = sqlx::query("SELECT * FROM issues WHERE id = ? AND customer_id = ?")
            .bind(issue_id.to_string())
            .bind(customer_id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("issue {issue_id}")))?;
        Self::row_to_issue(&row)
    }

    async fn get_issue_by_id(&self, issue_id: Uuid) -> StoreResult<Issue> {
        let row = sqlx::query("SELECT * FROM issues WHERE id = ?")
            .bind(issue_id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("issue {issue_id}")))?;
        Self::row_to_issue(&row)
    }

    async fn list_stall_candidates(&self) -> StoreResult<Vec<Issue>> {
        let now = Utc::now().to_rfc3339();
        let rows = sqlx::query(
            "SELECT * FROM issues WHERE kanban_column IN ('todo','ready_for_qa','in_progress','in_qa')
             AND (stall_check_at IS NULL OR stall_check_at <= ?)",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_issue).collect()
    }

    async fn last_activity_at(&self, issue_id: Uuid) -> StoreResult<DateTime<Utc>> {
        let issue_row = sqlx::query("SELECT created_at FROM issues WHERE id = ?")
            .bind(issue_id.to_string())
            .fetch_one(&self.pool)
            .await?;
        let created_at: String = issue_row.try_get("created_at")?;
        let mut latest = DateTime::parse_from_rfc3339(&created_at)
            .map_err(|e| StoreError::NotFound(e.to_string()))?
            .with_timezone(&Utc);

        if let Some(row) = sqlx::query(
            "SELECT created_at FROM ticket_transitions WHERE issue_id = ? ORDER BY created_at DESC LIMIT 1",
        )
        .bind(issue_id.to_string())
        .fetch_optional(&self.pool)
        .await?
        {
            let ts: String = row.try_get("created_at")?;
            let ts = DateTime::parse_from_rfc3339(&ts)
                .map_err(|e| StoreError::NotFound(e.to_string()))?
                .with_timezone(&Utc);
            if ts > latest {
                latest = ts;
            }
        }

        if let Some(row) = sqlx::query(
            "SELECT created_at FROM chat_messages WHERE issue_id = ? ORDER BY created_at DESC LIMIT 1",
        )
        .bind(issue_id.to_string())
        .fetch_optional(&self.pool)
        .await?
        {
            let ts: String = row.try_get("created_at")?;
            let ts = DateTime::parse_from_rfc3339(&ts)
                .map_err(|e| StoreError::NotFound(e.to_string()))?
                .with_timezone(&Utc);
            if ts > latest {
                latest = ts;
            }
        }

        Ok(latest)
    }

    async fn apply_transition(&self, write: TransitionWrite) -> StoreResult<TicketTransition> {
        let mut tx = self.pool.begin().await?;
        let now = Utc::now();
        let transition = TicketTransition {
            id: Uuid::new_v4(),
            issue_id: write.issue_id,
            from_col: write.from_col,
            to_col: write.to_col,
            actor_type: write.actor_type,
            actor_id: write.actor_id.clone(),
            note: write.note.clone(),
            created_at: now,
        };

        sqlx::query(
            "INSERT INTO ticket_transitions (id, issue_id, customer_id, from_col, to_col, actor_type, actor_id, note, created_at)
             VALUES (?,?,?,?,?,?,?,?,?)",
        )
        .bind(transition.id.to_string())
        .bind(write.issue_id.to_string())
        .bind(write.customer_id.to_string())
        .bind(write.from_col.map(|c| c.as_str().to_string()))
        .bind(write.to_col.as_str())
        .bind(write.actor_type.as_str())
        .bind(&write.actor_id)
        .bind(&write.note)
        .bind(now.to_rfc3339())
        .execute(&mut *tx)
        .await?;

        let resolved_at = if write.to_col == KanbanColumn::Done {
            Some(now.to_rfc3339())
        } else {
            None
        };

        sqlx::query(
            "UPDATE issues SET kanban_column = ?, dev_fail_count = dev_fail_count + ?,
             resolved_at = COALESCE(?, resolved_at)
             WHERE id = ? AND customer_id = ?",
        )
        .bind(write.to_col.as_str())
        .bind(write.dev_fail_count_delta)
        .bind(resolved_at)
        .bind(write.issue_id.to_string())
        .bind(write.customer_id.to_string())
        .execute(&mut *tx)
        .await?;

        if write.to_col == KanbanColumn::InProgress {
            sqlx::query("UPDATE issues SET stall_check_at = ? WHERE id = ?")
                .bind(now.to_rfc3339())
                .bind(write.issue_id.to_string())
                .execute(&mut *tx)
                .await?;
        }

        if let Some((sender_type, agent_role, content)) = &write.chat_message {
            sqlx::query(
                "INSERT INTO chat_messages (id, issue_id, customer_id, sender_type, agent_role, content, created_at)
                 VALUES (?,?,?,?,?,?,?)",
            )
            .bind(Uuid::new_v4().to_string())
            .bind(write.issue_id.to_string())
            .bind(write.customer_id.to_string())
            .bind(sender_type.as_str())
            .bind(agent_role.map(|r| r.as_str().to_string()))
            .bind(content)
            .bind(now.to_rfc3339())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(transition)
    }

    async fn append_chat(
        &self,
        issue_id: Uuid,
        sender_type: SenderType,
        agent_role: Option<AgentRole>,
        content: &str,
    ) -> StoreResult<ChatMessage> {
        let customer_id: String = sqlx::query("SELECT customer_id FROM issues WHERE id = ?")
            .bind(issue_id.to_string())
            .fetch_one(&self.pool)
            .await?
            .try_get("customer_id")?;

        let message = ChatMessage {
            id: Uuid::new_v4(),
            issue_id,
            sender_type,
            agent_role,
            content: content.to_string(),
            created_at: Utc::now(),
        };

        sqlx::query(
            "INSERT INTO chat_messages (id, issue_id, customer_id, sender_type, agent_role, content, created_at)
             VALUES (?,?,?,?,?,?,?)",
        )
        .bind(message.id.to_string())
        .bind(issue_id.to_string())
        .bind(customer_id)
        .bind(sender_type.as_str())
        .bind(agent_role.map(|r| r.as_str().to_string()))
        .bind(content)
        .bind(message.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(message)
    }

    async fn list_chat(&self, issue_id: Uuid, limit: i64) -> StoreResult<Vec<ChatMessage>> {
        let rows = sqlx::query(
            "SELECT * FROM chat_messages WHERE issue_id = ? ORDER BY created_at DESC LIMIT ?",
        )
        .bind(issue_id.to_string())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut messages = Vec::with_capacity(rows.len());
        for row in rows.iter().rev() {
            let sender_type: String = row.try_get("sender_type")?;
            let agent_role: Option<String> = row.try_get("agent_role")?;
            let created_at: String = row.try_get("created_at")?;
            messages.push(ChatMessage {
                id: Uuid::parse_str(row.try_get::<String, _>("id")?.as_str())
                    .map_err(|e| StoreError::NotFound(e.to_string()))?,
                issue_id,
                sender_type: match sender_type.as_str() {
                    "agent" => SenderType::Agent,
                    "system" => SenderType::System,
                    _ => SenderType::User,
                },
                agent_role: agent_role.and_then(|r| parse_agent_role(&r)),
                content: row.try_get("content")?,
                created_at: DateTime::parse_from_rfc3339(&created_at)
                    .map_err(|e| StoreError::NotFound(e.to_string()))?
                    .with_timezone(&Utc),
            });
        }
        Ok(messages)
    }

    async fn list_transitions(&self, issue_id: Uuid) -> StoreResult<Vec<TicketTransition>> {
        let rows = sqlx::query(
            "SELECT * FROM ticket_transitions WHERE issue_id = ? ORDER BY created_at ASC",
        )
        .bind(issue_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let from_col: Option<String> = row.try_get("from_col")?;
                let to_col: String = row.try_get("to_col")?;
                let actor_type: String = row.try_get("actor_type")?;
                let created_at: String = row.try_get("created_at")?;
                Ok(TicketTransition {
                    id: Uuid::parse_str(row.try_get::<String, _>("id")?.as_str())
                        .map_err(|e| StoreError::NotFound(e.to_string()))?,
                    issue_id,
                    from_col: from_col.and_then(|c| KanbanColumn::parse(&c)),
                    to_col: KanbanColumn::parse(&to_col)
                        .ok_or_else(|| StoreError::NotFound(format!("bad column {to_col}")))?,
                    actor_type: ActorType::parse(&actor_type)
                        .ok_or_else(|| StoreError::NotFound(format!("bad actor {actor_type}")))?,
                    actor_id: row.try_get("actor_id")?,
                    note: row.try_get("note")?,
                    created_at: DateTime::parse_from_rfc3339(&created_at)
                        .map_err(|e| StoreError::NotFound(e.to_string()))?
                        .with_timezone(&Utc),
                })
            })
            .collect()
    }

    async fn record_action(&self, action: AgentAction) -> StoreResult<()> {
        sqlx::query(
            r#"INSERT INTO agent_actions
            (id, issue_id, action_type, description, status, before_state, after_state,
             model_used, prompt_tokens, completion_tokens, total_tokens, created_at)
            VALUES (?,?,?,?,?,?,?,?,?,?,?,?)"#,
        )
        .bind(action.id.to_string())
        .bind(action.issue_id.to_string())
        .bind(&action.action_type)
        .bind(&action.description)
        .bind(action.status.as_str())
        .bind(action.before_state.map(|v| v.to_string()))
        .bind(action.after_state.map(|v| v.to_string()))
        .bind(&action.model_used)
        .bind(action.prompt_tokens)
        .bind(action.completion_tokens)
        .bind(action.total_tokens)
        .bind(action.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn count_actions(&self, issue_id: Uuid) -> StoreResult<i64> {
        let row = sqlx::query("SELECT COUNT(*) as c FROM agent_actions WHERE issue_id = ?")
            .bind(issue_id.to_string())
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("c")?)
    }

    async fn set_stall_check_at(&self, issue_id: Uuid, at: DateTime<Utc>) -> StoreResult<()> {
        sqlx::query("UPDATE issues SET stall_check_at = ? WHERE id = ?")
            .bind(at.to_rfc3339())
            .bind(issue_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn save_credential(&self, credential: SiteCredential) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO site_credentials (id, site_id, customer_id, credential_type, ciphertext, nonce, tag, created_at)
             VALUES (?,?,?,?,?,?,?,?)",
        )
        .bind(credential.id.to_string())
        .bind(credential.site_id.to_string())
        .bind(credential.customer_id.to_string())
        .bind(format!("{:?}", credential.credential_type))
        .bind(credential.ciphertext)
        .bind(credential.nonce)
        .bind(credential.tag)
        .bind(credential.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn parse_agent_role(s: &str) -> Option<AgentRole> {
    Some(match s {
        "pm_agent" => AgentRole::PmAgent,
        "dev_agent" => AgentRole::DevAgent,
        "qa_agent" => AgentRole::QaAgent,
        "tech_lead" => AgentRole::TechLead,
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_issue(customer_id: Uuid) -> Issue {
        Issue {
            id: Uuid::new_v4(),
            site_id: Uuid::new_v4(),
            customer_id,
            title: "Broken checkout".into(),
            description: "Checkout button does nothing".into(),
            priority: "high".into(),
            issue_type: IssueType::Maintenance,
            kanban_column: KanbanColumn::Triage,
            confidence_score: 0.0,
            dev_fail_count: 0,
            ticket_number: 1,
            pm_agent_id: None,
            dev_agent_id: None,
            stall_check_at: None,
            created_at: Utc::now(),
            resolved_at: None,
        }
    }

    #[tokio::test]
    async fn insert_and_fetch_issue() {
        let store = SqliteStore::new_in_memory().await.unwrap();
        let customer_id = Uuid::new_v4();
        let issue = sample_issue(customer_id);
        store.insert_issue(&issue).await.unwrap();

        let fetched = store.get_issue(customer_id, issue.id).await.unwrap();
        assert_eq!(fetched.kanban_column, KanbanColumn::Triage);
        assert_eq!(fetched.legacy_status(), LegacyStatus::Open);
    }

    #[tokio::test]
    async fn tenant_isolation_rejects_foreign_read() {
        let store = SqliteStore::new_in_memory().await.unwrap();
        let customer_id = Uuid::new_v4();
        let issue = sample_issue(customer_id);
        store.insert_issue(&issue).await.unwrap();

        let other_customer = Uuid::new_v4();
        let result = store.get_issue(other_customer, issue.id).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn apply_transition_writes_transition_and_chat_atomically() {
        let store = SqliteStore::new_in_memory().await.unwrap();
        let customer_id = Uuid::new_v4();
        let issue = sample_issue(customer_id);
        store.insert_issue(&issue).await.unwrap();

        store
            .apply_transition(TransitionWrite {
                issue_id: issue.id,
                customer_id,
                from_col: Some(KanbanColumn::Triage),
                to_col: KanbanColumn::ReadyForUatApproval,
                actor_type: ActorType::PmAgent,
                actor_id: None,
                note: None,
                dev_fail_count_delta: 0,
                chat_message: Some((SenderType::Agent, Some(AgentRole::PmAgent), "starting".into())),
            })
            .await
            .unwrap();

        let fetched = store.get_issue(customer_id, issue.id).await.unwrap();
        assert_eq!(fetched.kanban_column, KanbanColumn::ReadyForUatApproval);

        let chat = store.list_chat(issue.id, 10).await.unwrap();
        assert_eq!(chat.len(), 1);

        let transitions = store.list_transitions(issue.id).await.unwrap();
        assert_eq!(transitions.len(), 1);
    }

    #[tokio::test]
    async fn ticket_number_sequence_is_monotonic_per_tenant() {
        let store = SqliteStore::new_in_memory().await.unwrap();
        let customer_id = Uuid::new_v4();
        let first = store.next_ticket_number(customer_id).await.unwrap();
        let second = store.next_ticket_number(customer_id).await.unwrap();
        assert_eq!(second, first + 1);
    }
}
