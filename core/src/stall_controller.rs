//! Periodic sweep enforcing the pickup/stuck/warn/escalate tiers below.
//! Grounded in this workspace's periodic-sweep pattern (a
//! `tokio::time::interval` loop owned by a small struct) generalised from a
//! single check into the five-tier table below.

use crate::config::StallConfig;
use crate::dispatcher::{Dispatcher, JobPayload, QUEUE_BACKEND};
use crate::errors::EngineResult;
use crate::models::{ActorType, KanbanColumn, SenderType};
use crate::state_machine::StateMachine;
use crate::store::Store;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

pub struct StallController {
    store: Arc<dyn Store>,
    state_machine: Arc<StateMachine>,
    dispatcher: Arc<Dispatcher>,
    config: StallConfig,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub examined: usize,
    pub dev_enqueued: usize,
    pub qa_enqueued: usize,
    pub reverted_to_ready_for_qa: usize,
    pub reverted_to_todo: usize,
    pub warned: usize,
    pub escalated: usize,
}

impl StallController {
    pub fn new(
        store: Arc<dyn Store>,
        state_machine: Arc<StateMachine>,
        dispatcher: Arc<Dispatcher>,
        config: StallConfig,
    ) -> Self {
        Self {
            store,
            state_machine,
            dispatcher,
            config,
        }
    }

    /// Run the loop forever, sweeping every `config.sweep_interval_seconds`.
    /// Intended to be spawned as a background task by the daemon binary.
    pub async fn run_forever(self: Arc<Self>) {
        let mut interval = tokio::time::interval(Duration::from_secs(self.config.sweep_interval_seconds));
        loop {
            interval.tick().await;
            if let Err(err) = self.sweep_once().await {
                tracing::error!(error = %err, "stall sweep failed");
            }
        }
    }

    /// One pass over every candidate issue (the eligibility filter
    /// is applied by `Store::list_stall_candidates`).
    pub async fn sweep_once(&self) -> EngineResult<SweepReport> {
        let mut report = SweepReport::default();
        let issues = self.store.list_stall_candidates().await?;

        for issue in issues {
            report.examined += 1;
            let last_activity = self.store.last_activity_at(issue.id).await?;
            let age = Utc::now().signed_duration_since(last_activity);
            let age_secs = age.num_seconds();

            // Tiers are mutually exclusive bands keyed by age, checked from
            // the most severe down, so a ticket stuck for hours escalates
            // exactly once rather than being caught by a lower revert tier
            // on every sweep (tiers 2b/2c/3a/3b share columns
            // and would otherwise all match simultaneously for old tickets).
            match issue.kanban_column {
                KanbanColumn::Todo if age_secs >= self.config.pickup_threshold_seconds => {
                    self.dispatcher
                        .enqueue(QUEUE_BACKEND, "dev_agent.run", JobPayload::issue(issue.id))
                        .await?;
                    self.bump_stall_check(issue.id, 15 * 60).await?;
                    report.dev_enqueued += 1;
                }
                KanbanColumn::ReadyForQa if age_secs >= self.config.pickup_threshold_seconds => {
                    self.dispatcher
                        .enqueue(QUEUE_BACKEND, "qa_agent.run", JobPayload::issue(issue.id))
                        .await?;
                    self.bump_stall_check(issue.id, 15 * 60).await?;
                    report.qa_enqueued += 1;
                }
                KanbanColumn::InProgress | KanbanColumn::InQa
                    if age_secs >= self.config.escalate_threshold_seconds =>
                {
                    self.escalate(&issue).await?;
                    report.escalated += 1;
                }
                KanbanColumn::InProgress | KanbanColumn::InQa
                    if age_secs >= self.config.warn_threshold_seconds =>
                {
                    self.warn(&issue).await?;
                    report.warned += 1;
                }
                KanbanColumn::InQa if age_secs >= self.config.stuck_threshold_seconds => {
                    self.revert(&issue, KanbanColumn::ReadyForQa, "retrying QA").await?;
                    report.reverted_to_ready_for_qa += 1;
                }
                KanbanColumn::InProgress if age_secs >= self.config.stuck_threshold_seconds => {
                    self.revert(&issue, KanbanColumn::Todo, "retrying").await?;
                    report.reverted_to_todo += 1;
                }
                _ => {}
            }
        }

        Ok(report)
    }

    async fn bump_stall_check(&self, issue_id: uuid::Uuid, secs: i64) -> EngineResult<()> {
        let at: DateTime<Utc> = Utc::now() + chrono::Duration::seconds(secs);
        self.store.set_stall_check_at(issue_id, at).await?;
        Ok(())
    }

    async fn revert(
        &self,
        issue: &crate::models::Issue,
        to_col: KanbanColumn,
        message: &str,
    ) -> EngineResult<()> {
        self.state_machine
            .transition(
                issue.customer_id,
                issue.id,
                ActorType::System,
                None,
                to_col,
                Some(message.to_string()),
            )
            .await?;
        self.store
            .append_chat(issue.id, SenderType::System, None, message)
            .await?;
        self.bump_stall_check(issue.id, 15 * 60).await?;
        Ok(())
    }

    async fn warn(&self, issue: &crate::models::Issue) -> EngineResult<()> {
        self.store
            .append_chat(
                issue.id,
                SenderType::System,
                None,
                "This ticket is taking longer than expected. We'll keep you posted.",
            )
            .await?;
        self.bump_stall_check(issue.id, 30 * 60).await?;
        Ok(())
    }

    async fn escalate(&self, issue: &crate::models::Issue) -> EngineResult<()> {
        self.dispatcher
            .enqueue(QUEUE_BACKEND, "tech_lead.run", JobPayload::issue(issue.id))
            .await?;
        self.store
            .append_chat(
                issue.id,
                SenderType::System,
                None,
                "Escalated to a senior engineer for review.",
            )
            .await?;
        self.bump_stall_check(issue.id, 4 * 60 * 60).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_bus::EventBus;
    use crate::models::*;
    use crate::store::SqliteStore;
    use uuid::Uuid;

    async fn harness(
        config: StallConfig,
    ) -> (StallController, Arc<SqliteStore>, Uuid, Uuid) {
        let store = Arc::new(SqliteStore::new_in_memory().await.unwrap());
        let event_bus = Arc::new(EventBus::new());
        let dispatcher = Arc::new(Dispatcher::new(store.pool().clone()).await.unwrap());
        let state_machine = Arc::new(StateMachine::new(store.clone(), event_bus, dispatcher.clone()));

        let customer_id = Uuid::new_v4();
        let issue = Issue {
            id: Uuid::new_v4(),
            site_id: Uuid::new_v4(),
            customer_id,
            title: "t".into(),
            description: "d".into(),
            priority: "high".into(),
            issue_type: IssueType::Maintenance,
            kanban_column: KanbanColumn::Todo,
            confidence_score: 0.0,
            dev_fail_count: 0,
            ticket_number: 1,
            pm_agent_id: None,
            dev_agent_id: None,
            stall_check_at: None,
            created_at: Utc::now() - chrono::Duration::seconds(3600),
            resolved_at: None,
        };
        store.insert_issue(&issue).await.unwrap();
        let issue_id = issue.id;

        let controller = StallController::new(store.clone(), state_machine, dispatcher, config);
        (controller, store, customer_id, issue_id)
    }

    #[tokio::test]
    async fn todo_issue_stale_for_pickup_threshold_enqueues_dev_runner() {
        let (controller, _store, _customer_id, _issue_id) = harness(StallConfig {
            sweep_interval_seconds: 1,
            pickup_threshold_seconds: 1,
            stuck_threshold_seconds: 10,
            warn_threshold_seconds: 100,
            escalate_threshold_seconds: 1000,
        })
        .await;

        let report = controller.sweep_once().await.unwrap();
        assert_eq!(report.dev_enqueued, 1);
    }

    #[tokio::test]
    async fn in_progress_issue_stuck_past_threshold_reverts_to_todo() {
        let (controller, store, customer_id, issue_id) = harness(StallConfig {
            sweep_interval_seconds: 1,
            pickup_threshold_seconds: 100000,
            stuck_threshold_seconds: 1,
            warn_threshold_seconds: 100000,
            escalate_threshold_seconds: 1000000,
        })
        .await;

        store
            .apply_transition(crate::store::TransitionWrite {
                issue_id,
                customer_id,
                from_col: Some(KanbanColumn::Todo),
                to_col: KanbanColumn::InProgress,
                actor_type: ActorType::DevAgent,
                actor_id: None,
                note: None,
                dev_fail_count_delta: 0,
                chat_message: None,
            })
            .await
            .unwrap();

        let report = controller.sweep_once().await.unwrap();
        assert_eq!(report.reverted_to_todo, 1);

        let issue = store.get_issue(customer_id, issue_id).await.unwrap();
        assert_eq!(issue.kanban_column, KanbanColumn::Todo);
    }
}
