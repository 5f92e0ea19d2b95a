//! The Kanban transition permission matrix, legacy-status projection, and
//! post-transition side-effects. Structurally grounded in this
//! workspace's workflow-state-machine pattern — an owned struct wrapping a
//! `Store`, exposing a single `process_*` entry point that validates,
//! writes one transaction, and returns a typed outcome — generalised here
//! from a five-state generic workflow to the fixed nine-column pipeline.

use crate::dispatcher::{Dispatcher, JobPayload};
use crate::errors::{EngineError, EngineResult};
use crate::event_bus::{EventBus, IssueEvent};
use crate::models::*;
use crate::store::{Store, TransitionWrite};
use std::sync::Arc;
use uuid::Uuid;

/// The number of UAT/QA failures at which the issue is handed to tech_lead
/// instead of being re-queued for dev.
pub const TECH_LEAD_ESCALATION_THRESHOLD: i64 = 3;

/// The result of attempting a transition. `Skipped` is not an error — it is
/// the idempotency guard's outcome for a duplicate or stale callback
/// (a duplicate transition request, or a callback that lost a race).
#[derive(Debug, Clone)]
pub enum TransitionOutcome {
    Applied(TicketTransition),
    Skipped { reason: String },
}

pub struct StateMachine {
    store: Arc<dyn Store>,
    event_bus: Arc<EventBus>,
    dispatcher: Arc<Dispatcher>,
}

impl StateMachine {
    pub fn new(store: Arc<dyn Store>, event_bus: Arc<EventBus>, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            store,
            event_bus,
            dispatcher,
        }
    }

    /// Whether `actor` may move an issue currently at `from` to `to`,
    /// per the permission matrix below. `system` may transition from
    /// anywhere to anywhere non-terminal-violating; `tech_lead` may only
    /// move an issue to `in_progress`.
    pub fn is_allowed(actor: ActorType, from: KanbanColumn, to: KanbanColumn) -> bool {
        use ActorType::*;
        use KanbanColumn::*;

        if to == Dismissed {
            return matches!(actor, Customer | System) && !from.is_terminal();
        }

        match actor {
            Customer => matches!(
                (from, to),
                (ReadyForUatApproval, Todo) | (ReadyForUat, Done) | (ReadyForUat, Todo)
            ),
            PmAgent => matches!((from, to), (Triage, ReadyForUatApproval)),
            DevAgent => matches!((from, to), (Todo, InProgress) | (InProgress, ReadyForQa)),
            QaAgent => matches!(
                (from, to),
                (ReadyForQa, InQa) | (InQa, ReadyForUat) | (InQa, Todo)
            ),
            TechLead => to == InProgress && !from.is_terminal(),
            System => !from.is_terminal(),
        }
    }

    /// Whether a UAT-fail or QA-fail transition (the two paths that bump
    /// `dev_fail_count`) is being requested.
    fn increments_dev_fail_count(from: KanbanColumn, to: KanbanColumn) -> bool {
        matches!(
            (from, to),
            (KanbanColumn::ReadyForUat, KanbanColumn::Todo) | (KanbanColumn::InQa, KanbanColumn::Todo)
        )
    }

    /// Apply a transition requested by a human or agent actor through the
    /// permission matrix. Rejections surface as `ConflictError` and commit
    /// nothing.
    pub async fn transition(
        &self,
        customer_id: Uuid,
        issue_id: Uuid,
        actor_type: ActorType,
        actor_id: Option<String>,
        to_col: KanbanColumn,
        note: Option<String>,
    ) -> EngineResult<TransitionOutcome> {
        let issue = self.store.get_issue(customer_id, issue_id).await?;
        let from = issue.kanban_column;

        if from.is_terminal() {
            return Err(EngineError::ConflictError(format!(
                "issue {issue_id} is already in terminal column {from}"
            )));
        }

        if !Self::is_allowed(actor_type, from, to_col) {
            return Err(EngineError::ConflictError(format!(
                "actor {actor_type:?} may not move issue from {from} to {to_col}"
            )));
        }

        self.apply(&issue, from, to_col, actor_type, actor_id, note, None)
            .await
    }

    /// Apply a transition requested via an agent callback, subject to the
    /// order-based idempotency guard: if the issue's
    /// current column is already at or past `to_col` in canonical order,
    /// the request is a no-op.
    pub async fn transition_from_callback(
        &self,
        customer_id: Uuid,
        issue_id: Uuid,
        actor_type: ActorType,
        to_col: KanbanColumn,
        chat_message: Option<(SenderType, Option<AgentRole>, String)>,
    ) -> EngineResult<TransitionOutcome> {
        let issue = self.store.get_issue(customer_id, issue_id).await?;
        let from = issue.kanban_column;

        if from.is_terminal() {
            return Ok(TransitionOutcome::Skipped {
                reason: "already_at_or_past_target".into(),
            });
        }

        if let (Some(current_idx), Some(target_idx)) = (from.order_index(), to_col.order_index()) {
            if current_idx >= target_idx {
                return Ok(TransitionOutcome::Skipped {
                    reason: "already_at_or_past_target".into(),
                });
            }
        }

        self.apply(&issue, from, to_col, actor_type, None, None, chat_message)
            .await
    }

    async fn apply(
        &self,
        issue: &Issue,
        from: KanbanColumn,
        to_col: KanbanColumn,
        actor_type: ActorType,
        actor_id: Option<String>,
        note: Option<String>,
        chat_message: Option<(SenderType, Option<AgentRole>, String)>,
    ) -> EngineResult<TransitionOutcome> {
        let dev_fail_count_delta = if Self::increments_dev_fail_count(from, to_col) {
            1
        } else {
            0
        };

        let transition = self
            .store
            .apply_transition(TransitionWrite {
                issue_id: issue.id,
                customer_id: issue.customer_id,
                from_col: Some(from),
                to_col,
                actor_type,
                actor_id,
                note,
                dev_fail_count_delta,
                chat_message,
            })
            .await?;

        let dev_fail_count = issue.dev_fail_count + dev_fail_count_delta;
        self.run_side_effects(issue.id, from, to_col, dev_fail_count).await?;

        self.event_bus.publish(IssueEvent::issue_updated(issue.id, to_col));

        Ok(TransitionOutcome::Applied(transition))
    }

    /// Post-transition side-effects: enqueue the next agent runner, or
    /// escalate to tech_lead once `dev_fail_count` reaches the threshold
    /// Column-specific invariants enforced on entry.
    async fn run_side_effects(
        &self,
        issue_id: Uuid,
        from: KanbanColumn,
        to_col: KanbanColumn,
        dev_fail_count: i64,
    ) -> EngineResult<()> {
        if Self::increments_dev_fail_count(from, to_col) && dev_fail_count >= TECH_LEAD_ESCALATION_THRESHOLD {
            self.dispatcher
                .enqueue("backend", "tech_lead.run", JobPayload::issue(issue_id))
                .await?;
            return Ok(());
        }

        match to_col {
            KanbanColumn::Todo => {
                self.dispatcher
                    .enqueue("backend", "dev_agent.run", JobPayload::issue(issue_id))
                    .await?;
            }
            KanbanColumn::ReadyForQa => {
                self.dispatcher
                    .enqueue("backend", "qa_agent.run", JobPayload::issue(issue_id))
                    .await?;
            }
            KanbanColumn::ReadyForUatApproval | KanbanColumn::Done | KanbanColumn::Dismissed => {
                // issue_updated already published above; nothing further to enqueue.
            }
            _ => {}
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::Dispatcher as Disp;
    use crate::store::SqliteStore;

    async fn harness() -> (StateMachine, Arc<SqliteStore>, Uuid, Uuid) {
        let store = Arc::new(SqliteStore::new_in_memory().await.unwrap());
        let event_bus = Arc::new(EventBus::new());
        let dispatcher = Arc::new(Disp::new(store.pool().clone()).await.unwrap());
        let customer_id = Uuid::new_v4();
        let issue = Issue {
            id: Uuid::new_v4(),
            site_id: Uuid::new_v4(),
            customer_id,
            title: "t".into(),
            description: "d".into(),
            priority: "high".into(),
            issue_type: IssueType::Maintenance,
            kanban_column: KanbanColumn::Triage,
            confidence_score: 0.0,
            dev_fail_count: 0,
            ticket_number: 1,
            pm_agent_id: None,
            dev_agent_id: None,
            stall_check_at: None,
            created_at: chrono::Utc::now(),
            resolved_at: None,
        };
        store.insert_issue(&issue).await.unwrap();
        let issue_id = issue.id;
        let sm = StateMachine::new(store.clone(), event_bus, dispatcher);
        (sm, store, customer_id, issue_id)
    }

    #[tokio::test]
    async fn pm_agent_can_move_triage_to_ready_for_uat_approval() {
        let (sm, store, customer_id, issue_id) = harness().await;
        let outcome = sm
            .transition(
                customer_id,
                issue_id,
                ActorType::PmAgent,
                None,
                KanbanColumn::ReadyForUatApproval,
                None,
            )
            .await
            .unwrap();
        assert!(matches!(outcome, TransitionOutcome::Applied(_)));
        let issue = store.get_issue(customer_id, issue_id).await.unwrap();
        assert_eq!(issue.kanban_column, KanbanColumn::ReadyForUatApproval);
        assert_eq!(issue.legacy_status(), LegacyStatus::Open);
    }

    #[tokio::test]
    async fn dev_agent_cannot_skip_to_done() {
        let (sm, _store, customer_id, issue_id) = harness().await;
        let result = sm
            .transition(
                customer_id,
                issue_id,
                ActorType::DevAgent,
                None,
                KanbanColumn::Done,
                None,
            )
            .await;
        assert!(matches!(result, Err(EngineError::ConflictError(_))));
    }

    #[tokio::test]
    async fn callback_idempotency_guard_skips_stale_transition() {
        let (sm, store, customer_id, issue_id) = harness().await;
        sm.transition(customer_id, issue_id, ActorType::PmAgent, None, KanbanColumn::ReadyForUatApproval, None)
            .await
            .unwrap();
        sm.transition(customer_id, issue_id, ActorType::Customer, None, KanbanColumn::Todo, None)
            .await
            .unwrap();
        sm.transition(customer_id, issue_id, ActorType::DevAgent, None, KanbanColumn::InProgress, None)
            .await
            .unwrap();
        sm.transition_from_callback(customer_id, issue_id, ActorType::DevAgent, KanbanColumn::ReadyForQa, None)
            .await
            .unwrap();

        // Duplicate callback requesting the same transition again: should be skipped.
        let outcome = sm
            .transition_from_callback(customer_id, issue_id, ActorType::DevAgent, KanbanColumn::ReadyForQa, None)
            .await
            .unwrap();
        assert!(matches!(outcome, TransitionOutcome::Skipped { .. }));

        let transitions = store.list_transitions(issue_id).await.unwrap();
        assert_eq!(transitions.len(), 3);
    }

    #[tokio::test]
    async fn entering_done_sets_resolved_at() {
        let (sm, store, customer_id, issue_id) = harness().await;
        sm.transition(customer_id, issue_id, ActorType::PmAgent, None, KanbanColumn::ReadyForUatApproval, None)
            .await
            .unwrap();
        sm.transition(customer_id, issue_id, ActorType::Customer, None, KanbanColumn::Todo, None)
            .await
            .unwrap();
        sm.transition(customer_id, issue_id, ActorType::DevAgent, None, KanbanColumn::InProgress, None)
            .await
            .unwrap();
        sm.transition_from_callback(customer_id, issue_id, ActorType::DevAgent, KanbanColumn::ReadyForQa, None)
            .await
            .unwrap();
        sm.transition(customer_id, issue_id, ActorType::QaAgent, None, KanbanColumn::InQa, None)
            .await
            .unwrap();
        sm.transition_from_callback(customer_id, issue_id, ActorType::QaAgent, KanbanColumn::ReadyForUat, None)
            .await
            .unwrap();
        sm.transition(customer_id, issue_id, ActorType::Customer, None, KanbanColumn::Done, None)
            .await
            .unwrap();

        let issue = store.get_issue(customer_id, issue_id).await.unwrap();
        assert_eq!(issue.kanban_column, KanbanColumn::Done);
        assert!(issue.resolved_at.is_some());
    }

    #[tokio::test]
    async fn dev_fail_count_reaching_three_escalates_to_tech_lead() {
        let (sm, store, customer_id, issue_id) = harness().await;
        sm.transition(customer_id, issue_id, ActorType::PmAgent, None, KanbanColumn::ReadyForUatApproval, None)
            .await
            .unwrap();
        sm.transition(customer_id, issue_id, ActorType::Customer, None, KanbanColumn::Todo, None)
            .await
            .unwrap();

        for _ in 0..3 {
            sm.transition(customer_id, issue_id, ActorType::DevAgent, None, KanbanColumn::InProgress, None)
                .await
                .unwrap();
            sm.transition_from_callback(customer_id, issue_id, ActorType::DevAgent, KanbanColumn::ReadyForQa, None)
                .await
                .unwrap();
            sm.transition(customer_id, issue_id, ActorType::QaAgent, None, KanbanColumn::InQa, None)
                .await
                .unwrap();
            sm.transition_from_callback(customer_id, issue_id, ActorType::QaAgent, KanbanColumn::Todo, None)
                .await
                .unwrap();
        }

        let issue = store.get_issue(customer_id, issue_id).await.unwrap();
        assert_eq!(issue.dev_fail_count, 3);
    }

    #[tokio::test]
    async fn dismissed_is_terminal_and_reachable_from_any_non_terminal_column() {
        let (sm, store, customer_id, issue_id) = harness().await;
        sm.transition(customer_id, issue_id, ActorType::Customer, None, KanbanColumn::Dismissed, None)
            .await
            .unwrap();
        let issue = store.get_issue(customer_id, issue_id).await.unwrap();
        assert_eq!(issue.kanban_column, KanbanColumn::Dismissed);

        let result = sm
            .transition(customer_id, issue_id, ActorType::Customer, None, KanbanColumn::Todo, None)
            .await;
        assert!(result.is_err());
    }
}
