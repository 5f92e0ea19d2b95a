//! `POST /internal/agent-result` processing. The HTTP layer in
//! the daemon crate only handles transport and auth framing; this module
//! owns the ordered business logic so it is directly unit-testable and so
//! the StateMachine is called in-process rather than via a self-referential
//! HTTP call rather than a library call.

use crate::errors::{EngineError, EngineResult};
use crate::event_bus::{EventBus, IssueEvent};
use crate::lock_service::{agent_lock_key, LockService};
use crate::models::*;
use crate::state_machine::{StateMachine, TransitionOutcome};
use crate::store::Store;
use std::sync::Arc;

#[derive(Debug, Clone, serde::Serialize)]
pub struct CallbackResponse {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skipped: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

impl CallbackResponse {
    fn ok() -> Self {
        Self {
            ok: true,
            skipped: None,
            warning: None,
        }
    }
}

pub struct CallbackHandler {
    store: Arc<dyn Store>,
    state_machine: Arc<StateMachine>,
    lock_service: Arc<dyn LockService>,
    event_bus: Arc<EventBus>,
    internal_token: String,
}

impl CallbackHandler {
    pub fn new(
        store: Arc<dyn Store>,
        state_machine: Arc<StateMachine>,
        lock_service: Arc<dyn LockService>,
        event_bus: Arc<EventBus>,
        internal_token: String,
    ) -> Self {
        Self {
            store,
            state_machine,
            lock_service,
            event_bus,
            internal_token,
        }
    }

    /// Step 1: authz. Kept separate so the HTTP layer can reject before
    /// even deserializing a body if it wants to.
    pub fn authorize(&self, bearer_token: &str) -> EngineResult<()> {
        if bearer_token != self.internal_token {
            return Err(EngineError::AuthError("invalid internal token".into()));
        }
        Ok(())
    }

    /// In order: idempotency check, chat append,
    /// transition, lock release.
    pub async fn handle(
        &self,
        customer_id: uuid::Uuid,
        callback: AgentResultCallback,
    ) -> EngineResult<CallbackResponse> {
        let role_name = callback.agent_role.as_str();
        let lock_key = agent_lock_key(role_name, callback.issue_id);

        let prefix = match callback.status {
            CallbackStatus::Success => "✅",
            CallbackStatus::Failure => "❌",
        };
        let chat_content = format!("{prefix} {}", callback.message);

        let response = if let Some(to_col) = callback.transition_to {
            // Idempotency check lives inside `transition_from_callback`; a
            // stale/duplicate request comes back as `Skipped` rather than
            // an error, and never touches chat or the transition log.
            match self
                .state_machine
                .transition_from_callback(
                    customer_id,
                    callback.issue_id,
                    callback.agent_role.into(),
                    to_col,
                    Some((SenderType::Agent, Some(callback.agent_role), chat_content.clone())),
                )
                .await
            {
                Ok(TransitionOutcome::Applied(_)) => {
                    self.event_bus
                        .publish(IssueEvent::message(callback.issue_id, callback.message.clone()));
                    CallbackResponse::ok()
                }
                Ok(TransitionOutcome::Skipped { reason }) => CallbackResponse {
                    ok: true,
                    skipped: Some(reason),
                    warning: None,
                },
                // Transition failures do not roll back; they surface as a
                // 200 + warning so the agent does not retry.
                Err(err) => CallbackResponse {
                    ok: true,
                    skipped: None,
                    warning: Some(err.to_string()),
                },
            }
        } else {
            self.store
                .append_chat(
                    callback.issue_id,
                    SenderType::Agent,
                    Some(callback.agent_role),
                    &chat_content,
                )
                .await?;
            self.event_bus
                .publish(IssueEvent::message(callback.issue_id, callback.message.clone()));
            CallbackResponse::ok()
        };

        self.lock_service.release(&lock_key).await;
        Ok(response)
    }
}

impl From<AgentRole> for ActorType {
    fn from(role: AgentRole) -> Self {
        match role {
            AgentRole::PmAgent => ActorType::PmAgent,
            AgentRole::DevAgent => ActorType::DevAgent,
            AgentRole::QaAgent => ActorType::QaAgent,
            AgentRole::TechLead => ActorType::TechLead,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::Dispatcher;
    use crate::lock_service::SqliteLockService;
    use crate::store::SqliteStore;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn harness() -> (CallbackHandler, Arc<SqliteStore>, uuid::Uuid, Issue) {
        let store = Arc::new(SqliteStore::new_in_memory().await.unwrap());
        let event_bus = Arc::new(EventBus::new());
        let dispatcher = Arc::new(Dispatcher::new(store.pool().clone()).await.unwrap());
        let lock_pool = SqlitePoolOptions::new().connect("sqlite::memory:").await.unwrap();
        let lock_service = Arc::new(SqliteLockService::new(lock_pool).await.unwrap());
        let state_machine = Arc::new(StateMachine::new(store.clone(), event_bus.clone(), dispatcher));

        let customer_id = uuid::Uuid::new_v4();
        let issue = Issue {
            id: uuid::Uuid::new_v4(),
            site_id: uuid::Uuid::new_v4(),
            customer_id,
            title: "t".into(),
            description: "d".into(),
            priority: "high".into(),
            issue_type: IssueType::Maintenance,
            kanban_column: KanbanColumn::InProgress,
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

        let handler = CallbackHandler::new(
            store.clone(),
            state_machine,
            lock_service.clone(),
            event_bus,
            "internal-token".into(),
        );
        lock_service
            .try_acquire(&agent_lock_key("dev_agent", issue.id), std::time::Duration::from_secs(900))
            .await;

        (handler, store, customer_id, issue)
    }

    #[tokio::test]
    async fn rejects_bad_token() {
        let (handler, _store, _customer_id, _issue) = harness().await;
        assert!(handler.authorize("wrong").is_err());
        assert!(handler.authorize("internal-token").is_ok());
    }

    #[tokio::test]
    async fn success_callback_transitions_and_posts_chat() {
        let (handler, store, customer_id, issue) = harness().await;
        let response = handler
            .handle(
                customer_id,
                AgentResultCallback {
                    customer_id,
                    issue_id: issue.id,
                    agent_role: AgentRole::DevAgent,
                    status: CallbackStatus::Success,
                    message: "implemented the fix".into(),
                    transition_to: Some(KanbanColumn::ReadyForQa),
                },
            )
            .await
            .unwrap();
        assert!(response.skipped.is_none());
        assert!(response.warning.is_none());

        let fetched = store.get_issue(customer_id, issue.id).await.unwrap();
        assert_eq!(fetched.kanban_column, KanbanColumn::ReadyForQa);

        let chat = store.list_chat(issue.id, 10).await.unwrap();
        assert_eq!(chat.len(), 1);
        assert!(chat[0].content.starts_with('✅'));
    }

    #[tokio::test]
    async fn duplicate_callback_is_skipped_with_no_second_transition_or_chat() {
        let (handler, store, customer_id, issue) = harness().await;
        let callback = AgentResultCallback {
            customer_id,
            issue_id: issue.id,
            agent_role: AgentRole::DevAgent,
            status: CallbackStatus::Success,
            message: "implemented the fix".into(),
            transition_to: Some(KanbanColumn::ReadyForQa),
        };
        handler.handle(customer_id, callback.clone()).await.unwrap();
        let second = handler.handle(customer_id, callback).await.unwrap();

        assert_eq!(second.skipped.as_deref(), Some("already_at_or_past_target"));
        let chat = store.list_chat(issue.id, 10).await.unwrap();
        assert_eq!(chat.len(), 1);
        let transitions = store.list_transitions(issue.id).await.unwrap();
        assert_eq!(transitions.len(), 1);
    }
}
