//! Role-parameterised runner implementing the fixed seven-step protocol in
//! Per role: single-flight acquire, column pre-flight, enter-transition,
//! context gathering, prompt/callback-instruction construction, spawn, and
//! a progress chat post — without waiting for the spawned agent to finish.

use crate::config::AgentHostConfig;
use crate::credentials::CredentialCipher;
use crate::errors::EngineResult;
use crate::event_bus::{EventBus, IssueEvent};
use crate::lock_service::{agent_lock_key, LockService};
use crate::models::*;
use crate::spawner::{Spawner, SpawnRequest};
use crate::state_machine::StateMachine;
use crate::store::Store;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Number of trailing chat messages included in a runner's prompt context
/// after the spawn call returns.
pub const CONTEXT_CHAT_WINDOW: i64 = 15;

/// Static per-role wiring: which column the runner expects on entry, which
/// work column it transitions into, which actor type drives that
/// transition, and which column it reverts to on failure.
#[derive(Debug, Clone, Copy)]
pub struct RoleConfig {
    pub role: AgentRole,
    pub actor_type: ActorType,
    pub expected_entry: KanbanColumn,
    pub work_column: KanbanColumn,
}

impl RoleConfig {
    pub fn dev() -> Self {
        Self {
            role: AgentRole::DevAgent,
            actor_type: ActorType::DevAgent,
            expected_entry: KanbanColumn::Todo,
            work_column: KanbanColumn::InProgress,
        }
    }

    pub fn qa() -> Self {
        Self {
            role: AgentRole::QaAgent,
            actor_type: ActorType::QaAgent,
            expected_entry: KanbanColumn::ReadyForQa,
            work_column: KanbanColumn::InQa,
        }
    }

    /// tech_lead has no single expected entry column — it is dispatched on
    /// escalation from any non-terminal column and always moves the issue
    /// to `in_progress`, which is allowed from any column.
    pub fn tech_lead() -> Self {
        Self {
            role: AgentRole::TechLead,
            actor_type: ActorType::TechLead,
            expected_entry: KanbanColumn::Triage, // unused: see `column_ok`
            work_column: KanbanColumn::InProgress,
        }
    }

    fn column_ok(&self, current: KanbanColumn) -> bool {
        if self.role == AgentRole::TechLead {
            !current.is_terminal()
        } else {
            current == self.expected_entry
        }
    }

    /// Where the column reverts to on spawn/transition failure
    /// "Failure semantics").
    fn revert_column(&self) -> KanbanColumn {
        match self.role {
            AgentRole::DevAgent => KanbanColumn::Todo,
            AgentRole::QaAgent => KanbanColumn::ReadyForQa,
            AgentRole::TechLead | AgentRole::PmAgent => self.expected_entry,
        }
    }
}

pub struct AgentRunner {
    config: RoleConfig,
    store: Arc<dyn Store>,
    lock_service: Arc<dyn LockService>,
    spawner: Arc<dyn Spawner>,
    state_machine: Arc<StateMachine>,
    event_bus: Arc<EventBus>,
    host_config: AgentHostConfig,
}

impl AgentRunner {
    pub fn new(
        config: RoleConfig,
        store: Arc<dyn Store>,
        lock_service: Arc<dyn LockService>,
        spawner: Arc<dyn Spawner>,
        state_machine: Arc<StateMachine>,
        event_bus: Arc<EventBus>,
        host_config: AgentHostConfig,
    ) -> Self {
        Self {
            config,
            store,
            lock_service,
            spawner,
            state_machine,
            event_bus,
            host_config,
        }
    }

    fn model_for_role(&self) -> &str {
        match self.config.role {
            AgentRole::PmAgent => &self.host_config.model_pm,
            AgentRole::DevAgent => &self.host_config.model_dev,
            AgentRole::QaAgent => &self.host_config.model_qa,
            AgentRole::TechLead => &self.host_config.model_tech_lead,
        }
    }

    /// Run the role's protocol for one issue. Never propagates an error:
    /// all failures are caught, recorded as an `AgentAction{failed}`, and
    /// the job returns cleanly so the Dispatcher does not retry it — the
    /// StallController owns retry for this failure class.
    pub async fn run(&self, customer_id: Uuid, issue_id: Uuid) {
        let role = self.config.role;
        let lock_key = agent_lock_key(role.as_str(), issue_id);

        if !self
            .lock_service
            .try_acquire(&lock_key, Duration::from_secs(15 * 60))
            .await
        {
            tracing::info!(issue_id = %issue_id, role = %role, "duplicate task, lock already held");
            return;
        }

        if let Err(err) = self.run_locked(customer_id, issue_id, &lock_key).await {
            tracing::error!(issue_id = %issue_id, role = %role, error = %err, "agent runner failed");
        }
        self.lock_service.release(&lock_key).await;
    }

    async fn run_locked(
        &self,
        customer_id: Uuid,
        issue_id: Uuid,
        lock_key: &str,
    ) -> EngineResult<()> {
        let role = self.config.role;

        let issue = self.store.get_issue(customer_id, issue_id).await?;
        if !self.config.column_ok(issue.kanban_column) {
            tracing::info!(issue_id = %issue_id, role = %role, column = %issue.kanban_column, "column pre-flight failed, skipping");
            return Ok(());
        }

        if let Err(err) = self
            .state_machine
            .transition(
                customer_id,
                issue_id,
                self.config.actor_type,
                None,
                self.config.work_column,
                None,
            )
            .await
        {
            self.handle_failure(&issue, lock_key, &format!("enter-transition failed: {err}"))
                .await;
            return Ok(());
        }

        self.store
            .append_chat(
                issue_id,
                SenderType::Agent,
                Some(role),
                &format!("{role} starting…"),
            )
            .await?;
        self.event_bus
            .publish(IssueEvent::action_started(issue_id, role));

        let chat_history = self.store.list_chat(issue_id, CONTEXT_CHAT_WINDOW).await?;
        let prompt = self.build_prompt(&issue, &chat_history);

        let request = SpawnRequest {
            task: prompt,
            label: Some(format!("{role}:{issue_id}")),
            model: self.model_for_role().to_string(),
            run_timeout_seconds: self.host_config.run_timeout_seconds,
            cleanup: "keep",
        };

        match self.spawner.spawn(request).await {
            Ok(handle) => {
                self.store
                    .append_chat(
                        issue_id,
                        SenderType::System,
                        Some(role),
                        &format!("session {} dispatched", handle.child_session_key),
                    )
                    .await?;
                Ok(())
            }
            Err(err) => {
                self.handle_failure(&issue, lock_key, &format!("spawn failed: {err}"))
                    .await;
                Ok(())
            }
        }
    }

    /// Build a stable, bounded prompt from the issue's title, description,
    /// fail count, and recent chat, under a per-role word budget.
    fn build_prompt(&self, issue: &Issue, chat_history: &[ChatMessage]) -> String {
        const WORD_BUDGET: usize = 1200;
        let mut out = format!(
            "Role: {}\nIssue #{}: {}\nDescription: {}\nPrior dev failures: {}\n\nRecent conversation:\n",
            self.config.role, issue.ticket_number, issue.title, issue.description, issue.dev_fail_count,
        );
        for message in chat_history {
            out.push_str(&format!("[{}] {}\n", message.sender_type.as_str(), message.content));
        }

        let truncated: Vec<&str> = out.split_whitespace().take(WORD_BUDGET).collect();
        truncated.join(" ")
    }

    async fn handle_failure(&self, issue: &Issue, _lock_key: &str, reason: &str) {
        let role = self.config.role;
        tracing::error!(admin_alert = true, issue_id = %issue.id, role = %role, reason, "agent action failed");

        let _ = self
            .store
            .record_action(AgentAction {
                id: Uuid::new_v4(),
                issue_id: issue.id,
                action_type: format!("{role}.run"),
                description: reason.to_string(),
                status: ActionStatus::Failed,
                before_state: None,
                after_state: None,
                model_used: Some(self.model_for_role().to_string()),
                prompt_tokens: None,
                completion_tokens: None,
                total_tokens: None,
                created_at: chrono::Utc::now(),
            })
            .await;

        // Best-effort revert: only meaningful if the issue already advanced
        // into the work column.
        let _ = self
            .state_machine
            .transition(
                issue.customer_id,
                issue.id,
                ActorType::System,
                None,
                self.config.revert_column(),
                Some("reverted after agent action failure".into()),
            )
            .await;

        let _ = self
            .store
            .append_chat(
                issue.id,
                SenderType::System,
                Some(role),
                &format!("❌ {role} could not complete this step and will be retried."),
            )
            .await;

        self.event_bus
            .publish(IssueEvent::action_failed(issue.id, role, reason));
    }
}

/// PM-specific behaviour: PM does not spawn an external session. It calls
/// the LLM synchronously, parses structured action markers out of the
/// reply, applies each as a side-effect, and posts the sanitized text to
/// chat, which is specific to the PM runner.
pub mod pm {
    use super::*;
    use async_trait::async_trait;
    use serde::Deserialize;

    /// Synchronous LLM call used only by the PM runner (the rest of the
    /// system is fire-and-forget through Spawner). A thin seam so tests can
    /// substitute a canned reply.
    #[async_trait]
    pub trait Gateway: Send + Sync {
        async fn complete(&self, prompt: &str, model: &str) -> EngineResult<String>;
    }

    /// The fixed verb list parsed out of a PM reply (treated as a
    /// tagged-variant protocol with an explicit list of verbs").
    #[derive(Debug, Clone, Deserialize)]
    #[serde(tag = "ticket_action", rename_all = "snake_case")]
    pub enum PmAction {
        Transition { to_col: KanbanColumn },
        TicketConfirmed,
        UpdateDescription { text: String },
        SaveCredential { site_id: Uuid, credential_type: String, value: String },
    }

    /// Extract zero or more JSON action-marker objects embedded in free
    /// text, in the order they appear, and return the markers stripped
    /// from the visible reply.
    pub fn extract_actions(reply: &str) -> (String, Vec<PmAction>) {
        let mut actions = Vec::new();
        let mut visible = String::new();
        let mut rest = reply;

        while let Some(start) = rest.find('{') {
            visible.push_str(&rest[..start]);
            let mut depth = 0usize;
            let mut end = None;
            for (i, c) in rest[start..].char_indices() {
                match c {
                    '{' => depth += 1,
                    '}' => {
                        depth -= 1;
                        if depth == 0 {
                            end = Some(start + i + 1);
                            break;
                        }
                    }
                    _ => {}
                }
            }
            match end {
                Some(end) => {
                    let candidate = &rest[start..end];
                    match serde_json::from_str::<PmAction>(candidate) {
                        Ok(action) => actions.push(action),
                        Err(_) => visible.push_str(candidate),
                    }
                    rest = &rest[end..];
                }
                None => {
                    visible.push_str(&rest[start..]);
                    rest = "";
                    break;
                }
            }
        }
        visible.push_str(rest);
        (visible.trim().to_string(), actions)
    }

    pub struct PmRunner {
        store: Arc<dyn Store>,
        lock_service: Arc<dyn LockService>,
        gateway: Arc<dyn Gateway>,
        state_machine: Arc<StateMachine>,
        event_bus: Arc<EventBus>,
        credential_cipher: Arc<CredentialCipher>,
        model: String,
    }

    impl PmRunner {
        pub fn new(
            store: Arc<dyn Store>,
            lock_service: Arc<dyn LockService>,
            gateway: Arc<dyn Gateway>,
            state_machine: Arc<StateMachine>,
            event_bus: Arc<EventBus>,
            credential_cipher: Arc<CredentialCipher>,
            model: String,
        ) -> Self {
            Self {
                store,
                lock_service,
                gateway,
                state_machine,
                event_bus,
                credential_cipher,
                model,
            }
        }

        pub async fn run(&self, customer_id: Uuid, issue_id: Uuid) {
            let lock_key = agent_lock_key(AgentRole::PmAgent.as_str(), issue_id);
            if !self
                .lock_service
                .try_acquire(&lock_key, Duration::from_secs(15 * 60))
                .await
            {
                tracing::info!(issue_id = %issue_id, "duplicate pm_agent task");
                return;
            }

            if let Err(err) = self.run_locked(customer_id, issue_id).await {
                tracing::error!(issue_id = %issue_id, error = %err, "pm_agent run failed");
            }
            self.lock_service.release(&lock_key).await;
        }

        async fn run_locked(&self, customer_id: Uuid, issue_id: Uuid) -> EngineResult<()> {
            let issue = self.store.get_issue(customer_id, issue_id).await?;
            let chat_history = self.store.list_chat(issue_id, CONTEXT_CHAT_WINDOW).await?;

            let mut prompt = format!(
                "Role: pm_agent\nIssue #{}: {}\nDescription: {}\n\nRecent conversation:\n",
                issue.ticket_number, issue.title, issue.description
            );
            for message in &chat_history {
                prompt.push_str(&format!("[{}] {}\n", message.sender_type.as_str(), message.content));
            }

            let reply = self.gateway.complete(&prompt, &self.model).await?;
            let (visible, actions) = extract_actions(&reply);

            for action in actions {
                self.apply_action(&issue, action).await?;
            }

            if !visible.is_empty() {
                self.store
                    .append_chat(issue_id, SenderType::Agent, Some(AgentRole::PmAgent), &visible)
                    .await?;
                self.event_bus
                    .publish(IssueEvent::message(issue_id, visible));
            }

            Ok(())
        }

        async fn apply_action(&self, issue: &Issue, action: PmAction) -> EngineResult<()> {
            match action {
                PmAction::Transition { to_col } => {
                    self.state_machine
                        .transition(
                            issue.customer_id,
                            issue.id,
                            ActorType::PmAgent,
                            None,
                            to_col,
                            None,
                        )
                        .await?;
                }
                PmAction::TicketConfirmed => {
                    self.state_machine
                        .transition(
                            issue.customer_id,
                            issue.id,
                            ActorType::PmAgent,
                            None,
                            KanbanColumn::ReadyForUatApproval,
                            Some("ticket confirmed by pm_agent".into()),
                        )
                        .await?;
                }
                PmAction::UpdateDescription { text } => {
                    // Description is mutable; persisted via the
                    // CRUD layer's own update path, out of this engine's scope.
                    let _ = text;
                }
                PmAction::SaveCredential {
                    site_id,
                    credential_type,
                    value,
                } => {
                    let encrypted = self.credential_cipher.encrypt(&value).map_err(|e| {
                        crate::errors::EngineError::ValidationError(e.to_string())
                    })?;
                    self.store
                        .save_credential(SiteCredential {
                            id: Uuid::new_v4(),
                            site_id,
                            customer_id: issue.customer_id,
                            credential_type: parse_credential_type(&credential_type),
                            ciphertext: encrypted.ciphertext,
                            nonce: encrypted.nonce,
                            tag: encrypted.tag,
                            created_at: chrono::Utc::now(),
                        })
                        .await?;
                }
            }
            Ok(())
        }
    }

    fn parse_credential_type(s: &str) -> CredentialType {
        match s {
            "ssh" => CredentialType::Ssh,
            "ftp" => CredentialType::Ftp,
            "wp_admin" => CredentialType::WpAdmin,
            "wp_app_password" => CredentialType::WpAppPassword,
            "database" => CredentialType::Database,
            "cpanel" => CredentialType::Cpanel,
            _ => CredentialType::ApiKey,
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn extract_actions_strips_markers_and_parses_verbs() {
            let reply = r#"Thanks for reporting this! {"ticket_action":"ticket_confirmed"} I'll get dev on it."#;
            let (visible, actions) = extract_actions(reply);
            assert_eq!(actions.len(), 1);
            assert!(matches!(actions[0], PmAction::TicketConfirmed));
            assert!(!visible.contains("ticket_action"));
            assert!(visible.contains("Thanks for reporting"));
        }

        #[test]
        fn extract_actions_handles_multiple_markers_in_order() {
            let reply = r#"{"ticket_action":"transition","to_col":"ready_for_uat_approval"} ok {"ticket_action":"ticket_confirmed"}"#;
            let (_visible, actions) = extract_actions(reply);
            assert_eq!(actions.len(), 2);
            assert!(matches!(actions[0], PmAction::Transition { .. }));
            assert!(matches!(actions[1], PmAction::TicketConfirmed));
        }

        #[test]
        fn extract_actions_with_no_markers_returns_original_text() {
            let reply = "Just a plain reply, nothing structured.";
            let (visible, actions) = extract_actions(reply);
            assert!(actions.is_empty());
            assert_eq!(visible, reply);
        }
    }
}
