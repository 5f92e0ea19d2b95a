//! Domain types for the ticket-workflow engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The fixed nine-stage pipeline, in canonical order. `Dismissed` is a
/// terminal sink reachable from any non-terminal column but is not part of
/// the forward order used by the idempotency guard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KanbanColumn {
    Triage,
    ReadyForUatApproval,
    Todo,
    InProgress,
    ReadyForQa,
    InQa,
    ReadyForUat,
    Done,
    Dismissed,
}

impl KanbanColumn {
    /// The forward canonical order, excluding `Dismissed`. Used by the
    /// callback idempotency guard.
    pub const ORDER: [KanbanColumn; 8] = [
        KanbanColumn::Triage,
        KanbanColumn::ReadyForUatApproval,
        KanbanColumn::Todo,
        KanbanColumn::InProgress,
        KanbanColumn::ReadyForQa,
        KanbanColumn::InQa,
        KanbanColumn::ReadyForUat,
        KanbanColumn::Done,
    ];

    /// Index in the canonical order, or `None` for `Dismissed`.
    pub fn order_index(self) -> Option<usize> {
        Self::ORDER.iter().position(|c| *c == self)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, KanbanColumn::Done | KanbanColumn::Dismissed)
    }

    pub fn legacy_status(self) -> LegacyStatus {
        match self {
            KanbanColumn::Triage
            | KanbanColumn::ReadyForUatApproval
            | KanbanColumn::Todo => LegacyStatus::Open,
            KanbanColumn::InProgress | KanbanColumn::ReadyForQa | KanbanColumn::InQa => {
                LegacyStatus::InProgress
            }
            KanbanColumn::ReadyForUat => LegacyStatus::PendingApproval,
            KanbanColumn::Done => LegacyStatus::Resolved,
            KanbanColumn::Dismissed => LegacyStatus::Dismissed,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            KanbanColumn::Triage => "triage",
            KanbanColumn::ReadyForUatApproval => "ready_for_uat_approval",
            KanbanColumn::Todo => "todo",
            KanbanColumn::InProgress => "in_progress",
            KanbanColumn::ReadyForQa => "ready_for_qa",
            KanbanColumn::InQa => "in_qa",
            KanbanColumn::ReadyForUat => "ready_for_uat",
            KanbanColumn::Done => "done",
            KanbanColumn::Dismissed => "dismissed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "triage" => KanbanColumn::Triage,
            "ready_for_uat_approval" => KanbanColumn::ReadyForUatApproval,
            "todo" => KanbanColumn::Todo,
            "in_progress" => KanbanColumn::InProgress,
            "ready_for_qa" => KanbanColumn::ReadyForQa,
            "in_qa" => KanbanColumn::InQa,
            "ready_for_uat" => KanbanColumn::ReadyForUat,
            "done" => KanbanColumn::Done,
            "dismissed" => KanbanColumn::Dismissed,
            _ => return None,
        })
    }
}

impl std::fmt::Display for KanbanColumn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Backward-compatible derived status, kept in sync with `kanban_column`
/// by the fixed projection below, which never changes once an issue is dismissed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LegacyStatus {
    Open,
    InProgress,
    PendingApproval,
    Resolved,
    Dismissed,
}

impl LegacyStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            LegacyStatus::Open => "open",
            LegacyStatus::InProgress => "in_progress",
            LegacyStatus::PendingApproval => "pending_approval",
            LegacyStatus::Resolved => "resolved",
            LegacyStatus::Dismissed => "dismissed",
        }
    }
}

/// Who performed a transition or authored a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorType {
    Customer,
    PmAgent,
    DevAgent,
    QaAgent,
    TechLead,
    System,
}

impl ActorType {
    pub fn as_str(self) -> &'static str {
        match self {
            ActorType::Customer => "customer",
            ActorType::PmAgent => "pm_agent",
            ActorType::DevAgent => "dev_agent",
            ActorType::QaAgent => "qa_agent",
            ActorType::TechLead => "tech_lead",
            ActorType::System => "system",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "customer" => ActorType::Customer,
            "pm_agent" => ActorType::PmAgent,
            "dev_agent" => ActorType::DevAgent,
            "qa_agent" => ActorType::QaAgent,
            "tech_lead" => ActorType::TechLead,
            "system" => ActorType::System,
            _ => return None,
        })
    }
}

/// The roles an `AgentRunner` can be parameterised over (PM excluded: it
/// runs synchronously rather than through the spawn/callback protocol, but
/// shares the enum for chat/action bookkeeping).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    PmAgent,
    DevAgent,
    QaAgent,
    TechLead,
}

impl AgentRole {
    pub fn as_str(self) -> &'static str {
        match self {
            AgentRole::PmAgent => "pm_agent",
            AgentRole::DevAgent => "dev_agent",
            AgentRole::QaAgent => "qa_agent",
            AgentRole::TechLead => "tech_lead",
        }
    }
}

impl std::fmt::Display for AgentRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SenderType {
    User,
    Agent,
    System,
}

impl SenderType {
    pub fn as_str(self) -> &'static str {
        match self {
            SenderType::User => "user",
            SenderType::Agent => "agent",
            SenderType::System => "system",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    RolledBack,
}

impl ActionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ActionStatus::Pending => "pending",
            ActionStatus::Running => "running",
            ActionStatus::Completed => "completed",
            ActionStatus::Failed => "failed",
            ActionStatus::RolledBack => "rolled_back",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SiteStatus {
    Active,
    Inactive,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueType {
    Maintenance,
    SiteBuild,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialType {
    Ssh,
    Ftp,
    WpAdmin,
    WpAppPassword,
    ApiKey,
    Database,
    Cpanel,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Customer {
    pub id: Uuid,
    pub email: String,
    pub plan: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Site {
    pub id: Uuid,
    pub customer_id: Uuid,
    pub url: String,
    pub name: String,
    pub status: SiteStatus,
}

/// The state-machine subject. See the module docs below for field semantics and
/// invariants I1–I3.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Issue {
    pub id: Uuid,
    pub site_id: Uuid,
    pub customer_id: Uuid,
    pub title: String,
    pub description: String,
    pub priority: String,
    pub issue_type: IssueType,
    pub kanban_column: KanbanColumn,
    pub confidence_score: f64,
    pub dev_fail_count: i64,
    pub ticket_number: i64,
    pub pm_agent_id: Option<String>,
    pub dev_agent_id: Option<String>,
    pub stall_check_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Issue {
    pub fn legacy_status(&self) -> LegacyStatus {
        self.kanban_column.legacy_status()
    }
}

/// Append-only audit row. Exactly one per accepted transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TicketTransition {
    pub id: Uuid,
    pub issue_id: Uuid,
    pub from_col: Option<KanbanColumn>,
    pub to_col: KanbanColumn,
    pub actor_type: ActorType,
    pub actor_id: Option<String>,
    pub note: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: Uuid,
    pub issue_id: Uuid,
    pub sender_type: SenderType,
    pub agent_role: Option<AgentRole>,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentAction {
    pub id: Uuid,
    pub issue_id: Uuid,
    pub action_type: String,
    pub description: String,
    pub status: ActionStatus,
    pub before_state: Option<serde_json::Value>,
    pub after_state: Option<serde_json::Value>,
    pub model_used: Option<String>,
    pub prompt_tokens: Option<i64>,
    pub completion_tokens: Option<i64>,
    pub total_tokens: Option<i64>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteCredential {
    pub id: Uuid,
    pub site_id: Uuid,
    pub customer_id: Uuid,
    pub credential_type: CredentialType,
    pub ciphertext: Vec<u8>,
    pub nonce: Vec<u8>,
    pub tag: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

/// Request body for `POST /internal/agent-result`. Carries its
/// own `customer_id` like every other tenant-scoped request, rather than
/// requiring the daemon to look it up out-of-band.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AgentResultCallback {
    pub customer_id: Uuid,
    pub issue_id: Uuid,
    pub agent_role: AgentRole,
    pub status: CallbackStatus,
    pub message: String,
    pub transition_to: Option<KanbanColumn>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallbackStatus {
    Success,
    Failure,
}
