//! Publish/subscribe channel keyed by issue id. Grounded in the
//! broadcast-channel event bus already used elsewhere in this workspace:
//! a single `tokio::sync::broadcast` channel, per-subscription filters
//! applied client-side, and a small stats counter. Delivery is best-effort
//! to currently live subscribers, an at-most-once delivery guarantee.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::models::{AgentRole, KanbanColumn};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum IssueEvent {
    IssueUpdated {
        issue_id: Uuid,
        kanban_column: KanbanColumn,
        timestamp: DateTime<Utc>,
    },
    Message {
        issue_id: Uuid,
        content: String,
        timestamp: DateTime<Utc>,
    },
    ActionStarted {
        issue_id: Uuid,
        agent_role: AgentRole,
        timestamp: DateTime<Utc>,
    },
    ActionCompleted {
        issue_id: Uuid,
        agent_role: AgentRole,
        timestamp: DateTime<Utc>,
    },
    ActionFailed {
        issue_id: Uuid,
        agent_role: AgentRole,
        reason: String,
        timestamp: DateTime<Utc>,
    },
}

impl IssueEvent {
    pub fn issue_id(&self) -> Uuid {
        match self {
            IssueEvent::IssueUpdated { issue_id, .. }
            | IssueEvent::Message { issue_id, .. }
            | IssueEvent::ActionStarted { issue_id, .. }
            | IssueEvent::ActionCompleted { issue_id, .. }
            | IssueEvent::ActionFailed { issue_id, .. } => *issue_id,
        }
    }

    pub fn issue_updated(issue_id: Uuid, kanban_column: KanbanColumn) -> Self {
        IssueEvent::IssueUpdated {
            issue_id,
            kanban_column,
            timestamp: Utc::now(),
        }
    }

    pub fn message(issue_id: Uuid, content: impl Into<String>) -> Self {
        IssueEvent::Message {
            issue_id,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn action_started(issue_id: Uuid, agent_role: AgentRole) -> Self {
        IssueEvent::ActionStarted {
            issue_id,
            agent_role,
            timestamp: Utc::now(),
        }
    }

    pub fn action_completed(issue_id: Uuid, agent_role: AgentRole) -> Self {
        IssueEvent::ActionCompleted {
            issue_id,
            agent_role,
            timestamp: Utc::now(),
        }
    }

    pub fn action_failed(issue_id: Uuid, agent_role: AgentRole, reason: impl Into<String>) -> Self {
        IssueEvent::ActionFailed {
            issue_id,
            agent_role,
            reason: reason.into(),
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Default)]
pub struct EventBusStats {
    pub published: u64,
    pub dropped_no_subscribers: u64,
}

pub struct EventBus {
    tx: broadcast::Sender<IssueEvent>,
    published: AtomicU64,
    dropped: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            tx,
            published: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Publish an event. Best-effort: if there are no live subscribers this
    /// is recorded but not an error.
    pub fn publish(&self, event: IssueEvent) {
        self.published.fetch_add(1, Ordering::Relaxed);
        if self.tx.send(event).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<IssueEvent> {
        self.tx.subscribe()
    }

    pub fn stats(&self) -> EventBusStats {
        EventBusStats {
            published: self.published.load(Ordering::Relaxed),
            dropped_no_subscribers: self.dropped.load(Ordering::Relaxed),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Client-side filter applied by the RealtimeGateway: only events for the
/// subscribed issue are forwarded.
pub fn matches_issue(event: &IssueEvent, issue_id: Uuid) -> bool {
    event.issue_id() == issue_id
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_receives_published_event() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let issue_id = Uuid::new_v4();
        bus.publish(IssueEvent::issue_updated(issue_id, KanbanColumn::Todo));
        let received = rx.recv().await.unwrap();
        assert_eq!(received.issue_id(), issue_id);
    }

    #[tokio::test]
    async fn filter_drops_events_for_other_issues() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let target = Uuid::new_v4();
        let other = Uuid::new_v4();
        bus.publish(IssueEvent::issue_updated(other, KanbanColumn::Todo));
        bus.publish(IssueEvent::issue_updated(target, KanbanColumn::Todo));

        let first = rx.recv().await.unwrap();
        assert!(!matches_issue(&first, target));
        let second = rx.recv().await.unwrap();
        assert!(matches_issue(&second, target));
    }

    #[test]
    fn publish_without_subscribers_is_recorded_not_errored() {
        let bus = EventBus::new();
        bus.publish(IssueEvent::issue_updated(Uuid::new_v4(), KanbanColumn::Todo));
        assert_eq!(bus.stats().dropped_no_subscribers, 1);
    }
}
