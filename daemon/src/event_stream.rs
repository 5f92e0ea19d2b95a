//! WebSocket real-time gateway for a single issue. Grounded in this
//! workspace's `handle_event_stream`: `tokio_tungstenite::accept_async` on a
//! raw `TcpStream`, a `tokio::select!` loop merging client frames, a
//! filtered `EventBus` broadcast receiver, and a heartbeat interval. The
//! stream is scoped to one issue (filtered with `matches_issue`) rather than
//! an arbitrary subscription filter, and the very first frame sent is a
//! snapshot of current state rather than waiting for the next event.

use caseflow_core::event_bus::{matches_issue, EventBus, IssueEvent};
use caseflow_core::store::Store;
use caseflow_core::KanbanColumn;
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::{accept_async, tungstenite::Message as WsMessage};
use tracing::{debug, error, info};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "payload")]
enum ServerMessage<'a> {
    Snapshot {
        issue_id: Uuid,
        kanban_column: KanbanColumn,
        confidence_score: f64,
        action_count: i64,
    },
    Event(&'a IssueEvent),
    Ping {
        timestamp: chrono::DateTime<chrono::Utc>,
    },
}

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

pub async fn handle_issue_stream(
    stream: TcpStream,
    customer_id: Uuid,
    issue_id: Uuid,
    store: Arc<dyn Store>,
    event_bus: Arc<EventBus>,
) {
    let ws_stream = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(err) => {
            error!(issue_id = %issue_id, error = %err, "failed to accept websocket connection");
            return;
        }
    };
    info!(issue_id = %issue_id, "realtime gateway connection opened");

    let (mut sink, mut stream) = ws_stream.split();

    match store.get_issue(customer_id, issue_id).await {
        Ok(issue) => {
            let snapshot = ServerMessage::Snapshot {
                issue_id,
                kanban_column: issue.kanban_column,
                confidence_score: issue.confidence_score,
                action_count: store.count_actions(issue_id).await.unwrap_or(0),
            };
            send(&mut sink, &snapshot).await;
        }
        Err(err) => {
            error!(issue_id = %issue_id, error = %err, "could not load issue for snapshot");
            return;
        }
    }

    let mut events = event_bus.subscribe();
    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);

    loop {
        tokio::select! {
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(WsMessage::Close(_))) | None => {
                        debug!(issue_id = %issue_id, "client closed realtime connection");
                        break;
                    }
                    Some(Ok(WsMessage::Ping(data))) => {
                        if sink.send(WsMessage::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        error!(issue_id = %issue_id, error = %err, "websocket error");
                        break;
                    }
                }
            }
            received = events.recv() => {
                match received {
                    Ok(event) if matches_issue(&event, issue_id) => {
                        if !send(&mut sink, &ServerMessage::Event(&event)).await {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(_) => break,
                }
            }
            _ = heartbeat.tick() => {
                if !send(&mut sink, &ServerMessage::Ping { timestamp: chrono::Utc::now() }).await {
                    break;
                }
            }
        }
    }
    info!(issue_id = %issue_id, "realtime gateway connection closed");
}

async fn send(
    sink: &mut futures::stream::SplitSink<tokio_tungstenite::WebSocketStream<TcpStream>, WsMessage>,
    message: &ServerMessage<'_>,
) -> bool {
    let json = serde_json::to_string(message).expect("ServerMessage always serializes");
    sink.send(WsMessage::Text(json)).await.is_ok()
}
