//! HTTP and WebSocket server wiring. Grounded in this workspace's
//! `RpcServer`: a `hyper::Server::bind`/`make_service_fn`/`service_fn` HTTP
//! listener, plus a second listener for the real-time gateway. The JSON-RPC
//! dispatch table and the ZMQ publisher have no counterpart here — the
//! external surface is REST over HTTP, and fan-out goes through the
//! in-process `EventBus` instead.

use std::net::SocketAddr;
use std::sync::Arc;

use caseflow_core::event_bus::EventBus;
use caseflow_core::store::Store;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Server};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::auth::AuthManager;
use crate::errors::{DaemonError, DaemonResult};
use crate::event_stream::handle_issue_stream;
use crate::handlers::{route, AppState};

pub struct CaseflowServer {
    state: Arc<AppState>,
    host: String,
    http_port: u16,
    ws_port: u16,
    store: Arc<dyn Store>,
    event_bus: Arc<EventBus>,
}

impl CaseflowServer {
    pub fn new(
        state: Arc<AppState>,
        host: String,
        http_port: u16,
        ws_port: u16,
        store: Arc<dyn Store>,
        event_bus: Arc<EventBus>,
    ) -> Self {
        Self {
            state,
            host,
            http_port,
            ws_port,
            store,
            event_bus,
        }
    }

    pub async fn run(self) -> DaemonResult<()> {
        let http = self.run_http();
        let ws = self.run_ws();
        tokio::try_join!(http, ws)?;
        Ok(())
    }

    async fn run_http(&self) -> DaemonResult<()> {
        let addr: SocketAddr = format!("{}:{}", self.host, self.http_port)
            .parse()
            .map_err(|e| DaemonError::Internal(format!("invalid http address: {e}")))?;

        let state = self.state.clone();
        let make_svc = make_service_fn(move |_conn| {
            let state = state.clone();
            async move {
                Ok::<_, hyper::Error>(service_fn(move |req: Request<Body>| {
                    let state = state.clone();
                    async move { Ok::<_, hyper::Error>(route(state, req).await) }
                }))
            }
        });

        info!(%addr, "http api listening");
        Server::bind(&addr)
            .serve(make_svc)
            .await
            .map_err(|e| DaemonError::Internal(format!("http server error: {e}")))
    }

    /// The WebSocket handshake path is `/ws/issues/{issue_id}`; the
    /// customer id comes from a `customer_id` query parameter when auth is
    /// disabled, or from a `token` query parameter holding the JWT
    /// otherwise, since browsers cannot set an Authorization header on a
    /// WebSocket upgrade.
    async fn run_ws(&self) -> DaemonResult<()> {
        let addr: SocketAddr = format!("{}:{}", self.host, self.ws_port)
            .parse()
            .map_err(|e| DaemonError::Internal(format!("invalid ws address: {e}")))?;

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| DaemonError::Internal(format!("ws bind error: {e}")))?;
        info!(%addr, "realtime gateway listening");

        loop {
            let (stream, _peer) = match listener.accept().await {
                Ok(pair) => pair,
                Err(err) => {
                    warn!(error = %err, "failed to accept tcp connection");
                    continue;
                }
            };

            let store = self.store.clone();
            let event_bus = self.event_bus.clone();
            let auth = self.state.auth.clone();

            tokio::spawn(async move {
                match negotiate(&stream, &auth).await {
                    Ok((customer_id, issue_id)) => {
                        handle_issue_stream(stream, customer_id, issue_id, store, event_bus).await;
                    }
                    Err(err) => {
                        error!(error = %err, "realtime gateway handshake rejected");
                    }
                }
            });
        }
    }
}

/// Peeks the HTTP upgrade request line to recover `issue_id` and the
/// authenticated `customer_id` before handing the raw stream to
/// `tokio_tungstenite::accept_async`. A minimal hand-rolled parse of the
/// request line is enough here; the full handshake headers are left
/// untouched on the socket for `accept_async` to consume.
async fn negotiate(stream: &tokio::net::TcpStream, auth: &AuthManager) -> DaemonResult<(Uuid, Uuid)> {
    let mut buf = [0u8; 2048];
    let n = stream
        .peek(&mut buf)
        .await
        .map_err(|e| DaemonError::Internal(format!("ws peek failed: {e}")))?;
    let request_line = std::str::from_utf8(&buf[..n])
        .map_err(|_| DaemonError::BadRequest("non-utf8 handshake".into()))?
        .lines()
        .next()
        .unwrap_or("")
        .to_string();

    let path = request_line
        .split_whitespace()
        .nth(1)
        .ok_or_else(|| DaemonError::BadRequest("malformed request line".into()))?;

    let (path_part, query_part) = path.split_once('?').unwrap_or((path, ""));
    let segments: Vec<&str> = path_part.trim_matches('/').split('/').collect();
    let issue_id = match segments.as_slice() {
        ["ws", "issues", id] => Uuid::parse_str(id)
            .map_err(|_| DaemonError::BadRequest(format!("invalid issue id: {id}")))?,
        _ => return Err(DaemonError::NotFound),
    };

    let customer_id = if auth.is_enabled() {
        let token = query_param(query_part, "token").ok_or(DaemonError::MissingAuth)?;
        auth.verify(&token)?
    } else {
        let id = query_param(query_part, "customer_id").ok_or(DaemonError::MissingAuth)?;
        Uuid::parse_str(&id).map_err(|_| DaemonError::BadRequest("invalid customer_id".into()))?
    };

    Ok((customer_id, issue_id))
}

fn query_param(query: &str, key: &str) -> Option<String> {
    query.split('&').find_map(|pair| {
        let (k, v) = pair.split_once('=')?;
        (k == key).then(|| v.to_string())
    })
}
