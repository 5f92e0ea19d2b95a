//! Customer and internal HTTP route handlers. Grounded in this
//! workspace's `RpcHandlers` pattern — a struct of shared `Arc` services
//! with one method per operation — but dispatched over plain REST paths
//! instead of a JSON-RPC method table, since the engine's external surface
//! is REST, not JSON-RPC.

use std::sync::Arc;

use caseflow_core::callback::CallbackHandler;
use caseflow_core::credentials::CredentialCipher;
use caseflow_core::dispatcher::Dispatcher;
use caseflow_core::event_bus::{EventBus, IssueEvent};
use caseflow_core::lock_service::LockService;
use caseflow_core::state_machine::StateMachine;
use caseflow_core::store::Store;
use caseflow_core::{
    AgentResultCallback, ActorType, CredentialType, KanbanColumn, SenderType,
};
use chrono::Utc;
use hyper::{Body, Request, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::auth::{bearer_token, AuthManager};
use crate::errors::{DaemonError, DaemonResult};

pub struct AppState {
    pub store: Arc<dyn Store>,
    pub state_machine: Arc<StateMachine>,
    pub lock_service: Arc<dyn LockService>,
    pub dispatcher: Arc<Dispatcher>,
    pub event_bus: Arc<EventBus>,
    pub callback_handler: Arc<CallbackHandler>,
    pub credential_cipher: Arc<CredentialCipher>,
    pub auth: Arc<AuthManager>,
    pub internal_token: String,
}

pub fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<Body> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_vec(body).unwrap_or_default()))
        .unwrap_or_else(|_| Response::new(Body::empty()))
}

pub fn error_response(err: &DaemonError) -> Response<Body> {
    let status = StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    json_response(status, &err.to_json())
}

async fn read_json<T: for<'de> Deserialize<'de>>(req: Request<Body>) -> DaemonResult<T> {
    let bytes = hyper::body::to_bytes(req.into_body())
        .await
        .map_err(|e| DaemonError::BadRequest(e.to_string()))?;
    serde_json::from_slice(&bytes).map_err(|e| DaemonError::BadRequest(e.to_string()))
}

/// Customer bearer auth. When auth is disabled (local/dev use), the tenant
/// is instead read from an `X-Customer-Id` header so the rest of the
/// handlers never need to branch on whether auth is on.
fn authenticate_customer(req: &Request<Body>, auth: &AuthManager) -> DaemonResult<Uuid> {
    if !auth.is_enabled() {
        return req
            .headers()
            .get("x-customer-id")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| Uuid::parse_str(v).ok())
            .ok_or(DaemonError::MissingAuth);
    }
    let header = req
        .headers()
        .get(hyper::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    let token = bearer_token(header)?;
    auth.verify(token)
}

fn path_segments(path: &str) -> Vec<&str> {
    path.trim_matches('/').split('/').collect()
}

fn parse_uuid(s: &str) -> DaemonResult<Uuid> {
    Uuid::parse_str(s).map_err(|_| DaemonError::BadRequest(format!("invalid id: {s}")))
}

#[derive(Debug, Deserialize)]
struct TransitionRequest {
    to_col: KanbanColumn,
    #[serde(default)]
    note: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PostMessageRequest {
    content: String,
}

#[derive(Debug, Deserialize)]
struct SaveCredentialRequest {
    customer_id: Uuid,
    site_id: Uuid,
    credential_type: String,
    value: String,
}

pub async fn route(state: Arc<AppState>, req: Request<Body>) -> Response<Body> {
    match dispatch(state, req).await {
        Ok(response) => response,
        Err(err) => error_response(&err),
    }
}

async fn dispatch(state: Arc<AppState>, req: Request<Body>) -> DaemonResult<Response<Body>> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let segments = path_segments(&path);

    match (method.as_str(), segments.as_slice()) {
        ("GET", ["healthz"]) => Ok(json_response(StatusCode::OK, &json!({"ok": true}))),

        ("POST", ["internal", "agent-result"]) => handle_agent_result(state, req).await,
        ("POST", ["internal", "save-credential"]) => handle_save_credential(state, req).await,

        ("POST", ["issues", issue_id, "transition"]) => {
            handle_transition(state, req, parse_uuid(issue_id)?).await
        }
        ("POST", ["issues", issue_id, "approve-and-start"]) => {
            handle_approve_and_start(state, req, parse_uuid(issue_id)?).await
        }
        ("POST", ["issues", issue_id, "uat-reject"]) => {
            handle_uat_reject(state, req, parse_uuid(issue_id)?).await
        }
        ("GET", ["issues", issue_id, "transitions"]) => {
            handle_list_transitions(state, req, parse_uuid(issue_id)?).await
        }
        ("GET", ["issues", issue_id, "messages"]) => {
            handle_list_messages(state, req, parse_uuid(issue_id)?).await
        }
        ("POST", ["issues", issue_id, "messages"]) => {
            handle_post_message(state, req, parse_uuid(issue_id)?).await
        }

        _ => Err(DaemonError::NotFound),
    }
}

async fn handle_transition(
    state: Arc<AppState>,
    req: Request<Body>,
    issue_id: Uuid,
) -> DaemonResult<Response<Body>> {
    let customer_id = authenticate_customer(&req, &state.auth)?;
    let body: TransitionRequest = read_json(req).await?;

    let outcome = state
        .state_machine
        .transition(customer_id, issue_id, ActorType::Customer, None, body.to_col, body.note)
        .await?;

    Ok(json_response(StatusCode::OK, &json!({"outcome": format!("{outcome:?}")})))
}

async fn handle_approve_and_start(
    state: Arc<AppState>,
    req: Request<Body>,
    issue_id: Uuid,
) -> DaemonResult<Response<Body>> {
    let customer_id = authenticate_customer(&req, &state.auth)?;
    state
        .state_machine
        .transition(customer_id, issue_id, ActorType::Customer, None, KanbanColumn::Todo, None)
        .await?;
    Ok(json_response(StatusCode::OK, &json!({"ok": true})))
}

async fn handle_uat_reject(
    state: Arc<AppState>,
    req: Request<Body>,
    issue_id: Uuid,
) -> DaemonResult<Response<Body>> {
    let customer_id = authenticate_customer(&req, &state.auth)?;
    let body: PostMessageRequest = read_json(req).await.unwrap_or(PostMessageRequest {
        content: "customer rejected the result".into(),
    });
    state
        .state_machine
        .transition(
            customer_id,
            issue_id,
            ActorType::Customer,
            None,
            KanbanColumn::Todo,
            Some(body.content),
        )
        .await?;
    Ok(json_response(StatusCode::OK, &json!({"ok": true})))
}

async fn handle_list_transitions(
    state: Arc<AppState>,
    req: Request<Body>,
    issue_id: Uuid,
) -> DaemonResult<Response<Body>> {
    let customer_id = authenticate_customer(&req, &state.auth)?;
    state.store.get_issue(customer_id, issue_id).await.map_err(caseflow_core::EngineError::from)?;
    let transitions = state
        .store
        .list_transitions(issue_id)
        .await
        .map_err(caseflow_core::EngineError::from)?;
    Ok(json_response(StatusCode::OK, &transitions))
}

async fn handle_list_messages(
    state: Arc<AppState>,
    req: Request<Body>,
    issue_id: Uuid,
) -> DaemonResult<Response<Body>> {
    let customer_id = authenticate_customer(&req, &state.auth)?;
    state.store.get_issue(customer_id, issue_id).await.map_err(caseflow_core::EngineError::from)?;
    let messages = state
        .store
        .list_chat(issue_id, 200)
        .await
        .map_err(caseflow_core::EngineError::from)?;
    Ok(json_response(StatusCode::OK, &messages))
}

async fn handle_post_message(
    state: Arc<AppState>,
    req: Request<Body>,
    issue_id: Uuid,
) -> DaemonResult<Response<Body>> {
    let customer_id = authenticate_customer(&req, &state.auth)?;
    let body: PostMessageRequest = read_json(req).await?;
    state.store.get_issue(customer_id, issue_id).await.map_err(caseflow_core::EngineError::from)?;

    let message = state
        .store
        .append_chat(issue_id, SenderType::User, None, &body.content)
        .await
        .map_err(caseflow_core::EngineError::from)?;
    state
        .event_bus
        .publish(IssueEvent::message(issue_id, body.content));

    Ok(json_response(StatusCode::CREATED, &message))
}

/// `POST /internal/agent-result`. Authorized with the shared
/// internal token rather than customer JWT auth.
async fn handle_agent_result(state: Arc<AppState>, req: Request<Body>) -> DaemonResult<Response<Body>> {
    let header = req
        .headers()
        .get(hyper::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    let token = bearer_token(header)?;
    state
        .callback_handler
        .authorize(token)
        .map_err(DaemonError::Engine)?;

    let callback: AgentResultCallback = read_json(req).await?;
    let customer_id = callback.customer_id;
    let response = state
        .callback_handler
        .handle(customer_id, callback)
        .await
        .map_err(DaemonError::Engine)?;

    Ok(json_response(StatusCode::OK, &response))
}

/// `POST /internal/save-credential`. Also shared-token authorized;
/// the PM runner's own `save_credential` action applies the same encryption
/// path in-process, this route exists for the out-of-band case (e.g. a
/// human operator pre-seeding a credential).
async fn handle_save_credential(state: Arc<AppState>, req: Request<Body>) -> DaemonResult<Response<Body>> {
    let header = req
        .headers()
        .get(hyper::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    let token = bearer_token(header)?;
    if token != state.internal_token {
        return Err(DaemonError::MissingAuth);
    }

    let body: SaveCredentialRequest = read_json(req).await?;
    let encrypted = state
        .credential_cipher
        .encrypt(&body.value)
        .map_err(|e| DaemonError::Internal(e.to_string()))?;

    let credential_type = parse_credential_type(&body.credential_type);
    state
        .store
        .save_credential(caseflow_core::SiteCredential {
            id: Uuid::new_v4(),
            site_id: body.site_id,
            customer_id: body.customer_id,
            credential_type,
            ciphertext: encrypted.ciphertext,
            nonce: encrypted.nonce,
            tag: encrypted.tag,
            created_at: Utc::now(),
        })
        .await
        .map_err(caseflow_core::EngineError::from)?;

    Ok(json_response(StatusCode::OK, &json!({"ok": true})))
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
