//! HTTP-facing error type. Wraps `caseflow_core::EngineError` and adds the
//! request-framing failures the engine itself has no opinion on (bad JSON
//! body, unknown route, missing auth header). Grounded in this workspace's
//! one-enum-per-boundary `thiserror` pattern, with `to_rpc_error`'s role
//! played here by `http_status`/`to_json`, mapping straight to an HTTP
//! status and a JSON body instead of a JSON-RPC error code.

use caseflow_core::EngineError;
use serde_json::json;
use thiserror::Error;

pub type DaemonResult<T> = Result<T, DaemonError>;

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("invalid request body: {0}")]
    BadRequest(String),

    #[error("missing or malformed authorization header")]
    MissingAuth,

    #[error("not found")]
    NotFound,

    #[error("server error: {0}")]
    Internal(String),
}

impl DaemonError {
    pub fn http_status(&self) -> u16 {
        match self {
            DaemonError::Engine(e) => e.http_status(),
            DaemonError::BadRequest(_) => 400,
            DaemonError::MissingAuth => 401,
            DaemonError::NotFound => 404,
            DaemonError::Internal(_) => 500,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        json!({ "error": self.to_string() })
    }
}
