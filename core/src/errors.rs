//! Error taxonomy for the engine. One enum per component boundary, matching
//! the kinds and HTTP dispositions each caller needs.

use thiserror::Error;

/// The dispositions a caller (mostly the HTTP layer) maps onto status codes.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("validation error: {0}")]
    ValidationError(String),

    #[error("conflict: {0}")]
    ConflictError(String),

    #[error("auth error: {0}")]
    AuthError(String),

    #[error("transient error: {0}")]
    TransientError(String),

    #[error("agent action failed: {0}")]
    AgentActionFailed(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("lock error: {0}")]
    Lock(#[from] LockError),

    #[error("dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("spawn error: {0}")]
    Spawn(#[from] SpawnError),
}

impl EngineError {
    pub fn http_status(&self) -> u16 {
        match self {
            EngineError::ValidationError(_) => 400,
            EngineError::ConflictError(_) => 409,
            EngineError::AuthError(_) => 401,
            EngineError::TransientError(_) => 503,
            EngineError::AgentActionFailed(_) => 502,
            EngineError::Store(_) | EngineError::Dispatch(_) | EngineError::Spawn(_) => 500,
            EngineError::Lock(_) => 503,
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("tenant mismatch: row belongs to a different customer")]
    TenantMismatch,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Error, Debug)]
pub enum LockError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

pub type LockResult<T> = Result<T, LockError>;

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("unknown queue: {0}")]
    UnknownQueue(String),

    #[error("job exhausted retries: {0}")]
    RetriesExhausted(String),
}

pub type DispatchResult<T> = Result<T, DispatchError>;

#[derive(Error, Debug)]
pub enum SpawnError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("agent host returned non-2xx: {0}")]
    NonSuccess(u16),

    #[error("spawn timed out")]
    Timeout,
}

pub type SpawnResult<T> = Result<T, SpawnError>;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("io error reading config: {0}")]
    Io(#[from] std::io::Error),

    #[error("toml parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Error, Debug)]
pub enum CredentialError {
    #[error("encryption error: {0}")]
    Encryption(String),

    #[error("decryption error: {0}")]
    Decryption(String),
}

pub type CredentialResult<T> = Result<T, CredentialError>;
