//! HTTP/WebSocket front end for the ticket-workflow engine in
//! `caseflow-core`. Owns transport, auth framing, and process wiring; all
//! business logic lives in the engine crate.

pub mod auth;
pub mod config;
pub mod errors;
pub mod event_stream;
pub mod handlers;
pub mod llm_gateway;
pub mod server;

pub use config::EngineConfig;
pub use errors::{DaemonError, DaemonResult};
pub use handlers::AppState;
pub use server::CaseflowServer;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
