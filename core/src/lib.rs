//! Engine library for the multi-tenant ticket-workflow system: the Kanban
//! state machine, agent dispatch pipeline, stall recovery, and real-time
//! event fan-out.

pub mod agent_runner;
pub mod callback;
pub mod config;
pub mod credentials;
pub mod dispatcher;
pub mod errors;
pub mod event_bus;
pub mod lock_service;
pub mod models;
pub mod spawner;
pub mod stall_controller;
pub mod state_machine;
pub mod store;

pub use errors::{EngineError, EngineResult};
pub use models::*;
