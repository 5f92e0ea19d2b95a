//! Daemon-level configuration is just the engine's `EngineConfig` — the
//! daemon has no server knobs of its own beyond what `EngineConfig::server`
//! and `EngineConfig::auth` already carry.

pub use caseflow_core::config::EngineConfig;
