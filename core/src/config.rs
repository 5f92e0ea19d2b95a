//! Engine configuration: a serde-derived struct tree, loaded from an
//! optional TOML file and validated before the daemon starts serving.
//! Follows a layered load/override/validate pattern: defaults, then an
//! optional file, then CLI flags, then one final validation pass.

use crate::errors::{ConfigError, ConfigResult};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub database: DatabaseConfig,
    pub lock: LockConfig,
    pub dispatcher: DispatcherConfig,
    pub agent_host: AgentHostConfig,
    pub callback: CallbackConfig,
    pub credentials: CredentialsConfig,
    pub stall: StallConfig,
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub logging: LoggingConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            lock: LockConfig::default(),
            dispatcher: DispatcherConfig::default(),
            agent_host: AgentHostConfig::default(),
            callback: CallbackConfig::default(),
            credentials: CredentialsConfig::default(),
            stall: StallConfig::default(),
            server: ServerConfig::default(),
            auth: AuthConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: EngineConfig = toml::from_str(&contents)?;
        Ok(config)
    }

    pub fn load_or_default(path: Option<&Path>) -> ConfigResult<Self> {
        match path {
            Some(p) if p.exists() => Self::load(p),
            _ => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.database.path.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("database.path must not be empty".into()));
        }
        if self.lock.default_ttl_seconds == 0 {
            return Err(ConfigError::Invalid("lock.default_ttl_seconds must be > 0".into()));
        }
        if self.dispatcher.max_retries == 0 {
            return Err(ConfigError::Invalid("dispatcher.max_retries must be > 0".into()));
        }
        if self.agent_host.base_url.is_empty() {
            return Err(ConfigError::Invalid("agent_host.base_url must not be empty".into()));
        }
        if self.callback.internal_token.is_empty() {
            return Err(ConfigError::Invalid(
                "callback.internal_token must be set".into(),
            ));
        }
        if self.credentials.encryption_key.len() != 32 {
            return Err(ConfigError::Invalid(
                "credentials.encryption_key must decode to exactly 32 bytes".into(),
            ));
        }
        if self.server.port == 0 {
            return Err(ConfigError::Invalid("server.port must be nonzero".into()));
        }
        if self.auth.enabled && self.auth.jwt_secret == "change-me" {
            return Err(ConfigError::Invalid(
                "auth.jwt_secret must be overridden when auth is enabled".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: std::path::PathBuf,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: std::path::PathBuf::from("caseflow.db"),
            max_connections: 10,
        }
    }
}

/// TTL defaults for single-flight agent locks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    pub default_ttl_seconds: u64,
    pub poll_interval_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            default_ttl_seconds: 15 * 60,
            poll_interval_ms: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    pub agent_queue_workers: usize,
    pub backend_queue_workers: usize,
    pub visibility_timeout_seconds: u64,
    pub max_retries: u32,
    pub backoff_base_seconds: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            agent_queue_workers: 2,
            backend_queue_workers: 4,
            visibility_timeout_seconds: 60,
            max_retries: 3,
            backoff_base_seconds: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentHostConfig {
    pub base_url: String,
    pub shared_token: String,
    pub run_timeout_seconds: u64,
    pub model_pm: String,
    pub model_dev: String,
    pub model_qa: String,
    pub model_tech_lead: String,
}

impl Default for AgentHostConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:9100".into(),
            shared_token: String::new(),
            run_timeout_seconds: 900,
            model_pm: "gpt-4.1-mini".into(),
            model_dev: "gpt-4.1".into(),
            model_qa: "gpt-4.1".into(),
            model_tech_lead: "gpt-4.1".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CallbackConfig {
    pub internal_token: String,
}

impl Default for CallbackConfig {
    fn default() -> Self {
        Self {
            internal_token: "change-me".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CredentialsConfig {
    /// Hex or base64 in TOML; decoded at load time into exactly 32 bytes.
    pub encryption_key: Vec<u8>,
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            encryption_key: vec![0u8; 32],
        }
    }
}

/// Stall-recovery thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StallConfig {
    pub sweep_interval_seconds: u64,
    pub pickup_threshold_seconds: i64,
    pub stuck_threshold_seconds: i64,
    pub warn_threshold_seconds: i64,
    pub escalate_threshold_seconds: i64,
}

impl Default for StallConfig {
    fn default() -> Self {
        Self {
            sweep_interval_seconds: 5 * 60,
            pickup_threshold_seconds: 5 * 60,
            stuck_threshold_seconds: 20 * 60,
            warn_threshold_seconds: 45 * 60,
            escalate_threshold_seconds: 4 * 60 * 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Separate port for the real-time WebSocket gateway,
    /// mirroring this workspace's split HTTP/WS address convention.
    pub ws_port: u16,
    pub request_timeout_seconds: u64,
    pub keepalive_interval_seconds: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8089,
            ws_port: 8090,
            request_timeout_seconds: 30,
            keepalive_interval_seconds: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub enabled: bool,
    pub jwt_secret: String,
    pub token_ttl_seconds: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            jwt_secret: "change-me".into(),
            token_ttl_seconds: 24 * 60 * 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_fails_validation_on_secrets() {
        let config = EngineConfig::default();
        assert!(config.validate().is_err());
    }

    #[test]
    fn valid_config_passes() {
        let mut config = EngineConfig::default();
        config.callback.internal_token = "s3cr3t".into();
        config.credentials.encryption_key = vec![7u8; 32];
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_short_encryption_key() {
        let mut config = EngineConfig::default();
        config.callback.internal_token = "s3cr3t".into();
        config.credentials.encryption_key = vec![7u8; 16];
        assert!(config.validate().is_err());
    }
}
