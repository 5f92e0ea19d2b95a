//! Customer-facing JWT authentication. Grounded in this workspace's
//! `AuthManager`/`Claims` pattern (jsonwebtoken encode/decode behind a small
//! wrapper), narrowed to the one claim the customer API actually needs: the
//! tenant's `customer_id`. The internal callback and save-credential routes
//! use the engine's own shared-token check (`CallbackHandler::authorize`)
//! instead of JWTs.

use caseflow_core::config::AuthConfig;
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::{DaemonError, DaemonResult};

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub exp: i64,
    pub iat: i64,
}

pub struct AuthManager {
    config: AuthConfig,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
}

impl AuthManager {
    pub fn new(config: AuthConfig) -> Self {
        let encoding_key = EncodingKey::from_secret(config.jwt_secret.as_bytes());
        let decoding_key = DecodingKey::from_secret(config.jwt_secret.as_bytes());
        Self {
            config,
            encoding_key,
            decoding_key,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn issue_token(&self, customer_id: Uuid) -> DaemonResult<String> {
        let now = Utc::now();
        let claims = Claims {
            sub: customer_id,
            iat: now.timestamp(),
            exp: (now + Duration::seconds(self.config.token_ttl_seconds as i64)).timestamp(),
        };
        encode(&Header::default(), &claims, &self.encoding_key)
            .map_err(|e| DaemonError::Internal(format!("token generation failed: {e}")))
    }

    /// Verify a bearer token and return the tenant it authenticates.
    pub fn verify(&self, bearer_token: &str) -> DaemonResult<Uuid> {
        let data = decode::<Claims>(bearer_token, &self.decoding_key, &Validation::default())
            .map_err(|e| DaemonError::Engine(caseflow_core::EngineError::AuthError(e.to_string())))?;
        Ok(data.claims.sub)
    }
}

/// Extract the bearer token from an `Authorization: Bearer <token>` header
/// value.
pub fn bearer_token(header_value: Option<&str>) -> DaemonResult<&str> {
    header_value
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or(DaemonError::MissingAuth)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> AuthConfig {
        AuthConfig {
            enabled: true,
            jwt_secret: "test-secret".into(),
            token_ttl_seconds: 3600,
        }
    }

    #[test]
    fn issues_and_verifies_a_token_for_the_right_tenant() {
        let manager = AuthManager::new(config());
        let customer_id = Uuid::new_v4();
        let token = manager.issue_token(customer_id).unwrap();
        let verified = manager.verify(&token).unwrap();
        assert_eq!(verified, customer_id);
    }

    #[test]
    fn rejects_a_token_signed_with_a_different_secret() {
        let manager = AuthManager::new(config());
        let token = manager.issue_token(Uuid::new_v4()).unwrap();

        let mut other = config();
        other.jwt_secret = "different-secret".into();
        let other_manager = AuthManager::new(other);
        assert!(other_manager.verify(&token).is_err());
    }

    #[test]
    fn bearer_token_strips_prefix() {
        assert_eq!(bearer_token(Some("Bearer abc123")).unwrap(), "abc123");
        assert!(bearer_token(Some("abc123")).is_err());
        assert!(bearer_token(None).is_err());
    }
}
