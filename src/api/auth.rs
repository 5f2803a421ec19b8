//! Bearer tokens for field agents
//!
//! Tokens are `payload.signature`, both URL-safe base64. The payload is a
//! small JSON document whose subject is the agent id; the signature is
//! HMAC-SHA256 over the encoded payload.

use anyhow::{Context, Result};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use ring::{hmac, rand as ring_rand};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Token validity duration default (24 hours in seconds)
const DEFAULT_TOKEN_EXPIRY_SECS: u64 = 86400;

/// Token payload that gets signed
#[derive(Debug, Clone, Serialize, Deserialize)]
struct TokenPayload {
    /// Agent this token belongs to
    pub sub: String,
    /// Issue timestamp (Unix epoch seconds)
    pub iat: u64,
    /// Expiration timestamp (Unix epoch seconds)
    pub exp: u64,
    pub jti: String,
}

#[derive(Clone)]
pub struct AuthService {
    signing_key: Arc<hmac::Key>,
    token_expiry_secs: u64,
}

impl std::fmt::Debug for AuthService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthService")
            .field("token_expiry_secs", &self.token_expiry_secs)
            .finish()
    }
}

impl AuthService {
    /// Create a new AuthService
    ///
    /// Without a secret a random key is generated, so tokens only stay valid
    /// for the lifetime of this process.
    pub fn new(token_secret: Option<&str>, token_expiry_secs: Option<u64>) -> Result<Self> {
        let signing_key = match token_secret {
            Some(secret) => hmac::Key::new(hmac::HMAC_SHA256, secret.as_bytes()),
            None => {
                tracing::warn!("No token secret configured; issued tokens will not survive a restart");
                let rng = ring_rand::SystemRandom::new();
                hmac::Key::generate(hmac::HMAC_SHA256, &rng)
                    .map_err(|_| anyhow::anyhow!("Failed to generate signing key"))?
            }
        };

        Ok(Self {
            signing_key: Arc::new(signing_key),
            token_expiry_secs: token_expiry_secs.unwrap_or(DEFAULT_TOKEN_EXPIRY_SECS),
        })
    }

    pub fn token_expiry_secs(&self) -> u64 {
        self.token_expiry_secs
    }

    /// Generate a bearer token for an agent
    pub fn generate_token(&self, agent_id: &str) -> Result<String> {
        let now = unix_now()?;
        let payload = TokenPayload {
            sub: agent_id.to_string(),
            iat: now,
            exp: now + self.token_expiry_secs,
            jti: uuid::Uuid::new_v4().to_string(),
        };

        let payload_json = serde_json::to_string(&payload)?;
        let payload_b64 = URL_SAFE_NO_PAD.encode(payload_json.as_bytes());

        let signature = hmac::sign(&self.signing_key, payload_b64.as_bytes());
        let signature_b64 = URL_SAFE_NO_PAD.encode(signature.as_ref());

        Ok(format!("{}.{}", payload_b64, signature_b64))
    }

    /// Validate a bearer token and return the agent id if valid
    pub fn validate_token(&self, token: &str) -> Option<String> {
        let (payload_b64, signature_b64) = token.split_once('.')?;
        if signature_b64.contains('.') {
            return None;
        }

        let signature_bytes = URL_SAFE_NO_PAD.decode(signature_b64).ok()?;
        hmac::verify(&self.signing_key, payload_b64.as_bytes(), &signature_bytes).ok()?;

        let payload_json = URL_SAFE_NO_PAD.decode(payload_b64).ok()?;
        let payload: TokenPayload = serde_json::from_slice(&payload_json).ok()?;

        let now = unix_now().ok()?;
        if now > payload.exp || payload.sub.is_empty() {
            return None;
        }

        Some(payload.sub)
    }
}

fn unix_now() -> Result<u64> {
    Ok(std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .context("System time before Unix epoch")?
        .as_secs())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_generation_and_validation() {
        let auth = AuthService::new(Some("test_secret"), Some(3600)).unwrap();

        let token = auth.generate_token("agent-7").unwrap();
        assert_eq!(auth.validate_token(&token), Some("agent-7".to_string()));

        assert!(auth.validate_token("invalid.token").is_none());
        assert!(auth.validate_token("notavalidtoken").is_none());
        assert!(auth.validate_token(&format!("{}.extra", token)).is_none());
    }

    #[test]
    fn test_tokens_do_not_cross_secrets() {
        let issuer = AuthService::new(Some("secret-a"), None).unwrap();
        let other = AuthService::new(Some("secret-b"), None).unwrap();

        let token = issuer.generate_token("agent-7").unwrap();
        assert!(other.validate_token(&token).is_none());
    }

    #[test]
    fn test_expired_token() {
        let auth = AuthService::new(Some("test_secret"), Some(0)).unwrap();
        let token = auth.generate_token("agent-7").unwrap();

        // Expiry has second granularity.
        std::thread::sleep(std::time::Duration::from_millis(1100));

        assert!(auth.validate_token(&token).is_none());
    }

    #[test]
    fn test_token_tampering() {
        let auth = AuthService::new(Some("test_secret"), Some(3600)).unwrap();

        let token = auth.generate_token("agent-7").unwrap();
        let (_, signature) = token.split_once('.').unwrap();

        let forged = URL_SAFE_NO_PAD
            .encode(b"{\"sub\":\"supervisor\",\"iat\":0,\"exp\":9999999999,\"jti\":\"fake\"}");
        assert!(auth.validate_token(&format!("{}.{}", forged, signature)).is_none());
    }
}
