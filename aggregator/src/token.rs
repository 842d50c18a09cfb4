//! Per-call token issuance.
//!
//! Every outbound cluster call gets its own freshly signed token. Tokens are
//! never cached or shared between clusters or requests.

use crate::config::TokenConfig;
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

type HmacSha256 = Hmac<Sha256>;

/// Namespace marker carried by every token the gateway mints.
pub const NAMESPACE_MARKER: &str = "voyager";

#[derive(thiserror::Error, Debug)]
pub enum TokenError {
    #[error("signing secret env var {0} is not set")]
    MissingSecret(String),
    #[error("invalid signing key")]
    InvalidKey,
    #[error("failed to encode claims: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("system clock is before the unix epoch")]
    Clock,
}

/// Private claims attached on top of the registered ones.
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct TokenClaims {
    #[serde(rename = "ns")]
    pub namespace: String,
    #[serde(rename = "grp")]
    pub groups: Vec<String>,
}

impl TokenClaims {
    pub fn for_caller(groups: &[String]) -> Self {
        TokenClaims {
            namespace: NAMESPACE_MARKER.into(),
            groups: groups.to_vec(),
        }
    }
}

#[async_trait]
pub trait TokenIssuer: Send + Sync {
    /// Mints a new signed token. Called once per outbound call.
    async fn issue_token(
        &self,
        audience: &str,
        subject: &str,
        claims: &TokenClaims,
    ) -> Result<String, TokenError>;
}

#[derive(Serialize)]
struct Header<'a> {
    alg: &'static str,
    typ: &'static str,
    kid: &'a str,
}

#[derive(Serialize)]
struct Claims<'a> {
    iss: &'a str,
    sub: &'a str,
    aud: &'a str,
    iat: u64,
    exp: u64,
    jti: String,
    #[serde(flatten)]
    private: &'a TokenClaims,
}

/// Signs HS256 JWTs with a shared secret.
pub struct HmacTokenIssuer {
    issuer: String,
    key_id: String,
    secret: Vec<u8>,
    ttl: Duration,
    // Disambiguates tokens minted within the same clock tick.
    sequence: AtomicU64,
}

impl HmacTokenIssuer {
    pub fn new(issuer: &str, key_id: &str, secret: Vec<u8>, ttl: Duration) -> Result<Self, TokenError> {
        if secret.is_empty() {
            return Err(TokenError::InvalidKey);
        }
        Ok(HmacTokenIssuer {
            issuer: issuer.to_string(),
            key_id: key_id.to_string(),
            secret,
            ttl,
            sequence: AtomicU64::new(0),
        })
    }

    /// Reads the signing secret from the environment variable named in `config`.
    pub fn from_config(config: &TokenConfig) -> Result<Self, TokenError> {
        let secret = std::env::var(&config.secret_env)
            .map_err(|_| TokenError::MissingSecret(config.secret_env.clone()))?;
        Self::new(
            &config.issuer,
            &config.key_id,
            secret.into_bytes(),
            Duration::from_secs(config.ttl_secs),
        )
    }

    fn sign(&self, audience: &str, subject: &str, claims: &TokenClaims) -> Result<String, TokenError> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|_| TokenError::Clock)?;
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);

        let header = Header {
            alg: "HS256",
            typ: "JWT",
            kid: &self.key_id,
        };
        let body = Claims {
            iss: &self.issuer,
            sub: subject,
            aud: audience,
            iat: now.as_secs(),
            exp: (now + self.ttl).as_secs(),
            jti: format!("{:x}-{:x}", now.as_nanos(), seq),
            private: claims,
        };

        let signing_input = format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(serde_json::to_vec(&header)?),
            URL_SAFE_NO_PAD.encode(serde_json::to_vec(&body)?)
        );

        let mut mac = HmacSha256::new_from_slice(&self.secret).map_err(|_| TokenError::InvalidKey)?;
        mac.update(signing_input.as_bytes());
        let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());

        Ok(format!("{signing_input}.{signature}"))
    }
}

#[async_trait]
impl TokenIssuer for HmacTokenIssuer {
    async fn issue_token(
        &self,
        audience: &str,
        subject: &str,
        claims: &TokenClaims,
    ) -> Result<String, TokenError> {
        self.sign(audience, subject, claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn issuer() -> HmacTokenIssuer {
        HmacTokenIssuer::new(
            "aggregator",
            "aggregator/1",
            b"secret".to_vec(),
            Duration::from_secs(60),
        )
        .unwrap()
    }

    fn decode_part(part: &str) -> serde_json::Value {
        serde_json::from_slice(&URL_SAFE_NO_PAD.decode(part).unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_token_claims_and_signature() {
        let issuer = issuer();
        let claims = TokenClaims::for_caller(&["admins".to_string()]);
        let token = issuer
            .issue_token("atlassian.com/kube/tokenator", "alice", &claims)
            .await
            .unwrap();

        let parts: Vec<&str> = token.split('.').collect();
        assert_eq!(parts.len(), 3);

        let header = decode_part(parts[0]);
        assert_eq!(header["alg"], "HS256");
        assert_eq!(header["kid"], "aggregator/1");

        let body = decode_part(parts[1]);
        assert_eq!(body["iss"], "aggregator");
        assert_eq!(body["sub"], "alice");
        assert_eq!(body["aud"], "atlassian.com/kube/tokenator");
        assert_eq!(body["ns"], "voyager");
        assert_eq!(body["grp"], serde_json::json!(["admins"]));
        assert_eq!(
            body["exp"].as_u64().unwrap() - body["iat"].as_u64().unwrap(),
            60
        );

        let mut mac = HmacSha256::new_from_slice(b"secret").unwrap();
        mac.update(format!("{}.{}", parts[0], parts[1]).as_bytes());
        mac.verify_slice(&URL_SAFE_NO_PAD.decode(parts[2]).unwrap())
            .unwrap();
    }

    #[tokio::test]
    async fn test_tokens_are_never_reused() {
        let issuer = issuer();
        let claims = TokenClaims::for_caller(&[]);
        let mut seen = HashSet::new();
        for _ in 0..100 {
            let token = issuer.issue_token("aud", "alice", &claims).await.unwrap();
            assert!(seen.insert(token));
        }
    }

    #[test]
    fn test_empty_secret_rejected() {
        assert!(matches!(
            HmacTokenIssuer::new("i", "k", vec![], Duration::from_secs(1)),
            Err(TokenError::InvalidKey)
        ));
    }
}
