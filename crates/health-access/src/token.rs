//! Signed session tokens
//!
//! Wire form: `base64url(claims JSON) "." base64url(HMAC-SHA256(claims))`.
//!
//! The subject is tagged, so one token format carries both ordinary
//! sessions and emergency grants:
//!
//! ```json
//! {"sub":{"typ":"emergency","grant_id":"..","doctor_id":"..","patient_id":".."},
//!  "role":"DOCTOR","iat":1760000000,"exp":1760001800}
//! ```
//!
//! [`TokenSigner::verify`] checks integrity only. Expiry and revocation are
//! judged by the session manager, which must still be able to read an
//! expired token in order to revoke what it names.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;
use tracing::warn;

use crate::config::{AccessConfig, ConfigError, MIN_SIGNING_KEY_BYTES};
use crate::identity::{IdentityId, Role};
use crate::ids::{GrantId, SessionId};

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("malformed token")]
    Malformed,
    #[error("signature does not match")]
    BadSignature,
    #[error("token encoding failed: {0}")]
    Encoding(String),
}

/// Who a token speaks for
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "typ", rename_all = "snake_case")]
pub enum TokenSubject {
    Session {
        session_id: SessionId,
        identity_id: IdentityId,
    },
    Emergency {
        grant_id: GrantId,
        doctor_id: IdentityId,
        patient_id: IdentityId,
    },
}

/// Signed token payload
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenClaims {
    pub sub: TokenSubject,
    pub role: Role,
    /// Issued-at, unix seconds
    pub iat: i64,
    /// Expires-at, unix seconds
    pub exp: i64,
}

impl TokenClaims {
    pub fn new(sub: TokenSubject, role: Role, issued_at: DateTime<Utc>, expires_at: DateTime<Utc>) -> Self {
        Self {
            sub,
            role,
            iat: issued_at.timestamp(),
            exp: expires_at.timestamp(),
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now.timestamp() >= self.exp
    }

    /// Identity acting under this token
    pub fn actor_id(&self) -> IdentityId {
        match &self.sub {
            TokenSubject::Session { identity_id, .. } => *identity_id,
            TokenSubject::Emergency { doctor_id, .. } => *doctor_id,
        }
    }
}

/// Opaque bearer token handed to clients
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionToken(String);

impl SessionToken {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for SessionToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SessionToken(<redacted>)")
    }
}

fn encode(bytes: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(bytes)
}

fn decode(text: &str) -> Result<Vec<u8>, TokenError> {
    URL_SAFE_NO_PAD.decode(text).map_err(|_| TokenError::Malformed)
}

/// HMAC-SHA256 token signer
pub struct TokenSigner {
    key: Vec<u8>,
}

impl TokenSigner {
    pub fn new(key: Vec<u8>) -> Self {
        Self { key }
    }

    /// Build from configuration, generating an ephemeral key when none is set
    pub fn from_config(config: &AccessConfig) -> Result<Self, ConfigError> {
        match config.signing_key_bytes()? {
            Some(key) => Ok(Self::new(key)),
            None => {
                warn!("no signing key configured, tokens will not survive a restart");
                Ok(Self::ephemeral())
            }
        }
    }

    /// Signer with a random key from OS entropy
    pub fn ephemeral() -> Self {
        let mut key = vec![0u8; MIN_SIGNING_KEY_BYTES];
        OsRng.fill_bytes(&mut key);
        Self::new(key)
    }

    fn mac(&self) -> Result<HmacSha256, TokenError> {
        HmacSha256::new_from_slice(&self.key).map_err(|e| TokenError::Encoding(e.to_string()))
    }

    pub fn sign(&self, claims: &TokenClaims) -> Result<SessionToken, TokenError> {
        let claims_json = serde_json::to_vec(claims).map_err(|e| TokenError::Encoding(e.to_string()))?;
        let payload = encode(&claims_json);

        let mut mac = self.mac()?;
        mac.update(payload.as_bytes());
        let signature = mac.finalize().into_bytes();

        Ok(SessionToken(format!("{}.{}", payload, encode(&signature))))
    }

    /// Check the signature and decode the claims. Does not check expiry.
    pub fn verify(&self, token: &str) -> Result<TokenClaims, TokenError> {
        let (payload, signature) = token.trim().split_once('.').ok_or(TokenError::Malformed)?;
        if payload.is_empty() || signature.contains('.') {
            return Err(TokenError::Malformed);
        }
        let signature = decode(signature)?;

        let mut mac = self.mac()?;
        mac.update(payload.as_bytes());
        mac.verify_slice(&signature).map_err(|_| TokenError::BadSignature)?;

        let claims_json = decode(payload)?;
        serde_json::from_slice(&claims_json).map_err(|_| TokenError::Malformed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn claims() -> TokenClaims {
        let now = Utc::now();
        TokenClaims::new(
            TokenSubject::Emergency {
                grant_id: GrantId::new(),
                doctor_id: IdentityId::new(),
                patient_id: IdentityId::new(),
            },
            Role::Doctor,
            now,
            now + Duration::minutes(30),
        )
    }

    #[test]
    fn test_sign_and_verify() {
        let signer = TokenSigner::ephemeral();
        let claims = claims();
        let token = signer.sign(&claims).unwrap();
        assert_eq!(signer.verify(token.as_str()).unwrap(), claims);
    }

    #[test]
    fn test_other_key_rejected() {
        let token = TokenSigner::ephemeral().sign(&claims()).unwrap();
        let err = TokenSigner::ephemeral().verify(token.as_str()).unwrap_err();
        assert_eq!(err, TokenError::BadSignature);
    }

    #[test]
    fn test_tampered_payload_rejected() {
        let signer = TokenSigner::ephemeral();
        let token = signer.sign(&claims()).unwrap();
        let (_, signature) = token.as_str().split_once('.').unwrap();

        let mut forged = claims();
        forged.exp += 3600;
        let payload = encode(&serde_json::to_vec(&forged).unwrap());
        let err = signer.verify(&format!("{}.{}", payload, signature)).unwrap_err();
        assert_eq!(err, TokenError::BadSignature);
    }

    #[test]
    fn test_garbage_is_malformed() {
        let signer = TokenSigner::ephemeral();
        assert_eq!(signer.verify("not-a-token").unwrap_err(), TokenError::Malformed);
        assert_eq!(signer.verify("a.b.c").unwrap_err(), TokenError::Malformed);
        assert_eq!(signer.verify("abc.!!!").unwrap_err(), TokenError::Malformed);
    }

    #[test]
    fn test_subject_is_tagged() {
        let json = serde_json::to_value(claims()).unwrap();
        assert_eq!(json["sub"]["typ"], "emergency");
        assert_eq!(json["role"], "DOCTOR");
    }

    #[test]
    fn test_expiry_is_reported_not_enforced() {
        let now = Utc::now();
        let claims = TokenClaims::new(
            TokenSubject::Session {
                session_id: SessionId::new(),
                identity_id: IdentityId::new(),
            },
            Role::Patient,
            now - Duration::hours(2),
            now - Duration::hours(1),
        );
        let signer = TokenSigner::ephemeral();
        let token = signer.sign(&claims).unwrap();
        let decoded = signer.verify(token.as_str()).unwrap();
        assert!(decoded.is_expired_at(now));
    }

    #[test]
    fn test_debug_redacts_token() {
        let token = TokenSigner::ephemeral().sign(&claims()).unwrap();
        assert!(!format!("{:?}", token).contains(token.as_str()));
    }
}
