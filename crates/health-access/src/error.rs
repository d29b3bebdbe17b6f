//! Error taxonomy for the access core
//!
//! Every failure maps to a stable [`ErrorKind`] plus a human-readable
//! message. Callers branch on the kind; the message is for people.
//!
//! - `ValidationError`: malformed or missing input, do not retry
//! - `NotFound`: identifier, session or grant does not exist
//! - `Expired`: challenge, session or grant past its deadline, restart the flow
//! - `Conflict`: race lost or challenge locked, retry with a fresh challenge
//! - `Unauthorized`: verification or policy denial
//! - `StorageFailure`: infrastructure fault, retry with backoff
//! - `Timeout`: caller deadline elapsed, outcome of any write is unknown

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::ConfigError;
use crate::identity::BiometricKind;
use crate::token::TokenError;

/// Stable, enumerable error kinds exposed to external callers
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    ValidationError,
    NotFound,
    Expired,
    Conflict,
    Unauthorized,
    StorageFailure,
    Timeout,
}

impl ErrorKind {
    /// Whether the caller may retry the same call (possibly after backoff)
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::Conflict | ErrorKind::StorageFailure | ErrorKind::Timeout
        )
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::ValidationError => write!(f, "VALIDATION_ERROR"),
            ErrorKind::NotFound => write!(f, "NOT_FOUND"),
            ErrorKind::Expired => write!(f, "EXPIRED"),
            ErrorKind::Conflict => write!(f, "CONFLICT"),
            ErrorKind::Unauthorized => write!(f, "UNAUTHORIZED"),
            ErrorKind::StorageFailure => write!(f, "STORAGE_FAILURE"),
            ErrorKind::Timeout => write!(f, "TIMEOUT"),
        }
    }
}

/// Errors raised by a storage backend
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum StorageError {
    /// Transient lock or contention condition; safe to retry
    #[error("storage busy: {0}")]
    Busy(String),
    /// Backend could not be reached or refused the operation
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    /// A uniqueness constraint rejected the write
    #[error("duplicate value: {0}")]
    Duplicate(String),
    /// Stored data failed an integrity check
    #[error("storage corrupt: {0}")]
    Corrupt(String),
}

impl StorageError {
    /// Busy is the only condition the retry policy retries
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Busy(_))
    }
}

/// Umbrella error for every operation of the access core
#[derive(Debug, Error)]
pub enum AccessError {
    #[error("invalid {field}: {message}")]
    Validation { field: &'static str, message: String },

    #[error("emergency access requires a justification and a verification method")]
    MissingJustification,

    #[error("no outstanding verification code for this identifier")]
    ChallengeNotFound,

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("verification code expired")]
    CodeExpired,

    #[error("verification code was replaced by a newer one")]
    CodeSuperseded,

    #[error("verification code mismatch ({attempts_remaining} attempts remaining)")]
    CodeMismatch { attempts_remaining: u32 },

    #[error("verification code already used")]
    AlreadyConsumed,

    #[error("too many failed attempts, request a new code")]
    AttemptsExhausted,

    #[error("no {0} reference enrolled")]
    NoReferenceEnrolled(BiometricKind),

    #[error("biometric sample did not match")]
    NoMatch,

    #[error("no patient enrolled for {0} identification")]
    NoCandidate(BiometricKind),

    #[error("invalid session token: {0}")]
    InvalidToken(#[from] TokenError),

    #[error("session expired")]
    SessionExpired,

    #[error("session revoked")]
    SessionRevoked,

    #[error("access denied: {0}")]
    Unauthorized(String),

    #[error("storage failure: {0}")]
    Storage(#[from] StorageError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("internal error: {0}")]
    Internal(String),
}

impl AccessError {
    pub(crate) fn validation(field: &'static str, message: impl Into<String>) -> Self {
        AccessError::Validation {
            field,
            message: message.into(),
        }
    }

    /// Stable kind for programmatic handling
    pub fn kind(&self) -> ErrorKind {
        match self {
            AccessError::Validation { .. }
            | AccessError::MissingJustification
            | AccessError::Config(_) => ErrorKind::ValidationError,
            AccessError::ChallengeNotFound
            | AccessError::NotFound(_)
            | AccessError::NoReferenceEnrolled(_)
            | AccessError::NoCandidate(_) => ErrorKind::NotFound,
            AccessError::CodeExpired
            | AccessError::CodeSuperseded
            | AccessError::SessionExpired => ErrorKind::Expired,
            AccessError::AlreadyConsumed | AccessError::AttemptsExhausted => ErrorKind::Conflict,
            AccessError::CodeMismatch { .. }
            | AccessError::NoMatch
            | AccessError::InvalidToken(_)
            | AccessError::SessionRevoked
            | AccessError::Unauthorized(_) => ErrorKind::Unauthorized,
            AccessError::Storage(StorageError::Duplicate(_)) => ErrorKind::Conflict,
            AccessError::Storage(_) | AccessError::Internal(_) => ErrorKind::StorageFailure,
            AccessError::Timeout(_) => ErrorKind::Timeout,
        }
    }

    /// Message safe to hand to an external caller.
    ///
    /// Infrastructure details stay in the logs.
    pub fn public_message(&self) -> String {
        match self {
            AccessError::Storage(StorageError::Duplicate(_)) => {
                "identifier already registered".to_string()
            }
            AccessError::Storage(_) | AccessError::Internal(_) => {
                "temporary failure, retry later".to_string()
            }
            AccessError::Config(_) => "service misconfigured".to_string(),
            other => other.to_string(),
        }
    }
}

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, AccessError>;
