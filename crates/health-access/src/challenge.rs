//! One-time-code challenges
//!
//! A challenge binds a random numeric code to one (identifier, purpose)
//! pair. At most one challenge per pair is outstanding: issuing a new code
//! supersedes the previous one. Codes are never stored in the clear, only
//! as a SHA-256 digest bound to the identifier and purpose.
//!
//! Redemption is a single compare-and-set in the repository, so of several
//! concurrent callers presenting the right code exactly one wins. The
//! attempt budget is enforced in that same step, not against the snapshot
//! the caller read.
//!
//! Issuing writes its CHALLENGE_ISSUED entry together with the new record.
//! If the entry cannot be written the previous code stays valid.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rand::rngs::OsRng;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::audit::{AuditAction, AuditDraft};
use crate::clock::Clock;
use crate::config::AccessConfig;
use crate::error::{AccessError, ErrorKind, Result};
use crate::identity::{mask_identifier, normalize_identifier, IdentityId, Role};
use crate::ids::ChallengeId;
use crate::storage::{ChallengeRepository, ChallengeUpdate};

/// What a code is being issued for
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChallengePurpose {
    Login,
    Registration,
    EmergencyAccess,
}

impl std::fmt::Display for ChallengePurpose {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChallengePurpose::Login => write!(f, "LOGIN"),
            ChallengePurpose::Registration => write!(f, "REGISTRATION"),
            ChallengePurpose::EmergencyAccess => write!(f, "EMERGENCY_ACCESS"),
        }
    }
}

/// Normalised (identifier, purpose) pair a challenge belongs to
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChallengeKey {
    pub identifier: String,
    pub purpose: ChallengePurpose,
}

impl ChallengeKey {
    pub fn new(identifier: &str, purpose: ChallengePurpose) -> Result<Self> {
        Ok(Self {
            identifier: normalize_identifier(identifier)?,
            purpose,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChallengeState {
    Outstanding,
    Consumed,
    /// Replaced by a newer challenge for the same pair
    Superseded,
}

/// Stored challenge
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChallengeRecord {
    pub id: ChallengeId,
    pub key: ChallengeKey,
    /// Hex SHA-256 of (identifier, purpose, code)
    pub code_digest: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub state: ChallengeState,
    /// Failed redemption attempts
    pub attempts: u32,
    pub consumed_at: Option<DateTime<Utc>>,
}

impl ChallengeRecord {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// A freshly issued challenge together with the clear-text code to deliver
#[derive(Clone)]
pub struct IssuedChallenge {
    pub challenge: ChallengeRecord,
    pub code: String,
}

impl std::fmt::Debug for IssuedChallenge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssuedChallenge")
            .field("challenge", &self.challenge)
            .field("code", &"<redacted>")
            .finish()
    }
}

/// Digest of a code bound to its key
pub fn code_digest(key: &ChallengeKey, code: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.identifier.as_bytes());
    hasher.update([0u8]);
    hasher.update(key.purpose.to_string().as_bytes());
    hasher.update([0u8]);
    hasher.update(code.as_bytes());
    hex::encode(hasher.finalize())
}

/// Constant-time comparison to prevent timing attacks
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut result = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}

fn generate_code(length: usize) -> String {
    let mut rng = OsRng;
    (0..length)
        .map(|_| char::from(b'0' + rng.gen_range(0..10u8)))
        .collect()
}

/// Outstanding one-time-code challenges
pub struct ChallengeStore {
    repo: Arc<dyn ChallengeRepository>,
    clock: Arc<dyn Clock>,
    code_length: usize,
    ttl: Duration,
    max_attempts: u32,
}

impl ChallengeStore {
    pub fn new(repo: Arc<dyn ChallengeRepository>, clock: Arc<dyn Clock>, config: &AccessConfig) -> Self {
        Self {
            repo,
            clock,
            code_length: config.code_length,
            ttl: config.challenge_ttl(),
            max_attempts: config.max_code_attempts,
        }
    }

    /// Issue a new code for the pair, superseding any outstanding one
    pub fn issue(&self, identifier: &str, purpose: ChallengePurpose) -> Result<IssuedChallenge> {
        self.issue_to(identifier, purpose, None)
    }

    /// Issue a code, naming the registered recipient on the audit entry
    pub fn issue_to(
        &self,
        identifier: &str,
        purpose: ChallengePurpose,
        recipient: Option<(IdentityId, Role)>,
    ) -> Result<IssuedChallenge> {
        let key = ChallengeKey::new(identifier, purpose)?;
        let code = generate_code(self.code_length);
        let now = self.clock.now();
        let record = ChallengeRecord {
            id: ChallengeId::new(),
            code_digest: code_digest(&key, &code),
            key,
            issued_at: now,
            expires_at: now + self.ttl,
            state: ChallengeState::Outstanding,
            attempts: 0,
            consumed_at: None,
        };
        let mut draft = AuditDraft::new(AuditAction::ChallengeIssued, now).with_detail(json!({
            "identifier": mask_identifier(&record.key.identifier),
            "purpose": purpose,
            "expires_at": record.expires_at,
        }));
        if let Some((identity_id, role)) = recipient {
            draft = draft.by(identity_id, role);
        }
        let (superseded, _) = self.repo.supersede_and_insert(record.clone(), draft)?;
        info!(
            identifier = %mask_identifier(&record.key.identifier),
            %purpose,
            superseded,
            expires_at = %record.expires_at,
            "challenge issued"
        );
        Ok(IssuedChallenge {
            challenge: record,
            code,
        })
    }

    /// Redeem a code, reporting exactly why a failed redemption failed.
    ///
    /// Failed calls never consume the challenge. A mismatch counts against
    /// the attempt budget; a correct code for a superseded challenge is
    /// reported as expired.
    pub fn redeem(&self, identifier: &str, code: &str, purpose: ChallengePurpose) -> Result<ChallengeRecord> {
        self.redeem_inner(identifier, code, purpose, None)
    }

    /// Redeem a code and write `audit` in the same step as the consume. If
    /// the entry cannot be written the challenge stays outstanding.
    pub fn redeem_recorded(
        &self,
        identifier: &str,
        code: &str,
        purpose: ChallengePurpose,
        audit: AuditDraft,
    ) -> Result<ChallengeRecord> {
        self.redeem_inner(identifier, code, purpose, Some(audit))
    }

    fn redeem_inner(
        &self,
        identifier: &str,
        code: &str,
        purpose: ChallengePurpose,
        audit: Option<AuditDraft>,
    ) -> Result<ChallengeRecord> {
        let key = ChallengeKey::new(identifier, purpose)?;
        let code = code.trim();
        if code.len() != self.code_length || !code.bytes().all(|b| b.is_ascii_digit()) {
            return Err(AccessError::validation(
                "code",
                format!("must be {} digits", self.code_length),
            ));
        }

        let now = self.clock.now();
        let records = self.repo.challenges_for(&key)?;
        let Some(latest) = records.first() else {
            return Err(AccessError::ChallengeNotFound);
        };
        let digest = code_digest(&key, code);
        let digest_matches = |record: &ChallengeRecord| {
            constant_time_eq(record.code_digest.as_bytes(), digest.as_bytes())
        };

        if digest_matches(latest) {
            match latest.state {
                ChallengeState::Consumed => return Err(AccessError::AlreadyConsumed),
                ChallengeState::Superseded => return Err(AccessError::CodeSuperseded),
                ChallengeState::Outstanding => {}
            }
            if latest.is_expired_at(now) {
                return Err(AccessError::CodeExpired);
            }
            if latest.attempts >= self.max_attempts {
                return Err(AccessError::AttemptsExhausted);
            }
            match self.repo.mark_consumed(latest.id, now, self.max_attempts, audit)? {
                ChallengeUpdate::Applied { .. } => {}
                ChallengeUpdate::NotOutstanding => {
                    debug!(challenge = %latest.id, "lost consume race");
                    return Err(AccessError::AlreadyConsumed);
                }
                ChallengeUpdate::Expired => return Err(AccessError::CodeExpired),
                ChallengeUpdate::Locked => return Err(AccessError::AttemptsExhausted),
            }
            let mut consumed = latest.clone();
            consumed.state = ChallengeState::Consumed;
            consumed.consumed_at = Some(now);
            debug!(challenge = %consumed.id, %purpose, "challenge consumed");
            return Ok(consumed);
        }

        if let Some(older) = records.iter().skip(1).find(|&r| digest_matches(r)) {
            return Err(match older.state {
                ChallengeState::Consumed => AccessError::AlreadyConsumed,
                _ => AccessError::CodeSuperseded,
            });
        }

        if latest.state != ChallengeState::Outstanding {
            return Err(AccessError::ChallengeNotFound);
        }
        if latest.is_expired_at(now) {
            return Err(AccessError::CodeExpired);
        }
        if latest.attempts >= self.max_attempts {
            return Err(AccessError::AttemptsExhausted);
        }
        match self.repo.record_failed_attempt(latest.id, now, self.max_attempts)? {
            ChallengeUpdate::Applied { attempts, .. } => {
                debug!(challenge = %latest.id, attempts, "code mismatch");
                Err(AccessError::CodeMismatch {
                    attempts_remaining: self.max_attempts.saturating_sub(attempts),
                })
            }
            ChallengeUpdate::NotOutstanding => Err(AccessError::ChallengeNotFound),
            ChallengeUpdate::Expired => Err(AccessError::CodeExpired),
            ChallengeUpdate::Locked => Err(AccessError::AttemptsExhausted),
        }
    }

    /// Check-and-mark: true for exactly one successful caller.
    ///
    /// Verification failures map to `false`; storage and input errors
    /// still propagate.
    pub fn consume(&self, identifier: &str, code: &str, purpose: ChallengePurpose) -> Result<bool> {
        match self.redeem(identifier, code, purpose) {
            Ok(_) => Ok(true),
            Err(err) if matches!(err.kind(), ErrorKind::StorageFailure | ErrorKind::ValidationError) => Err(err),
            Err(_) => Ok(false),
        }
    }

    /// Drop every challenge with `expires_at <= now`
    pub fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        Ok(self.repo.purge_expired_challenges(now)?)
    }
}
