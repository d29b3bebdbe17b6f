//! Credential verification
//!
//! Turns a presented credential into a verified identity id:
//! - one-time codes are redeemed against the [`ChallengeStore`]
//! - biometric samples are compared with the enrolled reference through a
//!   pluggable [`BiometricMatcher`]
//! - an unconscious patient can be identified by scanning every patient
//!   enrolled for the modality
//!
//! The scan is linear in the number of enrolled patients.
//!
//! An unknown identifier fails as `NoMatch`, but a registered patient with
//! no reference for the modality fails as `NoReferenceEnrolled` so the
//! caller can fall back to a code. That second error does reveal that the
//! identifier is registered.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::challenge::{ChallengePurpose, ChallengeStore};
use crate::error::{AccessError, Result};
use crate::identity::{normalize_identifier, BiometricKind, BiometricReference, IdentityId, Role};
use crate::storage::IdentityRepository;

/// Result of one biometric comparison
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct MatchOutcome {
    pub matched: bool,
    /// Similarity in [0, 1]
    pub confidence: f64,
}

/// Compares a live sample with an enrolled reference
pub trait BiometricMatcher: Send + Sync {
    fn compare(&self, reference: &BiometricReference, sample: &[u8]) -> MatchOutcome;
}

/// Normalised Hamming similarity over template bytes.
///
/// Templates of different length never match.
#[derive(Clone, Copy, Debug)]
pub struct TemplateMatcher {
    threshold: f64,
}

impl TemplateMatcher {
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }
}

/// Fraction of equal bits between two equal-length byte strings
pub fn hamming_similarity(a: &[u8], b: &[u8]) -> f64 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let matching_bits: usize = a
        .iter()
        .zip(b.iter())
        .map(|(x, y)| (!(x ^ y)).count_ones() as usize)
        .sum();
    matching_bits as f64 / (a.len() * 8) as f64
}

impl BiometricMatcher for TemplateMatcher {
    fn compare(&self, reference: &BiometricReference, sample: &[u8]) -> MatchOutcome {
        let confidence = hamming_similarity(&reference.template, sample);
        MatchOutcome {
            matched: reference.template.len() == sample.len() && confidence >= self.threshold,
            confidence,
        }
    }
}

/// How an identity was verified, as recorded on grants and audit entries
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VerificationMethod {
    Otp,
    Fingerprint,
    Iris,
}

impl std::fmt::Display for VerificationMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VerificationMethod::Otp => write!(f, "OTP"),
            VerificationMethod::Fingerprint => write!(f, "FINGERPRINT"),
            VerificationMethod::Iris => write!(f, "IRIS"),
        }
    }
}

impl From<BiometricKind> for VerificationMethod {
    fn from(kind: BiometricKind) -> Self {
        match kind {
            BiometricKind::Fingerprint => VerificationMethod::Fingerprint,
            BiometricKind::Iris => VerificationMethod::Iris,
        }
    }
}

/// A presented proof of identity
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum Credential {
    Otp { code: String },
    Biometric { kind: BiometricKind, sample: Vec<u8> },
}

impl Credential {
    pub fn method(&self) -> VerificationMethod {
        match self {
            Credential::Otp { .. } => VerificationMethod::Otp,
            Credential::Biometric { kind, .. } => (*kind).into(),
        }
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credential::Otp { .. } => f.debug_struct("Otp").field("code", &"<redacted>").finish(),
            Credential::Biometric { kind, sample } => f
                .debug_struct("Biometric")
                .field("kind", kind)
                .field("sample_len", &sample.len())
                .finish(),
        }
    }
}

pub struct CredentialVerifier {
    challenges: Arc<ChallengeStore>,
    identities: Arc<dyn IdentityRepository>,
    matcher: Arc<dyn BiometricMatcher>,
}

impl CredentialVerifier {
    pub fn new(
        challenges: Arc<ChallengeStore>,
        identities: Arc<dyn IdentityRepository>,
        matcher: Arc<dyn BiometricMatcher>,
    ) -> Self {
        Self {
            challenges,
            identities,
            matcher,
        }
    }

    /// Redeem a one-time code and resolve the identifier it was sent to
    pub fn verify_code(&self, identifier: &str, code: &str, purpose: ChallengePurpose) -> Result<IdentityId> {
        let challenge = self.challenges.redeem(identifier, code, purpose)?;
        let identity = self
            .identities
            .identity_by_contact(&challenge.key.identifier)?
            .ok_or(AccessError::NotFound("identity"))?;
        debug!(identity = %identity.id, %purpose, "code verified");
        Ok(identity.id)
    }

    /// Compare a sample with the identifier's enrolled reference
    pub fn verify_biometric(&self, identifier: &str, kind: BiometricKind, sample: &[u8]) -> Result<IdentityId> {
        if sample.is_empty() {
            return Err(AccessError::validation("sample", "must not be empty"));
        }
        let identifier = normalize_identifier(identifier)?;
        let identity = match self.identities.identity_by_contact(&identifier)? {
            Some(identity) if identity.role() == Role::Patient => identity,
            _ => return Err(AccessError::NoMatch),
        };
        let reference = identity
            .biometric_reference(kind)
            .ok_or(AccessError::NoReferenceEnrolled(kind))?;

        let outcome = self.matcher.compare(reference, sample);
        debug!(identity = %identity.id, %kind, confidence = outcome.confidence, matched = outcome.matched, "biometric compared");
        if outcome.matched {
            Ok(identity.id)
        } else {
            Err(AccessError::NoMatch)
        }
    }

    /// Identify a patient from a sample alone. The first enrolled patient
    /// (in registration order) whose reference matches wins.
    pub fn identify_by_biometric_scan(&self, kind: BiometricKind, sample: &[u8]) -> Result<IdentityId> {
        if sample.is_empty() {
            return Err(AccessError::validation("sample", "must not be empty"));
        }
        let candidates = self.identities.patients_enrolled_for(kind)?;
        if candidates.is_empty() {
            return Err(AccessError::NoCandidate(kind));
        }
        let scanned = candidates.len();
        for candidate in candidates {
            let Some(reference) = candidate.biometric_reference(kind) else {
                continue;
            };
            let outcome = self.matcher.compare(reference, sample);
            if outcome.matched {
                info!(patient = %candidate.id, %kind, confidence = outcome.confidence, scanned, "patient identified by scan");
                return Ok(candidate.id);
            }
        }
        debug!(%kind, scanned, "biometric scan found no match");
        Err(AccessError::NoMatch)
    }

    /// Verify any credential variant.
    ///
    /// One-time codes need the identifier they were sent to. A biometric
    /// sample without an identifier falls back to the enrolment scan.
    pub fn verify(&self, identifier: Option<&str>, purpose: ChallengePurpose, credential: &Credential) -> Result<IdentityId> {
        match (credential, identifier) {
            (Credential::Otp { code }, Some(identifier)) => self.verify_code(identifier, code, purpose),
            (Credential::Otp { .. }, None) => Err(AccessError::validation(
                "identifier",
                "a one-time code needs the identifier it was sent to",
            )),
            (Credential::Biometric { kind, sample }, Some(identifier)) => {
                self.verify_biometric(identifier, *kind, sample)
            }
            (Credential::Biometric { kind, sample }, None) => self.identify_by_biometric_scan(*kind, sample),
        }
    }
}
