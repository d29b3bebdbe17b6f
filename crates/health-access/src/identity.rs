//! Identities and the identity directory
//!
//! An identity is a registered person with exactly one role:
//! - Patient: may carry biometric references and an emergency contact
//! - Doctor: may request break-glass access to a patient
//! - Operator: works at one assigned facility
//!
//! The role is derived from the profile variant, so it is fixed the moment
//! the identity is created and can never drift from its profile data.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{AccessError, Result};
pub use crate::ids::IdentityId;
use crate::storage::IdentityRepository;

/// Role types for role-based access control
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    Patient,
    Doctor,
    Operator,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Patient => write!(f, "PATIENT"),
            Role::Doctor => write!(f, "DOCTOR"),
            Role::Operator => write!(f, "OPERATOR"),
        }
    }
}

/// Biometric modalities
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BiometricKind {
    Fingerprint,
    Iris,
}

impl std::fmt::Display for BiometricKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BiometricKind::Fingerprint => write!(f, "fingerprint"),
            BiometricKind::Iris => write!(f, "iris"),
        }
    }
}

/// Enrolled biometric reference
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BiometricReference {
    pub kind: BiometricKind,
    /// Opaque handle of the reference in the biometric vault
    pub handle: String,
    /// Feature template the matcher compares samples against
    pub template: Vec<u8>,
    pub enrolled_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EmergencyContact {
    pub name: String,
    pub relationship: String,
    pub phone: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PatientProfile {
    /// At most one reference per biometric kind
    pub biometrics: Vec<BiometricReference>,
    pub emergency_contact: Option<EmergencyContact>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DoctorProfile {
    pub licence_number: Option<String>,
    pub facility: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OperatorProfile {
    /// Facility the operator is assigned to
    pub facility: String,
}

/// Role-specific profile data
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Profile {
    Patient(PatientProfile),
    Doctor(DoctorProfile),
    Operator(OperatorProfile),
}

impl Profile {
    pub fn role(&self) -> Role {
        match self {
            Profile::Patient(_) => Role::Patient,
            Profile::Doctor(_) => Role::Doctor,
            Profile::Operator(_) => Role::Operator,
        }
    }
}

/// A registered person
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    pub id: IdentityId,
    pub display_name: String,
    /// Normalised mobile number
    pub mobile: Option<String>,
    /// Normalised (lower-cased) email
    pub email: Option<String>,
    pub profile: Profile,
    pub created_at: DateTime<Utc>,
}

impl Identity {
    pub fn new(display_name: impl Into<String>, profile: Profile, created_at: DateTime<Utc>) -> Self {
        Self {
            id: IdentityId::new(),
            display_name: display_name.into(),
            mobile: None,
            email: None,
            profile,
            created_at,
        }
    }

    pub fn with_mobile(mut self, mobile: impl Into<String>) -> Self {
        self.mobile = Some(mobile.into());
        self
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    pub fn role(&self) -> Role {
        self.profile.role()
    }

    /// Facility an operator is assigned to
    pub fn assigned_facility(&self) -> Option<&str> {
        match &self.profile {
            Profile::Operator(op) => Some(op.facility.as_str()),
            _ => None,
        }
    }

    /// Stored reference for a biometric kind (patients only)
    pub fn biometric_reference(&self, kind: BiometricKind) -> Option<&BiometricReference> {
        match &self.profile {
            Profile::Patient(patient) => patient.biometrics.iter().find(|r| r.kind == kind),
            _ => None,
        }
    }

    /// Whether a normalised identifier names this identity
    pub fn matches_identifier(&self, identifier: &str) -> bool {
        self.mobile.as_deref() == Some(identifier) || self.email.as_deref() == Some(identifier)
    }
}

/// Normalise a mobile number or email used as a login identifier.
///
/// Emails are lower-cased; phone numbers lose spaces, dashes and brackets.
pub fn normalize_identifier(raw: &str) -> Result<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(AccessError::validation("identifier", "must not be empty"));
    }
    if trimmed.contains('@') {
        return Ok(trimmed.to_lowercase());
    }
    let phone: String = trimmed
        .chars()
        .filter(|c| !matches!(c, ' ' | '-' | '(' | ')' | '.'))
        .collect();
    let digits = phone.strip_prefix('+').unwrap_or(&phone);
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(AccessError::validation(
            "identifier",
            "must be an email address or a phone number",
        ));
    }
    Ok(phone)
}

/// Mask an identifier for audit details and logs: `+12******90`
pub fn mask_identifier(identifier: &str) -> String {
    let chars: Vec<char> = identifier.chars().collect();
    if chars.len() <= 4 {
        return "*".repeat(chars.len());
    }
    let head: String = chars[..3].iter().collect();
    let tail: String = chars[chars.len() - 2..].iter().collect();
    format!("{}{}{}", head, "*".repeat(chars.len() - 5), tail)
}

/// Registration, lookup and biometric enrolment over an identity repository
pub struct IdentityDirectory {
    repo: Arc<dyn IdentityRepository>,
}

impl IdentityDirectory {
    pub fn new(repo: Arc<dyn IdentityRepository>) -> Self {
        Self { repo }
    }

    /// Register a new identity; contacts are normalised and must be unique
    pub fn register(&self, mut identity: Identity) -> Result<IdentityId> {
        if identity.display_name.trim().is_empty() {
            return Err(AccessError::validation("display_name", "must not be empty"));
        }
        if identity.mobile.is_none() && identity.email.is_none() {
            return Err(AccessError::validation(
                "identifier",
                "a mobile number or an email is required",
            ));
        }
        if let Profile::Operator(op) = &identity.profile {
            if op.facility.trim().is_empty() {
                return Err(AccessError::validation("facility", "operators need an assigned facility"));
            }
        }
        identity.mobile = identity.mobile.as_deref().map(normalize_identifier).transpose()?;
        identity.email = identity.email.as_deref().map(normalize_identifier).transpose()?;

        let id = identity.id;
        let role = identity.role();
        self.repo.insert_identity(identity)?;
        info!(identity = %id, %role, "identity registered");
        Ok(id)
    }

    pub fn get(&self, id: IdentityId) -> Result<Option<Identity>> {
        Ok(self.repo.identity(id)?)
    }

    /// Resolve a raw identifier (mobile or email) to an identity
    pub fn resolve(&self, identifier: &str) -> Result<Option<Identity>> {
        let normalized = normalize_identifier(identifier)?;
        Ok(self.repo.identity_by_contact(&normalized)?)
    }

    /// Enrol (or replace) a patient's biometric reference
    pub fn enroll_biometric(&self, patient_id: IdentityId, reference: BiometricReference) -> Result<()> {
        if reference.template.is_empty() {
            return Err(AccessError::validation("template", "must not be empty"));
        }
        let mut identity = self
            .repo
            .identity(patient_id)?
            .ok_or(AccessError::NotFound("identity"))?;
        let Profile::Patient(profile) = &mut identity.profile else {
            return Err(AccessError::validation(
                "identity",
                "biometric references can only be enrolled for patients",
            ));
        };
        let kind = reference.kind;
        profile.biometrics.retain(|r| r.kind != kind);
        profile.biometrics.push(reference);
        self.repo.update_identity(identity)?;
        info!(patient = %patient_id, %kind, "biometric reference enrolled");
        Ok(())
    }
}
