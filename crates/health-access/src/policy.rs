//! Access policy
//!
//! Decides whether an actor may read a patient's records:
//! - a patient may read only their own records
//! - a doctor needs an ACTIVE emergency grant for the patient
//! - an operator may read patients with an encounter at their facility
//!
//! Nothing else is allowed. The decision is recomputed on every access and
//! never cached, so a revoked or expired grant stops working immediately.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::error::{Result, StorageError};
use crate::identity::{IdentityId, Role};
use crate::ids::GrantId;
use crate::session::{EmergencyGrant, SessionManager};

/// The party asking for access
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub identity_id: IdentityId,
    pub role: Role,
    /// Assigned facility (operators)
    pub facility: Option<String>,
}

/// Whether a patient has an encounter at a facility
pub trait FacilityMembership: Send + Sync {
    fn has_encounter_at(&self, patient_id: IdentityId, facility: &str) -> std::result::Result<bool, StorageError>;
}

/// In-memory facility membership
#[derive(Debug, Default)]
pub struct EncounterRoster {
    encounters: RwLock<HashMap<String, HashSet<IdentityId>>>,
}

impl EncounterRoster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_encounter(&self, facility: &str, patient_id: IdentityId) -> std::result::Result<(), StorageError> {
        let mut encounters = self
            .encounters
            .write()
            .map_err(|_| StorageError::Unavailable("encounter roster lock poisoned".into()))?;
        encounters.entry(facility.to_string()).or_default().insert(patient_id);
        Ok(())
    }
}

impl FacilityMembership for EncounterRoster {
    fn has_encounter_at(&self, patient_id: IdentityId, facility: &str) -> std::result::Result<bool, StorageError> {
        let encounters = self
            .encounters
            .read()
            .map_err(|_| StorageError::Unavailable("encounter roster lock poisoned".into()))?;
        Ok(encounters
            .get(facility)
            .map(|patients| patients.contains(&patient_id))
            .unwrap_or(false))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenialReason {
    NotOwnRecord,
    NoActiveGrant,
    NoAssignedFacility,
    NoEncounterAtFacility,
}

impl std::fmt::Display for DenialReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DenialReason::NotOwnRecord => write!(f, "patients may only access their own records"),
            DenialReason::NoActiveGrant => write!(f, "no active emergency grant for this patient"),
            DenialReason::NoAssignedFacility => write!(f, "operator has no assigned facility"),
            DenialReason::NoEncounterAtFacility => write!(f, "patient has no encounter at the operator's facility"),
        }
    }
}

/// Why access was allowed or denied
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "basis", rename_all = "snake_case")]
pub enum AccessBasis {
    SelfAccess,
    EmergencyGrant { grant_id: GrantId, expires_at: DateTime<Utc> },
    FacilityEncounter { facility: String },
    Denied { reason: DenialReason },
}

/// Authorization result with its basis
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessDecision {
    /// Whether access is authorized
    pub authorized: bool,
    pub basis: AccessBasis,
    /// Whether access rests on a break-glass grant
    pub emergency_override: bool,
}

impl AccessDecision {
    fn allow(basis: AccessBasis) -> Self {
        let emergency_override = matches!(basis, AccessBasis::EmergencyGrant { .. });
        Self {
            authorized: true,
            basis,
            emergency_override,
        }
    }

    fn deny(reason: DenialReason) -> Self {
        Self {
            authorized: false,
            basis: AccessBasis::Denied { reason },
            emergency_override: false,
        }
    }

    pub fn reason(&self) -> String {
        match &self.basis {
            AccessBasis::SelfAccess => "patient accessing own records".to_string(),
            AccessBasis::EmergencyGrant { grant_id, .. } => format!("emergency grant {}", grant_id),
            AccessBasis::FacilityEncounter { facility } => format!("encounter at {}", facility),
            AccessBasis::Denied { reason } => reason.to_string(),
        }
    }
}

/// Pure access decision over already-loaded grants.
///
/// `grants` are the actor's grants; only those for `target` that are
/// active at `now` count. The grant expiring last is reported as the basis.
pub fn decide(
    actor: &Actor,
    target: IdentityId,
    now: DateTime<Utc>,
    grants: &[EmergencyGrant],
    membership: &dyn FacilityMembership,
) -> Result<AccessDecision> {
    let decision = match actor.role {
        Role::Patient if actor.identity_id == target => AccessDecision::allow(AccessBasis::SelfAccess),
        Role::Patient => AccessDecision::deny(DenialReason::NotOwnRecord),
        Role::Doctor => grants
            .iter()
            .filter(|g| g.doctor_id == actor.identity_id && g.patient_id == target && g.is_active_at(now))
            .max_by_key(|g| g.expires_at)
            .map(|g| {
                AccessDecision::allow(AccessBasis::EmergencyGrant {
                    grant_id: g.id,
                    expires_at: g.expires_at,
                })
            })
            .unwrap_or_else(|| AccessDecision::deny(DenialReason::NoActiveGrant)),
        Role::Operator => match actor.facility.as_deref() {
            None => AccessDecision::deny(DenialReason::NoAssignedFacility),
            Some(facility) if membership.has_encounter_at(target, facility)? => {
                AccessDecision::allow(AccessBasis::FacilityEncounter {
                    facility: facility.to_string(),
                })
            }
            Some(_) => AccessDecision::deny(DenialReason::NoEncounterAtFacility),
        },
    };
    Ok(decision)
}

/// Access policy backed by the live grant store
pub struct AccessPolicy {
    sessions: Arc<SessionManager>,
    membership: Arc<dyn FacilityMembership>,
    clock: Arc<dyn Clock>,
}

impl AccessPolicy {
    pub fn new(sessions: Arc<SessionManager>, membership: Arc<dyn FacilityMembership>, clock: Arc<dyn Clock>) -> Self {
        Self {
            sessions,
            membership,
            clock,
        }
    }

    pub fn decide(&self, actor: &Actor, target: IdentityId) -> Result<AccessDecision> {
        let grants = match actor.role {
            Role::Doctor => self.sessions.active_grants(actor.identity_id, target)?,
            _ => Vec::new(),
        };
        decide(actor, target, self.clock.now(), &grants, self.membership.as_ref())
    }

    pub fn can_access(&self, actor: &Actor, target: IdentityId) -> Result<bool> {
        Ok(self.decide(actor, target)?.authorized)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::GrantStatus;
    use crate::verifier::VerificationMethod;
    use chrono::Duration;
    use proptest::prelude::*;

    fn actor(role: Role, facility: Option<&str>) -> Actor {
        Actor {
            identity_id: IdentityId::new(),
            role,
            facility: facility.map(str::to_string),
        }
    }

    fn grant(doctor: IdentityId, patient: IdentityId, granted_at: DateTime<Utc>, status: GrantStatus) -> EmergencyGrant {
        EmergencyGrant {
            id: GrantId::new(),
            doctor_id: doctor,
            patient_id: patient,
            reason: "trauma".into(),
            method: VerificationMethod::Otp,
            facility: None,
            granted_at,
            expires_at: granted_at + Duration::minutes(30),
            status,
            revoked_at: None,
        }
    }

    #[test]
    fn test_patient_reads_only_own_records() {
        let roster = EncounterRoster::new();
        let patient = actor(Role::Patient, None);
        let now = Utc::now();
        assert!(decide(&patient, patient.identity_id, now, &[], &roster).unwrap().authorized);
        let other = decide(&patient, IdentityId::new(), now, &[], &roster).unwrap();
        assert_eq!(other.basis, AccessBasis::Denied { reason: DenialReason::NotOwnRecord });
    }

    #[test]
    fn test_doctor_needs_active_grant() {
        let roster = EncounterRoster::new();
        let doctor = actor(Role::Doctor, None);
        let patient = IdentityId::new();
        let now = Utc::now();

        let denied = decide(&doctor, patient, now, &[], &roster).unwrap();
        assert!(!denied.authorized);

        let g = grant(doctor.identity_id, patient, now, GrantStatus::Active);
        let allowed = decide(&doctor, patient, now, std::slice::from_ref(&g), &roster).unwrap();
        assert!(allowed.authorized);
        assert!(allowed.emergency_override);

        let later = now + Duration::minutes(31);
        assert!(!decide(&doctor, patient, later, std::slice::from_ref(&g), &roster).unwrap().authorized);

        let revoked = grant(doctor.identity_id, patient, now, GrantStatus::Revoked);
        assert!(!decide(&doctor, patient, now, &[revoked], &roster).unwrap().authorized);

        let elsewhere = grant(doctor.identity_id, IdentityId::new(), now, GrantStatus::Active);
        assert!(!decide(&doctor, patient, now, &[elsewhere], &roster).unwrap().authorized);
    }

    #[test]
    fn test_operator_limited_to_facility() {
        let roster = EncounterRoster::new();
        let patient = IdentityId::new();
        roster.record_encounter("St. Mary", patient).unwrap();
        let now = Utc::now();

        let local = actor(Role::Operator, Some("St. Mary"));
        assert!(decide(&local, patient, now, &[], &roster).unwrap().authorized);

        let remote = actor(Role::Operator, Some("County General"));
        assert!(!decide(&remote, patient, now, &[], &roster).unwrap().authorized);

        let unassigned = actor(Role::Operator, None);
        let decision = decide(&unassigned, patient, now, &[], &roster).unwrap();
        assert_eq!(decision.basis, AccessBasis::Denied { reason: DenialReason::NoAssignedFacility });
    }

    proptest! {
        #[test]
        fn prop_doctor_allowed_iff_grant_active(minutes in 0i64..120, revoked in any::<bool>()) {
            let roster = EncounterRoster::new();
            let doctor = actor(Role::Doctor, None);
            let patient = IdentityId::new();
            let granted_at = Utc::now();
            let status = if revoked { GrantStatus::Revoked } else { GrantStatus::Active };
            let g = grant(doctor.identity_id, patient, granted_at, status);
            let now = granted_at + Duration::minutes(minutes);

            let decision = decide(&doctor, patient, now, std::slice::from_ref(&g), &roster).unwrap();
            prop_assert_eq!(decision.authorized, g.is_active_at(now));
            prop_assert_eq!(decision.authorized, !revoked && minutes < 30);
        }
    }
}
