//! Sessions and emergency grants
//!
//! Ordinary session: `absent -> ACTIVE -> ENDED` (expiry or logout).
//! Emergency grant: `absent -> ACTIVE -> EXPIRED | REVOKED`, both terminal.
//!
//! Expiry is lazy: a grant past its deadline reads as `Expired` even if the
//! sweeper has not reached it yet. Revocation is the only way to end a grant
//! early.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};

use crate::audit::{AuditAction, AuditDraft, AuditEntry};
use crate::clock::Clock;
use crate::config::AccessConfig;
use crate::error::{AccessError, Result};
use crate::identity::{IdentityId, Role};
use crate::ids::{GrantId, SessionId};
use crate::storage::{IdentityRepository, SessionRepository, Transition};
use crate::token::{SessionToken, TokenClaims, TokenSigner, TokenSubject};
use crate::verifier::VerificationMethod;

/// Upper bound on history listings
pub const MAX_HISTORY_LIMIT: usize = 500;

// ============================================================================
// Records
// ============================================================================

/// Ordinary authenticated session
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub identity_id: IdentityId,
    pub role: Role,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Set on logout
    pub revoked: bool,
    /// When the session ended, by logout or expiry
    pub ended_at: Option<DateTime<Utc>>,
}

impl Session {
    pub fn is_ended(&self) -> bool {
        self.revoked || self.ended_at.is_some()
    }

    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        !self.is_ended() && now < self.expires_at
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GrantStatus {
    Active,
    Expired,
    Revoked,
}

impl std::fmt::Display for GrantStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GrantStatus::Active => write!(f, "ACTIVE"),
            GrantStatus::Expired => write!(f, "EXPIRED"),
            GrantStatus::Revoked => write!(f, "REVOKED"),
        }
    }
}

/// Time-boxed break-glass access of one doctor to one patient
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EmergencyGrant {
    pub id: GrantId,
    pub doctor_id: IdentityId,
    pub patient_id: IdentityId,
    pub reason: String,
    pub method: VerificationMethod,
    pub facility: Option<String>,
    pub granted_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Stored status; see [`EmergencyGrant::status_at`] for the effective one
    pub status: GrantStatus,
    pub revoked_at: Option<DateTime<Utc>>,
}

impl EmergencyGrant {
    /// Effective status at `now`, applying lazy expiry
    pub fn status_at(&self, now: DateTime<Utc>) -> GrantStatus {
        match self.status {
            GrantStatus::Active if now >= self.expires_at => GrantStatus::Expired,
            status => status,
        }
    }

    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.status_at(now) == GrantStatus::Active
    }

    /// Copy with the stored status replaced by the effective one
    fn observed_at(mut self, now: DateTime<Utc>) -> Self {
        self.status = self.status_at(now);
        self
    }
}

// ============================================================================
// Results
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Validity {
    Valid,
    Expired,
    Revoked,
}

/// A token whose signature checked out, with its current standing
#[derive(Clone, Debug, PartialEq)]
pub struct ValidatedToken {
    pub claims: TokenClaims,
    pub validity: Validity,
}

impl ValidatedToken {
    pub fn is_valid(&self) -> bool {
        self.validity == Validity::Valid
    }

    /// The claims, if the token is still usable
    pub fn into_valid(self) -> Result<TokenClaims> {
        match self.validity {
            Validity::Valid => Ok(self.claims),
            Validity::Expired => Err(AccessError::SessionExpired),
            Validity::Revoked => Err(AccessError::SessionRevoked),
        }
    }
}

#[derive(Clone, Debug)]
pub struct IssuedSession {
    pub session: Session,
    pub token: SessionToken,
}

#[derive(Clone, Debug)]
pub struct IssuedGrant {
    pub grant: EmergencyGrant,
    pub token: SessionToken,
    /// The EMERGENCY_ACCESS entry committed with the grant
    pub audit: AuditEntry,
}

/// Emergency access request after the doctor and patient are identified
#[derive(Clone, Debug)]
pub struct GrantRequest {
    pub doctor_id: IdentityId,
    pub patient_id: IdentityId,
    pub reason: String,
    pub method: VerificationMethod,
    pub facility: Option<String>,
}

/// What a token revocation ended
#[derive(Clone, Debug, PartialEq)]
pub enum Revocation {
    Session(Transition<Session>),
    Grant(Transition<EmergencyGrant>),
}

impl Revocation {
    /// Whether this call ended something that was still open
    pub fn changed(&self) -> bool {
        match self {
            Revocation::Session(t) => t.changed,
            Revocation::Grant(t) => t.changed,
        }
    }
}

/// Counts from one eager expiry pass
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpiryCounts {
    pub grants_expired: usize,
    pub sessions_ended: usize,
}

// ============================================================================
// Session manager
// ============================================================================

pub struct SessionManager {
    sessions: Arc<dyn SessionRepository>,
    identities: Arc<dyn IdentityRepository>,
    signer: Arc<TokenSigner>,
    clock: Arc<dyn Clock>,
    session_ttl: Duration,
    grant_window: Duration,
}

impl SessionManager {
    pub fn new(
        sessions: Arc<dyn SessionRepository>,
        identities: Arc<dyn IdentityRepository>,
        signer: Arc<TokenSigner>,
        clock: Arc<dyn Clock>,
        config: &AccessConfig,
    ) -> Self {
        Self {
            sessions,
            identities,
            signer,
            clock,
            session_ttl: config.session_ttl(),
            grant_window: config.grant_window(),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Open an ordinary session for a verified identity
    pub fn create_session(&self, identity_id: IdentityId) -> Result<IssuedSession> {
        let identity = self
            .identities
            .identity(identity_id)?
            .ok_or(AccessError::NotFound("identity"))?;
        let now = self.clock.now();
        let session = Session {
            id: SessionId::new(),
            identity_id,
            role: identity.role(),
            issued_at: now,
            expires_at: now + self.session_ttl,
            revoked: false,
            ended_at: None,
        };
        let claims = TokenClaims::new(
            TokenSubject::Session {
                session_id: session.id,
                identity_id,
            },
            session.role,
            session.issued_at,
            session.expires_at,
        );
        let token = self.signer.sign(&claims)?;
        self.sessions.insert_session(session.clone())?;
        info!(session = %session.id, identity = %identity_id, role = %session.role, "session created");
        Ok(IssuedSession { session, token })
    }

    /// Persist an ACTIVE grant and its EMERGENCY_ACCESS audit entry as one
    /// unit. If the audit entry cannot be written no grant exists.
    pub fn grant_emergency_access(&self, request: GrantRequest) -> Result<IssuedGrant> {
        let reason = request.reason.trim();
        if reason.is_empty() {
            return Err(AccessError::MissingJustification);
        }
        let doctor = self
            .identities
            .identity(request.doctor_id)?
            .ok_or(AccessError::NotFound("doctor"))?;
        if doctor.role() != Role::Doctor {
            return Err(AccessError::Unauthorized(
                "only doctors may request emergency access".into(),
            ));
        }
        match self.identities.identity(request.patient_id)? {
            Some(patient) if patient.role() == Role::Patient => {}
            _ => return Err(AccessError::NotFound("patient")),
        }

        let now = self.clock.now();
        let facility = request
            .facility
            .as_deref()
            .map(str::trim)
            .filter(|f| !f.is_empty())
            .map(str::to_string);
        let grant = EmergencyGrant {
            id: GrantId::new(),
            doctor_id: request.doctor_id,
            patient_id: request.patient_id,
            reason: reason.to_string(),
            method: request.method,
            facility,
            granted_at: now,
            expires_at: now + self.grant_window,
            status: GrantStatus::Active,
            revoked_at: None,
        };
        let claims = TokenClaims::new(
            TokenSubject::Emergency {
                grant_id: grant.id,
                doctor_id: grant.doctor_id,
                patient_id: grant.patient_id,
            },
            Role::Doctor,
            grant.granted_at,
            grant.expires_at,
        );
        let token = self.signer.sign(&claims)?;

        let draft = AuditDraft::new(AuditAction::EmergencyAccess, now)
            .by(grant.doctor_id, Role::Doctor)
            .for_patient(grant.patient_id)
            .with_detail(json!({
                "grant_id": grant.id,
                "reason": grant.reason,
                "method": grant.method,
                "facility": grant.facility,
                "expires_at": grant.expires_at,
            }));
        let audit = self.sessions.commit_grant(grant.clone(), draft)?;
        info!(
            grant = %grant.id,
            doctor = %grant.doctor_id,
            patient = %grant.patient_id,
            method = %grant.method,
            expires_at = %grant.expires_at,
            "emergency access granted"
        );
        Ok(IssuedGrant { grant, token, audit })
    }

    /// Check a token's signature, then its standing against the store.
    ///
    /// Emergency tokens re-read the grant, so a revocation is visible on the
    /// very next validation.
    pub fn validate_token(&self, token: &str) -> Result<ValidatedToken> {
        let claims = self.signer.verify(token)?;
        let now = self.clock.now();
        let validity = match &claims.sub {
            TokenSubject::Session { session_id, .. } => {
                let session = self
                    .sessions
                    .session(*session_id)?
                    .ok_or(AccessError::NotFound("session"))?;
                if session.revoked {
                    Validity::Revoked
                } else if !session.is_active_at(now) || claims.is_expired_at(now) {
                    Validity::Expired
                } else {
                    Validity::Valid
                }
            }
            TokenSubject::Emergency { grant_id, .. } => {
                let grant = self
                    .sessions
                    .grant(*grant_id)?
                    .ok_or(AccessError::NotFound("grant"))?;
                match grant.status_at(now) {
                    GrantStatus::Revoked => Validity::Revoked,
                    GrantStatus::Expired => Validity::Expired,
                    GrantStatus::Active if claims.is_expired_at(now) => Validity::Expired,
                    GrantStatus::Active => Validity::Valid,
                }
            }
        };
        debug!(?validity, role = %claims.role, "token validated");
        Ok(ValidatedToken { claims, validity })
    }

    /// Revoke a grant and write GRANT_REVOKED with it. Revoking a terminal
    /// grant is a no-op and writes nothing.
    pub fn revoke_grant(&self, grant_id: GrantId) -> Result<Transition<EmergencyGrant>> {
        let grant = self
            .sessions
            .grant(grant_id)?
            .ok_or(AccessError::NotFound("grant"))?;
        let now = self.clock.now();
        let draft = AuditDraft::new(AuditAction::GrantRevoked, now)
            .by(grant.doctor_id, Role::Doctor)
            .for_patient(grant.patient_id)
            .with_detail(json!({
                "grant_id": grant.id,
                "granted_at": grant.granted_at,
                "revoked_at": now,
            }));
        let transition = self
            .sessions
            .revoke_grant(grant_id, now, draft)?
            .ok_or(AccessError::NotFound("grant"))?;
        if transition.changed {
            info!(grant = %grant_id, "emergency grant revoked");
        }
        Ok(transition)
    }

    /// Log out and write LOGOUT with it. Ending an ended session is a no-op.
    pub fn end_session(&self, session_id: SessionId) -> Result<Transition<Session>> {
        let session = self
            .sessions
            .session(session_id)?
            .ok_or(AccessError::NotFound("session"))?;
        let now = self.clock.now();
        let mut draft = AuditDraft::new(AuditAction::Logout, now)
            .by(session.identity_id, session.role)
            .with_detail(json!({ "session_id": session.id }));
        if session.role == Role::Patient {
            draft = draft.for_patient(session.identity_id);
        }
        self.close_session(session_id, now, Some(draft))
    }

    /// End a session without an audit entry, for a login that never took
    /// effect because its own entry could not be written
    pub fn discard_session(&self, session_id: SessionId) -> Result<Transition<Session>> {
        self.close_session(session_id, self.clock.now(), None)
    }

    fn close_session(
        &self,
        session_id: SessionId,
        now: DateTime<Utc>,
        audit: Option<AuditDraft>,
    ) -> Result<Transition<Session>> {
        let transition = self
            .sessions
            .end_session(session_id, now, audit)?
            .ok_or(AccessError::NotFound("session"))?;
        if transition.changed {
            info!(session = %session_id, "session ended");
        }
        Ok(transition)
    }

    /// End whatever a correctly signed token names, even if it has expired
    pub fn revoke_token(&self, token: &str) -> Result<(TokenClaims, Revocation)> {
        let claims = self.signer.verify(token)?;
        let revocation = match &claims.sub {
            TokenSubject::Session { session_id, .. } => Revocation::Session(self.end_session(*session_id)?),
            TokenSubject::Emergency { grant_id, .. } => Revocation::Grant(self.revoke_grant(*grant_id)?),
        };
        Ok((claims, revocation))
    }

    /// Active grants of a doctor, newest first
    pub fn list_active_grants_for_doctor(&self, doctor_id: IdentityId) -> Result<Vec<EmergencyGrant>> {
        let now = self.clock.now();
        let mut grants: Vec<EmergencyGrant> = self
            .sessions
            .grants_for_doctor(doctor_id)?
            .into_iter()
            .filter(|grant| grant.is_active_at(now))
            .collect();
        grants.sort_by(|a, b| b.granted_at.cmp(&a.granted_at));
        Ok(grants)
    }

    /// Active grants of a doctor for one patient
    pub fn active_grants(&self, doctor_id: IdentityId, patient_id: IdentityId) -> Result<Vec<EmergencyGrant>> {
        Ok(self
            .list_active_grants_for_doctor(doctor_id)?
            .into_iter()
            .filter(|grant| grant.patient_id == patient_id)
            .collect())
    }

    /// Every grant ever made for a patient, newest first, with effective
    /// status. `limit` is capped at [`MAX_HISTORY_LIMIT`].
    pub fn list_access_history_for_patient(&self, patient_id: IdentityId, limit: usize) -> Result<Vec<EmergencyGrant>> {
        if limit == 0 {
            return Err(AccessError::validation("limit", "must be greater than 0"));
        }
        let now = self.clock.now();
        let mut grants: Vec<EmergencyGrant> = self
            .sessions
            .grants_for_patient(patient_id)?
            .into_iter()
            .map(|grant| grant.observed_at(now))
            .collect();
        grants.sort_by(|a, b| b.granted_at.cmp(&a.granted_at));
        grants.truncate(limit.min(MAX_HISTORY_LIMIT));
        Ok(grants)
    }

    /// Eagerly expire overdue grants and end overdue sessions
    pub fn expire_overdue(&self, now: DateTime<Utc>) -> Result<ExpiryCounts> {
        let grants_expired = self.sessions.expire_overdue_grants(now)?;
        let sessions_ended = self.sessions.end_overdue_sessions(now)?;
        Ok(ExpiryCounts {
            grants_expired,
            sessions_ended,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::ErrorKind;
    use crate::identity::{DoctorProfile, Identity, IdentityDirectory, OperatorProfile, PatientProfile, Profile};
    use crate::storage::{AuditRepository, MemoryStore};

    struct Fixture {
        manager: SessionManager,
        store: Arc<MemoryStore>,
        clock: Arc<ManualClock>,
        doctor: IdentityId,
        patient: IdentityId,
        operator: IdentityId,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let directory = IdentityDirectory::new(store.clone());
        let doctor = directory
            .register(Identity::new("Dr. Okafor", Profile::Doctor(DoctorProfile::default()), clock.now()).with_mobile("+15550001000"))
            .unwrap();
        let patient = directory
            .register(Identity::new("Ana", Profile::Patient(PatientProfile::default()), clock.now()).with_mobile("+15550002000"))
            .unwrap();
        let operator = directory
            .register(
                Identity::new("Desk", Profile::Operator(OperatorProfile { facility: "St. Mary".into() }), clock.now())
                    .with_mobile("+15550003000"),
            )
            .unwrap();
        let manager = SessionManager::new(
            store.clone(),
            store.clone(),
            Arc::new(TokenSigner::ephemeral()),
            clock.clone(),
            &AccessConfig::default(),
        );
        Fixture {
            manager,
            store,
            clock,
            doctor,
            patient,
            operator,
        }
    }

    fn request(f: &Fixture) -> GrantRequest {
        GrantRequest {
            doctor_id: f.doctor,
            patient_id: f.patient,
            reason: "unconscious on arrival".into(),
            method: VerificationMethod::Fingerprint,
            facility: Some("St. Mary".into()),
        }
    }

    #[test]
    fn test_session_lifecycle() {
        let f = fixture();
        let issued = f.manager.create_session(f.patient).unwrap();
        let validated = f.manager.validate_token(issued.token.as_str()).unwrap();
        assert!(validated.is_valid());
        assert_eq!(validated.claims.role, Role::Patient);

        assert!(f.manager.end_session(issued.session.id).unwrap().changed);
        assert!(!f.manager.end_session(issued.session.id).unwrap().changed);
        let validated = f.manager.validate_token(issued.token.as_str()).unwrap();
        assert_eq!(validated.validity, Validity::Revoked);
    }

    #[test]
    fn test_session_expires_after_ttl() {
        let f = fixture();
        let issued = f.manager.create_session(f.operator).unwrap();
        f.clock.advance(Duration::hours(24));
        let err = f.manager.validate_token(issued.token.as_str()).unwrap().into_valid().unwrap_err();
        assert!(matches!(err, AccessError::SessionExpired));
    }

    #[test]
    fn test_create_session_for_unknown_identity() {
        let f = fixture();
        let err = f.manager.create_session(IdentityId::new()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_grant_window_is_thirty_minutes() {
        let f = fixture();
        let issued = f.manager.grant_emergency_access(request(&f)).unwrap();
        assert_eq!(issued.grant.expires_at - issued.grant.granted_at, Duration::minutes(30));
        assert_eq!(issued.grant.status, GrantStatus::Active);
        assert_eq!(issued.audit.action, AuditAction::EmergencyAccess);
        assert_eq!(issued.audit.patient_id, Some(f.patient));

        f.clock.advance(Duration::minutes(29));
        assert!(f.manager.validate_token(issued.token.as_str()).unwrap().is_valid());
        f.clock.advance(Duration::minutes(2));
        let validated = f.manager.validate_token(issued.token.as_str()).unwrap();
        assert_eq!(validated.validity, Validity::Expired);
        assert!(f.manager.list_active_grants_for_doctor(f.doctor).unwrap().is_empty());
    }

    #[test]
    fn test_blank_reason_is_missing_justification() {
        let f = fixture();
        let mut req = request(&f);
        req.reason = "   ".into();
        let err = f.manager.grant_emergency_access(req).unwrap_err();
        assert!(matches!(err, AccessError::MissingJustification));
    }

    #[test]
    fn test_only_doctors_get_grants() {
        let f = fixture();
        let mut req = request(&f);
        req.doctor_id = f.operator;
        assert_eq!(f.manager.grant_emergency_access(req).unwrap_err().kind(), ErrorKind::Unauthorized);

        let mut req = request(&f);
        req.patient_id = f.doctor;
        assert_eq!(f.manager.grant_emergency_access(req).unwrap_err().kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_audit_failure_aborts_grant() {
        let f = fixture();
        f.store.set_audit_unavailable(true);
        let err = f.manager.grant_emergency_access(request(&f)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StorageFailure);
        f.store.set_audit_unavailable(false);
        assert!(f.manager.list_access_history_for_patient(f.patient, 10).unwrap().is_empty());
        assert!(f.store.audit_chain().unwrap().is_empty());
    }

    #[test]
    fn test_revoke_is_idempotent() {
        let f = fixture();
        let issued = f.manager.grant_emergency_access(request(&f)).unwrap();
        assert!(f.manager.revoke_grant(issued.grant.id).unwrap().changed);
        let again = f.manager.revoke_grant(issued.grant.id).unwrap();
        assert!(!again.changed);
        assert_eq!(again.record.status, GrantStatus::Revoked);
        assert!(again.record.revoked_at.is_some());
        let validated = f.manager.validate_token(issued.token.as_str()).unwrap();
        assert_eq!(validated.validity, Validity::Revoked);
    }

    #[test]
    fn test_revoke_waits_for_its_audit_entry() {
        let f = fixture();
        let issued = f.manager.grant_emergency_access(request(&f)).unwrap();

        f.store.set_audit_unavailable(true);
        let err = f.manager.revoke_grant(issued.grant.id).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StorageFailure);
        assert!(f.manager.validate_token(issued.token.as_str()).unwrap().is_valid());
        f.store.set_audit_unavailable(false);

        assert!(f.manager.revoke_grant(issued.grant.id).unwrap().changed);
        assert!(!f.manager.revoke_grant(issued.grant.id).unwrap().changed);
        let revoked: Vec<_> = f
            .store
            .audit_chain()
            .unwrap()
            .into_iter()
            .filter(|e| e.action == AuditAction::GrantRevoked)
            .collect();
        assert_eq!(revoked.len(), 1);
        assert_eq!(revoked[0].actor_id, Some(f.doctor));
        assert_eq!(revoked[0].patient_id, Some(f.patient));
    }

    #[test]
    fn test_logout_waits_for_its_audit_entry() {
        let f = fixture();
        let issued = f.manager.create_session(f.patient).unwrap();

        f.store.set_audit_unavailable(true);
        assert!(f.manager.end_session(issued.session.id).is_err());
        assert!(f.manager.validate_token(issued.token.as_str()).unwrap().is_valid());
        // Undoing a login needs no entry
        assert!(f.manager.discard_session(issued.session.id).unwrap().changed);
        f.store.set_audit_unavailable(false);

        assert!(f.store.audit_chain().unwrap().is_empty());
    }

    #[test]
    fn test_revoke_after_deadline_settles_as_expired() {
        let f = fixture();
        let issued = f.manager.grant_emergency_access(request(&f)).unwrap();
        f.clock.advance(Duration::minutes(31));
        let transition = f.manager.revoke_grant(issued.grant.id).unwrap();
        assert!(!transition.changed);
        assert_eq!(transition.record.status, GrantStatus::Expired);
    }

    #[test]
    fn test_revoke_token_accepts_expired_token() {
        let f = fixture();
        let issued = f.manager.create_session(f.patient).unwrap();
        f.clock.advance(Duration::days(2));
        let (claims, revocation) = f.manager.revoke_token(issued.token.as_str()).unwrap();
        assert_eq!(claims.actor_id(), f.patient);
        assert!(revocation.changed());
    }

    #[test]
    fn test_history_is_newest_first_and_bounded() {
        let f = fixture();
        let first = f.manager.grant_emergency_access(request(&f)).unwrap();
        f.clock.advance(Duration::minutes(5));
        let second = f.manager.grant_emergency_access(request(&f)).unwrap();
        f.manager.revoke_grant(first.grant.id).unwrap();

        let history = f.manager.list_access_history_for_patient(f.patient, 10).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].id, second.grant.id);
        assert_eq!(history[1].status, GrantStatus::Revoked);

        assert_eq!(f.manager.list_access_history_for_patient(f.patient, 1).unwrap().len(), 1);
        let active = f.manager.list_active_grants_for_doctor(f.doctor).unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, second.grant.id);
    }

    #[test]
    fn test_expire_overdue() {
        let f = fixture();
        f.manager.grant_emergency_access(request(&f)).unwrap();
        f.manager.create_session(f.patient).unwrap();
        f.clock.advance(Duration::hours(25));
        let counts = f.manager.expire_overdue(f.clock.now()).unwrap();
        assert_eq!(counts, ExpiryCounts { grants_expired: 1, sessions_ended: 1 });
        assert_eq!(f.manager.expire_overdue(f.clock.now()).unwrap(), ExpiryCounts::default());
    }
}
