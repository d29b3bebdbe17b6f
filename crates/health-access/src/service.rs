//! Access service
//!
//! The inbound boundary of the access core. It wires the components
//! together and owns one rule the components cannot enforce alone: every
//! security-relevant decision leaves exactly one audit entry, whether it
//! succeeded or not.
//!
//! | operation                  | success entry                  | failure entry             |
//! |----------------------------|--------------------------------|---------------------------|
//! | `request_challenge`        | CHALLENGE_ISSUED               | none (nothing issued)     |
//! | `verify_challenge`         | LOGIN / OPERATOR_LOGIN / REGISTRATION_VERIFIED | LOGIN_FAILED |
//! | `verify_biometric`         | LOGIN                          | LOGIN_FAILED              |
//! | `request_emergency_access` | EMERGENCY_ACCESS (with grant)  | EMERGENCY_ACCESS_DENIED   |
//! | `revoke_session`           | LOGOUT / GRANT_REVOKED         | none (no-op)              |
//! | `authorize_access`         | RECORD_ACCESSED                | ACCESS_DENIED             |
//!
//! Where a success changes stored state, the change and its entry are
//! committed as one unit, so an audit outage leaves the state untouched and
//! the call fails. A login whose entry cannot be written has its fresh
//! session discarded.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::audit::{AuditAction, AuditDraft, AuditEntry, AuditQuery, AuditTrail};
use crate::challenge::{ChallengePurpose, ChallengeStore, IssuedChallenge};
use crate::clock::{Clock, SystemClock};
use crate::config::AccessConfig;
use crate::error::{AccessError, ErrorKind, Result};
use crate::identity::{mask_identifier, normalize_identifier, BiometricKind, Identity, IdentityDirectory, IdentityId, Role};
use crate::policy::{AccessDecision, AccessPolicy, Actor, EncounterRoster, FacilityMembership};
use crate::session::{GrantRequest, IssuedGrant, IssuedSession, Revocation, SessionManager};
use crate::storage::{AuditRepository, ChallengeRepository, IdentityRepository, MemoryStore, Retrying, SessionRepository};
use crate::sweeper::ExpirySweeper;
use crate::token::{TokenClaims, TokenSigner, TokenSubject};
use crate::verifier::{BiometricMatcher, Credential, CredentialVerifier, TemplateMatcher, VerificationMethod};

/// Repositories backing the service
#[derive(Clone)]
pub struct Repositories {
    pub identities: Arc<dyn IdentityRepository>,
    pub challenges: Arc<dyn ChallengeRepository>,
    pub sessions: Arc<dyn SessionRepository>,
    pub audit: Arc<dyn AuditRepository>,
}

impl Repositories {
    /// Use one backend for every repository
    pub fn shared<S>(store: Arc<S>) -> Self
    where
        S: IdentityRepository + ChallengeRepository + SessionRepository + AuditRepository + 'static,
    {
        Self {
            identities: store.clone(),
            challenges: store.clone(),
            sessions: store.clone(),
            audit: store,
        }
    }
}

/// Outcome of a successful `verify_challenge`
#[derive(Clone, Debug)]
pub enum Verified {
    /// A registration code was confirmed for this (normalised) identifier
    Registration { identifier: String },
    /// A login code opened a session
    Session(IssuedSession),
}

/// Break-glass request as it arrives from a doctor
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EmergencyAccessRequest {
    /// Mobile number the doctor is registered under
    pub doctor_mobile: String,
    /// Patient's mobile or email; absent for an unidentified patient
    pub patient_identifier: Option<String>,
    pub reason: String,
    pub facility: Option<String>,
    /// OTP sent to the patient identifier, or a biometric sample
    pub credential: Credential,
}

pub struct AccessService {
    config: AccessConfig,
    clock: Arc<dyn Clock>,
    identities: Arc<IdentityDirectory>,
    challenges: Arc<ChallengeStore>,
    verifier: Arc<CredentialVerifier>,
    sessions: Arc<SessionManager>,
    policy: Arc<AccessPolicy>,
    audit: Arc<AuditTrail>,
}

impl AccessService {
    pub fn new(
        config: AccessConfig,
        repos: Repositories,
        membership: Arc<dyn FacilityMembership>,
        matcher: Arc<dyn BiometricMatcher>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        let signer = Arc::new(TokenSigner::from_config(&config)?);
        let challenges = Arc::new(ChallengeStore::new(repos.challenges, clock.clone(), &config));
        let verifier = Arc::new(CredentialVerifier::new(
            challenges.clone(),
            repos.identities.clone(),
            matcher,
        ));
        let sessions = Arc::new(SessionManager::new(
            repos.sessions,
            repos.identities.clone(),
            signer,
            clock.clone(),
            &config,
        ));
        let policy = Arc::new(AccessPolicy::new(sessions.clone(), membership, clock.clone()));
        Ok(Self {
            identities: Arc::new(IdentityDirectory::new(repos.identities)),
            audit: Arc::new(AuditTrail::new(repos.audit)),
            config,
            clock,
            challenges,
            verifier,
            sessions,
            policy,
        })
    }

    /// Service over a fresh in-memory store behind the configured retry
    /// policy, with the template matcher and an in-memory encounter roster
    pub fn in_memory(config: AccessConfig) -> Result<(Self, Arc<EncounterRoster>)> {
        let store = Arc::new(Retrying::new(MemoryStore::new(), config.retry.clone()));
        let roster = Arc::new(EncounterRoster::new());
        let matcher = Arc::new(TemplateMatcher::new(config.biometric_threshold));
        let service = Self::new(
            config,
            Repositories::shared(store),
            roster.clone(),
            matcher,
            Arc::new(SystemClock),
        )?;
        Ok((service, roster))
    }

    pub fn config(&self) -> &AccessConfig {
        &self.config
    }

    pub fn identities(&self) -> &IdentityDirectory {
        &self.identities
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn policy(&self) -> &AccessPolicy {
        &self.policy
    }

    pub fn audit(&self) -> &AuditTrail {
        &self.audit
    }

    /// Sweeper over this service's sessions and challenges
    pub fn sweeper(&self) -> ExpirySweeper {
        ExpirySweeper::new(self.sessions.clone(), self.challenges.clone(), self.clock.clone())
    }

    fn draft(&self, action: AuditAction) -> AuditDraft {
        AuditDraft::new(action, self.clock.now())
    }

    /// Record a failed decision. The caller is already failing, so an audit
    /// outage here is logged and the original error is returned.
    fn audit_failure(&self, draft: AuditDraft, err: AccessError) -> AccessError {
        if let Err(audit_err) = self.audit.append(draft) {
            warn!(error = %audit_err, original = %err, "could not audit failed decision");
        }
        err
    }

    fn failure_detail(err: &AccessError, mut detail: Value) -> Value {
        if let Value::Object(map) = &mut detail {
            map.insert("error".into(), json!(err.kind()));
            map.insert("message".into(), json!(err.public_message()));
        }
        detail
    }

    // ========================================================================
    // Verification
    // ========================================================================

    /// Issue a one-time code for delivery to the identifier
    pub fn request_challenge(&self, identifier: &str, purpose: ChallengePurpose) -> Result<IssuedChallenge> {
        let recipient = self
            .identities
            .resolve(identifier)?
            .map(|identity| (identity.id, identity.role()));
        self.challenges.issue_to(identifier, purpose, recipient)
    }

    /// Redeem a login or registration code
    pub fn verify_challenge(&self, identifier: &str, code: &str, purpose: ChallengePurpose) -> Result<Verified> {
        let masked = mask_identifier(&normalize_identifier(identifier)?);
        let outcome = match purpose {
            ChallengePurpose::Registration => {
                let draft = self
                    .draft(AuditAction::RegistrationVerified)
                    .with_detail(json!({ "identifier": &masked }));
                self.challenges
                    .redeem_recorded(identifier, code, purpose, draft)
                    .map(|challenge| Verified::Registration {
                        identifier: challenge.key.identifier,
                    })
            }
            ChallengePurpose::Login => self
                .verifier
                .verify_code(identifier, code, purpose)
                .and_then(|identity_id| self.sessions.create_session(identity_id))
                .map(Verified::Session),
            ChallengePurpose::EmergencyAccess => {
                return Err(AccessError::validation(
                    "purpose",
                    "emergency codes are redeemed by an emergency access request",
                ))
            }
        };

        match outcome {
            Ok(Verified::Registration { identifier }) => {
                info!(identifier = %masked, "registration code verified");
                Ok(Verified::Registration { identifier })
            }
            Ok(Verified::Session(issued)) => {
                self.audit_login(&issued, VerificationMethod::Otp)?;
                Ok(Verified::Session(issued))
            }
            Err(err) => {
                let detail = Self::failure_detail(
                    &err,
                    json!({ "identifier": masked, "purpose": purpose, "method": VerificationMethod::Otp }),
                );
                Err(self.audit_failure(self.draft(AuditAction::LoginFailed).with_detail(detail), err))
            }
        }
    }

    /// Log in with a biometric sample
    pub fn verify_biometric(&self, identifier: &str, kind: BiometricKind, sample: &[u8]) -> Result<IssuedSession> {
        let masked = mask_identifier(&normalize_identifier(identifier)?);
        let method = VerificationMethod::from(kind);
        let outcome = self
            .verifier
            .verify_biometric(identifier, kind, sample)
            .and_then(|identity_id| self.sessions.create_session(identity_id));
        match outcome {
            Ok(issued) => {
                self.audit_login(&issued, method)?;
                Ok(issued)
            }
            Err(err) => {
                let detail = Self::failure_detail(&err, json!({ "identifier": masked, "method": method }));
                Err(self.audit_failure(self.draft(AuditAction::LoginFailed).with_detail(detail), err))
            }
        }
    }

    /// Audit a fresh session; if that fails the session is discarded
    fn audit_login(&self, issued: &IssuedSession, method: VerificationMethod) -> Result<()> {
        let session = &issued.session;
        let action = match session.role {
            Role::Operator => AuditAction::OperatorLogin,
            _ => AuditAction::Login,
        };
        let mut draft = self
            .draft(action)
            .by(session.identity_id, session.role)
            .with_detail(json!({ "session_id": session.id, "method": method }));
        if session.role == Role::Patient {
            draft = draft.for_patient(session.identity_id);
        }
        if let Err(err) = self.audit.append(draft) {
            if let Err(end_err) = self.sessions.discard_session(session.id) {
                warn!(session = %session.id, error = %end_err, "could not end unaudited session");
            }
            return Err(err);
        }
        info!(session = %session.id, identity = %session.identity_id, %method, "login succeeded");
        Ok(())
    }

    // ========================================================================
    // Emergency access
    // ========================================================================

    /// Break-glass: verify the doctor and the patient proof, then grant
    pub fn request_emergency_access(&self, request: EmergencyAccessRequest) -> Result<IssuedGrant> {
        let method = request.credential.method();
        let doctor = match self.identities.resolve(&request.doctor_mobile) {
            Ok(identity) => identity.filter(|identity| identity.role() == Role::Doctor),
            Err(err) if err.kind() == ErrorKind::ValidationError => None,
            Err(err) => return Err(err),
        };
        let mut patient_id = None;

        match self.grant_for(&request, doctor.as_ref(), &mut patient_id) {
            Ok(issued) => Ok(issued),
            Err(err) => {
                let mut draft = self.draft(AuditAction::EmergencyAccessDenied).with_detail(Self::failure_detail(
                    &err,
                    json!({
                        "doctor": mask_identifier(request.doctor_mobile.trim()),
                        "method": method,
                        "reason": request.reason.trim(),
                        "facility": request.facility,
                        "patient_identified": patient_id.is_some(),
                    }),
                ));
                if let Some(doctor) = &doctor {
                    draft = draft.by(doctor.id, Role::Doctor);
                }
                if let Some(patient) = patient_id {
                    draft = draft.for_patient(patient);
                }
                warn!(%method, error = %err, "emergency access denied");
                Err(self.audit_failure(draft, err))
            }
        }
    }

    /// The checks behind an emergency request. `patient_id` is filled in as
    /// soon as the patient proof verifies, so a later denial can name them.
    fn grant_for(
        &self,
        request: &EmergencyAccessRequest,
        doctor: Option<&Identity>,
        patient_id: &mut Option<IdentityId>,
    ) -> Result<IssuedGrant> {
        let doctor = doctor.ok_or_else(|| AccessError::Unauthorized("doctor not recognised".into()))?;
        if request.reason.trim().is_empty() {
            return Err(AccessError::MissingJustification);
        }
        let patient = self.verifier.verify(
            request.patient_identifier.as_deref(),
            ChallengePurpose::EmergencyAccess,
            &request.credential,
        )?;
        *patient_id = Some(patient);
        self.sessions.grant_emergency_access(GrantRequest {
            doctor_id: doctor.id,
            patient_id: patient,
            reason: request.reason.clone(),
            method: request.credential.method(),
            facility: request.facility.clone(),
        })
    }

    // ========================================================================
    // Sessions
    // ========================================================================

    /// Claims of a token that is signed, unexpired and not revoked
    pub fn validate_session(&self, token: &str) -> Result<TokenClaims> {
        self.sessions.validate_token(token)?.into_valid()
    }

    /// Log out or revoke an emergency grant. The LOGOUT or GRANT_REVOKED
    /// entry is committed with the revocation; repeating it is a no-op.
    pub fn revoke_session(&self, token: &str) -> Result<Revocation> {
        let (claims, revocation) = self.sessions.revoke_token(token)?;
        if revocation.changed() {
            info!(actor = %claims.actor_id(), "token revoked");
        }
        Ok(revocation)
    }

    fn actor_for(&self, claims: &TokenClaims) -> Result<Actor> {
        let actor = match &claims.sub {
            TokenSubject::Emergency { doctor_id, .. } => Actor {
                identity_id: *doctor_id,
                role: Role::Doctor,
                facility: None,
            },
            TokenSubject::Session { identity_id, .. } => {
                let identity = self
                    .identities
                    .get(*identity_id)?
                    .ok_or(AccessError::NotFound("identity"))?;
                Actor {
                    identity_id: identity.id,
                    role: identity.role(),
                    facility: identity.assigned_facility().map(str::to_string),
                }
            }
        };
        Ok(actor)
    }

    // ========================================================================
    // Data access
    // ========================================================================

    /// Decide whether the token holder may read a patient's records.
    ///
    /// A denial is returned as a decision, not an error; errors mean the
    /// token itself is unusable.
    pub fn authorize_access(&self, token: &str, patient_id: IdentityId) -> Result<AccessDecision> {
        let validated = self.sessions.validate_token(token)?;
        let actor_id = validated.claims.actor_id();
        let actor_role = validated.claims.role;
        let claims = match validated.into_valid() {
            Ok(claims) => claims,
            Err(err) => {
                let draft = self
                    .draft(AuditAction::AccessDenied)
                    .by(actor_id, actor_role)
                    .for_patient(patient_id)
                    .with_detail(Self::failure_detail(&err, json!({})));
                return Err(self.audit_failure(draft, err));
            }
        };
        let actor = self.actor_for(&claims)?;
        let decision = self.policy.decide(&actor, patient_id)?;
        let action = if decision.authorized {
            AuditAction::RecordAccessed
        } else {
            AuditAction::AccessDenied
        };
        self.audit.append(
            self.draft(action)
                .by(actor.identity_id, actor.role)
                .for_patient(patient_id)
                .with_detail(json!({
                    "basis": decision.basis,
                    "emergency_override": decision.emergency_override,
                })),
        )?;
        Ok(decision)
    }

    /// Let a collaborating service record an event about a patient
    pub fn record_event(&self, token: &str, patient_id: IdentityId, action: AuditAction, detail: Value) -> Result<AuditEntry> {
        if !matches!(action, AuditAction::EncounterCreated | AuditAction::DocumentUploaded) {
            return Err(AccessError::validation(
                "action",
                "only encounter and document events can be recorded",
            ));
        }
        let claims = self.validate_session(token)?;
        self.audit.append(
            self.draft(action)
                .by(claims.actor_id(), claims.role)
                .for_patient(patient_id)
                .with_detail(detail),
        )
    }

    // ========================================================================
    // Audit
    // ========================================================================

    pub fn query_audit(&self, query: &AuditQuery) -> Result<Vec<AuditEntry>> {
        self.audit.query(query)
    }

    pub fn export_audit_csv(&self, patient_id: IdentityId) -> Result<Vec<u8>> {
        self.audit.export_csv(patient_id)
    }
}
