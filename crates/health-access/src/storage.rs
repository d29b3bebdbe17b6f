//! Storage layer
//!
//! Each owning component talks to its own repository trait:
//! - [`IdentityRepository`]: identities and biometric enrolment
//! - [`ChallengeRepository`]: one-time-code challenges
//! - [`SessionRepository`]: ordinary sessions and emergency grants
//! - [`AuditRepository`]: the append-only, hash-chained audit trail
//!
//! [`MemoryStore`] implements all four behind `std::sync` locks. A state
//! change that carries an audit entry is applied only once the entry is
//! sealed, and the owning lock (challenges, sessions or grants) is always
//! taken before the audit lock.
//!
//! [`Retrying`] wraps any backend with a [`RetryPolicy`], so transient
//! [`StorageError::Busy`] conditions are retried in one place instead of in
//! every caller. A backend must only report `Busy` when nothing was applied.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};

use crate::audit::{AuditDraft, AuditEntry, AuditQuery, GENESIS_HASH};
use crate::challenge::{ChallengeKey, ChallengeRecord, ChallengeState};
use crate::config::RetryPolicy;
use crate::error::StorageError;
use crate::identity::{BiometricKind, Identity, IdentityId};
use crate::ids::{ChallengeId, GrantId, SessionId};
use crate::session::{EmergencyGrant, GrantStatus, Session};

pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Outcome of a state transition on a stored record
#[derive(Clone, Debug, PartialEq)]
pub struct Transition<T> {
    /// The record after the call
    pub record: T,
    /// Whether this call changed the record
    pub changed: bool,
}

/// Outcome of an atomic step against a stored challenge
#[derive(Clone, Debug, PartialEq)]
pub enum ChallengeUpdate {
    /// The step was applied. `attempts` is the failed-attempt count after
    /// it, `audit` the entry sealed with it.
    Applied { attempts: u32, audit: Option<AuditEntry> },
    /// Consumed, superseded or gone
    NotOutstanding,
    Expired,
    /// The attempt budget is spent
    Locked,
}

// ============================================================================
// Repository traits
// ============================================================================

pub trait IdentityRepository: Send + Sync {
    /// Insert a new identity. Fails with `Duplicate` if the id, mobile or
    /// email is already taken.
    fn insert_identity(&self, identity: Identity) -> StorageResult<()>;

    fn identity(&self, id: IdentityId) -> StorageResult<Option<Identity>>;

    /// Look up by normalised mobile number or email
    fn identity_by_contact(&self, identifier: &str) -> StorageResult<Option<Identity>>;

    /// Replace an existing identity; returns false if it does not exist
    fn update_identity(&self, identity: Identity) -> StorageResult<bool>;

    /// Patients with a reference of the given kind, in registration order
    fn patients_enrolled_for(&self, kind: BiometricKind) -> StorageResult<Vec<Identity>>;
}

pub trait ChallengeRepository: Send + Sync {
    /// Mark every outstanding challenge for the record's key as superseded,
    /// insert the record and seal its audit entry, as one step. Returns how
    /// many were superseded. If the entry cannot be written nothing changes.
    fn supersede_and_insert(&self, record: ChallengeRecord, audit: AuditDraft) -> StorageResult<(usize, AuditEntry)>;

    /// All retained challenges for a key, newest first
    fn challenges_for(&self, key: &ChallengeKey) -> StorageResult<Vec<ChallengeRecord>>;

    /// Atomically move an outstanding, unexpired challenge with attempts
    /// left to consumed. Exactly one concurrent caller sees `Applied`. A
    /// draft is sealed in the same step; if it cannot be written the
    /// challenge stays outstanding.
    fn mark_consumed(
        &self,
        id: ChallengeId,
        now: DateTime<Utc>,
        max_attempts: u32,
        audit: Option<AuditDraft>,
    ) -> StorageResult<ChallengeUpdate>;

    /// Count a failed attempt against an outstanding, unexpired challenge.
    /// Refused with `Locked` once `max_attempts` failures are recorded.
    fn record_failed_attempt(&self, id: ChallengeId, now: DateTime<Utc>, max_attempts: u32)
        -> StorageResult<ChallengeUpdate>;

    /// Remove every challenge with `expires_at <= now`
    fn purge_expired_challenges(&self, now: DateTime<Utc>) -> StorageResult<usize>;
}

pub trait SessionRepository: Send + Sync {
    fn insert_session(&self, session: Session) -> StorageResult<()>;

    fn session(&self, id: SessionId) -> StorageResult<Option<Session>>;

    /// Revoke (log out) a session. Ending an ended session is a no-op. A
    /// draft is sealed only when this call ends the session, and the session
    /// stays open if it cannot be written.
    fn end_session(
        &self,
        id: SessionId,
        now: DateTime<Utc>,
        audit: Option<AuditDraft>,
    ) -> StorageResult<Option<Transition<Session>>>;

    /// End every open session with `expires_at <= now`
    fn end_overdue_sessions(&self, now: DateTime<Utc>) -> StorageResult<usize>;

    /// Persist a new grant together with its audit entry. Either both are
    /// stored or neither is.
    fn commit_grant(&self, grant: EmergencyGrant, audit: AuditDraft) -> StorageResult<AuditEntry>;

    fn grant(&self, id: GrantId) -> StorageResult<Option<EmergencyGrant>>;

    fn grants_for_doctor(&self, doctor_id: IdentityId) -> StorageResult<Vec<EmergencyGrant>>;

    fn grants_for_patient(&self, patient_id: IdentityId) -> StorageResult<Vec<EmergencyGrant>>;

    /// Revoke an active grant and seal its audit entry as one step. An
    /// active grant already past its deadline becomes `Expired` instead and
    /// terminal grants are left untouched; neither writes the entry.
    fn revoke_grant(
        &self,
        id: GrantId,
        now: DateTime<Utc>,
        audit: AuditDraft,
    ) -> StorageResult<Option<Transition<EmergencyGrant>>>;

    /// Mark every active grant with `expires_at <= now` expired
    fn expire_overdue_grants(&self, now: DateTime<Utc>) -> StorageResult<usize>;
}

pub trait AuditRepository: Send + Sync {
    /// Seal the draft onto the end of the chain
    fn append_audit(&self, draft: AuditDraft) -> StorageResult<AuditEntry>;

    /// Matching entries, newest first, paged by the query
    fn query_audit(&self, query: &AuditQuery) -> StorageResult<Vec<AuditEntry>>;

    /// The whole chain in sequence order
    fn audit_chain(&self) -> StorageResult<Vec<AuditEntry>>;
}

// ============================================================================
// In-memory backend
// ============================================================================

fn poisoned(what: &str) -> StorageError {
    StorageError::Unavailable(format!("{} lock poisoned", what))
}

fn read<'a, T>(lock: &'a RwLock<T>, what: &str) -> StorageResult<RwLockReadGuard<'a, T>> {
    lock.read().map_err(|_| poisoned(what))
}

fn write<'a, T>(lock: &'a RwLock<T>, what: &str) -> StorageResult<RwLockWriteGuard<'a, T>> {
    lock.write().map_err(|_| poisoned(what))
}

fn lock<'a, T>(lock: &'a Mutex<T>, what: &str) -> StorageResult<MutexGuard<'a, T>> {
    lock.lock().map_err(|_| poisoned(what))
}

/// In-memory backend for all repositories.
///
/// Also carries two fault switches used by tests: a budget of `Busy`
/// failures to hand out, and a flag that makes audit writes fail.
#[derive(Debug, Default)]
pub struct MemoryStore {
    identities: RwLock<HashMap<IdentityId, Identity>>,
    challenges: Mutex<HashMap<ChallengeKey, Vec<ChallengeRecord>>>,
    sessions: RwLock<HashMap<SessionId, Session>>,
    grants: RwLock<HashMap<GrantId, EmergencyGrant>>,
    audit: RwLock<Vec<AuditEntry>>,
    busy_budget: AtomicU32,
    audit_unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` operations with `StorageError::Busy`
    pub fn inject_busy(&self, count: u32) {
        self.busy_budget.store(count, Ordering::SeqCst);
    }

    /// Make every audit write fail with `StorageError::Unavailable`
    pub fn set_audit_unavailable(&self, unavailable: bool) {
        self.audit_unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_busy(&self) -> StorageResult<()> {
        let took = self
            .busy_budget
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if took {
            return Err(StorageError::Busy("injected contention".into()));
        }
        Ok(())
    }

    fn check_audit_writable(&self) -> StorageResult<()> {
        if self.audit_unavailable.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("audit store offline".into()));
        }
        Ok(())
    }

    /// Seal a draft onto the chain, failing if the audit store is offline
    fn seal(&self, draft: AuditDraft) -> StorageResult<AuditEntry> {
        self.check_audit_writable()?;
        let mut chain = write(&self.audit, "audit")?;
        Ok(Self::seal_onto(&mut chain, draft))
    }

    /// Why a challenge cannot be acted on, if it cannot
    fn challenge_refusal(record: &ChallengeRecord, now: DateTime<Utc>, max_attempts: u32) -> Option<ChallengeUpdate> {
        if record.state != ChallengeState::Outstanding {
            Some(ChallengeUpdate::NotOutstanding)
        } else if record.is_expired_at(now) {
            Some(ChallengeUpdate::Expired)
        } else if record.attempts >= max_attempts {
            Some(ChallengeUpdate::Locked)
        } else {
            None
        }
    }

    fn seal_onto(chain: &mut Vec<AuditEntry>, draft: AuditDraft) -> AuditEntry {
        let (sequence, prev_hash) = match chain.last() {
            Some(last) => (last.sequence + 1, last.entry_hash.clone()),
            None => (1, GENESIS_HASH.to_string()),
        };
        let entry = draft.seal(sequence, prev_hash);
        chain.push(entry.clone());
        entry
    }
}

impl IdentityRepository for MemoryStore {
    fn insert_identity(&self, identity: Identity) -> StorageResult<()> {
        self.check_busy()?;
        let mut identities = write(&self.identities, "identities")?;
        if identities.contains_key(&identity.id) {
            return Err(StorageError::Duplicate(format!("identity {}", identity.id)));
        }
        let taken = identities.values().any(|existing| {
            [&identity.mobile, &identity.email]
                .into_iter()
                .flatten()
                .any(|contact| existing.matches_identifier(contact))
        });
        if taken {
            return Err(StorageError::Duplicate("contact already registered".into()));
        }
        identities.insert(identity.id, identity);
        Ok(())
    }

    fn identity(&self, id: IdentityId) -> StorageResult<Option<Identity>> {
        self.check_busy()?;
        Ok(read(&self.identities, "identities")?.get(&id).cloned())
    }

    fn identity_by_contact(&self, identifier: &str) -> StorageResult<Option<Identity>> {
        self.check_busy()?;
        Ok(read(&self.identities, "identities")?
            .values()
            .find(|identity| identity.matches_identifier(identifier))
            .cloned())
    }

    fn update_identity(&self, identity: Identity) -> StorageResult<bool> {
        self.check_busy()?;
        let mut identities = write(&self.identities, "identities")?;
        match identities.get_mut(&identity.id) {
            Some(slot) => {
                *slot = identity;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn patients_enrolled_for(&self, kind: BiometricKind) -> StorageResult<Vec<Identity>> {
        self.check_busy()?;
        let mut patients: Vec<Identity> = read(&self.identities, "identities")?
            .values()
            .filter(|identity| identity.biometric_reference(kind).is_some())
            .cloned()
            .collect();
        patients.sort_by_key(|identity| identity.created_at);
        Ok(patients)
    }
}

impl ChallengeRepository for MemoryStore {
    fn supersede_and_insert(&self, record: ChallengeRecord, audit: AuditDraft) -> StorageResult<(usize, AuditEntry)> {
        self.check_busy()?;
        let mut challenges = lock(&self.challenges, "challenges")?;
        let entry = self.seal(audit)?;
        let slot = challenges.entry(record.key.clone()).or_default();
        let mut superseded = 0;
        for prior in slot.iter_mut() {
            if prior.state == ChallengeState::Outstanding {
                prior.state = ChallengeState::Superseded;
                superseded += 1;
            }
        }
        slot.push(record);
        Ok((superseded, entry))
    }

    fn challenges_for(&self, key: &ChallengeKey) -> StorageResult<Vec<ChallengeRecord>> {
        self.check_busy()?;
        let challenges = lock(&self.challenges, "challenges")?;
        Ok(challenges
            .get(key)
            .map(|slot| slot.iter().rev().cloned().collect())
            .unwrap_or_default())
    }

    fn mark_consumed(
        &self,
        id: ChallengeId,
        now: DateTime<Utc>,
        max_attempts: u32,
        audit: Option<AuditDraft>,
    ) -> StorageResult<ChallengeUpdate> {
        self.check_busy()?;
        let mut challenges = lock(&self.challenges, "challenges")?;
        let Some(record) = challenges.values_mut().flatten().find(|r| r.id == id) else {
            return Ok(ChallengeUpdate::NotOutstanding);
        };
        if let Some(refusal) = Self::challenge_refusal(record, now, max_attempts) {
            return Ok(refusal);
        }
        let audit = audit.map(|draft| self.seal(draft)).transpose()?;
        record.state = ChallengeState::Consumed;
        record.consumed_at = Some(now);
        Ok(ChallengeUpdate::Applied {
            attempts: record.attempts,
            audit,
        })
    }

    fn record_failed_attempt(
        &self,
        id: ChallengeId,
        now: DateTime<Utc>,
        max_attempts: u32,
    ) -> StorageResult<ChallengeUpdate> {
        self.check_busy()?;
        let mut challenges = lock(&self.challenges, "challenges")?;
        let Some(record) = challenges.values_mut().flatten().find(|r| r.id == id) else {
            return Ok(ChallengeUpdate::NotOutstanding);
        };
        if let Some(refusal) = Self::challenge_refusal(record, now, max_attempts) {
            return Ok(refusal);
        }
        record.attempts = record.attempts.saturating_add(1);
        Ok(ChallengeUpdate::Applied {
            attempts: record.attempts,
            audit: None,
        })
    }

    fn purge_expired_challenges(&self, now: DateTime<Utc>) -> StorageResult<usize> {
        self.check_busy()?;
        let mut challenges = lock(&self.challenges, "challenges")?;
        let mut purged = 0;
        challenges.retain(|_, slot| {
            let before = slot.len();
            slot.retain(|record| record.expires_at > now);
            purged += before - slot.len();
            !slot.is_empty()
        });
        Ok(purged)
    }
}

impl SessionRepository for MemoryStore {
    fn insert_session(&self, session: Session) -> StorageResult<()> {
        self.check_busy()?;
        let mut sessions = write(&self.sessions, "sessions")?;
        if sessions.contains_key(&session.id) {
            return Err(StorageError::Duplicate(format!("session {}", session.id)));
        }
        sessions.insert(session.id, session);
        Ok(())
    }

    fn session(&self, id: SessionId) -> StorageResult<Option<Session>> {
        self.check_busy()?;
        Ok(read(&self.sessions, "sessions")?.get(&id).cloned())
    }

    fn end_session(
        &self,
        id: SessionId,
        now: DateTime<Utc>,
        audit: Option<AuditDraft>,
    ) -> StorageResult<Option<Transition<Session>>> {
        self.check_busy()?;
        let mut sessions = write(&self.sessions, "sessions")?;
        let Some(session) = sessions.get_mut(&id) else {
            return Ok(None);
        };
        let changed = !session.is_ended();
        if changed {
            if let Some(draft) = audit {
                self.seal(draft)?;
            }
            session.revoked = true;
            session.ended_at = Some(now);
        }
        Ok(Some(Transition {
            record: session.clone(),
            changed,
        }))
    }

    fn end_overdue_sessions(&self, now: DateTime<Utc>) -> StorageResult<usize> {
        self.check_busy()?;
        let mut sessions = write(&self.sessions, "sessions")?;
        let mut ended = 0;
        for session in sessions.values_mut() {
            if !session.is_ended() && session.expires_at <= now {
                session.ended_at = Some(session.expires_at);
                ended += 1;
            }
        }
        Ok(ended)
    }

    fn commit_grant(&self, grant: EmergencyGrant, audit: AuditDraft) -> StorageResult<AuditEntry> {
        self.check_busy()?;
        let mut grants = write(&self.grants, "grants")?;
        if grants.contains_key(&grant.id) {
            return Err(StorageError::Duplicate(format!("grant {}", grant.id)));
        }
        let entry = self.seal(audit)?;
        grants.insert(grant.id, grant);
        Ok(entry)
    }

    fn grant(&self, id: GrantId) -> StorageResult<Option<EmergencyGrant>> {
        self.check_busy()?;
        Ok(read(&self.grants, "grants")?.get(&id).cloned())
    }

    fn grants_for_doctor(&self, doctor_id: IdentityId) -> StorageResult<Vec<EmergencyGrant>> {
        self.check_busy()?;
        Ok(read(&self.grants, "grants")?
            .values()
            .filter(|grant| grant.doctor_id == doctor_id)
            .cloned()
            .collect())
    }

    fn grants_for_patient(&self, patient_id: IdentityId) -> StorageResult<Vec<EmergencyGrant>> {
        self.check_busy()?;
        Ok(read(&self.grants, "grants")?
            .values()
            .filter(|grant| grant.patient_id == patient_id)
            .cloned()
            .collect())
    }

    fn revoke_grant(
        &self,
        id: GrantId,
        now: DateTime<Utc>,
        audit: AuditDraft,
    ) -> StorageResult<Option<Transition<EmergencyGrant>>> {
        self.check_busy()?;
        let mut grants = write(&self.grants, "grants")?;
        let Some(grant) = grants.get_mut(&id) else {
            return Ok(None);
        };
        let mut changed = false;
        if grant.status == GrantStatus::Active {
            if now < grant.expires_at {
                self.seal(audit)?;
                grant.status = GrantStatus::Revoked;
                grant.revoked_at = Some(now);
                changed = true;
            } else {
                grant.status = GrantStatus::Expired;
            }
        }
        Ok(Some(Transition {
            record: grant.clone(),
            changed,
        }))
    }

    fn expire_overdue_grants(&self, now: DateTime<Utc>) -> StorageResult<usize> {
        self.check_busy()?;
        let mut grants = write(&self.grants, "grants")?;
        let mut expired = 0;
        for grant in grants.values_mut() {
            if grant.status == GrantStatus::Active && grant.expires_at <= now {
                grant.status = GrantStatus::Expired;
                expired += 1;
            }
        }
        Ok(expired)
    }
}

impl AuditRepository for MemoryStore {
    fn append_audit(&self, draft: AuditDraft) -> StorageResult<AuditEntry> {
        self.check_busy()?;
        self.seal(draft)
    }

    fn query_audit(&self, query: &AuditQuery) -> StorageResult<Vec<AuditEntry>> {
        self.check_busy()?;
        let chain = read(&self.audit, "audit")?;
        let mut matching: Vec<AuditEntry> = chain.iter().filter(|e| query.matches(e)).cloned().collect();
        drop(chain);
        matching.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.sequence.cmp(&a.sequence))
        });
        Ok(matching
            .into_iter()
            .skip(query.offset)
            .take(query.effective_limit())
            .collect())
    }

    fn audit_chain(&self) -> StorageResult<Vec<AuditEntry>> {
        self.check_busy()?;
        Ok(read(&self.audit, "audit")?.clone())
    }
}

// ============================================================================
// Retrying client
// ============================================================================

/// Storage client that retries transient failures of the wrapped backend
#[derive(Debug)]
pub struct Retrying<S> {
    inner: S,
    policy: RetryPolicy,
}

impl<S> Retrying<S> {
    pub fn new(inner: S, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    /// Access the wrapped backend
    pub fn inner(&self) -> &S {
        &self.inner
    }
}

impl<S: IdentityRepository> IdentityRepository for Retrying<S> {
    fn insert_identity(&self, identity: Identity) -> StorageResult<()> {
        self.policy.run(|| self.inner.insert_identity(identity.clone()))
    }

    fn identity(&self, id: IdentityId) -> StorageResult<Option<Identity>> {
        self.policy.run(|| self.inner.identity(id))
    }

    fn identity_by_contact(&self, identifier: &str) -> StorageResult<Option<Identity>> {
        self.policy.run(|| self.inner.identity_by_contact(identifier))
    }

    fn update_identity(&self, identity: Identity) -> StorageResult<bool> {
        self.policy.run(|| self.inner.update_identity(identity.clone()))
    }

    fn patients_enrolled_for(&self, kind: BiometricKind) -> StorageResult<Vec<Identity>> {
        self.policy.run(|| self.inner.patients_enrolled_for(kind))
    }
}

impl<S: ChallengeRepository> ChallengeRepository for Retrying<S> {
    fn supersede_and_insert(&self, record: ChallengeRecord, audit: AuditDraft) -> StorageResult<(usize, AuditEntry)> {
        self.policy
            .run(|| self.inner.supersede_and_insert(record.clone(), audit.clone()))
    }

    fn challenges_for(&self, key: &ChallengeKey) -> StorageResult<Vec<ChallengeRecord>> {
        self.policy.run(|| self.inner.challenges_for(key))
    }

    fn mark_consumed(
        &self,
        id: ChallengeId,
        now: DateTime<Utc>,
        max_attempts: u32,
        audit: Option<AuditDraft>,
    ) -> StorageResult<ChallengeUpdate> {
        self.policy
            .run(|| self.inner.mark_consumed(id, now, max_attempts, audit.clone()))
    }

    fn record_failed_attempt(
        &self,
        id: ChallengeId,
        now: DateTime<Utc>,
        max_attempts: u32,
    ) -> StorageResult<ChallengeUpdate> {
        self.policy
            .run(|| self.inner.record_failed_attempt(id, now, max_attempts))
    }

    fn purge_expired_challenges(&self, now: DateTime<Utc>) -> StorageResult<usize> {
        self.policy.run(|| self.inner.purge_expired_challenges(now))
    }
}

impl<S: SessionRepository> SessionRepository for Retrying<S> {
    fn insert_session(&self, session: Session) -> StorageResult<()> {
        self.policy.run(|| self.inner.insert_session(session.clone()))
    }

    fn session(&self, id: SessionId) -> StorageResult<Option<Session>> {
        self.policy.run(|| self.inner.session(id))
    }

    fn end_session(
        &self,
        id: SessionId,
        now: DateTime<Utc>,
        audit: Option<AuditDraft>,
    ) -> StorageResult<Option<Transition<Session>>> {
        self.policy.run(|| self.inner.end_session(id, now, audit.clone()))
    }

    fn end_overdue_sessions(&self, now: DateTime<Utc>) -> StorageResult<usize> {
        self.policy.run(|| self.inner.end_overdue_sessions(now))
    }

    fn commit_grant(&self, grant: EmergencyGrant, audit: AuditDraft) -> StorageResult<AuditEntry> {
        self.policy
            .run(|| self.inner.commit_grant(grant.clone(), audit.clone()))
    }

    fn grant(&self, id: GrantId) -> StorageResult<Option<EmergencyGrant>> {
        self.policy.run(|| self.inner.grant(id))
    }

    fn grants_for_doctor(&self, doctor_id: IdentityId) -> StorageResult<Vec<EmergencyGrant>> {
        self.policy.run(|| self.inner.grants_for_doctor(doctor_id))
    }

    fn grants_for_patient(&self, patient_id: IdentityId) -> StorageResult<Vec<EmergencyGrant>> {
        self.policy.run(|| self.inner.grants_for_patient(patient_id))
    }

    fn revoke_grant(
        &self,
        id: GrantId,
        now: DateTime<Utc>,
        audit: AuditDraft,
    ) -> StorageResult<Option<Transition<EmergencyGrant>>> {
        self.policy.run(|| self.inner.revoke_grant(id, now, audit.clone()))
    }

    fn expire_overdue_grants(&self, now: DateTime<Utc>) -> StorageResult<usize> {
        self.policy.run(|| self.inner.expire_overdue_grants(now))
    }
}

impl<S: AuditRepository> AuditRepository for Retrying<S> {
    fn append_audit(&self, draft: AuditDraft) -> StorageResult<AuditEntry> {
        self.policy.run(|| self.inner.append_audit(draft.clone()))
    }

    fn query_audit(&self, query: &AuditQuery) -> StorageResult<Vec<AuditEntry>> {
        self.policy.run(|| self.inner.query_audit(query))
    }

    fn audit_chain(&self) -> StorageResult<Vec<AuditEntry>> {
        self.policy.run(|| self.inner.audit_chain())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    use crate::audit::AuditAction;
    use crate::challenge::ChallengePurpose;
    use crate::identity::{PatientProfile, Profile};

    fn patient(mobile: &str) -> Identity {
        Identity::new("Ana", Profile::Patient(PatientProfile::default()), Utc::now()).with_mobile(mobile)
    }

    #[test]
    fn test_contact_uniqueness() {
        let store = MemoryStore::new();
        store.insert_identity(patient("+1555")).unwrap();
        let err = store.insert_identity(patient("+1555")).unwrap_err();
        assert!(matches!(err, StorageError::Duplicate(_)));
        assert!(store.identity_by_contact("+1555").unwrap().is_some());
    }

    #[test]
    fn test_audit_chain_links_entries() {
        let store = MemoryStore::new();
        let first = store
            .append_audit(AuditDraft::system(AuditAction::ChallengeIssued, Utc::now()))
            .unwrap();
        let second = store
            .append_audit(AuditDraft::system(AuditAction::ChallengeIssued, Utc::now()))
            .unwrap();
        assert_eq!(first.sequence, 1);
        assert_eq!(first.prev_hash, GENESIS_HASH);
        assert_eq!(second.sequence, 2);
        assert_eq!(second.prev_hash, first.entry_hash);
    }

    #[test]
    fn test_audit_outage_is_reported() {
        let store = MemoryStore::new();
        store.set_audit_unavailable(true);
        let err = store
            .append_audit(AuditDraft::system(AuditAction::Logout, Utc::now()))
            .unwrap_err();
        assert!(matches!(err, StorageError::Unavailable(_)));
        assert!(store.audit_chain().unwrap().is_empty());
    }

    fn outstanding(now: DateTime<Utc>) -> ChallengeRecord {
        ChallengeRecord {
            id: ChallengeId::new(),
            key: ChallengeKey::new("+1777", ChallengePurpose::Login).unwrap(),
            code_digest: "digest".into(),
            issued_at: now,
            expires_at: now + Duration::minutes(10),
            state: ChallengeState::Outstanding,
            attempts: 0,
            consumed_at: None,
        }
    }

    fn issued_draft(now: DateTime<Utc>) -> AuditDraft {
        AuditDraft::system(AuditAction::ChallengeIssued, now)
    }

    #[test]
    fn test_attempt_budget_is_enforced_in_the_store() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let record = outstanding(now);
        store.supersede_and_insert(record.clone(), issued_draft(now)).unwrap();

        for expected in 1..=3 {
            assert_eq!(
                store.record_failed_attempt(record.id, now, 3).unwrap(),
                ChallengeUpdate::Applied {
                    attempts: expected,
                    audit: None
                }
            );
        }
        assert_eq!(store.record_failed_attempt(record.id, now, 3).unwrap(), ChallengeUpdate::Locked);
        assert_eq!(store.mark_consumed(record.id, now, 3, None).unwrap(), ChallengeUpdate::Locked);
    }

    #[test]
    fn test_consume_with_audit_is_all_or_nothing() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let record = outstanding(now);
        store.supersede_and_insert(record.clone(), issued_draft(now)).unwrap();
        let draft = AuditDraft::system(AuditAction::RegistrationVerified, now);

        store.set_audit_unavailable(true);
        assert!(store.mark_consumed(record.id, now, 5, Some(draft.clone())).is_err());
        store.set_audit_unavailable(false);
        let stored = store.challenges_for(&record.key).unwrap();
        assert_eq!(stored[0].state, ChallengeState::Outstanding);

        let update = store.mark_consumed(record.id, now, 5, Some(draft)).unwrap();
        assert!(matches!(update, ChallengeUpdate::Applied { audit: Some(ref entry), .. } if entry.sequence == 2));
        assert_eq!(store.mark_consumed(record.id, now, 5, None).unwrap(), ChallengeUpdate::NotOutstanding);
        assert_eq!(
            store.mark_consumed(outstanding(now).id, now, 5, None).unwrap(),
            ChallengeUpdate::NotOutstanding
        );
    }

    #[test]
    fn test_expired_challenge_refuses_both_steps() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let record = outstanding(now);
        store.supersede_and_insert(record.clone(), issued_draft(now)).unwrap();
        let later = now + Duration::minutes(10);
        assert_eq!(store.record_failed_attempt(record.id, later, 5).unwrap(), ChallengeUpdate::Expired);
        assert_eq!(store.mark_consumed(record.id, later, 5, None).unwrap(), ChallengeUpdate::Expired);
    }

    #[test]
    fn test_retrying_absorbs_injected_contention() {
        let store = Retrying::new(
            MemoryStore::new(),
            RetryPolicy {
                max_attempts: 3,
                initial_backoff_ms: 0,
                max_backoff_ms: 0,
            },
        );
        store.inner().inject_busy(2);
        store.insert_identity(patient("+1666")).unwrap();
        assert!(store.identity_by_contact("+1666").unwrap().is_some());
    }

    #[test]
    fn test_retrying_surfaces_persistent_contention() {
        let store = Retrying::new(MemoryStore::new(), RetryPolicy::none());
        store.inner().inject_busy(1);
        let err = store.audit_chain().unwrap_err();
        assert!(err.is_transient());
    }
}
