//! Audit trail
//!
//! Append-only record of every authentication event and access decision.
//! Entries form a SHA-256 hash chain: each one commits to its predecessor
//! through `prev_hash`, so editing, deleting or reordering any entry breaks
//! every later link and [`AuditTrail::verify_chain`] reports where.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::error::{AccessError, Result};
use crate::identity::{IdentityId, Role};
use crate::ids::AuditId;
use crate::storage::AuditRepository;

/// `prev_hash` of the first entry: 64 hex zeros
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

pub const DEFAULT_QUERY_LIMIT: usize = 50;
pub const MAX_QUERY_LIMIT: usize = 500;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditAction {
    Login,
    LoginFailed,
    OperatorLogin,
    ChallengeIssued,
    RegistrationVerified,
    EmergencyAccess,
    EmergencyAccessDenied,
    GrantRevoked,
    Logout,
    RecordAccessed,
    AccessDenied,
    EncounterCreated,
    DocumentUploaded,
}

impl std::fmt::Display for AuditAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            AuditAction::Login => "LOGIN",
            AuditAction::LoginFailed => "LOGIN_FAILED",
            AuditAction::OperatorLogin => "OPERATOR_LOGIN",
            AuditAction::ChallengeIssued => "CHALLENGE_ISSUED",
            AuditAction::RegistrationVerified => "REGISTRATION_VERIFIED",
            AuditAction::EmergencyAccess => "EMERGENCY_ACCESS",
            AuditAction::EmergencyAccessDenied => "EMERGENCY_ACCESS_DENIED",
            AuditAction::GrantRevoked => "GRANT_REVOKED",
            AuditAction::Logout => "LOGOUT",
            AuditAction::RecordAccessed => "RECORD_ACCESSED",
            AuditAction::AccessDenied => "ACCESS_DENIED",
            AuditAction::EncounterCreated => "ENCOUNTER_CREATED",
            AuditAction::DocumentUploaded => "DOCUMENT_UPLOADED",
        };
        write!(f, "{}", name)
    }
}

/// An entry that has not been placed on the chain yet
#[derive(Clone, Debug, PartialEq)]
pub struct AuditDraft {
    pub action: AuditAction,
    pub actor_id: Option<IdentityId>,
    pub actor_role: Option<Role>,
    pub patient_id: Option<IdentityId>,
    pub detail: Value,
    pub created_at: DateTime<Utc>,
}

impl AuditDraft {
    pub fn new(action: AuditAction, created_at: DateTime<Utc>) -> Self {
        Self {
            action,
            actor_id: None,
            actor_role: None,
            patient_id: None,
            detail: Value::Object(Default::default()),
            created_at,
        }
    }

    /// Draft for an action with no acting identity
    pub fn system(action: AuditAction, created_at: DateTime<Utc>) -> Self {
        Self::new(action, created_at)
    }

    pub fn by(mut self, actor_id: IdentityId, role: Role) -> Self {
        self.actor_id = Some(actor_id);
        self.actor_role = Some(role);
        self
    }

    pub fn for_patient(mut self, patient_id: IdentityId) -> Self {
        self.patient_id = Some(patient_id);
        self
    }

    pub fn with_detail(mut self, detail: Value) -> Self {
        self.detail = detail;
        self
    }

    /// Place the draft at `sequence`, linking it to `prev_hash`
    pub fn seal(self, sequence: u64, prev_hash: String) -> AuditEntry {
        let mut entry = AuditEntry {
            id: AuditId::new(),
            sequence,
            actor_id: self.actor_id,
            actor_role: self.actor_role,
            patient_id: self.patient_id,
            action: self.action,
            detail: self.detail,
            created_at: self.created_at,
            prev_hash,
            entry_hash: String::new(),
        };
        entry.entry_hash = entry.compute_hash();
        entry
    }
}

/// Immutable audit record
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: AuditId,
    /// Position in the chain, starting at 1
    pub sequence: u64,
    pub actor_id: Option<IdentityId>,
    pub actor_role: Option<Role>,
    pub patient_id: Option<IdentityId>,
    pub action: AuditAction,
    pub detail: Value,
    pub created_at: DateTime<Utc>,
    pub prev_hash: String,
    /// SHA-256 (hex) over every other field
    pub entry_hash: String,
}

impl AuditEntry {
    /// Hash of the entry's canonical content
    pub fn compute_hash(&self) -> String {
        fn field(hasher: &mut Sha256, value: &str) {
            hasher.update(value.as_bytes());
            hasher.update([0x1f]);
        }
        let optional = |v: Option<String>| v.unwrap_or_default();

        let mut hasher = Sha256::new();
        field(&mut hasher, &self.sequence.to_string());
        field(&mut hasher, &self.id.to_string());
        field(&mut hasher, &optional(self.actor_id.map(|id| id.to_string())));
        field(&mut hasher, &optional(self.actor_role.map(|role| role.to_string())));
        field(&mut hasher, &optional(self.patient_id.map(|id| id.to_string())));
        field(&mut hasher, &self.action.to_string());
        // serde_json maps are ordered, so this rendering is canonical
        field(&mut hasher, &self.detail.to_string());
        field(&mut hasher, &self.created_at.to_rfc3339_opts(SecondsFormat::Nanos, true));
        field(&mut hasher, &self.prev_hash);
        hex::encode(hasher.finalize())
    }
}

// ============================================================================
// Queries
// ============================================================================

/// Filters over the trail, combined with AND
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditQuery {
    pub patient_id: Option<IdentityId>,
    pub actor_id: Option<IdentityId>,
    pub actor_role: Option<Role>,
    pub action: Option<AuditAction>,
    /// Inclusive lower bound on `created_at`
    pub from: Option<DateTime<Utc>>,
    /// Inclusive upper bound on `created_at`
    pub to: Option<DateTime<Utc>>,
    /// Case-insensitive substring of the detail payload
    pub text: Option<String>,
    pub limit: Option<usize>,
    pub offset: usize,
}

impl AuditQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn patient(mut self, patient_id: IdentityId) -> Self {
        self.patient_id = Some(patient_id);
        self
    }

    pub fn actor(mut self, actor_id: IdentityId) -> Self {
        self.actor_id = Some(actor_id);
        self
    }

    pub fn role(mut self, role: Role) -> Self {
        self.actor_role = Some(role);
        self
    }

    pub fn action(mut self, action: AuditAction) -> Self {
        self.action = Some(action);
        self
    }

    pub fn between(mut self, from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        self.from = Some(from);
        self.to = Some(to);
        self
    }

    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    pub fn effective_limit(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_QUERY_LIMIT).min(MAX_QUERY_LIMIT)
    }

    pub fn validate(&self) -> Result<()> {
        if self.limit == Some(0) {
            return Err(AccessError::validation("limit", "must be greater than 0"));
        }
        if let (Some(from), Some(to)) = (self.from, self.to) {
            if from > to {
                return Err(AccessError::validation("from", "must not be after `to`"));
            }
        }
        Ok(())
    }

    pub fn matches(&self, entry: &AuditEntry) -> bool {
        if self.patient_id.is_some() && entry.patient_id != self.patient_id {
            return false;
        }
        if self.actor_id.is_some() && entry.actor_id != self.actor_id {
            return false;
        }
        if self.actor_role.is_some() && entry.actor_role != self.actor_role {
            return false;
        }
        if self.action.is_some_and(|action| action != entry.action) {
            return false;
        }
        if self.from.is_some_and(|from| entry.created_at < from) {
            return false;
        }
        if self.to.is_some_and(|to| entry.created_at > to) {
            return false;
        }
        match &self.text {
            Some(text) if !text.is_empty() => entry
                .detail
                .to_string()
                .to_lowercase()
                .contains(&text.to_lowercase()),
            _ => true,
        }
    }
}

/// Result of walking the hash chain
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainVerification {
    pub entries: usize,
    /// Sequence number of the first entry that does not link up
    pub first_broken: Option<u64>,
    /// `entry_hash` of the last entry, or the genesis hash when empty
    pub head_hash: String,
}

impl ChainVerification {
    pub fn is_intact(&self) -> bool {
        self.first_broken.is_none()
    }
}

/// Patient-facing summary of who touched a patient's records
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DisclosureSummary {
    pub patient_id: IdentityId,
    pub total_events: usize,
    pub by_action: BTreeMap<AuditAction, usize>,
    pub emergency_accesses: usize,
    pub distinct_actors: usize,
    pub first_event: Option<DateTime<Utc>>,
    pub last_event: Option<DateTime<Utc>>,
}

#[derive(Serialize)]
struct CsvRow {
    id: String,
    sequence: u64,
    created_at: String,
    actor_id: String,
    actor_role: String,
    patient_id: String,
    action: String,
    detail: String,
}

const CSV_HEADER: [&str; 8] = [
    "id",
    "sequence",
    "created_at",
    "actor_id",
    "actor_role",
    "patient_id",
    "action",
    "detail",
];

impl From<&AuditEntry> for CsvRow {
    fn from(entry: &AuditEntry) -> Self {
        let or_empty = |v: Option<String>| v.unwrap_or_default();
        CsvRow {
            id: entry.id.to_string(),
            sequence: entry.sequence,
            created_at: entry.created_at.to_rfc3339_opts(SecondsFormat::Millis, true),
            actor_id: or_empty(entry.actor_id.map(|id| id.to_string())),
            actor_role: or_empty(entry.actor_role.map(|role| role.to_string())),
            patient_id: or_empty(entry.patient_id.map(|id| id.to_string())),
            action: entry.action.to_string(),
            detail: entry.detail.to_string(),
        }
    }
}

/// Walk a chain in sequence order and report the first entry that does not
/// link up with its predecessor or whose hash does not match its content
pub fn verify_entries(chain: &[AuditEntry]) -> ChainVerification {
    let mut expected_prev = GENESIS_HASH;
    let mut first_broken = None;
    for (index, entry) in chain.iter().enumerate() {
        if entry.sequence != index as u64 + 1
            || entry.prev_hash != expected_prev
            || entry.compute_hash() != entry.entry_hash
        {
            first_broken = Some(entry.sequence);
            break;
        }
        expected_prev = entry.entry_hash.as_str();
    }
    ChainVerification {
        entries: chain.len(),
        first_broken,
        head_hash: chain
            .last()
            .map(|e| e.entry_hash.clone())
            .unwrap_or_else(|| GENESIS_HASH.to_string()),
    }
}

fn csv_error(err: impl std::fmt::Display) -> AccessError {
    AccessError::Internal(format!("csv export failed: {}", err))
}

// ============================================================================
// Trail
// ============================================================================

pub struct AuditTrail {
    repo: Arc<dyn AuditRepository>,
}

impl AuditTrail {
    pub fn new(repo: Arc<dyn AuditRepository>) -> Self {
        Self { repo }
    }

    /// Append an entry. Failure must abort the caller's operation.
    pub fn append(&self, draft: AuditDraft) -> Result<AuditEntry> {
        let action = draft.action;
        let entry = self.repo.append_audit(draft).map_err(|err| {
            warn!(%action, error = %err, "audit append failed");
            err
        })?;
        debug!(sequence = entry.sequence, action = %entry.action, "audit entry appended");
        Ok(entry)
    }

    /// Matching entries, newest first
    pub fn query(&self, query: &AuditQuery) -> Result<Vec<AuditEntry>> {
        query.validate()?;
        Ok(self.repo.query_audit(query)?)
    }

    /// Flat CSV of every entry about a patient, oldest first
    pub fn export_csv(&self, patient_id: IdentityId) -> Result<Vec<u8>> {
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(Vec::new());
        writer.write_record(CSV_HEADER).map_err(csv_error)?;
        let mut rows = 0usize;
        for entry in self.repo.audit_chain()?.iter().filter(|e| e.patient_id == Some(patient_id)) {
            writer.serialize(CsvRow::from(entry)).map_err(csv_error)?;
            rows += 1;
        }
        let bytes = writer.into_inner().map_err(csv_error)?;
        debug!(patient = %patient_id, rows, "audit exported");
        Ok(bytes)
    }

    /// Recompute every link of the chain
    pub fn verify_chain(&self) -> Result<ChainVerification> {
        let verification = verify_entries(&self.repo.audit_chain()?);
        if let Some(sequence) = verification.first_broken {
            warn!(sequence, "audit chain broken");
        }
        Ok(verification)
    }

    pub fn disclosure_summary(&self, patient_id: IdentityId) -> Result<DisclosureSummary> {
        let chain = self.repo.audit_chain()?;
        let mut by_action = BTreeMap::new();
        let mut actors = BTreeSet::new();
        let mut first_event = None;
        let mut last_event = None;
        let mut total_events = 0;
        for entry in chain.iter().filter(|e| e.patient_id == Some(patient_id)) {
            total_events += 1;
            *by_action.entry(entry.action).or_insert(0) += 1;
            if let Some(actor) = entry.actor_id {
                actors.insert(actor);
            }
            first_event = Some(first_event.map_or(entry.created_at, |t: DateTime<Utc>| t.min(entry.created_at)));
            last_event = Some(last_event.map_or(entry.created_at, |t: DateTime<Utc>| t.max(entry.created_at)));
        }
        Ok(DisclosureSummary {
            patient_id,
            total_events,
            emergency_accesses: by_action.get(&AuditAction::EmergencyAccess).copied().unwrap_or(0),
            by_action,
            distinct_actors: actors.len(),
            first_event,
            last_event,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use chrono::Duration;
    use serde_json::json;

    fn trail() -> (AuditTrail, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (AuditTrail::new(store.clone()), store)
    }

    #[test]
    fn test_seal_is_deterministic_for_content() {
        let draft = AuditDraft::new(AuditAction::Login, Utc::now()).with_detail(json!({"b": 1, "a": 2}));
        let entry = draft.seal(1, GENESIS_HASH.into());
        assert_eq!(entry.compute_hash(), entry.entry_hash);
        assert_eq!(entry.entry_hash.len(), 64);
    }

    #[test]
    fn test_query_filters_and_orders() {
        let (trail, _) = trail();
        let p1 = IdentityId::new();
        let p2 = IdentityId::new();
        let doctor = IdentityId::new();
        let t0 = Utc::now();
        for (offset, patient, action) in [
            (0, p1, AuditAction::RecordAccessed),
            (1, p2, AuditAction::RecordAccessed),
            (2, p1, AuditAction::EmergencyAccess),
            (2, p1, AuditAction::RecordAccessed),
        ] {
            trail
                .append(
                    AuditDraft::new(action, t0 + Duration::seconds(offset))
                        .by(doctor, Role::Doctor)
                        .for_patient(patient),
                )
                .unwrap();
        }

        let entries = trail.query(&AuditQuery::new().patient(p1)).unwrap();
        assert_eq!(entries.len(), 3);
        assert!(entries.iter().all(|e| e.patient_id == Some(p1)));
        // same timestamp: later sequence first
        assert_eq!(entries[0].sequence, 4);
        assert_eq!(entries[1].sequence, 3);
        assert_eq!(entries[2].sequence, 1);

        let only = trail
            .query(&AuditQuery::new().patient(p1).action(AuditAction::EmergencyAccess))
            .unwrap();
        assert_eq!(only.len(), 1);

        let windowed = trail
            .query(&AuditQuery::new().between(t0 + Duration::seconds(1), t0 + Duration::seconds(1)))
            .unwrap();
        assert_eq!(windowed.len(), 1);
        assert_eq!(windowed[0].patient_id, Some(p2));

        let paged = trail.query(&AuditQuery::new().patient(p1).limit(1).offset(1)).unwrap();
        assert_eq!(paged.len(), 1);
        assert_eq!(paged[0].sequence, 3);
    }

    #[test]
    fn test_text_search_over_detail() {
        let (trail, _) = trail();
        trail
            .append(AuditDraft::system(AuditAction::ChallengeIssued, Utc::now()).with_detail(json!({"purpose": "LOGIN"})))
            .unwrap();
        trail
            .append(AuditDraft::system(AuditAction::ChallengeIssued, Utc::now()).with_detail(json!({"purpose": "REGISTRATION"})))
            .unwrap();
        assert_eq!(trail.query(&AuditQuery::new().text("registration")).unwrap().len(), 1);
    }

    #[test]
    fn test_invalid_query_rejected() {
        let (trail, _) = trail();
        let now = Utc::now();
        assert!(trail.query(&AuditQuery::new().limit(0)).is_err());
        assert!(trail.query(&AuditQuery::new().between(now, now - Duration::seconds(1))).is_err());
    }

    #[test]
    fn test_export_csv() {
        let (trail, _) = trail();
        let patient = IdentityId::new();
        trail
            .append(
                AuditDraft::new(AuditAction::EmergencyAccess, Utc::now())
                    .by(IdentityId::new(), Role::Doctor)
                    .for_patient(patient)
                    .with_detail(json!({"reason": "cardiac arrest, unresponsive"})),
            )
            .unwrap();
        trail
            .append(AuditDraft::new(AuditAction::Login, Utc::now()).for_patient(IdentityId::new()))
            .unwrap();

        let bytes = trail.export_csv(patient).unwrap();
        let mut reader = csv::Reader::from_reader(bytes.as_slice());
        let headers = reader.headers().unwrap().clone();
        assert_eq!(headers.iter().collect::<Vec<_>>(), CSV_HEADER.to_vec());
        let rows: Vec<csv::StringRecord> = reader.records().map(|r| r.unwrap()).collect();
        assert_eq!(rows.len(), 1);
        assert_eq!(&rows[0][6], "EMERGENCY_ACCESS");
        assert_eq!(&rows[0][4], "DOCTOR");
        assert!(rows[0][7].contains("cardiac arrest, unresponsive"));
    }

    #[test]
    fn test_export_csv_for_unknown_patient_has_header_only() {
        let (trail, _) = trail();
        let bytes = trail.export_csv(IdentityId::new()).unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert_eq!(text.lines().count(), 1);
    }

    fn sealed_chain(len: u64) -> Vec<AuditEntry> {
        let mut chain = Vec::new();
        let mut prev = GENESIS_HASH.to_string();
        for sequence in 1..=len {
            let entry = AuditDraft::new(AuditAction::RecordAccessed, Utc::now()).seal(sequence, prev);
            prev = entry.entry_hash.clone();
            chain.push(entry);
        }
        chain
    }

    #[test]
    fn test_verify_chain_on_store() {
        let (trail, _) = trail();
        for _ in 0..3 {
            trail.append(AuditDraft::system(AuditAction::ChallengeIssued, Utc::now())).unwrap();
        }
        let verification = trail.verify_chain().unwrap();
        assert!(verification.is_intact());
        assert_eq!(verification.entries, 3);
    }

    #[test]
    fn test_verify_detects_edit() {
        let mut chain = sealed_chain(4);
        assert!(verify_entries(&chain).is_intact());
        chain[1].detail = json!({"edited": true});
        assert_eq!(verify_entries(&chain).first_broken, Some(2));
    }

    #[test]
    fn test_verify_detects_deletion_and_reordering() {
        let mut chain = sealed_chain(4);
        chain.remove(1);
        assert_eq!(verify_entries(&chain).first_broken, Some(3));

        let mut chain = sealed_chain(4);
        chain.swap(2, 3);
        assert_eq!(verify_entries(&chain).first_broken, Some(4));
    }

    #[test]
    fn test_verify_detects_rehashed_edit() {
        let mut chain = sealed_chain(3);
        chain[0].patient_id = Some(IdentityId::new());
        chain[0].entry_hash = chain[0].compute_hash();
        assert_eq!(verify_entries(&chain).first_broken, Some(2));
    }

    #[test]
    fn test_verify_empty_chain() {
        let (trail, _) = trail();
        let verification = trail.verify_chain().unwrap();
        assert!(verification.is_intact());
        assert_eq!(verification.entries, 0);
        assert_eq!(verification.head_hash, GENESIS_HASH);
    }

    #[test]
    fn test_disclosure_summary() {
        let (trail, _) = trail();
        let patient = IdentityId::new();
        let doctor = IdentityId::new();
        let t0 = Utc::now();
        trail
            .append(AuditDraft::new(AuditAction::EmergencyAccess, t0).by(doctor, Role::Doctor).for_patient(patient))
            .unwrap();
        trail
            .append(
                AuditDraft::new(AuditAction::RecordAccessed, t0 + Duration::minutes(1))
                    .by(doctor, Role::Doctor)
                    .for_patient(patient),
            )
            .unwrap();
        trail
            .append(AuditDraft::new(AuditAction::Login, t0 + Duration::minutes(2)).by(patient, Role::Patient).for_patient(patient))
            .unwrap();

        let summary = trail.disclosure_summary(patient).unwrap();
        assert_eq!(summary.total_events, 3);
        assert_eq!(summary.emergency_accesses, 1);
        assert_eq!(summary.distinct_actors, 2);
        assert_eq!(summary.first_event, Some(t0));
        assert_eq!(summary.last_event, Some(t0 + Duration::minutes(2)));
        assert_eq!(summary.by_action.get(&AuditAction::RecordAccessed), Some(&1));
    }
}
