//! Health Access - break-glass emergency access to patient records
//!
//! Grants and revokes time-boxed elevated access to patient records and
//! keeps a tamper-evident audit trail of every access decision.
//!
//! # Features
//!
//! - One-time-code challenges with supersession, expiry and attempt limits
//! - Biometric verification against enrolled references, including
//!   identification of an unconscious patient by scan
//! - Role-based access policy where doctors need an active emergency grant
//! - Signed session tokens for ordinary sessions and 30-minute grants
//! - SHA-256 hash-chained audit trail with query, CSV export and
//!   chain verification
//! - Background expiry sweeper and an async gateway with per-call deadlines
//!
//! # Example
//!
//! ```rust
//! use chrono::Utc;
//! use health_access::{
//!     AccessConfig, AccessService, ChallengePurpose, Identity, PatientProfile, Profile, Verified,
//! };
//!
//! let (service, _roster) = AccessService::in_memory(AccessConfig::default()).unwrap();
//! let patient = service
//!     .identities()
//!     .register(
//!         Identity::new("Ana", Profile::Patient(PatientProfile::default()), Utc::now())
//!             .with_mobile("+15550002000"),
//!     )
//!     .unwrap();
//!
//! let issued = service.request_challenge("+15550002000", ChallengePurpose::Login).unwrap();
//! let Verified::Session(session) = service
//!     .verify_challenge("+15550002000", &issued.code, ChallengePurpose::Login)
//!     .unwrap()
//! else {
//!     panic!("login codes open a session");
//! };
//!
//! let decision = service.authorize_access(session.token.as_str(), patient).unwrap();
//! assert!(decision.authorized);
//! ```

pub mod audit;
pub mod challenge;
pub mod clock;
pub mod config;
pub mod error;
pub mod gateway;
pub mod identity;
pub mod ids;
pub mod policy;
pub mod service;
pub mod session;
pub mod storage;
pub mod sweeper;
pub mod token;
pub mod verifier;

// Re-export commonly used types for convenience
pub use audit::{AuditAction, AuditEntry, AuditQuery, AuditTrail, ChainVerification, DisclosureSummary};
pub use challenge::{ChallengePurpose, ChallengeStore, IssuedChallenge};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{AccessConfig, ConfigError, RetryPolicy};
pub use error::{AccessError, ErrorKind, Result, StorageError};
pub use gateway::AccessGateway;
pub use identity::{
    BiometricKind, BiometricReference, DoctorProfile, EmergencyContact, Identity, IdentityDirectory, IdentityId,
    OperatorProfile, PatientProfile, Profile, Role,
};
pub use ids::{GrantId, SessionId};
pub use policy::{AccessBasis, AccessDecision, AccessPolicy, Actor, EncounterRoster, FacilityMembership};
pub use service::{AccessService, EmergencyAccessRequest, Repositories, Verified};
pub use session::{EmergencyGrant, GrantStatus, IssuedGrant, IssuedSession, Revocation, SessionManager, Validity};
pub use storage::{MemoryStore, Retrying};
pub use sweeper::{ExpirySweeper, SweepReport, SweeperHandle};
pub use token::{SessionToken, TokenClaims, TokenSubject};
pub use verifier::{BiometricMatcher, Credential, CredentialVerifier, MatchOutcome, TemplateMatcher, VerificationMethod};
