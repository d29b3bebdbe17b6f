//! Async gateway
//!
//! The core is synchronous and its storage calls may block. The gateway runs
//! every call on tokio's blocking pool under a deadline. When the deadline
//! passes the caller gets [`AccessError::Timeout`], but the blocking call
//! keeps running: a timed-out write may or may not have happened.

use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use crate::audit::{AuditEntry, AuditQuery};
use crate::challenge::{ChallengePurpose, IssuedChallenge};
use crate::error::{AccessError, Result};
use crate::identity::{BiometricKind, IdentityId};
use crate::policy::AccessDecision;
use crate::service::{AccessService, EmergencyAccessRequest, Verified};
use crate::session::{IssuedGrant, IssuedSession, Revocation};
use crate::token::TokenClaims;

/// Default per-call deadline
pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct AccessGateway {
    service: Arc<AccessService>,
    deadline: Duration,
}

impl AccessGateway {
    pub fn new(service: Arc<AccessService>) -> Self {
        Self {
            service,
            deadline: DEFAULT_DEADLINE,
        }
    }

    /// Same service, different deadline
    pub fn with_deadline(&self, deadline: Duration) -> Self {
        Self {
            service: Arc::clone(&self.service),
            deadline,
        }
    }

    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    /// Run any service call under the deadline
    pub async fn call<T, F>(&self, op: F) -> Result<T>
    where
        F: FnOnce(&AccessService) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let service = Arc::clone(&self.service);
        let task = tokio::task::spawn_blocking(move || op(&service));
        match tokio::time::timeout(self.deadline, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(err)) => Err(AccessError::Internal(format!("core task failed: {}", err))),
            Err(_) => {
                warn!(deadline = ?self.deadline, "access call timed out");
                Err(AccessError::Timeout(self.deadline))
            }
        }
    }

    pub async fn request_challenge(&self, identifier: String, purpose: ChallengePurpose) -> Result<IssuedChallenge> {
        self.call(move |s| s.request_challenge(&identifier, purpose)).await
    }

    pub async fn verify_challenge(&self, identifier: String, code: String, purpose: ChallengePurpose) -> Result<Verified> {
        self.call(move |s| s.verify_challenge(&identifier, &code, purpose)).await
    }

    pub async fn verify_biometric(&self, identifier: String, kind: BiometricKind, sample: Vec<u8>) -> Result<IssuedSession> {
        self.call(move |s| s.verify_biometric(&identifier, kind, &sample)).await
    }

    pub async fn request_emergency_access(&self, request: EmergencyAccessRequest) -> Result<IssuedGrant> {
        self.call(move |s| s.request_emergency_access(request)).await
    }

    pub async fn validate_session(&self, token: String) -> Result<TokenClaims> {
        self.call(move |s| s.validate_session(&token)).await
    }

    pub async fn revoke_session(&self, token: String) -> Result<Revocation> {
        self.call(move |s| s.revoke_session(&token)).await
    }

    pub async fn authorize_access(&self, token: String, patient_id: IdentityId) -> Result<AccessDecision> {
        self.call(move |s| s.authorize_access(&token, patient_id)).await
    }

    pub async fn query_audit(&self, query: AuditQuery) -> Result<Vec<AuditEntry>> {
        self.call(move |s| s.query_audit(&query)).await
    }

    pub async fn export_audit_csv(&self, patient_id: IdentityId) -> Result<Vec<u8>> {
        self.call(move |s| s.export_audit_csv(patient_id)).await
    }
}
