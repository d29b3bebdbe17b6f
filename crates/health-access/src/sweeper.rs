//! Expiry sweeper
//!
//! Periodically settles what has passed its deadline: active grants become
//! EXPIRED, overdue sessions end, expired challenges are dropped. Lazy
//! checks on read already give the right answers, so a missed or failed
//! sweep only delays cleanup. Failures are logged and retried on the next
//! tick.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::challenge::ChallengeStore;
use crate::clock::Clock;
use crate::error::Result;
use crate::session::SessionManager;

/// What one sweep did
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    pub grants_expired: usize,
    pub sessions_ended: usize,
    pub challenges_purged: usize,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        *self == SweepReport::default()
    }
}

pub struct ExpirySweeper {
    sessions: Arc<SessionManager>,
    challenges: Arc<ChallengeStore>,
    clock: Arc<dyn Clock>,
}

impl ExpirySweeper {
    pub fn new(sessions: Arc<SessionManager>, challenges: Arc<ChallengeStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            sessions,
            challenges,
            clock,
        }
    }

    /// One blocking sweep at the current time
    pub fn run_once(&self) -> Result<SweepReport> {
        let now = self.clock.now();
        let expired = self.sessions.expire_overdue(now)?;
        let challenges_purged = self.challenges.purge_expired(now)?;
        Ok(SweepReport {
            grants_expired: expired.grants_expired,
            sessions_ended: expired.sessions_ended,
            challenges_purged,
        })
    }

    /// Run a sweep every `interval` on the current tokio runtime until the
    /// returned handle is stopped. Each sweep runs on the blocking pool.
    pub fn spawn(self: Arc<Self>, interval: Duration) -> SweeperHandle {
        let (shutdown, mut stopped) = watch::channel(false);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(?interval, "expiry sweeper started");
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    changed = stopped.changed() => {
                        if changed.is_err() || *stopped.borrow() {
                            break;
                        }
                        continue;
                    }
                }
                let sweeper = Arc::clone(&self);
                match tokio::task::spawn_blocking(move || sweeper.run_once()).await {
                    Ok(Ok(report)) if report.is_empty() => debug!("sweep found nothing to do"),
                    Ok(Ok(report)) => info!(
                        grants_expired = report.grants_expired,
                        sessions_ended = report.sessions_ended,
                        challenges_purged = report.challenges_purged,
                        "sweep completed"
                    ),
                    Ok(Err(err)) => warn!(error = %err, "sweep failed, retrying next tick"),
                    Err(err) => warn!(error = %err, "sweep task panicked, retrying next tick"),
                }
            }
            info!("expiry sweeper stopped");
        });
        SweeperHandle { shutdown, task }
    }
}

/// Handle to a running sweeper
pub struct SweeperHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SweeperHandle {
    /// Signal shutdown and wait for the loop to exit
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(err) = self.task.await {
            warn!(error = %err, "sweeper task ended abnormally");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::challenge::ChallengePurpose;
    use crate::clock::ManualClock;
    use crate::config::AccessConfig;
    use crate::identity::{DoctorProfile, Identity, IdentityDirectory, PatientProfile, Profile};
    use crate::session::GrantRequest;
    use crate::storage::MemoryStore;
    use crate::token::TokenSigner;
    use crate::verifier::VerificationMethod;
    use chrono::Utc;

    #[test]
    fn test_run_once_counts() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let config = AccessConfig::default();
        let directory = IdentityDirectory::new(store.clone());
        let doctor = directory
            .register(Identity::new("Dr", Profile::Doctor(DoctorProfile::default()), clock.now()).with_mobile("+15550001000"))
            .unwrap();
        let patient = directory
            .register(Identity::new("Pt", Profile::Patient(PatientProfile::default()), clock.now()).with_mobile("+15550002000"))
            .unwrap();
        let sessions = Arc::new(SessionManager::new(
            store.clone(),
            store.clone(),
            Arc::new(TokenSigner::ephemeral()),
            clock.clone(),
            &config,
        ));
        let challenges = Arc::new(ChallengeStore::new(store.clone(), clock.clone(), &config));
        let sweeper = ExpirySweeper::new(sessions.clone(), challenges.clone(), clock.clone());

        sessions
            .grant_emergency_access(GrantRequest {
                doctor_id: doctor,
                patient_id: patient,
                reason: "stroke".into(),
                method: VerificationMethod::Otp,
                facility: None,
            })
            .unwrap();
        challenges.issue("+15550002000", ChallengePurpose::Login).unwrap();

        assert!(sweeper.run_once().unwrap().is_empty());

        clock.advance(chrono::Duration::minutes(31));
        let report = sweeper.run_once().unwrap();
        assert_eq!(report.grants_expired, 1);
        assert_eq!(report.challenges_purged, 1);
        assert_eq!(report.sessions_ended, 0);
        assert!(sweeper.run_once().unwrap().is_empty());
    }
}
