//! Shared fixture for integration tests: an in-memory service on a manual
//! clock with one doctor, two patients and one operator registered.

#![allow(dead_code)]

use std::sync::Arc;

use chrono::{TimeZone, Utc};
use health_access::{
    AccessConfig, AccessService, BiometricKind, BiometricReference, ChallengePurpose, Clock, Credential, DoctorProfile,
    EmergencyAccessRequest, EncounterRoster, Identity, IdentityId, IssuedGrant, IssuedSession, ManualClock,
    MemoryStore, OperatorProfile, PatientProfile, Profile, Repositories, Result, TemplateMatcher, Verified,
};

pub const DOCTOR_MOBILE: &str = "+15550001000";
pub const ANA_MOBILE: &str = "+15550002000";
pub const BEA_MOBILE: &str = "+15550003000";
pub const OPERATOR_MOBILE: &str = "+15550004000";
pub const FACILITY: &str = "St. Mary";

pub const ANA_FINGERPRINT: [u8; 16] = [
    0x3c, 0xa5, 0x5a, 0xc3, 0x0f, 0xf0, 0x99, 0x66, 0x12, 0x34, 0x56, 0x78, 0x9a, 0xbc, 0xde, 0xf0,
];

pub struct Harness {
    pub service: Arc<AccessService>,
    pub store: Arc<MemoryStore>,
    pub clock: Arc<ManualClock>,
    pub roster: Arc<EncounterRoster>,
    pub doctor: IdentityId,
    pub ana: IdentityId,
    pub bea: IdentityId,
    pub operator: IdentityId,
}

impl Harness {
    pub fn new() -> Self {
        let config = AccessConfig {
            signing_key: Some("ab".repeat(32)),
            ..AccessConfig::default()
        };
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 3, 14, 9, 0, 0).unwrap()));
        let roster = Arc::new(EncounterRoster::new());
        let service = AccessService::new(
            config,
            Repositories::shared(store.clone()),
            roster.clone(),
            Arc::new(TemplateMatcher::new(0.85)),
            clock.clone(),
        )
        .expect("service builds");

        let now = clock.now();
        let directory = service.identities();
        let doctor = directory
            .register(
                Identity::new(
                    "Dr. Okafor",
                    Profile::Doctor(DoctorProfile {
                        licence_number: Some("MD-4471".into()),
                        facility: Some(FACILITY.into()),
                    }),
                    now,
                )
                .with_mobile(DOCTOR_MOBILE),
            )
            .unwrap();
        let ana = directory
            .register(Identity::new("Ana", Profile::Patient(PatientProfile::default()), now).with_mobile(ANA_MOBILE))
            .unwrap();
        directory
            .enroll_biometric(
                ana,
                BiometricReference {
                    kind: BiometricKind::Fingerprint,
                    handle: "vault://fp/ana".into(),
                    template: ANA_FINGERPRINT.to_vec(),
                    enrolled_at: now,
                },
            )
            .unwrap();
        let bea = directory
            .register(
                Identity::new("Bea", Profile::Patient(PatientProfile::default()), now)
                    .with_mobile(BEA_MOBILE)
                    .with_email("bea@example.org"),
            )
            .unwrap();
        let operator = directory
            .register(
                Identity::new(
                    "Front desk",
                    Profile::Operator(OperatorProfile {
                        facility: FACILITY.into(),
                    }),
                    now,
                )
                .with_mobile(OPERATOR_MOBILE),
            )
            .unwrap();

        Self {
            service: Arc::new(service),
            store,
            clock,
            roster,
            doctor,
            ana,
            bea,
            operator,
        }
    }

    /// Log in with a one-time code
    pub fn login(&self, mobile: &str) -> IssuedSession {
        let issued = self.service.request_challenge(mobile, ChallengePurpose::Login).unwrap();
        match self
            .service
            .verify_challenge(mobile, &issued.code, ChallengePurpose::Login)
            .unwrap()
        {
            Verified::Session(session) => session,
            other => panic!("expected a session, got {:?}", other),
        }
    }

    /// Emergency access to a patient, proven by a code sent to the patient
    pub fn emergency_by_otp(&self, patient_mobile: &str, reason: &str) -> Result<IssuedGrant> {
        let issued = self
            .service
            .request_challenge(patient_mobile, ChallengePurpose::EmergencyAccess)?;
        self.service.request_emergency_access(EmergencyAccessRequest {
            doctor_mobile: DOCTOR_MOBILE.into(),
            patient_identifier: Some(patient_mobile.into()),
            reason: reason.into(),
            facility: Some(FACILITY.into()),
            credential: Credential::Otp { code: issued.code },
        })
    }

    /// Emergency access to an unidentified patient by fingerprint scan
    pub fn emergency_by_scan(&self, sample: &[u8], reason: &str) -> Result<IssuedGrant> {
        self.service.request_emergency_access(EmergencyAccessRequest {
            doctor_mobile: DOCTOR_MOBILE.into(),
            patient_identifier: None,
            reason: reason.into(),
            facility: None,
            credential: Credential::Biometric {
                kind: BiometricKind::Fingerprint,
                sample: sample.to_vec(),
            },
        })
    }
}
