//! Clinical ledger service
//!
//! Writes go through [`LedgerService::record_clinical_update`], which keeps
//! the patient projection and the append-only history in lockstep. Reads of
//! the history are lazy: [`PatientHistory::iter`] pages through the table
//! newest first and can be restarted any number of times.

use std::collections::VecDeque;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};

use crate::access::{ActingUser, Operation};
use crate::db::patients::{get_active_patient, PatientRow};
use crate::db::records::{
    append_clinical_update, count_records, latest_record, records_page, ClinicalRecord, LedgerCursor,
    Observation,
};
use crate::db::users::get_user;
use crate::db::ClinicDb;
use crate::error::ClinicError;

use super::events::{ClinicEvent, EventBus};
use super::authorize;

/// Rows fetched per round trip when walking a history
pub const HISTORY_PAGE_SIZE: u32 = 50;

/// Everything a staff view of one patient needs
#[derive(Debug, Clone, Serialize)]
pub struct PatientChart {
    pub patient: PatientRow,
    pub latest: Option<ClinicalRecord>,
    pub history: Vec<ClinicalRecord>,
}

/// Service for the clinical record ledger
pub struct LedgerService {
    db: Arc<ClinicDb>,
    events: Arc<EventBus>,
}

impl LedgerService {
    pub fn new(db: Arc<ClinicDb>, events: Arc<EventBus>) -> Self {
        Self { db, events }
    }

    /// Record a clinical observation for a patient.
    ///
    /// Overwrites the projection and appends one history entry in a single
    /// transaction. With `expected_version`, the write is rejected with
    /// `Conflict` unless the projection is still at that version.
    pub fn record_clinical_update(
        &self,
        actor: &ActingUser,
        patient_id: i64,
        observation: &Observation,
        expected_version: Option<i64>,
    ) -> Result<ClinicalRecord, ClinicError> {
        let record = self.db.with_conn_mut(|conn| {
            if get_active_patient(conn, patient_id)?.is_none() {
                return Err(ClinicError::PatientNotFound(patient_id));
            }
            if get_user(conn, actor.id)?.is_none() {
                return Err(ClinicError::AuthorNotFound(actor.id));
            }
            authorize(conn, actor, Operation::WriteClinicalRecord, Some(patient_id))?;
            observation.validate()?;

            append_clinical_update(conn, patient_id, actor.id, observation, expected_version)
        })?;

        info!(
            patient_id,
            record_id = record.id,
            author = actor.id,
            version = record.projection_version,
            "Clinical record added"
        );

        self.events.emit(ClinicEvent::ClinicalRecordAdded {
            actor: actor.clone(),
            patient_id,
            record_id: record.id,
        });

        Ok(record)
    }

    /// Handle on a patient's history; iterate it with [`PatientHistory::iter`]
    pub fn get_patient_history(&self, actor: &ActingUser, patient_id: i64) -> Result<PatientHistory, ClinicError> {
        self.check_read(actor, patient_id)?;
        Ok(PatientHistory {
            db: self.db.clone(),
            patient_id,
            page_size: HISTORY_PAGE_SIZE,
        })
    }

    /// Newest history entry. `RecordNotFound` when there is none yet.
    pub fn get_latest_record(&self, actor: &ActingUser, patient_id: i64) -> Result<ClinicalRecord, ClinicError> {
        self.check_read(actor, patient_id)?;
        self.db
            .with_conn(|conn| latest_record(conn, patient_id))?
            .ok_or(ClinicError::RecordNotFound(patient_id))
    }

    /// Patient, latest entry and full history in one response
    pub fn get_patient_chart(&self, actor: &ActingUser, patient_id: i64) -> Result<PatientChart, ClinicError> {
        let patient = self.check_read(actor, patient_id)?;
        let history = self.get_patient_history(actor, patient_id)?.to_vec()?;
        let latest = history.first().cloned();

        Ok(PatientChart { patient, latest, history })
    }

    fn check_read(&self, actor: &ActingUser, patient_id: i64) -> Result<PatientRow, ClinicError> {
        self.db.with_conn(|conn| {
            let patient = get_active_patient(conn, patient_id)?
                .ok_or(ClinicError::PatientNotFound(patient_id))?;
            authorize(conn, actor, Operation::ReadClinicalHistory, Some(patient_id))?;
            Ok(patient)
        })
    }
}

/// Restartable, newest-first view over one patient's ledger
#[derive(Clone)]
pub struct PatientHistory {
    db: Arc<ClinicDb>,
    patient_id: i64,
    page_size: u32,
}

impl PatientHistory {
    pub fn patient_id(&self) -> i64 {
        self.patient_id
    }

    /// Rows per database round trip
    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Start a fresh walk from the newest entry
    pub fn iter(&self) -> HistoryIter<'_> {
        HistoryIter {
            history: self,
            buffer: VecDeque::new(),
            cursor: None,
            exhausted: false,
        }
    }

    pub fn len(&self) -> Result<usize, ClinicError> {
        let n = self.db.with_conn(|conn| count_records(conn, self.patient_id))?;
        Ok(n as usize)
    }

    pub fn is_empty(&self) -> Result<bool, ClinicError> {
        Ok(self.len()? == 0)
    }

    /// Materialise the whole history
    pub fn to_vec(&self) -> Result<Vec<ClinicalRecord>, ClinicError> {
        self.iter().collect()
    }
}

/// Iterator over a [`PatientHistory`]
pub struct HistoryIter<'a> {
    history: &'a PatientHistory,
    buffer: VecDeque<ClinicalRecord>,
    cursor: Option<LedgerCursor>,
    exhausted: bool,
}

impl Iterator for HistoryIter<'_> {
    type Item = Result<ClinicalRecord, ClinicError>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(record) = self.buffer.pop_front() {
            return Some(Ok(record));
        }
        if self.exhausted {
            return None;
        }

        let history = self.history;
        let page = history.db.with_conn(|conn| {
            records_page(conn, history.patient_id, self.cursor.as_ref(), history.page_size)
        });

        match page {
            Ok(page) => {
                debug!(patient_id = history.patient_id, rows = page.len(), "Fetched history page");
                if page.len() < history.page_size as usize {
                    self.exhausted = true;
                }
                if let Some(last) = page.last() {
                    self.cursor = Some(LedgerCursor::from(last));
                }
                self.buffer.extend(page);
                self.buffer.pop_front().map(Ok)
            }
            Err(e) => {
                self.exhausted = true;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::Role;
    use crate::db::appointments::{insert_appointment, NewAppointment};
    use crate::db::patients::{get_patient, insert_patient, NewPatient};
    use crate::db::users::{create_user, NewStaffUser};
    use chrono::{Duration, Utc};

    struct Fixture {
        service: LedgerService,
        db: Arc<ClinicDb>,
        admin: ActingUser,
        therapist: ActingUser,
        secretary: ActingUser,
        patient: i64,
    }

    fn fixture() -> Fixture {
        let db = Arc::new(ClinicDb::open_in_memory().unwrap());
        let (admin, therapist, secretary, patient) = db
            .with_conn(|conn| {
                let staff = |name: &str, email: &str, role| {
                    create_user(conn, &NewStaffUser { name: name.into(), email: email.into(), role })
                        .map(|u| u.as_acting_user())
                };
                let admin = staff("Admin", "admin@clinic.test", Role::Admin)?;
                let therapist = staff("Dr. Tomas", "tomas@clinic.test", Role::Therapist)?;
                let secretary = staff("Sara", "sara@clinic.test", Role::Secretary)?;
                let patient = insert_patient(conn, &NewPatient { name: "Olga Reis".into(), ..Default::default() }, None)?;
                Ok((admin, therapist, secretary, patient))
            })
            .unwrap();

        Fixture {
            service: LedgerService::new(db.clone(), Arc::new(EventBus::new())),
            db,
            admin,
            therapist,
            secretary,
            patient,
        }
    }

    fn book(f: &Fixture) {
        let start = Utc::now();
        f.db.with_conn(|conn| {
            insert_appointment(conn, &NewAppointment {
                patient_id: f.patient,
                doctor_id: f.therapist.id,
                start_time: start,
                end_time: start + Duration::minutes(50),
                notes: None,
                price: 0.0,
            })
        })
        .unwrap();
    }

    fn obs(level: i32) -> Observation {
        Observation {
            sadness_level: level,
            current_treatment: format!("session {}", level),
            ..Default::default()
        }
    }

    #[test]
    fn test_latest_matches_projection() {
        let f = fixture();
        f.service.record_clinical_update(&f.admin, f.patient, &obs(4), None).unwrap();

        let latest = f.service.get_latest_record(&f.admin, f.patient).unwrap();
        let patient = f.db.with_conn(|conn| get_patient(conn, f.patient)).unwrap().unwrap();
        assert_eq!(latest.observation, obs(4));
        assert_eq!(patient.projection, obs(4));
        assert_eq!(latest.doctor_id, f.admin.id);
    }

    #[test]
    fn test_history_is_newest_first_and_restartable() {
        let f = fixture();
        for level in 1..=7 {
            f.service.record_clinical_update(&f.admin, f.patient, &obs(level), None).unwrap();
        }

        let history = f.service.get_patient_history(&f.admin, f.patient).unwrap().with_page_size(3);
        let first: Vec<i32> = history.iter().map(|r| r.unwrap().observation.sadness_level).collect();
        assert_eq!(first, vec![7, 6, 5, 4, 3, 2, 1]);

        let again: Vec<i32> = history.iter().take(2).map(|r| r.unwrap().observation.sadness_level).collect();
        assert_eq!(again, vec![7, 6]);
        assert_eq!(history.len().unwrap(), 7);

        let latest = f.service.get_latest_record(&f.admin, f.patient).unwrap();
        assert_eq!(history.iter().next().unwrap().unwrap(), latest);
    }

    #[test]
    fn test_empty_history_and_missing_latest() {
        let f = fixture();
        let history = f.service.get_patient_history(&f.admin, f.patient).unwrap();
        assert!(history.iter().next().is_none());
        assert!(history.is_empty().unwrap());

        let err = f.service.get_latest_record(&f.admin, f.patient).unwrap_err();
        assert!(matches!(err, ClinicError::RecordNotFound(_)));
    }

    #[test]
    fn test_unknown_patient_and_author() {
        let f = fixture();
        let err = f.service.record_clinical_update(&f.admin, 4040, &obs(1), None).unwrap_err();
        assert!(matches!(err, ClinicError::PatientNotFound(4040)));

        let ghost = ActingUser::new(999, "Ghost", Role::Admin);
        let err = f.service.record_clinical_update(&ghost, f.patient, &obs(1), None).unwrap_err();
        assert!(matches!(err, ClinicError::AuthorNotFound(999)));

        assert!(matches!(
            f.service.get_patient_history(&f.admin, 4040),
            Err(ClinicError::PatientNotFound(4040))
        ));
    }

    #[test]
    fn test_therapist_needs_appointment() {
        let f = fixture();
        let err = f.service.record_clinical_update(&f.therapist, f.patient, &obs(2), None).unwrap_err();
        assert!(matches!(err, ClinicError::Unauthorized(_)));
        assert!(matches!(
            f.service.get_patient_history(&f.therapist, f.patient),
            Err(ClinicError::Unauthorized(_))
        ));

        book(&f);
        f.service.record_clinical_update(&f.therapist, f.patient, &obs(2), None).unwrap();
        assert_eq!(f.service.get_patient_history(&f.therapist, f.patient).unwrap().len().unwrap(), 1);
    }

    #[test]
    fn test_secretary_denied_clinical_access() {
        let f = fixture();
        let err = f.service.record_clinical_update(&f.secretary, f.patient, &obs(2), None).unwrap_err();
        assert!(matches!(err, ClinicError::Unauthorized(_)));
        assert!(matches!(
            f.service.get_patient_chart(&f.secretary, f.patient),
            Err(ClinicError::Unauthorized(_))
        ));
    }

    #[test]
    fn test_claimed_role_is_checked_against_directory() {
        let f = fixture();
        let posing = ActingUser::new(f.secretary.id, f.secretary.name.clone(), Role::Admin);

        let err = f.service.record_clinical_update(&posing, f.patient, &obs(2), None).unwrap_err();
        assert!(matches!(err, ClinicError::Unauthorized(_)));
        assert!(matches!(
            f.service.get_patient_history(&posing, f.patient),
            Err(ClinicError::Unauthorized(_))
        ));

        let patient = f.db.with_conn(|conn| get_patient(conn, f.patient)).unwrap().unwrap();
        assert_eq!(patient.projection_version, 0);
        assert_eq!(f.db.stats().unwrap().record_count, 0);
    }

    #[test]
    fn test_invalid_levels_change_nothing() {
        let f = fixture();
        let mut bad = obs(3);
        bad.anger_level = 42;
        let err = f.service.record_clinical_update(&f.admin, f.patient, &bad, None).unwrap_err();
        assert!(matches!(err, ClinicError::Validation(_)));

        let patient = f.db.with_conn(|conn| get_patient(conn, f.patient)).unwrap().unwrap();
        assert_eq!(patient.projection_version, 0);
        assert!(f.service.get_patient_history(&f.admin, f.patient).unwrap().is_empty().unwrap());
    }

    #[test]
    fn test_chart_bundles_latest_and_history() {
        let f = fixture();
        f.service.record_clinical_update(&f.admin, f.patient, &obs(1), None).unwrap();
        f.service.record_clinical_update(&f.admin, f.patient, &obs(2), Some(1)).unwrap();

        let chart = f.service.get_patient_chart(&f.admin, f.patient).unwrap();
        assert_eq!(chart.patient.id, f.patient);
        assert_eq!(chart.history.len(), 2);
        assert_eq!(chart.latest.as_ref(), chart.history.first());
        assert_eq!(chart.patient.projection, obs(2));
    }
}
