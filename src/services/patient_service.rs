//! Patient directory service

use std::sync::Arc;

use serde::Serialize;
use tracing::info;

use crate::access::{required_scope, ActingUser, Operation, PatientScope};
use crate::db::patients::{
    get_active_patient, insert_patient, list_pending_consents, list_treated_patients, search_patients,
    search_treated_patients, soft_delete_patient, update_demographics, DemographicsUpdate, NewPatient, PatientRow, PendingConsent,
};
use crate::db::ClinicDb;
use crate::error::{ClinicError, ValidationErrors};
use crate::token::{generate_access_token, portal_link};

use super::{authorize, verified_role};
use super::events::{ClinicEvent, EventBus};

/// Default page size for searches and listings
pub const DEFAULT_LIST_LIMIT: u32 = 50;

/// A newly created patient together with its portal token
#[derive(Debug, Clone, Serialize)]
pub struct IssuedPatient {
    pub patient: PatientRow,
    pub token: String,
    pub portal_link: String,
}

pub struct PatientService {
    db: Arc<ClinicDb>,
    events: Arc<EventBus>,
    portal_base_url: String,
}

impl PatientService {
    pub fn new(db: Arc<ClinicDb>, events: Arc<EventBus>, portal_base_url: String) -> Self {
        Self {
            db,
            events,
            portal_base_url,
        }
    }

    /// Register a patient and issue its portal token
    pub fn create_patient(&self, actor: &ActingUser, input: &NewPatient) -> Result<IssuedPatient, ClinicError> {
        if input.name.trim().is_empty() {
            return Err(ValidationErrors::single("name", "Name is required"));
        }

        let token = generate_access_token();
        let patient = self.db.with_conn(|conn| {
            authorize(conn, actor, Operation::CreatePatient, None)?;
            let id = insert_patient(conn, input, Some(&token))?;
            get_active_patient(conn, id)?
                .ok_or_else(|| ClinicError::Internal("Patient not found after insert".to_string()))
        })?;

        info!(patient_id = patient.id, created_by = actor.id, "Patient created");
        self.events.emit(ClinicEvent::PatientCreated {
            actor: actor.clone(),
            patient_id: patient.id,
        });

        Ok(IssuedPatient {
            portal_link: portal_link(&self.portal_base_url, &token),
            token,
            patient,
        })
    }

    pub fn get_patient(&self, actor: &ActingUser, id: i64) -> Result<PatientRow, ClinicError> {
        self.db.with_conn(|conn| {
            let patient = get_active_patient(conn, id)?.ok_or(ClinicError::PatientNotFound(id))?;
            authorize(conn, actor, Operation::ReadPatient, Some(id))?;
            Ok(patient)
        })
    }

    /// Name prefix search. Therapists only see patients they treat.
    pub fn search_patients(&self, actor: &ActingUser, term: &str, limit: u32) -> Result<Vec<PatientRow>, ClinicError> {
        self.db.with_conn(|conn| match required_scope(verified_role(conn, actor)?, Operation::ReadPatient) {
            PatientScope::Any => search_patients(conn, term, limit),
            PatientScope::Treated => search_treated_patients(conn, actor.id, term, limit),
            PatientScope::Denied => authorize(conn, actor, Operation::ReadPatient, None).map(|_| Vec::new()),
        })
    }

    /// Patients with an appointment with `doctor_id`. Therapists may only
    /// list their own.
    pub fn list_treated_patients(&self, actor: &ActingUser, doctor_id: i64) -> Result<Vec<PatientRow>, ClinicError> {
        self.db.with_conn(|conn| {
            match required_scope(verified_role(conn, actor)?, Operation::ReadPatient) {
                PatientScope::Any => {}
                PatientScope::Treated if doctor_id == actor.id => {}
                _ => {
                    return Err(ClinicError::Unauthorized(format!(
                        "{} may not list patients of user {}",
                        actor, doctor_id
                    )))
                }
            }
            list_treated_patients(conn, doctor_id)
        })
    }

    /// Patients who have not completed the consent portal, with their tokens
    pub fn list_pending_consents(&self, actor: &ActingUser, limit: u32) -> Result<Vec<PendingConsent>, ClinicError> {
        self.db.with_conn(|conn| {
            authorize(conn, actor, Operation::CreatePatient, None)?;
            list_pending_consents(conn, limit)
        })
    }

    /// Change identity fields. Clinical and consent data are never touched.
    pub fn update_demographics(
        &self,
        actor: &ActingUser,
        id: i64,
        update: &DemographicsUpdate,
    ) -> Result<PatientRow, ClinicError> {
        if matches!(&update.name, Some(name) if name.trim().is_empty()) {
            return Err(ValidationErrors::single("name", "Name cannot be blank"));
        }

        let patient = self.db.with_conn(|conn| {
            authorize(conn, actor, Operation::UpdateDemographics, Some(id))?;
            if !update_demographics(conn, id, update)? {
                return Err(ClinicError::PatientNotFound(id));
            }
            get_active_patient(conn, id)?.ok_or(ClinicError::PatientNotFound(id))
        })?;

        info!(patient_id = id, updated_by = actor.id, "Patient demographics updated");
        self.events.emit(ClinicEvent::PatientUpdated {
            actor: actor.clone(),
            patient_id: id,
        });

        Ok(patient)
    }

    /// Soft delete. The clinical ledger is kept.
    pub fn delete_patient(&self, actor: &ActingUser, id: i64) -> Result<(), ClinicError> {
        self.db.with_conn(|conn| {
            authorize(conn, actor, Operation::DeletePatient, Some(id))?;
            if !soft_delete_patient(conn, id)? {
                return Err(ClinicError::PatientNotFound(id));
            }
            Ok(())
        })?;

        info!(patient_id = id, deleted_by = actor.id, "Patient deleted");
        self.events.emit(ClinicEvent::PatientDeleted {
            actor: actor.clone(),
            patient_id: id,
        });

        Ok(())
    }
}
