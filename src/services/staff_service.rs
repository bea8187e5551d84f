//! Staff directory service

use std::sync::Arc;

use tracing::info;

use crate::access::{ActingUser, Operation};
use crate::db::appointments::count_open_for_doctor;
use crate::db::users::{
    count_authored_records, create_user, delete_user, get_user, list_users, update_user, NewStaffUser, StaffUpdate,
    StaffUser,
};
use crate::db::ClinicDb;
use crate::error::{ClinicError, ValidationErrors};

use super::authorize;
use super::events::{ClinicEvent, EventBus};

pub struct StaffService {
    db: Arc<ClinicDb>,
    events: Arc<EventBus>,
}

impl StaffService {
    pub fn new(db: Arc<ClinicDb>, events: Arc<EventBus>) -> Self {
        Self { db, events }
    }

    /// Create a staff user. Without an acting user this bootstraps the
    /// first admin and is refused once any user exists.
    pub fn create_user(&self, actor: Option<&ActingUser>, input: &NewStaffUser) -> Result<StaffUser, ClinicError> {
        let mut errors = ValidationErrors::new();
        if input.name.trim().is_empty() {
            errors.add("name", "Name is required");
        }
        if !input.email.contains('@') {
            errors.add("email", "Email address is invalid");
            errors.keep_value("email", input.email.clone());
        }
        errors.into_result()?;

        let user = self.db.with_conn(|conn| {
            match actor {
                Some(actor) => authorize(conn, actor, Operation::ManageStaff, None)?,
                None => {
                    if !list_users(conn)?.is_empty() {
                        return Err(ClinicError::Unauthorized(
                            "an acting admin is required once staff exists".to_string(),
                        ));
                    }
                }
            }
            create_user(conn, input)
        })?;

        info!(user_id = user.id, role = %user.role, "Staff user created");
        if let Some(actor) = actor {
            self.events.emit(ClinicEvent::StaffCreated {
                actor: actor.clone(),
                user_id: user.id,
            });
        }

        Ok(user)
    }

    /// Resolve a staff id to the user record
    pub fn get_user(&self, id: i64) -> Result<StaffUser, ClinicError> {
        self.db
            .with_conn(|conn| get_user(conn, id))?
            .ok_or_else(|| ClinicError::NotFound(format!("Staff user {}", id)))
    }

    pub fn list_users(&self, actor: &ActingUser) -> Result<Vec<StaffUser>, ClinicError> {
        self.db.with_conn(|conn| {
            authorize(conn, actor, Operation::ManageStaff, None)?;
            list_users(conn)
        })
    }

    /// Change a staff user's name, email or role. Absent fields are kept.
    pub fn update_user(&self, actor: &ActingUser, id: i64, update: &StaffUpdate) -> Result<StaffUser, ClinicError> {
        let mut errors = ValidationErrors::new();
        if update.name.as_deref().is_some_and(|name| name.trim().is_empty()) {
            errors.add("name", "Name is required");
        }
        if let Some(email) = update.email.as_deref().filter(|email| !email.contains('@')) {
            errors.add("email", "Email address is invalid");
            errors.keep_value("email", email.to_string());
        }
        errors.into_result()?;

        let user = self.db.with_conn(|conn| {
            authorize(conn, actor, Operation::ManageStaff, None)?;
            if !update_user(conn, id, update)? {
                return Err(ClinicError::NotFound(format!("Staff user {}", id)));
            }
            get_user(conn, id)?.ok_or_else(|| ClinicError::NotFound(format!("Staff user {}", id)))
        })?;

        info!(user_id = id, role = %user.role, updated_by = actor.id, "Staff user updated");
        self.events.emit(ClinicEvent::StaffUpdated {
            actor: actor.clone(),
            user_id: id,
        });

        Ok(user)
    }

    /// Delete a staff user. Refused while the user authored clinical records
    /// or still has appointments that are not canceled.
    pub fn delete_user(&self, actor: &ActingUser, id: i64) -> Result<(), ClinicError> {
        self.db.with_conn(|conn| {
            authorize(conn, actor, Operation::ManageStaff, None)?;
            let authored = count_authored_records(conn, id)?;
            if authored > 0 {
                return Err(ClinicError::Conflict(format!(
                    "user {} authored {} clinical records and cannot be deleted",
                    id, authored
                )));
            }
            let booked = count_open_for_doctor(conn, id)?;
            if booked > 0 {
                return Err(ClinicError::Conflict(format!(
                    "user {} has {} appointments on the book and cannot be deleted",
                    id, booked
                )));
            }
            if !delete_user(conn, id)? {
                return Err(ClinicError::NotFound(format!("Staff user {}", id)));
            }
            Ok(())
        })?;

        info!(user_id = id, deleted_by = actor.id, "Staff user deleted");
        self.events.emit(ClinicEvent::StaffDeleted {
            actor: actor.clone(),
            user_id: id,
        });

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::Role;
    use crate::db::patients::{insert_patient, NewPatient};
    use crate::db::records::{append_clinical_update, Observation};

    fn staff(name: &str, role: Role) -> NewStaffUser {
        NewStaffUser {
            name: name.into(),
            email: format!("{}@clinic.test", name.to_lowercase()),
            role,
        }
    }

    #[test]
    fn test_bootstrap_then_admin_only() {
        let db = Arc::new(ClinicDb::open_in_memory().unwrap());
        let svc = StaffService::new(db, Arc::new(EventBus::new()));

        let admin = svc.create_user(None, &staff("Root", Role::Admin)).unwrap().as_acting_user();
        assert!(matches!(
            svc.create_user(None, &staff("Sneaky", Role::Admin)),
            Err(ClinicError::Unauthorized(_))
        ));

        let secretary = svc.create_user(Some(&admin), &staff("Sol", Role::Secretary)).unwrap().as_acting_user();
        assert!(matches!(
            svc.create_user(Some(&secretary), &staff("Other", Role::Therapist)),
            Err(ClinicError::Unauthorized(_))
        ));
        assert_eq!(svc.list_users(&admin).unwrap().len(), 2);
    }

    #[test]
    fn test_invalid_email() {
        let db = Arc::new(ClinicDb::open_in_memory().unwrap());
        let svc = StaffService::new(db, Arc::new(EventBus::new()));
        let mut input = staff("Root", Role::Admin);
        input.email = "nope".into();
        assert!(matches!(svc.create_user(None, &input), Err(ClinicError::Validation(_))));
    }

    #[test]
    fn test_author_cannot_be_deleted() {
        let db = Arc::new(ClinicDb::open_in_memory().unwrap());
        let svc = StaffService::new(db.clone(), Arc::new(EventBus::new()));
        let admin = svc.create_user(None, &staff("Root", Role::Admin)).unwrap().as_acting_user();
        let author = svc.create_user(Some(&admin), &staff("Writer", Role::Admin)).unwrap();
        let idle = svc.create_user(Some(&admin), &staff("Idle", Role::Therapist)).unwrap();

        db.with_conn_mut(|conn| {
            let patient = insert_patient(conn, &NewPatient { name: "Ana Lopes".into(), ..Default::default() }, None)?;
            append_clinical_update(conn, patient, author.id, &Observation::default(), None)
        })
        .unwrap();

        assert!(matches!(svc.delete_user(&admin, author.id), Err(ClinicError::Conflict(_))));
        svc.delete_user(&admin, idle.id).unwrap();
        assert!(matches!(svc.get_user(idle.id), Err(ClinicError::NotFound(_))));
    }

    #[test]
    fn test_booked_therapist_cannot_be_deleted() {
        use crate::db::appointments::{insert_appointment, transition_from_scheduled, AppointmentStatus, NewAppointment};
        use chrono::{Duration, Utc};

        let db = Arc::new(ClinicDb::open_in_memory().unwrap());
        let svc = StaffService::new(db.clone(), Arc::new(EventBus::new()));
        let admin = svc.create_user(None, &staff("Root", Role::Admin)).unwrap().as_acting_user();
        let therapist = svc.create_user(Some(&admin), &staff("Busy", Role::Therapist)).unwrap();

        let appointment = db
            .with_conn(|conn| {
                let patient = insert_patient(conn, &NewPatient { name: "Bia Reis".into(), ..Default::default() }, None)?;
                let start = Utc::now();
                insert_appointment(conn, &NewAppointment {
                    patient_id: patient,
                    doctor_id: therapist.id,
                    start_time: start,
                    end_time: start + Duration::minutes(30),
                    notes: None,
                    price: 0.0,
                })
            })
            .unwrap();

        assert!(matches!(svc.delete_user(&admin, therapist.id), Err(ClinicError::Conflict(_))));

        db.with_conn(|conn| transition_from_scheduled(conn, appointment.id, AppointmentStatus::Canceled))
            .unwrap();
        svc.delete_user(&admin, therapist.id).unwrap();
    }

    #[test]
    fn test_role_change_applies_to_next_request() {
        let db = Arc::new(ClinicDb::open_in_memory().unwrap());
        let svc = StaffService::new(db, Arc::new(EventBus::new()));
        let admin = svc.create_user(None, &staff("Root", Role::Admin)).unwrap().as_acting_user();
        let sol = svc.create_user(Some(&admin), &staff("Sol", Role::Secretary)).unwrap();

        let promoted = svc
            .update_user(&admin, sol.id, &StaffUpdate {
                name: Some("Sol Andrade".into()),
                role: Some(Role::Admin),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(promoted.name, "Sol Andrade");
        assert_eq!(promoted.email, "sol@clinic.test");
        assert_eq!(promoted.role, Role::Admin);
        assert_eq!(svc.list_users(&promoted.as_acting_user()).unwrap().len(), 2);

        // an identity resolved before the change no longer matches the directory
        assert!(matches!(svc.list_users(&sol.as_acting_user()), Err(ClinicError::Unauthorized(_))));

        let blank = StaffUpdate { name: Some("  ".into()), email: Some("nope".into()), role: None };
        match svc.update_user(&admin, sol.id, &blank) {
            Err(ClinicError::Validation(e)) => assert!(e.has("name") && e.has("email")),
            other => panic!("expected validation error, got {:?}", other),
        }
        assert!(matches!(
            svc.update_user(&admin, 999, &StaffUpdate::default()),
            Err(ClinicError::NotFound(_))
        ));
    }
}
