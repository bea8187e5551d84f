//! Appointment book service
//!
//! Appointments double as the treatment relationship: a therapist may
//! access a patient's clinical data once any appointment links them.

use std::sync::Arc;

use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Utc};
use serde::Serialize;
use tracing::info;

use crate::access::{required_scope, ActingUser, Operation, PatientScope};
use crate::db::appointments::{
    get_appointment, has_treated, insert_appointment, list_agenda, list_for_patient, reschedule_scheduled,
    set_payment_status, transition_from_scheduled, AgendaEntry, AppointmentRow, AppointmentStatus,
    NewAppointment, PaymentStatus, RescheduleAppointment,
};
use crate::db::patients::get_active_patient;
use crate::db::users::get_user;
use crate::db::ClinicDb;
use crate::error::{ClinicError, ValidationErrors};

use super::{authorize, verified_role};
use super::events::{ClinicEvent, EventBus};

/// One day of the agenda
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgendaDay {
    pub date: NaiveDate,
    pub appointments: Vec<AgendaEntry>,
}

/// Sunday-to-Saturday view of the appointment book
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WeekAgenda {
    pub week_start: NaiveDate,
    pub previous_week: NaiveDate,
    pub next_week: NaiveDate,
    pub days: Vec<AgendaDay>,
}

fn check_slot(start: DateTime<Utc>, end: DateTime<Utc>, errors: &mut ValidationErrors) {
    if end <= start {
        errors.add("end_time", "must be after start_time");
    }
}

fn midnight_utc(date: NaiveDate) -> Result<DateTime<Utc>, ClinicError> {
    date.and_hms_opt(0, 0, 0)
        .map(|naive| Utc.from_utc_datetime(&naive))
        .ok_or_else(|| ClinicError::Internal(format!("no midnight on {}", date)))
}

pub struct AppointmentService {
    db: Arc<ClinicDb>,
    events: Arc<EventBus>,
}

impl AppointmentService {
    pub fn new(db: Arc<ClinicDb>, events: Arc<EventBus>) -> Self {
        Self { db, events }
    }

    pub fn schedule(&self, actor: &ActingUser, input: &NewAppointment) -> Result<AppointmentRow, ClinicError> {
        let mut errors = ValidationErrors::new();
        check_slot(input.start_time, input.end_time, &mut errors);
        if input.price.is_nan() || input.price < 0.0 {
            errors.add("price", "must not be negative");
            errors.keep_value("price", input.price.to_string());
        }
        errors.into_result()?;

        let appointment = self.db.with_conn(|conn| {
            authorize(conn, actor, Operation::ManageAppointments, Some(input.patient_id))?;
            if get_active_patient(conn, input.patient_id)?.is_none() {
                return Err(ClinicError::PatientNotFound(input.patient_id));
            }
            if get_user(conn, input.doctor_id)?.is_none() {
                return Err(ClinicError::NotFound(format!("Staff user {}", input.doctor_id)));
            }
            insert_appointment(conn, input)
        })?;

        info!(
            appointment_id = appointment.id,
            patient_id = appointment.patient_id,
            doctor_id = appointment.doctor_id,
            "Appointment scheduled"
        );
        self.events.emit(ClinicEvent::AppointmentScheduled {
            actor: actor.clone(),
            appointment_id: appointment.id,
            patient_id: appointment.patient_id,
        });

        Ok(appointment)
    }

    pub fn cancel(&self, actor: &ActingUser, id: i64) -> Result<AppointmentRow, ClinicError> {
        self.transition(actor, id, AppointmentStatus::Canceled)
    }

    pub fn complete(&self, actor: &ActingUser, id: i64) -> Result<AppointmentRow, ClinicError> {
        self.transition(actor, id, AppointmentStatus::Completed)
    }

    fn transition(&self, actor: &ActingUser, id: i64, status: AppointmentStatus) -> Result<AppointmentRow, ClinicError> {
        let appointment = self.db.with_conn(|conn| {
            let current = get_appointment(conn, id)?
                .ok_or_else(|| ClinicError::NotFound(format!("Appointment {}", id)))?;
            authorize(conn, actor, Operation::ManageAppointments, Some(current.patient_id))?;

            if !transition_from_scheduled(conn, id, status)? {
                return Err(ClinicError::Conflict(format!(
                    "appointment {} is {}, only scheduled appointments can be marked {}",
                    id,
                    current.status.as_str(),
                    status.as_str()
                )));
            }
            get_appointment(conn, id)?.ok_or_else(|| ClinicError::NotFound(format!("Appointment {}", id)))
        })?;

        info!(appointment_id = id, status = status.as_str(), "Appointment status changed");
        self.events.emit(ClinicEvent::AppointmentStatusChanged {
            actor: actor.clone(),
            appointment_id: id,
            status,
        });

        Ok(appointment)
    }

    /// Move a scheduled appointment to another doctor or time slot
    pub fn reschedule(
        &self,
        actor: &ActingUser,
        id: i64,
        slot: &RescheduleAppointment,
    ) -> Result<AppointmentRow, ClinicError> {
        let mut errors = ValidationErrors::new();
        check_slot(slot.start_time, slot.end_time, &mut errors);
        errors.into_result()?;

        let appointment = self.db.with_conn(|conn| {
            let current = get_appointment(conn, id)?
                .ok_or_else(|| ClinicError::NotFound(format!("Appointment {}", id)))?;
            authorize(conn, actor, Operation::ManageAppointments, Some(current.patient_id))?;
            if get_user(conn, slot.doctor_id)?.is_none() {
                return Err(ClinicError::NotFound(format!("Staff user {}", slot.doctor_id)));
            }

            if !reschedule_scheduled(conn, id, slot)? {
                return Err(ClinicError::Conflict(format!(
                    "appointment {} is {}, only scheduled appointments can be rescheduled",
                    id,
                    current.status.as_str()
                )));
            }
            get_appointment(conn, id)?.ok_or_else(|| ClinicError::NotFound(format!("Appointment {}", id)))
        })?;

        info!(appointment_id = id, doctor_id = slot.doctor_id, "Appointment rescheduled");
        self.events.emit(ClinicEvent::AppointmentRescheduled {
            actor: actor.clone(),
            appointment_id: id,
        });

        Ok(appointment)
    }

    pub fn mark_paid(&self, actor: &ActingUser, id: i64) -> Result<AppointmentRow, ClinicError> {
        self.set_payment(actor, id, PaymentStatus::Paid)
    }

    /// Set the payment status to any of pending, paid or exempt
    pub fn set_payment(
        &self,
        actor: &ActingUser,
        id: i64,
        payment: PaymentStatus,
    ) -> Result<AppointmentRow, ClinicError> {
        let appointment = self.db.with_conn(|conn| {
            let current = get_appointment(conn, id)?
                .ok_or_else(|| ClinicError::NotFound(format!("Appointment {}", id)))?;
            authorize(conn, actor, Operation::ManageAppointments, Some(current.patient_id))?;
            set_payment_status(conn, id, payment)?;
            get_appointment(conn, id)?.ok_or_else(|| ClinicError::NotFound(format!("Appointment {}", id)))
        })?;

        info!(appointment_id = id, payment = payment.as_str(), "Appointment payment changed");
        self.events.emit(ClinicEvent::AppointmentPaymentChanged {
            actor: actor.clone(),
            appointment_id: id,
            payment,
        });

        Ok(appointment)
    }

    /// Appointments starting in `[from, to)` with patient and doctor names.
    /// Therapists only see their own.
    pub fn agenda(
        &self,
        actor: &ActingUser,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<AgendaEntry>, ClinicError> {
        if to <= from {
            return Err(ValidationErrors::single("to", "must be after from"));
        }

        self.db.with_conn(|conn| match required_scope(verified_role(conn, actor)?, Operation::ViewAgenda) {
            PatientScope::Any => list_agenda(conn, from, to, None),
            PatientScope::Treated => list_agenda(conn, from, to, Some(actor.id)),
            PatientScope::Denied => authorize(conn, actor, Operation::ViewAgenda, None).map(|_| Vec::new()),
        })
    }

    /// The Sunday-to-Saturday week containing `date`, one entry per day
    pub fn week_agenda(&self, actor: &ActingUser, date: NaiveDate) -> Result<WeekAgenda, ClinicError> {
        let week_start = date - Duration::days(i64::from(date.weekday().num_days_from_sunday()));
        let next_week = week_start + Duration::days(7);

        let entries = self.agenda(actor, midnight_utc(week_start)?, midnight_utc(next_week)?)?;

        let days = (0..7)
            .map(|offset| {
                let day = week_start + Duration::days(offset);
                let key = day.format("%Y-%m-%d").to_string();
                AgendaDay {
                    date: day,
                    appointments: entries.iter().filter(|e| e.start_time.starts_with(&key)).cloned().collect(),
                }
            })
            .collect();

        Ok(WeekAgenda {
            week_start,
            previous_week: week_start - Duration::days(7),
            next_week,
            days,
        })
    }

    /// A patient's appointments, most recent first. Therapists see only
    /// patients they treat.
    pub fn list_for_patient(&self, actor: &ActingUser, patient_id: i64) -> Result<Vec<AppointmentRow>, ClinicError> {
        self.db.with_conn(|conn| {
            if get_active_patient(conn, patient_id)?.is_none() {
                return Err(ClinicError::PatientNotFound(patient_id));
            }
            authorize(conn, actor, Operation::ReadPatient, Some(patient_id))?;
            list_for_patient(conn, patient_id)
        })
    }

    /// Whether the doctor has any appointment with the patient
    pub fn has_treated(&self, doctor_id: i64, patient_id: i64) -> Result<bool, ClinicError> {
        self.db.with_conn(|conn| has_treated(conn, doctor_id, patient_id))
    }
}
