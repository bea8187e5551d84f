//! Appointment book operations

use std::str::FromStr;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use crate::error::ClinicError;

use super::{format_timestamp, now_timestamp};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppointmentStatus {
    Scheduled,
    Completed,
    Canceled,
}

impl AppointmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppointmentStatus::Scheduled => "scheduled",
            AppointmentStatus::Completed => "completed",
            AppointmentStatus::Canceled => "canceled",
        }
    }
}

impl FromStr for AppointmentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(AppointmentStatus::Scheduled),
            "completed" => Ok(AppointmentStatus::Completed),
            "canceled" => Ok(AppointmentStatus::Canceled),
            other => Err(format!("unknown appointment status '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Pending,
    Paid,
    Exempt,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Paid => "paid",
            PaymentStatus::Exempt => "exempt",
        }
    }
}

impl FromStr for PaymentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(PaymentStatus::Pending),
            "paid" => Ok(PaymentStatus::Paid),
            "exempt" => Ok(PaymentStatus::Exempt),
            other => Err(format!("unknown payment status '{}'", other)),
        }
    }
}

fn parse_column<T: FromStr<Err = String>>(row: &Row, column: &str) -> Result<T, rusqlite::Error> {
    let raw: String = row.get(column)?;
    raw.parse::<T>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, e.into())
    })
}

/// Appointment row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppointmentRow {
    pub id: i64,
    pub patient_id: i64,
    pub doctor_id: i64,
    pub start_time: String,
    pub end_time: String,
    pub status: AppointmentStatus,
    pub notes: Option<String>,
    pub price: f64,
    pub payment_status: PaymentStatus,
    pub created_at: String,
    pub updated_at: String,
}

impl AppointmentRow {
    fn from_row(row: &Row) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            patient_id: row.get("patient_id")?,
            doctor_id: row.get("doctor_id")?,
            start_time: row.get("start_time")?,
            end_time: row.get("end_time")?,
            status: parse_column(row, "status")?,
            notes: row.get("notes")?,
            price: row.get("price")?,
            payment_status: parse_column(row, "payment_status")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }
}

/// Input for booking an appointment
#[derive(Debug, Clone, Deserialize)]
pub struct NewAppointment {
    pub patient_id: i64,
    pub doctor_id: i64,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub price: f64,
}

/// New doctor and time slot for an existing appointment
#[derive(Debug, Clone, Deserialize)]
pub struct RescheduleAppointment {
    pub doctor_id: i64,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

/// Appointment joined with the patient and doctor names, for agenda views
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgendaEntry {
    pub id: i64,
    pub patient_id: i64,
    pub patient_name: String,
    pub doctor_id: i64,
    pub doctor_name: String,
    pub start_time: String,
    pub end_time: String,
    pub status: AppointmentStatus,
    pub payment_status: PaymentStatus,
}

impl AgendaEntry {
    fn from_row(row: &Row) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            patient_id: row.get("patient_id")?,
            patient_name: row.get("patient_name")?,
            doctor_id: row.get("doctor_id")?,
            doctor_name: row.get("doctor_name")?,
            start_time: row.get("start_time")?,
            end_time: row.get("end_time")?,
            status: parse_column(row, "status")?,
            payment_status: parse_column(row, "payment_status")?,
        })
    }
}

const AGENDA_SELECT: &str = r#"
    SELECT a.id, a.patient_id, p.name AS patient_name, a.doctor_id, u.name AS doctor_name,
           a.start_time, a.end_time, a.status, a.payment_status
    FROM appointments a
    JOIN patients p ON a.patient_id = p.id
    JOIN users u ON a.doctor_id = u.id
"#;

/// Insert an appointment in the `scheduled` state
pub fn insert_appointment(conn: &Connection, input: &NewAppointment) -> Result<AppointmentRow, ClinicError> {
    let now = now_timestamp();

    conn.execute(
        r#"
        INSERT INTO appointments (
            patient_id, doctor_id, start_time, end_time, status, notes, price,
            payment_status, created_at, updated_at
        ) VALUES (?, ?, ?, ?, 'scheduled', ?, ?, 'pending', ?, ?)
        "#,
        params![
            input.patient_id,
            input.doctor_id,
            format_timestamp(input.start_time),
            format_timestamp(input.end_time),
            input.notes,
            input.price,
            now,
            now,
        ],
    )?;

    let id = conn.last_insert_rowid();
    get_appointment(conn, id)?
        .ok_or_else(|| ClinicError::Internal("Appointment not found after insert".to_string()))
}

/// Get an appointment by ID
pub fn get_appointment(conn: &Connection, id: i64) -> Result<Option<AppointmentRow>, ClinicError> {
    let appointment = conn
        .query_row("SELECT * FROM appointments WHERE id = ?", params![id], |row| {
            AppointmentRow::from_row(row)
        })
        .optional()?;
    Ok(appointment)
}

/// All appointments of a patient, most recent start first
pub fn list_for_patient(conn: &Connection, patient_id: i64) -> Result<Vec<AppointmentRow>, ClinicError> {
    let mut stmt = conn.prepare(
        "SELECT * FROM appointments WHERE patient_id = ? ORDER BY start_time DESC, id DESC",
    )?;
    let rows = stmt
        .query_map(params![patient_id], |row| AppointmentRow::from_row(row))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Move a scheduled appointment to `status`.
///
/// Returns false when the appointment does not exist or is no longer
/// scheduled.
pub fn transition_from_scheduled(
    conn: &Connection,
    id: i64,
    status: AppointmentStatus,
) -> Result<bool, ClinicError> {
    let changes = conn.execute(
        "UPDATE appointments SET status = ?, updated_at = ? WHERE id = ? AND status = 'scheduled'",
        params![status.as_str(), now_timestamp(), id],
    )?;
    Ok(changes > 0)
}

/// Move a scheduled appointment to another doctor or time slot.
///
/// Returns false when the appointment does not exist or is no longer
/// scheduled.
pub fn reschedule_scheduled(
    conn: &Connection,
    id: i64,
    slot: &RescheduleAppointment,
) -> Result<bool, ClinicError> {
    let changes = conn.execute(
        r#"
        UPDATE appointments SET doctor_id = ?, start_time = ?, end_time = ?, updated_at = ?
        WHERE id = ? AND status = 'scheduled'
        "#,
        params![
            slot.doctor_id,
            format_timestamp(slot.start_time),
            format_timestamp(slot.end_time),
            now_timestamp(),
            id,
        ],
    )?;
    Ok(changes > 0)
}

/// Set the payment status. Returns false when the appointment does not exist.
pub fn set_payment_status(conn: &Connection, id: i64, payment: PaymentStatus) -> Result<bool, ClinicError> {
    let changes = conn.execute(
        "UPDATE appointments SET payment_status = ?, updated_at = ? WHERE id = ?",
        params![payment.as_str(), now_timestamp(), id],
    )?;
    Ok(changes > 0)
}

/// Whether `doctor_id` has any appointment with `patient_id`, in any status
pub fn has_treated(conn: &Connection, doctor_id: i64, patient_id: i64) -> Result<bool, ClinicError> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM appointments WHERE doctor_id = ? AND patient_id = ?)",
        params![doctor_id, patient_id],
        |row| row.get(0),
    )?;
    Ok(exists)
}

/// Appointments of a doctor that are not canceled
pub fn count_open_for_doctor(conn: &Connection, doctor_id: i64) -> Result<i64, ClinicError> {
    let n = conn.query_row(
        "SELECT COUNT(*) FROM appointments WHERE doctor_id = ? AND status != 'canceled'",
        params![doctor_id],
        |row| row.get(0),
    )?;
    Ok(n)
}

/// Appointments starting in `[from, to)`, earliest first, optionally for
/// one doctor only. Soft-deleted patients are left out.
pub fn list_agenda(
    conn: &Connection,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
    doctor_id: Option<i64>,
) -> Result<Vec<AgendaEntry>, ClinicError> {
    let sql = format!(
        "{} WHERE a.start_time >= ?1 AND a.start_time < ?2 AND p.deleted_at IS NULL \
         AND (?3 IS NULL OR a.doctor_id = ?3) ORDER BY a.start_time ASC, a.id ASC",
        AGENDA_SELECT
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(
            params![format_timestamp(from), format_timestamp(to), doctor_id],
            |row| AgendaEntry::from_row(row),
        )?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Next appointments starting at or after `from`
pub fn list_upcoming(conn: &Connection, from: DateTime<Utc>, limit: u32) -> Result<Vec<AgendaEntry>, ClinicError> {
    let sql = format!(
        "{} WHERE a.start_time >= ?1 AND p.deleted_at IS NULL ORDER BY a.start_time ASC, a.id ASC LIMIT ?2",
        AGENDA_SELECT
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params![format_timestamp(from), limit as i64], |row| AgendaEntry::from_row(row))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Completed appointments that started at or after `since`
pub fn count_completed_since(conn: &Connection, since: DateTime<Utc>) -> Result<i64, ClinicError> {
    let n = conn.query_row(
        "SELECT COUNT(*) FROM appointments WHERE status = 'completed' AND start_time >= ?",
        params![format_timestamp(since)],
        |row| row.get(0),
    )?;
    Ok(n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::Role;
    use crate::db::patients::{insert_patient, NewPatient};
    use crate::db::users::{create_user, NewStaffUser};
    use crate::db::ClinicDb;
    use chrono::{Duration, TimeZone};

    fn booking(patient_id: i64, doctor_id: i64) -> NewAppointment {
        let start = Utc.with_ymd_and_hms(2024, 5, 6, 14, 0, 0).unwrap();
        NewAppointment {
            patient_id,
            doctor_id,
            start_time: start,
            end_time: start + Duration::minutes(50),
            notes: None,
            price: 180.0,
        }
    }

    fn setup() -> (ClinicDb, i64, i64) {
        let db = ClinicDb::open_in_memory().unwrap();
        let ids = db
            .with_conn(|conn| {
                let p = insert_patient(conn, &NewPatient { name: "Caio Lima".into(), ..Default::default() }, None)?;
                let d = create_user(conn, &NewStaffUser {
                    name: "Dr. Leda".into(),
                    email: "leda@clinic.test".into(),
                    role: Role::Therapist,
                })?;
                Ok((p, d.id))
            })
            .unwrap();
        (db, ids.0, ids.1)
    }

    #[test]
    fn test_has_treated_follows_bookings() {
        let (db, patient, doctor) = setup();
        assert!(!db.with_conn(|conn| has_treated(conn, doctor, patient)).unwrap());

        let appt = db.with_conn(|conn| insert_appointment(conn, &booking(patient, doctor))).unwrap();
        assert_eq!(appt.status, AppointmentStatus::Scheduled);
        assert_eq!(appt.payment_status, PaymentStatus::Pending);
        assert_eq!(appt.start_time, "2024-05-06T14:00:00.000000Z");

        // canceled bookings still count
        db.with_conn(|conn| transition_from_scheduled(conn, appt.id, AppointmentStatus::Canceled))
            .unwrap();
        assert!(db.with_conn(|conn| has_treated(conn, doctor, patient)).unwrap());
    }

    #[test]
    fn test_transitions_only_from_scheduled() {
        let (db, patient, doctor) = setup();
        let appt = db.with_conn(|conn| insert_appointment(conn, &booking(patient, doctor))).unwrap();

        assert!(db
            .with_conn(|conn| transition_from_scheduled(conn, appt.id, AppointmentStatus::Completed))
            .unwrap());
        assert!(!db
            .with_conn(|conn| transition_from_scheduled(conn, appt.id, AppointmentStatus::Canceled))
            .unwrap());

        let stored = db.with_conn(|conn| get_appointment(conn, appt.id)).unwrap().unwrap();
        assert_eq!(stored.status, AppointmentStatus::Completed);
    }

    #[test]
    fn test_reschedule_only_while_scheduled() {
        let (db, patient, doctor) = setup();
        let appt = db.with_conn(|conn| insert_appointment(conn, &booking(patient, doctor))).unwrap();
        let start = Utc.with_ymd_and_hms(2024, 5, 8, 10, 0, 0).unwrap();
        let slot = RescheduleAppointment {
            doctor_id: doctor,
            start_time: start,
            end_time: start + Duration::hours(1),
        };

        assert!(db.with_conn(|conn| reschedule_scheduled(conn, appt.id, &slot)).unwrap());
        let moved = db.with_conn(|conn| get_appointment(conn, appt.id)).unwrap().unwrap();
        assert_eq!(moved.start_time, "2024-05-08T10:00:00.000000Z");
        assert_eq!(moved.end_time, "2024-05-08T11:00:00.000000Z");

        db.with_conn(|conn| transition_from_scheduled(conn, appt.id, AppointmentStatus::Completed))
            .unwrap();
        assert!(!db.with_conn(|conn| reschedule_scheduled(conn, appt.id, &slot)).unwrap());
    }

    #[test]
    fn test_agenda_range_is_half_open_and_named() {
        let (db, patient, doctor) = setup();
        db.with_conn(|conn| insert_appointment(conn, &booking(patient, doctor))).unwrap();

        let from = Utc.with_ymd_and_hms(2024, 5, 6, 0, 0, 0).unwrap();
        let at_start = Utc.with_ymd_and_hms(2024, 5, 6, 14, 0, 0).unwrap();
        let entries = db
            .with_conn(|conn| list_agenda(conn, from, from + Duration::days(1), None))
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].patient_name, "Caio Lima");
        assert_eq!(entries[0].doctor_name, "Dr. Leda");

        assert!(db.with_conn(|conn| list_agenda(conn, from, at_start, None)).unwrap().is_empty());
        assert!(db
            .with_conn(|conn| list_agenda(conn, from, from + Duration::days(1), Some(doctor + 1)))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_mark_paid() {
        let (db, patient, doctor) = setup();
        let appt = db.with_conn(|conn| insert_appointment(conn, &booking(patient, doctor))).unwrap();
        assert!(db.with_conn(|conn| set_payment_status(conn, appt.id, PaymentStatus::Paid)).unwrap());
        assert!(!db.with_conn(|conn| set_payment_status(conn, 404, PaymentStatus::Paid)).unwrap());

        let list = db.with_conn(|conn| list_for_patient(conn, patient)).unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].payment_status, PaymentStatus::Paid);
    }
}
