//! Clinical ledger operations
//!
//! `patient_records` is append-only (enforced by triggers). Every append
//! also overwrites the projection columns on `patients` and bumps
//! `projection_version`, inside one transaction.

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ClinicError, ValidationErrors};

use super::now_timestamp;

/// Lowest and highest value on the emotional level scale
pub const LEVEL_RANGE: std::ops::RangeInclusive<i32> = 0..=10;

/// One clinical observation: six emotional levels and the free-text notes.
///
/// Shared by the patient projection and ledger entries; column names are
/// identical in both tables.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Observation {
    #[serde(default)]
    pub anxiety_level: i32,
    #[serde(default)]
    pub anger_level: i32,
    #[serde(default)]
    pub fear_level: i32,
    #[serde(default)]
    pub sadness_level: i32,
    #[serde(default)]
    pub joy_level: i32,
    #[serde(default)]
    pub energy_level: i32,
    #[serde(default)]
    pub main_complaint: String,
    #[serde(default)]
    pub complaint_history: String,
    #[serde(default)]
    pub signs_symptoms: String,
    #[serde(default)]
    pub current_treatment: String,
    #[serde(default)]
    pub notes: String,
}

impl Observation {
    pub(crate) fn from_row(row: &Row) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            anxiety_level: row.get("anxiety_level")?,
            anger_level: row.get("anger_level")?,
            fear_level: row.get("fear_level")?,
            sadness_level: row.get("sadness_level")?,
            joy_level: row.get("joy_level")?,
            energy_level: row.get("energy_level")?,
            main_complaint: row.get("main_complaint")?,
            complaint_history: row.get("complaint_history")?,
            signs_symptoms: row.get("signs_symptoms")?,
            current_treatment: row.get("current_treatment")?,
            notes: row.get("notes")?,
        })
    }

    /// The six levels with their field names
    pub fn levels(&self) -> [(&'static str, i32); 6] {
        [
            ("anxiety_level", self.anxiety_level),
            ("anger_level", self.anger_level),
            ("fear_level", self.fear_level),
            ("sadness_level", self.sadness_level),
            ("joy_level", self.joy_level),
            ("energy_level", self.energy_level),
        ]
    }

    /// Every level must be on the 0-10 scale
    pub fn validate(&self) -> Result<(), ClinicError> {
        let mut errors = ValidationErrors::new();
        for (field, value) in self.levels() {
            if !LEVEL_RANGE.contains(&value) {
                errors.add(field, format!("must be between {} and {}", LEVEL_RANGE.start(), LEVEL_RANGE.end()));
                errors.keep_value(field, value.to_string());
            }
        }
        errors.into_result()
    }
}

/// Immutable ledger entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClinicalRecord {
    pub id: i64,
    pub patient_id: i64,
    pub doctor_id: i64,
    pub record_date: String,
    #[serde(flatten)]
    pub observation: Observation,
    pub projection_version: i64,
}

impl ClinicalRecord {
    fn from_row(row: &Row) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            patient_id: row.get("patient_id")?,
            doctor_id: row.get("doctor_id")?,
            record_date: row.get("record_date")?,
            observation: Observation::from_row(row)?,
            projection_version: row.get("projection_version")?,
        })
    }
}

/// Position in a newest-first walk over a patient's ledger
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerCursor {
    pub record_date: String,
    pub id: i64,
}

impl From<&ClinicalRecord> for LedgerCursor {
    fn from(record: &ClinicalRecord) -> Self {
        Self {
            record_date: record.record_date.clone(),
            id: record.id,
        }
    }
}

/// Get a ledger entry by ID
pub fn get_record(conn: &Connection, id: i64) -> Result<Option<ClinicalRecord>, ClinicError> {
    let record = conn
        .query_row("SELECT * FROM patient_records WHERE id = ?", params![id], |row| {
            ClinicalRecord::from_row(row)
        })
        .optional()?;
    Ok(record)
}

/// Newest ledger entry for a patient
pub fn latest_record(conn: &Connection, patient_id: i64) -> Result<Option<ClinicalRecord>, ClinicError> {
    let record = conn
        .query_row(
            "SELECT * FROM patient_records WHERE patient_id = ? ORDER BY record_date DESC, id DESC LIMIT 1",
            params![patient_id],
            |row| ClinicalRecord::from_row(row),
        )
        .optional()?;
    Ok(record)
}

/// One page of a patient's ledger, newest first, strictly older than `after`
pub fn records_page(
    conn: &Connection,
    patient_id: i64,
    after: Option<&LedgerCursor>,
    limit: u32,
) -> Result<Vec<ClinicalRecord>, ClinicError> {
    let rows = match after {
        None => {
            let mut stmt = conn.prepare(
                "SELECT * FROM patient_records WHERE patient_id = ? ORDER BY record_date DESC, id DESC LIMIT ?",
            )?;
            let rows = stmt
                .query_map(params![patient_id, limit as i64], |row| ClinicalRecord::from_row(row))?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        }
        Some(cursor) => {
            let mut stmt = conn.prepare(
                r#"
                SELECT * FROM patient_records
                WHERE patient_id = ?
                  AND (record_date < ? OR (record_date = ? AND id < ?))
                ORDER BY record_date DESC, id DESC
                LIMIT ?
                "#,
            )?;
            let rows = stmt
                .query_map(
                    params![patient_id, cursor.record_date, cursor.record_date, cursor.id, limit as i64],
                    |row| ClinicalRecord::from_row(row),
                )?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        }
    };

    Ok(rows)
}

/// Number of ledger entries for a patient
pub fn count_records(conn: &Connection, patient_id: i64) -> Result<i64, ClinicError> {
    let n = conn.query_row(
        "SELECT COUNT(*) FROM patient_records WHERE patient_id = ?",
        params![patient_id],
        |row| row.get(0),
    )?;
    Ok(n)
}

/// Apply a clinical update: overwrite the projection and append a ledger
/// entry, all or nothing.
///
/// `expected_version`, when given, must equal the stored
/// `projection_version` or the update is rejected with `Conflict`.
/// The entry's `record_date` never sorts before an existing entry of the
/// same patient, even if the wall clock stepped backwards.
pub fn append_clinical_update(
    conn: &mut Connection,
    patient_id: i64,
    doctor_id: i64,
    observation: &Observation,
    expected_version: Option<i64>,
) -> Result<ClinicalRecord, ClinicError> {
    let tx = conn.transaction()?;

    let current_version: i64 = tx
        .query_row(
            "SELECT projection_version FROM patients WHERE id = ? AND deleted_at IS NULL",
            params![patient_id],
            |row| row.get(0),
        )
        .optional()?
        .ok_or(ClinicError::PatientNotFound(patient_id))?;

    if let Some(expected) = expected_version {
        if expected != current_version {
            return Err(ClinicError::Conflict(format!(
                "patient {} is at version {}, update was based on version {}",
                patient_id, current_version, expected
            )));
        }
    }

    let newest: Option<String> = tx
        .query_row(
            "SELECT MAX(record_date) FROM patient_records WHERE patient_id = ?",
            params![patient_id],
            |row| row.get(0),
        )?;
    let now = now_timestamp();
    let record_date = match newest {
        Some(prev) if prev > now => prev,
        _ => now.clone(),
    };
    let next_version = current_version + 1;

    let updated = tx.execute(
        r#"
        UPDATE patients SET
            anxiety_level = ?, anger_level = ?, fear_level = ?,
            sadness_level = ?, joy_level = ?, energy_level = ?,
            main_complaint = ?, complaint_history = ?, signs_symptoms = ?,
            current_treatment = ?, notes = ?,
            projection_version = ?, updated_at = ?
        WHERE id = ? AND projection_version = ?
        "#,
        params![
            observation.anxiety_level,
            observation.anger_level,
            observation.fear_level,
            observation.sadness_level,
            observation.joy_level,
            observation.energy_level,
            observation.main_complaint,
            observation.complaint_history,
            observation.signs_symptoms,
            observation.current_treatment,
            observation.notes,
            next_version,
            now,
            patient_id,
            current_version,
        ],
    )?;
    if updated != 1 {
        return Err(ClinicError::Internal(format!(
            "projection update for patient {} touched {} rows",
            patient_id, updated
        )));
    }

    tx.execute(
        r#"
        INSERT INTO patient_records (
            patient_id, doctor_id, record_date,
            anxiety_level, anger_level, fear_level, sadness_level, joy_level, energy_level,
            main_complaint, complaint_history, signs_symptoms, current_treatment, notes,
            projection_version
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
        params![
            patient_id,
            doctor_id,
            record_date,
            observation.anxiety_level,
            observation.anger_level,
            observation.fear_level,
            observation.sadness_level,
            observation.joy_level,
            observation.energy_level,
            observation.main_complaint,
            observation.complaint_history,
            observation.signs_symptoms,
            observation.current_treatment,
            observation.notes,
            next_version,
        ],
    )?;
    let record_id = tx.last_insert_rowid();

    tx.commit()?;

    debug!(patient_id, record_id, version = next_version, "Appended clinical record");

    get_record(conn, record_id)?
        .ok_or_else(|| ClinicError::Internal("Record not found after insert".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::Role;
    use crate::db::patients::{get_patient, insert_patient, NewPatient};
    use crate::db::users::{create_user, NewStaffUser};
    use crate::db::ClinicDb;

    fn setup() -> (ClinicDb, i64, i64) {
        let db = ClinicDb::open_in_memory().unwrap();
        let (patient, doctor) = db
            .with_conn(|conn| {
                let p = insert_patient(conn, &NewPatient { name: "Hana Prado".into(), ..Default::default() }, None)?;
                let d = create_user(conn, &NewStaffUser {
                    name: "Dr. Ivo".into(),
                    email: "ivo@clinic.test".into(),
                    role: Role::Admin,
                })?;
                Ok((p, d.id))
            })
            .unwrap();
        (db, patient, doctor)
    }

    fn obs(level: i32, complaint: &str) -> Observation {
        Observation {
            anxiety_level: level,
            joy_level: 10 - level,
            main_complaint: complaint.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_append_updates_projection_and_ledger() {
        let (db, patient, doctor) = setup();
        let record = db
            .with_conn_mut(|conn| append_clinical_update(conn, patient, doctor, &obs(7, "insomnia"), None))
            .unwrap();

        assert_eq!(record.projection_version, 1);
        assert_eq!(record.observation, obs(7, "insomnia"));

        let p = db.with_conn(|conn| get_patient(conn, patient)).unwrap().unwrap();
        assert_eq!(p.projection, record.observation);
        assert_eq!(p.projection_version, 1);

        let latest = db.with_conn(|conn| latest_record(conn, patient)).unwrap().unwrap();
        assert_eq!(latest, record);
    }

    #[test]
    fn test_stale_version_rejected() {
        let (db, patient, doctor) = setup();
        db.with_conn_mut(|conn| append_clinical_update(conn, patient, doctor, &obs(1, "a"), Some(0)))
            .unwrap();

        let err = db
            .with_conn_mut(|conn| append_clinical_update(conn, patient, doctor, &obs(2, "b"), Some(0)))
            .unwrap_err();
        assert!(matches!(err, ClinicError::Conflict(_)));
        assert_eq!(db.with_conn(|conn| count_records(conn, patient)).unwrap(), 1);
    }

    #[test]
    fn test_unknown_patient() {
        let (db, _, doctor) = setup();
        let err = db
            .with_conn_mut(|conn| append_clinical_update(conn, 999, doctor, &obs(1, "a"), None))
            .unwrap_err();
        assert!(matches!(err, ClinicError::PatientNotFound(999)));
    }

    #[test]
    fn test_ledger_rows_are_immutable() {
        let (db, patient, doctor) = setup();
        let record = db
            .with_conn_mut(|conn| append_clinical_update(conn, patient, doctor, &obs(3, "c"), None))
            .unwrap();

        let update = db.with_conn(|conn| {
            conn.execute("UPDATE patient_records SET notes = 'x' WHERE id = ?", params![record.id])?;
            Ok(())
        });
        assert!(update.is_err());

        let delete = db.with_conn(|conn| {
            conn.execute("DELETE FROM patient_records WHERE id = ?", params![record.id])?;
            Ok(())
        });
        assert!(delete.is_err());
    }

    #[test]
    fn test_pages_walk_newest_first() {
        let (db, patient, doctor) = setup();
        for i in 0..5 {
            db.with_conn_mut(|conn| append_clinical_update(conn, patient, doctor, &obs(i, "x"), None))
                .unwrap();
        }

        let first = db.with_conn(|conn| records_page(conn, patient, None, 2)).unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].projection_version, 5);
        assert_eq!(first[1].projection_version, 4);

        let cursor = LedgerCursor::from(&first[1]);
        let second = db.with_conn(|conn| records_page(conn, patient, Some(&cursor), 10)).unwrap();
        let versions: Vec<i64> = second.iter().map(|r| r.projection_version).collect();
        assert_eq!(versions, vec![3, 2, 1]);
    }

    #[test]
    fn test_out_of_range_levels_fail_validation() {
        let mut o = obs(5, "x");
        assert!(o.validate().is_ok());
        o.fear_level = 11;
        o.energy_level = -1;
        match o.validate() {
            Err(ClinicError::Validation(errors)) => {
                assert!(errors.has("fear_level"));
                assert!(errors.has("energy_level"));
                assert_eq!(errors.submitted.get("fear_level").map(String::as_str), Some("11"));
            }
            other => panic!("expected validation error, got {:?}", other),
        }
    }
}
