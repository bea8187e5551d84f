//! Patient CRUD operations
//!
//! The clinical projection columns are written only by `records`; nothing
//! in this module touches them.

use std::collections::BTreeMap;

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ClinicError;

use super::now_timestamp;
use super::records::Observation;

/// Patient row from database
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatientRow {
    pub id: i64,
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub mobile: Option<String>,
    pub dob: Option<String>,
    pub profession: Option<String>,
    pub address_street: Option<String>,
    pub address_number: Option<String>,
    pub address_neighborhood: Option<String>,
    pub address_city: Option<String>,
    pub address_state: Option<String>,
    /// Current clinical state, equal to the newest ledger entry
    pub projection: Observation,
    pub projection_version: i64,
    pub access_token: Option<String>,
    pub consent_given_at: Option<String>,
    pub consent_name: Option<String>,
    pub consent_cpf: Option<String>,
    pub consent_date: Option<String>,
    pub signature_date: Option<String>,
    pub signature_location: Option<String>,
    pub how_found: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub deleted_at: Option<String>,
}

impl PatientRow {
    fn from_row(row: &Row) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            name: row.get("name")?,
            email: row.get("email")?,
            phone: row.get("phone")?,
            mobile: row.get("mobile")?,
            dob: row.get("dob")?,
            profession: row.get("profession")?,
            address_street: row.get("address_street")?,
            address_number: row.get("address_number")?,
            address_neighborhood: row.get("address_neighborhood")?,
            address_city: row.get("address_city")?,
            address_state: row.get("address_state")?,
            projection: Observation::from_row(row)?,
            projection_version: row.get("projection_version")?,
            access_token: row.get("access_token")?,
            consent_given_at: row.get("consent_given_at")?,
            consent_name: row.get("consent_name")?,
            consent_cpf: row.get("consent_cpf")?,
            consent_date: row.get("consent_date")?,
            signature_date: row.get("signature_date")?,
            signature_location: row.get("signature_location")?,
            how_found: row.get("how_found")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
            deleted_at: row.get("deleted_at")?,
        })
    }

    pub fn has_consented(&self) -> bool {
        self.consent_given_at.is_some()
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// Input for creating a patient. Only the name is required.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewPatient {
    pub name: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub mobile: Option<String>,
    #[serde(default)]
    pub dob: Option<String>,
    #[serde(default)]
    pub profession: Option<String>,
    #[serde(default)]
    pub address_street: Option<String>,
    #[serde(default)]
    pub address_number: Option<String>,
    #[serde(default)]
    pub address_neighborhood: Option<String>,
    #[serde(default)]
    pub address_city: Option<String>,
    #[serde(default)]
    pub address_state: Option<String>,
}

/// Identity fields a staff member may change. `None` leaves a field as is.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DemographicsUpdate {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub mobile: Option<String>,
    #[serde(default)]
    pub dob: Option<String>,
    #[serde(default)]
    pub profession: Option<String>,
    #[serde(default)]
    pub address_street: Option<String>,
    #[serde(default)]
    pub address_number: Option<String>,
    #[serde(default)]
    pub address_neighborhood: Option<String>,
    #[serde(default)]
    pub address_city: Option<String>,
    #[serde(default)]
    pub address_state: Option<String>,
}

/// Values captured by the consent form, already validated and cleaned
#[derive(Debug, Clone)]
pub struct ConsentCapture {
    pub consent_name: String,
    pub consent_cpf: String,
    pub how_found: Option<String>,
    pub signature_location: Option<String>,
}

/// Patient still waiting to complete the consent portal
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PendingConsent {
    pub id: i64,
    pub name: String,
    pub access_token: Option<String>,
    pub created_at: String,
}

/// Insert a patient, optionally with an access token. Returns the new ID.
pub fn insert_patient(
    conn: &Connection,
    input: &NewPatient,
    access_token: Option<&str>,
) -> Result<i64, ClinicError> {
    let now = now_timestamp();

    conn.execute(
        r#"
        INSERT INTO patients (
            name, email, phone, mobile, dob, profession,
            address_street, address_number, address_neighborhood, address_city, address_state,
            access_token, created_at, updated_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
        params![
            input.name,
            input.email,
            input.phone,
            input.mobile,
            input.dob,
            input.profession,
            input.address_street,
            input.address_number,
            input.address_neighborhood,
            input.address_city,
            input.address_state,
            access_token,
            now,
            now,
        ],
    )?;

    Ok(conn.last_insert_rowid())
}

/// Get a patient by ID, soft-deleted rows included
pub fn get_patient(conn: &Connection, id: i64) -> Result<Option<PatientRow>, ClinicError> {
    let patient = conn
        .query_row("SELECT * FROM patients WHERE id = ?", params![id], |row| {
            PatientRow::from_row(row)
        })
        .optional()?;
    Ok(patient)
}

/// Get a patient that has not been soft-deleted
pub fn get_active_patient(conn: &Connection, id: i64) -> Result<Option<PatientRow>, ClinicError> {
    Ok(get_patient(conn, id)?.filter(|p| !p.is_deleted()))
}

/// Look a patient up by exact token match.
///
/// With `require_pending`, patients who already consented do not match.
pub fn find_by_token(
    conn: &Connection,
    token: &str,
    require_pending: bool,
) -> Result<Option<PatientRow>, ClinicError> {
    let sql = if require_pending {
        "SELECT * FROM patients WHERE access_token = ? AND deleted_at IS NULL AND consent_given_at IS NULL"
    } else {
        "SELECT * FROM patients WHERE access_token = ? AND deleted_at IS NULL"
    };

    let patient = conn
        .query_row(sql, params![token], |row| PatientRow::from_row(row))
        .optional()?;
    Ok(patient)
}

/// Store a token for a patient that has none. Never replaces an existing one.
pub fn set_token_if_missing(conn: &Connection, id: i64, token: &str) -> Result<bool, ClinicError> {
    let changes = conn.execute(
        "UPDATE patients SET access_token = ?, updated_at = ? WHERE id = ? AND access_token IS NULL",
        params![token, now_timestamp(), id],
    )?;
    Ok(changes > 0)
}

/// Record consent. Only the first call for a patient changes anything;
/// returns whether this call did.
pub fn record_consent(
    conn: &Connection,
    id: i64,
    capture: &ConsentCapture,
) -> Result<bool, ClinicError> {
    let now = now_timestamp();

    let changes = conn.execute(
        r#"
        UPDATE patients SET
            consent_name = ?, consent_cpf = ?, how_found = ?,
            signature_location = COALESCE(?, signature_location),
            consent_given_at = ?, consent_date = ?, signature_date = ?,
            updated_at = ?
        WHERE id = ? AND consent_given_at IS NULL
        "#,
        params![
            capture.consent_name,
            capture.consent_cpf,
            capture.how_found,
            capture.signature_location,
            now,
            now,
            now,
            now,
            id,
        ],
    )?;

    Ok(changes > 0)
}

/// Case-insensitive name prefix search over active patients
pub fn search_patients(conn: &Connection, term: &str, limit: u32) -> Result<Vec<PatientRow>, ClinicError> {
    let pattern = format!("{}%", escape_like(term));
    debug!(pattern = %pattern, "Searching patients");

    let mut stmt = conn.prepare(
        "SELECT * FROM patients WHERE deleted_at IS NULL AND name LIKE ? ESCAPE '\\' ORDER BY name ASC LIMIT ?",
    )?;
    let rows = stmt
        .query_map(params![pattern, limit as i64], |row| PatientRow::from_row(row))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Name prefix search restricted to patients with an appointment with
/// `doctor_id`. The restriction is applied before the limit.
pub fn search_treated_patients(
    conn: &Connection,
    doctor_id: i64,
    term: &str,
    limit: u32,
) -> Result<Vec<PatientRow>, ClinicError> {
    let pattern = format!("{}%", escape_like(term));

    let mut stmt = conn.prepare(
        r#"
        SELECT p.* FROM patients p
        WHERE p.deleted_at IS NULL
          AND p.name LIKE ? ESCAPE '\'
          AND EXISTS (SELECT 1 FROM appointments a WHERE a.patient_id = p.id AND a.doctor_id = ?)
        ORDER BY p.name ASC
        LIMIT ?
        "#,
    )?;
    let rows = stmt
        .query_map(params![pattern, doctor_id, limit as i64], |row| PatientRow::from_row(row))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Active patients with at least one appointment with the given doctor
pub fn list_treated_patients(conn: &Connection, doctor_id: i64) -> Result<Vec<PatientRow>, ClinicError> {
    let mut stmt = conn.prepare(
        r#"
        SELECT p.* FROM patients p
        WHERE p.deleted_at IS NULL
          AND EXISTS (SELECT 1 FROM appointments a WHERE a.patient_id = p.id AND a.doctor_id = ?)
        ORDER BY p.name ASC
        "#,
    )?;
    let rows = stmt
        .query_map(params![doctor_id], |row| PatientRow::from_row(row))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Patients who have not completed consent, oldest first
pub fn list_pending_consents(conn: &Connection, limit: u32) -> Result<Vec<PendingConsent>, ClinicError> {
    let mut stmt = conn.prepare(
        r#"
        SELECT id, name, access_token, created_at FROM patients
        WHERE consent_given_at IS NULL AND deleted_at IS NULL
        ORDER BY created_at ASC, id ASC
        LIMIT ?
        "#,
    )?;
    let rows = stmt
        .query_map(params![limit as i64], |row| {
            Ok(PendingConsent {
                id: row.get(0)?,
                name: row.get(1)?,
                access_token: row.get(2)?,
                created_at: row.get(3)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Mean emotional levels over a set of patients
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LevelAverages {
    pub anxiety: f64,
    pub anger: f64,
    pub fear: f64,
    pub sadness: f64,
    pub joy: f64,
    pub energy: f64,
}

/// How patients registered since `since` found the clinic, with counts
pub fn how_found_counts_since(conn: &Connection, since: &str) -> Result<BTreeMap<String, i64>, ClinicError> {
    let mut stmt = conn.prepare(
        r#"
        SELECT how_found, COUNT(*) FROM patients
        WHERE created_at >= ? AND deleted_at IS NULL AND how_found IS NOT NULL AND how_found != ''
        GROUP BY how_found
        "#,
    )?;
    let counts = stmt
        .query_map(params![since], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
        .collect::<Result<BTreeMap<_, _>, _>>()?;
    Ok(counts)
}

/// Projection averages over patients registered since `since`
pub fn average_levels_since(conn: &Connection, since: &str) -> Result<LevelAverages, ClinicError> {
    let averages = conn.query_row(
        r#"
        SELECT COALESCE(AVG(anxiety_level), 0), COALESCE(AVG(anger_level), 0),
               COALESCE(AVG(fear_level), 0), COALESCE(AVG(sadness_level), 0),
               COALESCE(AVG(joy_level), 0), COALESCE(AVG(energy_level), 0)
        FROM patients WHERE created_at >= ? AND deleted_at IS NULL
        "#,
        params![since],
        |row| {
            Ok(LevelAverages {
                anxiety: row.get(0)?,
                anger: row.get(1)?,
                fear: row.get(2)?,
                sadness: row.get(3)?,
                joy: row.get(4)?,
                energy: row.get(5)?,
            })
        },
    )?;
    Ok(averages)
}

/// Update identity fields. Returns false when the patient is missing or deleted.
pub fn update_demographics(
    conn: &Connection,
    id: i64,
    update: &DemographicsUpdate,
) -> Result<bool, ClinicError> {
    let changes = conn.execute(
        r#"
        UPDATE patients SET
            name = COALESCE(?, name),
            email = COALESCE(?, email),
            phone = COALESCE(?, phone),
            mobile = COALESCE(?, mobile),
            dob = COALESCE(?, dob),
            profession = COALESCE(?, profession),
            address_street = COALESCE(?, address_street),
            address_number = COALESCE(?, address_number),
            address_neighborhood = COALESCE(?, address_neighborhood),
            address_city = COALESCE(?, address_city),
            address_state = COALESCE(?, address_state),
            updated_at = ?
        WHERE id = ? AND deleted_at IS NULL
        "#,
        params![
            update.name,
            update.email,
            update.phone,
            update.mobile,
            update.dob,
            update.profession,
            update.address_street,
            update.address_number,
            update.address_neighborhood,
            update.address_city,
            update.address_state,
            now_timestamp(),
            id,
        ],
    )?;
    Ok(changes > 0)
}

/// Soft delete. Ledger rows stay untouched.
pub fn soft_delete_patient(conn: &Connection, id: i64) -> Result<bool, ClinicError> {
    let now = now_timestamp();
    let changes = conn.execute(
        "UPDATE patients SET deleted_at = ?, updated_at = ? WHERE id = ? AND deleted_at IS NULL",
        params![now, now, id],
    )?;
    Ok(changes > 0)
}

fn escape_like(term: &str) -> String {
    let mut escaped = String::with_capacity(term.len());
    for c in term.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}
