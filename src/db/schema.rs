//! Database schema definitions

use rusqlite::{Connection, OptionalExtension};
use tracing::info;

use crate::error::ClinicError;

/// Current schema version for migrations
pub const SCHEMA_VERSION: i32 = 1;

/// Initialize the database schema
pub fn init_schema(conn: &Connection) -> Result<(), ClinicError> {
    let current_version = get_schema_version(conn)?;

    if current_version == 0 {
        info!("Creating new database schema v{}", SCHEMA_VERSION);
        create_tables(conn)?;
        set_schema_version(conn, SCHEMA_VERSION)?;
    } else if current_version < SCHEMA_VERSION {
        info!("Migrating schema from v{} to v{}", current_version, SCHEMA_VERSION);
        migrate_schema(conn, current_version)?;
    } else {
        info!("Database schema is up to date (v{})", current_version);
    }

    Ok(())
}

/// Get current schema version (0 if not initialized)
pub fn get_schema_version(conn: &Connection) -> Result<i32, ClinicError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)",
        [],
    )?;

    let version: Option<i32> = conn
        .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| row.get(0))
        .optional()?;

    Ok(version.unwrap_or(0))
}

fn set_schema_version(conn: &Connection, version: i32) -> Result<(), ClinicError> {
    conn.execute("DELETE FROM schema_version", [])?;
    conn.execute("INSERT INTO schema_version (version) VALUES (?)", [version])?;
    Ok(())
}

fn create_tables(conn: &Connection) -> Result<(), ClinicError> {
    conn.execute_batch(USERS_SCHEMA)
        .map_err(|e| ClinicError::Internal(format!("Failed to create users table: {}", e)))?;

    conn.execute_batch(PATIENTS_SCHEMA)
        .map_err(|e| ClinicError::Internal(format!("Failed to create patients table: {}", e)))?;

    conn.execute_batch(LEDGER_SCHEMA)
        .map_err(|e| ClinicError::Internal(format!("Failed to create ledger tables: {}", e)))?;

    conn.execute_batch(APPOINTMENTS_SCHEMA)
        .map_err(|e| ClinicError::Internal(format!("Failed to create appointments table: {}", e)))?;

    conn.execute_batch(AUDIT_SCHEMA)
        .map_err(|e| ClinicError::Internal(format!("Failed to create audit table: {}", e)))?;

    conn.execute_batch(INDEXES_SCHEMA)
        .map_err(|e| ClinicError::Internal(format!("Failed to create indexes: {}", e)))?;

    Ok(())
}

fn migrate_schema(conn: &Connection, from_version: i32) -> Result<(), ClinicError> {
    // No released versions before v1 yet
    info!(from_version, "No migration steps registered");
    set_schema_version(conn, SCHEMA_VERSION)
}

const USERS_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    email TEXT NOT NULL UNIQUE,
    role TEXT NOT NULL CHECK (role IN ('admin', 'therapist', 'secretary')),
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
"#;

const PATIENTS_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS patients (
    id INTEGER PRIMARY KEY AUTOINCREMENT,

    -- Identity
    name TEXT NOT NULL,
    email TEXT,
    phone TEXT,
    mobile TEXT,
    dob TEXT,
    profession TEXT,
    address_street TEXT,
    address_number TEXT,
    address_neighborhood TEXT,
    address_city TEXT,
    address_state TEXT,

    -- Current clinical projection (mirrors the newest patient_records row)
    anxiety_level INTEGER NOT NULL DEFAULT 0,
    anger_level INTEGER NOT NULL DEFAULT 0,
    fear_level INTEGER NOT NULL DEFAULT 0,
    sadness_level INTEGER NOT NULL DEFAULT 0,
    joy_level INTEGER NOT NULL DEFAULT 0,
    energy_level INTEGER NOT NULL DEFAULT 0,
    main_complaint TEXT NOT NULL DEFAULT '',
    complaint_history TEXT NOT NULL DEFAULT '',
    signs_symptoms TEXT NOT NULL DEFAULT '',
    current_treatment TEXT NOT NULL DEFAULT '',
    notes TEXT NOT NULL DEFAULT '',
    projection_version INTEGER NOT NULL DEFAULT 0,

    -- Consent portal
    access_token TEXT UNIQUE,
    consent_given_at TEXT,
    consent_name TEXT,
    consent_cpf TEXT,
    consent_date TEXT,
    signature_date TEXT,
    signature_location TEXT,
    how_found TEXT,

    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    deleted_at TEXT
);
"#;

const LEDGER_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS patient_records (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    patient_id INTEGER NOT NULL,
    doctor_id INTEGER NOT NULL,
    record_date TEXT NOT NULL,

    anxiety_level INTEGER NOT NULL,
    anger_level INTEGER NOT NULL,
    fear_level INTEGER NOT NULL,
    sadness_level INTEGER NOT NULL,
    joy_level INTEGER NOT NULL,
    energy_level INTEGER NOT NULL,
    main_complaint TEXT NOT NULL,
    complaint_history TEXT NOT NULL,
    signs_symptoms TEXT NOT NULL,
    current_treatment TEXT NOT NULL,
    notes TEXT NOT NULL,

    -- patients.projection_version this entry produced
    projection_version INTEGER NOT NULL,

    UNIQUE (patient_id, projection_version),
    FOREIGN KEY (patient_id) REFERENCES patients(id),
    FOREIGN KEY (doctor_id) REFERENCES users(id)
);

-- Ledger rows are never mutated or removed
CREATE TRIGGER IF NOT EXISTS patient_records_no_update
BEFORE UPDATE ON patient_records
BEGIN
    SELECT RAISE(ABORT, 'patient_records is append-only');
END;

CREATE TRIGGER IF NOT EXISTS patient_records_no_delete
BEFORE DELETE ON patient_records
BEGIN
    SELECT RAISE(ABORT, 'patient_records is append-only');
END;
"#;

const APPOINTMENTS_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS appointments (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    patient_id INTEGER NOT NULL,
    doctor_id INTEGER NOT NULL,
    start_time TEXT NOT NULL,
    end_time TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'scheduled'
        CHECK (status IN ('scheduled', 'completed', 'canceled')),
    notes TEXT,
    price REAL NOT NULL DEFAULT 0,
    payment_status TEXT NOT NULL DEFAULT 'pending'
        CHECK (payment_status IN ('pending', 'paid', 'exempt')),
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,

    FOREIGN KEY (patient_id) REFERENCES patients(id),
    FOREIGN KEY (doctor_id) REFERENCES users(id) ON DELETE CASCADE
);
"#;

const AUDIT_SCHEMA: &str = r#"
-- user_id 0 is the system / patient portal
CREATE TABLE IF NOT EXISTS audit_logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER NOT NULL,
    user_name TEXT NOT NULL,
    action TEXT NOT NULL,
    target_type TEXT NOT NULL,
    target_id INTEGER NOT NULL,
    created_at TEXT NOT NULL
);
"#;

const INDEXES_SCHEMA: &str = r#"
CREATE INDEX IF NOT EXISTS idx_patients_name ON patients(name);
CREATE INDEX IF NOT EXISTS idx_patients_consent ON patients(consent_given_at);
CREATE INDEX IF NOT EXISTS idx_records_patient_date ON patient_records(patient_id, record_date, id);
CREATE INDEX IF NOT EXISTS idx_records_doctor ON patient_records(doctor_id);
CREATE INDEX IF NOT EXISTS idx_appointments_pair ON appointments(doctor_id, patient_id);
CREATE INDEX IF NOT EXISTS idx_appointments_start ON appointments(start_time);
CREATE INDEX IF NOT EXISTS idx_audit_target ON audit_logs(target_type, target_id);
"#;
