//! SQLite database module for clinic data
//!
//! ## Tables
//!
//! - `users` - Staff directory (admin, therapist, secretary)
//! - `patients` - Identity, consent state and the current clinical projection
//! - `patient_records` - Append-only clinical ledger
//! - `appointments` - Appointment book with payment status
//! - `audit_logs` - Write-mostly audit trail
//!
//! The projection on `patients` and the newest row of `patient_records`
//! are always written in the same transaction (see `records`).

pub mod schema;
pub mod users;
pub mod patients;
pub mod records;
pub mod appointments;
pub mod audit;

use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Connection;
use tracing::{debug, info};

use crate::error::ClinicError;

/// Database file name inside the data directory
pub const DB_FILE: &str = "clinic.db";

/// SQLite database for the clinic
pub struct ClinicDb {
    conn: Mutex<Connection>,
}

impl ClinicDb {
    /// Open or create the clinic database inside `data_dir`
    pub fn open(data_dir: &Path) -> Result<Self, ClinicError> {
        let db_path = data_dir.join(DB_FILE);
        info!("Opening SQLite database at {:?}", db_path);

        let conn = Connection::open(&db_path)?;

        // WAL for concurrent readers, FKs are off by default in SQLite
        conn.execute_batch(
            "PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA foreign_keys=ON;",
        )?;

        let db = Self {
            conn: Mutex::new(conn),
        };

        db.init_schema()?;

        Ok(db)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self, ClinicError> {
        debug!("Opening in-memory SQLite database");

        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;

        let db = Self {
            conn: Mutex::new(conn),
        };

        db.init_schema()?;

        Ok(db)
    }

    fn init_schema(&self) -> Result<(), ClinicError> {
        self.with_conn(schema::init_schema)
    }

    /// Run a read (or single-statement write) against the connection
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, ClinicError>
    where
        F: FnOnce(&Connection) -> Result<T, ClinicError>,
    {
        let conn = self.conn.lock()
            .map_err(|e| ClinicError::Internal(format!("Lock poisoned: {}", e)))?;
        f(&conn)
    }

    /// Execute a write operation with exclusive access (for transactions)
    pub fn with_conn_mut<F, T>(&self, f: F) -> Result<T, ClinicError>
    where
        F: FnOnce(&mut Connection) -> Result<T, ClinicError>,
    {
        let mut conn = self.conn.lock()
            .map_err(|e| ClinicError::Internal(format!("Lock poisoned: {}", e)))?;
        f(&mut conn)
    }

    /// Get database statistics
    pub fn stats(&self) -> Result<DbStats, ClinicError> {
        self.with_conn(|conn| {
            let count = |sql: &str| -> Result<u64, ClinicError> {
                let n: i64 = conn.query_row(sql, [], |row| row.get(0))?;
                Ok(n as u64)
            };

            Ok(DbStats {
                staff_count: count("SELECT COUNT(*) FROM users")?,
                patient_count: count("SELECT COUNT(*) FROM patients WHERE deleted_at IS NULL")?,
                pending_consent_count: count(
                    "SELECT COUNT(*) FROM patients WHERE deleted_at IS NULL AND consent_given_at IS NULL",
                )?,
                record_count: count("SELECT COUNT(*) FROM patient_records")?,
                appointment_count: count("SELECT COUNT(*) FROM appointments")?,
            })
        })
    }
}

/// Database statistics
#[derive(Debug, Clone, serde::Serialize)]
pub struct DbStats {
    pub staff_count: u64,
    pub patient_count: u64,
    pub pending_consent_count: u64,
    pub record_count: u64,
    pub appointment_count: u64,
}

/// Stored timestamp format: RFC 3339, UTC, microseconds.
///
/// Fixed width, so lexical order in SQL equals chronological order.
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Current time in the stored format
pub fn now_timestamp() -> String {
    format_timestamp(Utc::now())
}

// Re-exports
pub use appointments::{AppointmentRow, AppointmentStatus, NewAppointment, PaymentStatus};
pub use audit::{AuditEntry, NewAuditEntry};
pub use patients::{DemographicsUpdate, NewPatient, PatientRow, PendingConsent};
pub use records::{ClinicalRecord, Observation};
pub use users::{NewStaffUser, StaffUser};
