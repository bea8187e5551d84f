//! Audit trail storage

use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};

use crate::error::ClinicError;

use super::now_timestamp;

/// Audit entry to persist
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewAuditEntry {
    pub user_id: i64,
    pub user_name: String,
    pub action: String,
    pub target_type: String,
    pub target_id: i64,
}

/// Stored audit entry
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditEntry {
    pub id: i64,
    pub user_id: i64,
    pub user_name: String,
    pub action: String,
    pub target_type: String,
    pub target_id: i64,
    pub created_at: String,
}

impl AuditEntry {
    fn from_row(row: &Row) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            user_id: row.get("user_id")?,
            user_name: row.get("user_name")?,
            action: row.get("action")?,
            target_type: row.get("target_type")?,
            target_id: row.get("target_id")?,
            created_at: row.get("created_at")?,
        })
    }
}

pub fn insert_entry(conn: &Connection, entry: &NewAuditEntry) -> Result<i64, ClinicError> {
    conn.execute(
        r#"
        INSERT INTO audit_logs (user_id, user_name, action, target_type, target_id, created_at)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
        params![
            entry.user_id,
            entry.user_name,
            entry.action,
            entry.target_type,
            entry.target_id,
            now_timestamp(),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Entries about one target, oldest first
pub fn list_for_target(
    conn: &Connection,
    target_type: &str,
    target_id: i64,
) -> Result<Vec<AuditEntry>, ClinicError> {
    let mut stmt = conn.prepare(
        "SELECT * FROM audit_logs WHERE target_type = ? AND target_id = ? ORDER BY id ASC",
    )?;
    let entries = stmt
        .query_map(params![target_type, target_id], |row| AuditEntry::from_row(row))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(entries)
}

/// Entries written at or after `since`, newest first
pub fn list_since(conn: &Connection, since: &str, limit: u32) -> Result<Vec<AuditEntry>, ClinicError> {
    let mut stmt = conn.prepare(
        "SELECT * FROM audit_logs WHERE created_at >= ? ORDER BY created_at DESC, id DESC LIMIT ?",
    )?;
    let entries = stmt
        .query_map(params![since, limit as i64], |row| AuditEntry::from_row(row))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(entries)
}
