//! Staff directory CRUD operations

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use crate::access::{ActingUser, Role};
use crate::error::ClinicError;

use super::now_timestamp;

/// Staff user row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StaffUser {
    pub id: i64,
    pub name: String,
    pub email: String,
    pub role: Role,
    pub created_at: String,
    pub updated_at: String,
}

impl StaffUser {
    fn from_row(row: &Row) -> Result<Self, rusqlite::Error> {
        let role: String = row.get("role")?;
        let role = role.parse::<Role>().map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                e.into(),
            )
        })?;

        Ok(Self {
            id: row.get("id")?,
            name: row.get("name")?,
            email: row.get("email")?,
            role,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }

    pub fn as_acting_user(&self) -> ActingUser {
        ActingUser::new(self.id, self.name.clone(), self.role)
    }
}

/// Input for creating a staff user
#[derive(Debug, Clone, Deserialize)]
pub struct NewStaffUser {
    pub name: String,
    pub email: String,
    pub role: Role,
}

/// Get a staff user by ID
pub fn get_user(conn: &Connection, id: i64) -> Result<Option<StaffUser>, ClinicError> {
    let user = conn
        .query_row("SELECT * FROM users WHERE id = ?", params![id], |row| {
            StaffUser::from_row(row)
        })
        .optional()?;
    Ok(user)
}

/// List all staff users ordered by name
pub fn list_users(conn: &Connection) -> Result<Vec<StaffUser>, ClinicError> {
    let mut stmt = conn.prepare("SELECT * FROM users ORDER BY name ASC")?;
    let users = stmt
        .query_map([], |row| StaffUser::from_row(row))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(users)
}

/// Insert a staff user. Duplicate email is a conflict.
pub fn create_user(conn: &Connection, input: &NewStaffUser) -> Result<StaffUser, ClinicError> {
    let now = now_timestamp();

    let result = conn.execute(
        "INSERT INTO users (name, email, role, created_at, updated_at) VALUES (?, ?, ?, ?, ?)",
        params![input.name, input.email, input.role.as_str(), now, now],
    );

    match result {
        Ok(_) => {}
        Err(rusqlite::Error::SqliteFailure(err, _))
            if err.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            return Err(ClinicError::Conflict(format!(
                "email '{}' is already registered",
                input.email
            )));
        }
        Err(e) => return Err(e.into()),
    }

    let id = conn.last_insert_rowid();
    get_user(conn, id)?
        .ok_or_else(|| ClinicError::Internal("User not found after insert".to_string()))
}

/// Fields an admin may change on a staff user. `None` leaves a field as is.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StaffUpdate {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub role: Option<Role>,
}

/// Update a staff user. Returns false when no such user exists; a
/// duplicate email is a conflict.
pub fn update_user(conn: &Connection, id: i64, update: &StaffUpdate) -> Result<bool, ClinicError> {
    let result = conn.execute(
        r#"
        UPDATE users SET
            name = COALESCE(?, name),
            email = COALESCE(?, email),
            role = COALESCE(?, role),
            updated_at = ?
        WHERE id = ?
        "#,
        params![
            update.name,
            update.email,
            update.role.map(|r| r.as_str()),
            now_timestamp(),
            id,
        ],
    );

    match result {
        Ok(changes) => Ok(changes > 0),
        Err(rusqlite::Error::SqliteFailure(err, _))
            if err.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            Err(ClinicError::Conflict(format!(
                "email '{}' is already registered",
                update.email.as_deref().unwrap_or_default()
            )))
        }
        Err(e) => Err(e.into()),
    }
}

/// Number of ledger entries authored by a user
pub fn count_authored_records(conn: &Connection, user_id: i64) -> Result<i64, ClinicError> {
    let n = conn.query_row(
        "SELECT COUNT(*) FROM patient_records WHERE doctor_id = ?",
        params![user_id],
        |row| row.get(0),
    )?;
    Ok(n)
}

/// Delete a staff user. Returns false when no such user exists.
pub fn delete_user(conn: &Connection, id: i64) -> Result<bool, ClinicError> {
    let changes = conn.execute("DELETE FROM users WHERE id = ?", params![id])?;
    Ok(changes > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::ClinicDb;

    #[test]
    fn test_create_and_get_user() {
        let db = ClinicDb::open_in_memory().unwrap();
        let user = db
            .with_conn(|conn| {
                create_user(conn, &NewStaffUser {
                    name: "Dr. Ana".into(),
                    email: "ana@clinic.test".into(),
                    role: Role::Therapist,
                })
            })
            .unwrap();

        let fetched = db.with_conn(|conn| get_user(conn, user.id)).unwrap().unwrap();
        assert_eq!(fetched, user);
        assert_eq!(fetched.role, Role::Therapist);
    }

    #[test]
    fn test_update_user_changes_role_and_guards_email() {
        let db = ClinicDb::open_in_memory().unwrap();
        let (a, b) = db
            .with_conn(|conn| {
                let a = create_user(conn, &NewStaffUser {
                    name: "Caio".into(),
                    email: "caio@clinic.test".into(),
                    role: Role::Secretary,
                })?;
                let b = create_user(conn, &NewStaffUser {
                    name: "Duda".into(),
                    email: "duda@clinic.test".into(),
                    role: Role::Therapist,
                })?;
                Ok((a, b))
            })
            .unwrap();

        let promote = StaffUpdate { role: Some(Role::Admin), ..Default::default() };
        assert!(db.with_conn(|conn| update_user(conn, a.id, &promote)).unwrap());
        let stored = db.with_conn(|conn| get_user(conn, a.id)).unwrap().unwrap();
        assert_eq!(stored.role, Role::Admin);
        assert_eq!(stored.email, "caio@clinic.test");

        let steal = StaffUpdate { email: Some(b.email.clone()), ..Default::default() };
        let err = db.with_conn(|conn| update_user(conn, a.id, &steal)).unwrap_err();
        assert!(matches!(err, ClinicError::Conflict(_)));
        assert!(!db.with_conn(|conn| update_user(conn, 999, &promote)).unwrap());
    }

    #[test]
    fn test_duplicate_email_conflicts() {
        let db = ClinicDb::open_in_memory().unwrap();
        let input = NewStaffUser {
            name: "Bea".into(),
            email: "bea@clinic.test".into(),
            role: Role::Secretary,
        };
        db.with_conn(|conn| create_user(conn, &input)).unwrap();
        let err = db.with_conn(|conn| create_user(conn, &input)).unwrap_err();
        assert!(matches!(err, ClinicError::Conflict(_)));
    }
}
