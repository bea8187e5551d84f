//! Read side of the audit trail

use std::sync::Arc;

use crate::access::{ActingUser, Operation};
use crate::db::audit::{list_for_target, AuditEntry};
use crate::db::ClinicDb;
use crate::error::ClinicError;

use super::authorize;

pub struct AuditService {
    db: Arc<ClinicDb>,
}

impl AuditService {
    pub fn new(db: Arc<ClinicDb>) -> Self {
        Self { db }
    }

    /// Entries about one target (e.g. `Patient`, 12), oldest first
    pub fn list_entries(
        &self,
        actor: &ActingUser,
        target_type: &str,
        target_id: i64,
    ) -> Result<Vec<AuditEntry>, ClinicError> {
        self.db.with_conn(|conn| {
            authorize(conn, actor, Operation::ReadAuditLog, None)?;
            list_for_target(conn, target_type, target_id)
        })
    }
}
