//! Service layer for clinic-records
//!
//! Services encapsulate business logic between HTTP handlers and repositories.
//! Each service wraps database operations with:
//! - Authorisation against the role policy table
//! - Input validation
//! - Transaction boundaries
//! - Event emission for the audit trail (after commit)
//!
//! ## Architecture
//!
//! ```text
//! HTTP Handlers (thin)
//!     ↓
//! Service Layer (business logic)
//!     ↓
//! Repository Layer (db/*.rs)
//!     ↓
//! SQLite Database
//! ```

pub mod response;
pub mod events;
pub mod ledger_service;
pub mod consent_service;
pub mod patient_service;
pub mod appointment_service;
pub mod staff_service;
pub mod audit_service;
pub mod monitoring_service;

// Re-exports
pub use response::*;
pub use events::{spawn_audit_listener, ClinicEvent, EventBus, EventListener};
pub use ledger_service::{LedgerService, PatientChart, PatientHistory};
pub use consent_service::{ConsentForm, ConsentReceipt, ConsentService, PortalSession, RedemptionPolicy};
pub use patient_service::{IssuedPatient, PatientService};
pub use appointment_service::{AgendaDay, AppointmentService, WeekAgenda};
pub use staff_service::StaffService;
pub use audit_service::AuditService;
pub use monitoring_service::{MonitoringReport, MonitoringService};

use std::sync::Arc;

use rusqlite::Connection;

use crate::access::{operation_description, required_scope, ActingUser, Operation, PatientScope, Role};
use crate::db::appointments::has_treated;
use crate::db::users::get_user;
use crate::db::ClinicDb;
use crate::error::ClinicError;

/// Settings shared by services
#[derive(Debug, Clone)]
pub struct ServiceOptions {
    pub redemption_policy: RedemptionPolicy,
    /// Public origin used to build portal links
    pub portal_base_url: String,
    pub event_capacity: usize,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            redemption_policy: RedemptionPolicy::Strict,
            portal_base_url: "http://localhost:8090".to_string(),
            event_capacity: 1024,
        }
    }
}

/// Service container for dependency injection
///
/// Holds all services with shared database connection.
/// Pass this to HttpServer for handler access.
pub struct Services {
    pub ledger: Arc<LedgerService>,
    pub consent: Arc<ConsentService>,
    pub patients: Arc<PatientService>,
    pub appointments: Arc<AppointmentService>,
    pub staff: Arc<StaffService>,
    pub audit: Arc<AuditService>,
    pub monitoring: Arc<MonitoringService>,
    pub events: Arc<EventBus>,
    pub db: Arc<ClinicDb>,
}

impl Services {
    /// Create all services with shared database
    pub fn new(db: Arc<ClinicDb>, options: ServiceOptions) -> Self {
        let events = Arc::new(EventBus::with_capacity(options.event_capacity));

        Self {
            ledger: Arc::new(LedgerService::new(db.clone(), events.clone())),
            consent: Arc::new(ConsentService::new(
                db.clone(),
                events.clone(),
                options.redemption_policy,
                options.portal_base_url.clone(),
            )),
            patients: Arc::new(PatientService::new(
                db.clone(),
                events.clone(),
                options.portal_base_url,
            )),
            appointments: Arc::new(AppointmentService::new(db.clone(), events.clone())),
            staff: Arc::new(StaffService::new(db.clone(), events.clone())),
            audit: Arc::new(AuditService::new(db.clone())),
            monitoring: Arc::new(MonitoringService::new(db.clone())),
            events,
            db,
        }
    }
}

/// Role of `actor` as stored in the staff directory.
///
/// Unknown users and callers claiming a role they do not hold are
/// `Unauthorized`.
pub(crate) fn verified_role(conn: &Connection, actor: &ActingUser) -> Result<Role, ClinicError> {
    let stored = get_user(conn, actor.id)?
        .ok_or_else(|| ClinicError::Unauthorized(format!("{} is not a staff user", actor)))?;
    if stored.role != actor.role {
        return Err(ClinicError::Unauthorized(format!(
            "{} does not hold that role, stored role is {}",
            actor, stored.role
        )));
    }
    Ok(stored.role)
}

/// Check `actor` against the policy table for `operation`.
///
/// The role comes from the staff directory, not from the caller.
/// `patient_id` is required for operations scoped to treated patients.
pub(crate) fn authorize(
    conn: &Connection,
    actor: &ActingUser,
    operation: Operation,
    patient_id: Option<i64>,
) -> Result<(), ClinicError> {
    let role = verified_role(conn, actor)?;
    match required_scope(role, operation) {
        PatientScope::Any => Ok(()),
        PatientScope::Denied => Err(ClinicError::Unauthorized(format!(
            "{} may not perform: {}",
            actor,
            operation_description(operation)
        ))),
        PatientScope::Treated => match patient_id {
            Some(pid) if has_treated(conn, actor.id, pid)? => Ok(()),
            Some(pid) => Err(ClinicError::Unauthorized(format!(
                "{} has no appointment with patient {}",
                actor, pid
            ))),
            None => Err(ClinicError::Unauthorized(format!(
                "{} may only perform '{}' for a specific patient",
                actor,
                operation_description(operation)
            ))),
        },
    }
}
