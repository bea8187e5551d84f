//! Event system for clinic operations
//!
//! Services emit a [`ClinicEvent`] after each committed write. The audit
//! listener turns them into `audit_logs` rows; a failed audit write is
//! logged and dropped, it never undoes the operation that caused it.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, error, trace};

use crate::access::ActingUser;
use crate::db::appointments::{AppointmentStatus, PaymentStatus};
use crate::db::audit::{insert_entry, NewAuditEntry};
use crate::db::ClinicDb;

/// Actor id recorded for actions taken by a patient through the portal
pub const PORTAL_ACTOR_ID: i64 = 0;
/// Actor name recorded for actions taken by a patient through the portal
pub const PORTAL_ACTOR_NAME: &str = "Patient portal";

/// Events emitted by services
#[derive(Debug, Clone)]
pub enum ClinicEvent {
    ClinicalRecordAdded {
        actor: ActingUser,
        patient_id: i64,
        record_id: i64,
    },
    ConsentGiven {
        patient_id: i64,
    },

    PatientCreated {
        actor: ActingUser,
        patient_id: i64,
    },
    PatientUpdated {
        actor: ActingUser,
        patient_id: i64,
    },
    PatientDeleted {
        actor: ActingUser,
        patient_id: i64,
    },
    AccessTokenIssued {
        actor: ActingUser,
        patient_id: i64,
    },

    AppointmentScheduled {
        actor: ActingUser,
        appointment_id: i64,
        patient_id: i64,
    },
    AppointmentStatusChanged {
        actor: ActingUser,
        appointment_id: i64,
        status: AppointmentStatus,
    },
    AppointmentRescheduled {
        actor: ActingUser,
        appointment_id: i64,
    },
    AppointmentPaymentChanged {
        actor: ActingUser,
        appointment_id: i64,
        payment: PaymentStatus,
    },

    StaffCreated {
        actor: ActingUser,
        user_id: i64,
    },
    StaffUpdated {
        actor: ActingUser,
        user_id: i64,
    },
    StaffDeleted {
        actor: ActingUser,
        user_id: i64,
    },
}

impl ClinicEvent {
    /// The audit row this event produces
    pub fn audit_entry(&self) -> NewAuditEntry {
        let by = |actor: &ActingUser, action: String, target_type: &str, target_id: i64| NewAuditEntry {
            user_id: actor.id,
            user_name: actor.name.clone(),
            action,
            target_type: target_type.to_string(),
            target_id,
        };

        match self {
            ClinicEvent::ClinicalRecordAdded { actor, patient_id, .. } => {
                by(actor, "Added new clinical record entry".into(), "Patient", *patient_id)
            }
            ClinicEvent::ConsentGiven { patient_id } => NewAuditEntry {
                user_id: PORTAL_ACTOR_ID,
                user_name: PORTAL_ACTOR_NAME.to_string(),
                action: "Patient gave consent through the portal".into(),
                target_type: "Patient".into(),
                target_id: *patient_id,
            },
            ClinicEvent::PatientCreated { actor, patient_id } => {
                by(actor, "Created patient".into(), "Patient", *patient_id)
            }
            ClinicEvent::PatientUpdated { actor, patient_id } => {
                by(actor, "Updated patient demographics".into(), "Patient", *patient_id)
            }
            ClinicEvent::PatientDeleted { actor, patient_id } => {
                by(actor, "Deleted patient".into(), "Patient", *patient_id)
            }
            ClinicEvent::AccessTokenIssued { actor, patient_id } => {
                by(actor, "Issued portal access token".into(), "Patient", *patient_id)
            }
            ClinicEvent::AppointmentScheduled { actor, appointment_id, patient_id } => by(
                actor,
                format!("Scheduled appointment for patient {}", patient_id),
                "Appointment",
                *appointment_id,
            ),
            ClinicEvent::AppointmentStatusChanged { actor, appointment_id, status } => by(
                actor,
                format!("Appointment marked {}", status.as_str()),
                "Appointment",
                *appointment_id,
            ),
            ClinicEvent::AppointmentRescheduled { actor, appointment_id } => {
                by(actor, "Rescheduled appointment".into(), "Appointment", *appointment_id)
            }
            ClinicEvent::AppointmentPaymentChanged { actor, appointment_id, payment } => by(
                actor,
                format!("Appointment payment marked {}", payment.as_str()),
                "Appointment",
                *appointment_id,
            ),
            ClinicEvent::StaffCreated { actor, user_id } => {
                by(actor, "Created staff user".into(), "User", *user_id)
            }
            ClinicEvent::StaffUpdated { actor, user_id } => {
                by(actor, "Updated staff user".into(), "User", *user_id)
            }
            ClinicEvent::StaffDeleted { actor, user_id } => {
                by(actor, "Deleted staff user".into(), "User", *user_id)
            }
        }
    }
}

/// Trait for event listeners
pub trait EventListener: Send + Sync {
    fn on_event(&self, event: &ClinicEvent);
}

/// Event bus for broadcasting clinic events
pub struct EventBus {
    sender: broadcast::Sender<ClinicEvent>,
}

impl EventBus {
    /// Create a new event bus with default capacity
    pub fn new() -> Self {
        Self::with_capacity(1024)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Emit an event to all subscribers
    pub fn emit(&self, event: ClinicEvent) {
        trace!(event = ?event, "Emitting clinic event");
        // No subscribers is fine
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClinicEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Persists events into `audit_logs`
pub struct AuditLogListener {
    db: Arc<ClinicDb>,
}

impl AuditLogListener {
    pub fn new(db: Arc<ClinicDb>) -> Self {
        Self { db }
    }
}

impl EventListener for AuditLogListener {
    fn on_event(&self, event: &ClinicEvent) {
        let entry = event.audit_entry();
        match self.db.with_conn(|conn| insert_entry(conn, &entry)) {
            Ok(id) => debug!(
                audit_id = id,
                target_type = %entry.target_type,
                target_id = entry.target_id,
                "Audit entry written"
            ),
            Err(e) => error!(
                error = %e,
                action = %entry.action,
                target_id = entry.target_id,
                "Failed to write audit entry"
            ),
        }
    }
}

/// Spawn a background task feeding every event to `listener`.
///
/// Subscribes before returning, so events emitted after this call are seen.
/// Each `on_event` call runs on the blocking pool, one at a time and in
/// emission order.
pub fn spawn_listener<L>(event_bus: Arc<EventBus>, listener: L) -> tokio::task::JoinHandle<()>
where
    L: EventListener + 'static,
{
    let mut receiver = event_bus.subscribe();
    let listener = Arc::new(listener);

    tokio::spawn(async move {
        loop {
            match receiver.recv().await {
                Ok(event) => {
                    let listener = listener.clone();
                    if let Err(e) = tokio::task::spawn_blocking(move || listener.on_event(&event)).await {
                        error!(error = %e, "Event listener failed");
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    error!(skipped = n, "Event listener lagged, audit entries lost");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("Event bus closed, stopping listener");
                    break;
                }
            }
        }
    })
}

/// Spawn the audit trail writer
pub fn spawn_audit_listener(event_bus: Arc<EventBus>, db: Arc<ClinicDb>) -> tokio::task::JoinHandle<()> {
    spawn_listener(event_bus, AuditLogListener::new(db))
}
