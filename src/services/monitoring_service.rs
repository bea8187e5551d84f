//! Admin overview of recent clinic activity

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{Duration, Utc};
use serde::Serialize;

use crate::access::{ActingUser, Operation};
use crate::db::appointments::{count_completed_since, list_upcoming, AgendaEntry};
use crate::db::audit::{list_since, AuditEntry};
use crate::db::patients::{average_levels_since, how_found_counts_since, list_pending_consents, LevelAverages, PendingConsent};
use crate::db::{format_timestamp, ClinicDb};
use crate::error::ClinicError;

use super::authorize;

pub const DEFAULT_WINDOW_DAYS: i64 = 7;
const PENDING_LIMIT: u32 = 10;
const UPCOMING_LIMIT: u32 = 10;
const ACTIVITY_LIMIT: u32 = 50;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonitoringReport {
    pub days: i64,
    pub since: String,
    pub pending_consents: Vec<PendingConsent>,
    pub upcoming_appointments: Vec<AgendaEntry>,
    pub completed_appointments: i64,
    pub recent_activity: Vec<AuditEntry>,
    /// Referral channels of patients registered in the window
    pub how_found: BTreeMap<String, i64>,
    pub average_levels: LevelAverages,
}

pub struct MonitoringService {
    db: Arc<ClinicDb>,
}

impl MonitoringService {
    pub fn new(db: Arc<ClinicDb>) -> Self {
        Self { db }
    }

    /// Activity over the last `days` days. Missing or non-positive windows
    /// fall back to a week.
    pub fn report(&self, actor: &ActingUser, days: Option<i64>) -> Result<MonitoringReport, ClinicError> {
        let days = days.filter(|d| *d > 0).unwrap_or(DEFAULT_WINDOW_DAYS);
        let now = Utc::now();
        let since_at = now - Duration::days(days);
        let since = format_timestamp(since_at);

        self.db.with_conn(|conn| {
            authorize(conn, actor, Operation::ViewMonitoring, None)?;
            Ok(MonitoringReport {
                days,
                pending_consents: list_pending_consents(conn, PENDING_LIMIT)?,
                upcoming_appointments: list_upcoming(conn, now, UPCOMING_LIMIT)?,
                completed_appointments: count_completed_since(conn, since_at)?,
                recent_activity: list_since(conn, &since, ACTIVITY_LIMIT)?,
                how_found: how_found_counts_since(conn, &since)?,
                average_levels: average_levels_since(conn, &since)?,
                since,
            })
        })
    }
}
