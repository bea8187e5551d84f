//! Staff roles and the role × operation policy table
//!
//! Every service call takes an explicit [`ActingUser`]. What that user may
//! do is decided here, in one table, so the asymmetries are visible:
//! admins reach every patient, therapists only patients they have an
//! appointment with, secretaries never touch clinical data.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Staff role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Therapist,
    Secretary,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Therapist => "therapist",
            Role::Secretary => "secretary",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "admin" => Ok(Role::Admin),
            "therapist" => Ok(Role::Therapist),
            "secretary" => Ok(Role::Secretary),
            other => Err(format!("unknown role '{}'", other)),
        }
    }
}

/// The staff member performing an operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActingUser {
    pub id: i64,
    pub name: String,
    pub role: Role,
}

impl ActingUser {
    pub fn new(id: i64, name: impl Into<String>, role: Role) -> Self {
        Self {
            id,
            name: name.into(),
            role,
        }
    }
}

impl fmt::Display for ActingUser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{} ({})", self.name, self.id, self.role)
    }
}

/// Operations gated by the policy table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    ReadClinicalHistory,
    WriteClinicalRecord,
    CreatePatient,
    ReadPatient,
    UpdateDemographics,
    DeletePatient,
    ManageAppointments,
    ManageStaff,
    ReadAuditLog,
    /// Week or range view of the appointment book. For therapists the
    /// treated scope means their own appointments only.
    ViewAgenda,
    ViewMonitoring,
}

/// Which patients an operation may touch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatientScope {
    /// Any patient
    Any,
    /// Only patients the acting user has an appointment with
    Treated,
    /// Not allowed at all
    Denied,
}

/// The policy table.
pub fn required_scope(role: Role, operation: Operation) -> PatientScope {
    use Operation::*;
    use PatientScope::*;

    match (role, operation) {
        (Role::Admin, _) => Any,

        (Role::Therapist, ReadClinicalHistory)
        | (Role::Therapist, WriteClinicalRecord)
        | (Role::Therapist, ReadPatient)
        | (Role::Therapist, ViewAgenda) => Treated,
        (Role::Therapist, _) => Denied,

        (Role::Secretary, CreatePatient)
        | (Role::Secretary, ReadPatient)
        | (Role::Secretary, UpdateDemographics)
        | (Role::Secretary, ManageAppointments)
        | (Role::Secretary, ViewAgenda) => Any,
        (Role::Secretary, _) => Denied,
    }
}

/// Human-readable description of an operation for logging
pub fn operation_description(operation: Operation) -> &'static str {
    match operation {
        Operation::ReadClinicalHistory => "Read clinical history",
        Operation::WriteClinicalRecord => "Write clinical record",
        Operation::CreatePatient => "Create patient",
        Operation::ReadPatient => "Read patient",
        Operation::UpdateDemographics => "Update patient demographics",
        Operation::DeletePatient => "Delete patient",
        Operation::ManageAppointments => "Manage appointments",
        Operation::ManageStaff => "Manage staff",
        Operation::ReadAuditLog => "Read audit log",
        Operation::ViewAgenda => "View agenda",
        Operation::ViewMonitoring => "View clinic monitoring",
    }
}
