//! Clinic Records - clinical ledger and patient consent portal
//!
//! A small practice's patient records, kept in one SQLite database.
//!
//! ## Architecture
//!
//! - **Clinical ledger**: every observation is appended to `patient_records`
//!   and mirrored onto the patient row (the projection) in one transaction
//! - **Consent handshake**: staff issue a single-purpose access token, the
//!   patient redeems it on the portal and submits name and CPF once
//! - **Role policy**: admins reach every patient, therapists only the ones
//!   they have appointments with, secretaries never touch clinical data
//!
//! ## Storage Layout
//!
//! ```text
//! ~/.local/share/clinic-records/
//! ├── clinic.db      # SQLite database (WAL mode)
//! └── config.toml    # Configuration
//! ```

pub mod access;
pub mod config;
pub mod db;
pub mod error;
pub mod http;
pub mod services;
pub mod token;
pub mod validation;

// Re-exports
pub use access::{ActingUser, Role};
pub use config::Config;
pub use db::ClinicDb;
pub use error::{ClinicError, ValidationErrors};
pub use http::HttpServer;
pub use services::Services;
pub use validation::{clean_cpf, format_cpf, is_valid_cpf};
