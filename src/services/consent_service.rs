//! Consent token handshake
//!
//! `Unissued → Issued → Redeemed → Consented`. Tokens are issued by staff
//! (see `PatientService`), redeemed by the patient on the portal, and the
//! consent form is submitted once. Consented is terminal.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::access::{ActingUser, Operation};
use crate::db::patients::{find_by_token, get_active_patient, record_consent, set_token_if_missing, ConsentCapture};
use crate::db::ClinicDb;
use crate::error::{ClinicError, ValidationErrors};
use crate::token::{generate_access_token, looks_like_token, portal_link};
use crate::validation::{clean_cpf, is_valid_cpf, is_valid_full_name};

use super::authorize;
use super::events::{ClinicEvent, EventBus};

pub const NAME_MESSAGE: &str = "Please enter your full name, without numbers or special characters.";
pub const CPF_MESSAGE: &str = "The CPF entered is invalid. Please check it.";

/// Which patients a token may be redeemed for
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RedemptionPolicy {
    /// Only patients who have not consented yet
    #[default]
    Strict,
    /// Any patient holding the token
    Permissive,
}

impl RedemptionPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RedemptionPolicy::Strict => "strict",
            RedemptionPolicy::Permissive => "permissive",
        }
    }
}

impl fmt::Display for RedemptionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RedemptionPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "strict" => Ok(RedemptionPolicy::Strict),
            "permissive" => Ok(RedemptionPolicy::Permissive),
            other => Err(format!("unknown redemption policy '{}'", other)),
        }
    }
}

/// Result of redeeming a token
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortalSession {
    pub patient_id: i64,
    pub patient_name: String,
}

/// Consent form as submitted by the patient
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConsentForm {
    pub full_name: String,
    pub cpf: String,
    #[serde(default)]
    pub how_found: Option<String>,
    #[serde(default)]
    pub signature_location: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConsentReceipt {
    pub patient_id: i64,
    pub consent_given_at: String,
    /// True when consent had already been given before this submission
    pub already_consented: bool,
}

/// Raw token plus the shareable link
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IssuedToken {
    pub patient_id: i64,
    pub token: String,
    pub portal_link: String,
}

pub struct ConsentService {
    db: Arc<ClinicDb>,
    events: Arc<EventBus>,
    policy: RedemptionPolicy,
    portal_base_url: String,
}

impl ConsentService {
    pub fn new(
        db: Arc<ClinicDb>,
        events: Arc<EventBus>,
        policy: RedemptionPolicy,
        portal_base_url: String,
    ) -> Self {
        Self {
            db,
            events,
            policy,
            portal_base_url,
        }
    }

    pub fn policy(&self) -> RedemptionPolicy {
        self.policy
    }

    /// Token for a patient, issuing one if the row has none.
    ///
    /// An existing token is returned as is.
    pub fn issue_token(&self, actor: &ActingUser, patient_id: i64) -> Result<IssuedToken, ClinicError> {
        let (token, fresh) = self.db.with_conn(|conn| {
            let patient = get_active_patient(conn, patient_id)?
                .ok_or(ClinicError::PatientNotFound(patient_id))?;
            authorize(conn, actor, Operation::CreatePatient, Some(patient_id))?;

            if let Some(token) = patient.access_token {
                return Ok((token, false));
            }

            let candidate = generate_access_token();
            if set_token_if_missing(conn, patient_id, &candidate)? {
                return Ok((candidate, true));
            }

            // another writer got there first
            get_active_patient(conn, patient_id)?
                .and_then(|p| p.access_token)
                .map(|t| (t, false))
                .ok_or_else(|| ClinicError::Internal(format!("patient {} lost its token", patient_id)))
        })?;

        if fresh {
            info!(patient_id, "Issued portal access token");
            self.events.emit(ClinicEvent::AccessTokenIssued {
                actor: actor.clone(),
                patient_id,
            });
        }

        Ok(IssuedToken {
            patient_id,
            portal_link: portal_link(&self.portal_base_url, &token),
            token,
        })
    }

    /// Exchange a token for a portal session.
    ///
    /// Under the strict policy, a patient who already consented no longer
    /// matches. Any miss is `InvalidToken`.
    pub fn redeem_token(&self, token: &str) -> Result<PortalSession, ClinicError> {
        let token = token.trim();
        if !looks_like_token(token) {
            return Err(ClinicError::InvalidToken);
        }

        let require_pending = self.policy == RedemptionPolicy::Strict;
        let patient = self
            .db
            .with_conn(|conn| find_by_token(conn, token, require_pending))?
            .ok_or(ClinicError::InvalidToken)?;

        info!(patient_id = patient.id, policy = %self.policy, "Portal token redeemed");

        Ok(PortalSession {
            patient_id: patient.id,
            patient_name: patient.name,
        })
    }

    /// Validate and store the consent form.
    ///
    /// Resubmission after consent returns the original timestamp and
    /// changes nothing. Invalid input yields `Validation` with the
    /// submitted values attached.
    pub fn submit_consent(&self, session: &PortalSession, form: &ConsentForm) -> Result<ConsentReceipt, ClinicError> {
        let patient_id = session.patient_id;

        let existing = self
            .db
            .with_conn(|conn| get_active_patient(conn, patient_id))?
            .ok_or(ClinicError::PatientNotFound(patient_id))?;
        if let Some(at) = existing.consent_given_at {
            return Ok(ConsentReceipt {
                patient_id,
                consent_given_at: at,
                already_consented: true,
            });
        }

        validate_form(form)?;

        let capture = ConsentCapture {
            consent_name: form.full_name.trim().to_string(),
            consent_cpf: clean_cpf(&form.cpf),
            how_found: form.how_found.clone().filter(|s| !s.trim().is_empty()),
            signature_location: form.signature_location.clone().filter(|s| !s.trim().is_empty()),
        };

        let (changed, patient) = self.db.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let changed = record_consent(&tx, patient_id, &capture)?;
            let patient = get_active_patient(&tx, patient_id)?
                .ok_or(ClinicError::PatientNotFound(patient_id))?;
            tx.commit()?;
            Ok((changed, patient))
        })?;

        let consent_given_at = patient.consent_given_at.ok_or_else(|| {
            ClinicError::Internal(format!("patient {} has no consent timestamp after submit", patient_id))
        })?;

        if changed {
            info!(patient_id, "Patient gave consent");
            self.events.emit(ClinicEvent::ConsentGiven { patient_id });
        } else {
            warn!(patient_id, "Concurrent consent submission, keeping the first");
        }

        Ok(ConsentReceipt {
            patient_id,
            consent_given_at,
            already_consented: !changed,
        })
    }

    /// Redeem and submit in one step, for clients that keep no session
    pub fn redeem_and_submit(&self, token: &str, form: &ConsentForm) -> Result<ConsentReceipt, ClinicError> {
        let session = self.redeem_token(token)?;
        self.submit_consent(&session, form)
    }
}

fn validate_form(form: &ConsentForm) -> Result<(), ClinicError> {
    let mut errors = ValidationErrors::new();

    if !is_valid_full_name(&form.full_name) {
        errors.add("name", NAME_MESSAGE);
    }
    if !is_valid_cpf(&form.cpf) {
        errors.add("cpf", CPF_MESSAGE);
    }

    if !errors.is_empty() {
        errors.keep_value("name", form.full_name.clone());
        errors.keep_value("cpf", form.cpf.clone());
        if let Some(how_found) = &form.how_found {
            errors.keep_value("how_found", how_found.clone());
        }
    }

    errors.into_result()
}
