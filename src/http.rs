//! HTTP API for the clinic
//!
//! Thin JSON handlers over [`Services`]. Staff routes identify the acting
//! user with the `X-Staff-Id` header; portal routes are keyed by the
//! patient's access token and keep no session.
//!
//! ## Staff API
//! - `GET /health`
//! - `POST /staff`, `GET /staff`, `GET|PATCH|DELETE /staff/{id}`
//! - `GET /staff/{id}/patients` - patients with an appointment with that user
//! - `POST /patients`, `GET /patients?search=&limit=`, `GET /patients/pending-consent`
//! - `GET|PATCH|DELETE /patients/{id}`, `POST /patients/{id}/token`
//! - `GET /patients/{id}/chart`, `GET /patients/{id}/records?limit=`
//! - `GET /patients/{id}/records/latest`, `POST /patients/{id}/records`
//! - `GET /patients/{id}/appointments`, `POST /appointments`
//! - `PATCH /appointments/{id}` `{"doctor_id", "start_time", "end_time"}`
//! - `POST /appointments/{id}/cancel|complete|pay`
//! - `POST /appointments/{id}/payment` `{"payment_status": "pending|paid|exempt"}`
//! - `GET /agenda?date=YYYY-MM-DD` - the Sunday-to-Saturday week around `date`
//! - `GET /agenda?from=&to=` - RFC 3339 range, `to` exclusive
//! - `GET /audit?target_type=&target_id=`
//! - `GET /monitoring?days=` - admin overview, 7 days by default
//!
//! ## Portal API
//! - `POST /portal/login` `{"token": ...}`, `GET /portal/login/{token}`
//! - `POST /portal/consent` `{"token", "full_name", "cpf", "how_found"}`
//!
//! ## Example Usage
//!
//! ```bash
//! curl -H "X-Staff-Id: 1" -d '{"name": "Ana Souza"}' http://localhost:8090/patients
//!
//! curl -H "X-Staff-Id: 2" -d '{"anxiety_level": 6, "main_complaint": "insomnia"}' \
//!      http://localhost:8090/patients/1/records
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, NaiveDate, Utc};
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::{Body, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use crate::access::ActingUser;
use crate::db::appointments::{NewAppointment, PaymentStatus, RescheduleAppointment};
use crate::db::patients::{DemographicsUpdate, NewPatient};
use crate::db::records::Observation;
use crate::db::users::{NewStaffUser, StaffUpdate};
use crate::error::{ClinicError, ValidationErrors};
use crate::services::patient_service::DEFAULT_LIST_LIMIT;
use crate::services::{
    bad_request, error_response, from_create_result, from_delete_result, from_result, json_response,
    not_found, unauthenticated, ConsentForm, Services,
};

/// Header carrying the acting staff user's id
pub const STAFF_ID_HEADER: &str = "x-staff-id";

/// Largest accepted request body
pub const MAX_BODY_BYTES: usize = 64 * 1024;

type HttpResponse = Response<Full<Bytes>>;

/// HTTP server state
pub struct HttpServer {
    services: Arc<Services>,
    bind_addr: SocketAddr,
}

impl HttpServer {
    pub fn new(services: Arc<Services>, bind_addr: SocketAddr) -> Self {
        Self { services, bind_addr }
    }

    /// Run the HTTP server
    pub async fn run(self: Arc<Self>) -> Result<(), ClinicError> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(addr = %self.bind_addr, "HTTP server listening");

        loop {
            let (stream, remote_addr) = listener.accept().await?;
            let io = TokioIo::new(stream);
            let server = self.clone();

            tokio::spawn(async move {
                let service = service_fn(move |req: Request<Incoming>| {
                    let server = server.clone();
                    async move { Ok::<_, hyper::Error>(server.handle_request(req).await) }
                });

                if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                    warn!(addr = %remote_addr, error = %err, "Connection error");
                }
            });
        }
    }

    /// Read the request and dispatch it on the blocking pool
    pub async fn handle_request<B>(&self, req: Request<B>) -> HttpResponse
    where
        B: Body,
        B::Error: std::error::Error + Send + Sync + 'static,
    {
        let (parts, body) = req.into_parts();
        debug!(method = %parts.method, path = %parts.uri.path(), "Incoming request");

        let body = match Limited::new(body, MAX_BODY_BYTES).collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => return bad_request(&format!("Failed to read body: {}", e)),
        };

        let request = ApiRequest {
            method: parts.method,
            path: parts.uri.path().to_string(),
            query: parts.uri.query().map(str::to_string),
            staff_id: parts
                .headers
                .get(STAFF_ID_HEADER)
                .and_then(|v| v.to_str().ok())
                .map(|v| v.trim().to_string()),
            body,
        };

        let services = self.services.clone();
        match tokio::task::spawn_blocking(move || dispatch(&services, &request)).await {
            Ok(response) => response,
            Err(e) => {
                error!(error = %e, "Handler panicked");
                error_response(ClinicError::Internal("handler failed".to_string()))
            }
        }
    }
}

/// A fully read request
#[derive(Debug)]
struct ApiRequest {
    method: Method,
    path: String,
    query: Option<String>,
    staff_id: Option<String>,
    body: Bytes,
}

impl ApiRequest {
    fn json<T: DeserializeOwned>(&self) -> Result<T, ClinicError> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    fn query<T: DeserializeOwned>(&self) -> Result<T, ClinicError> {
        serde_urlencoded::from_str(self.query.as_deref().unwrap_or(""))
            .map_err(|e| ValidationErrors::single("query", &e.to_string()))
    }
}

#[derive(Debug, Deserialize)]
struct TokenBody {
    token: String,
}

#[derive(Debug, Deserialize)]
struct PortalConsentBody {
    token: String,
    #[serde(flatten)]
    form: ConsentForm,
}

#[derive(Debug, Deserialize)]
struct RecordBody {
    #[serde(flatten)]
    observation: Observation,
    #[serde(default)]
    expected_version: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
struct ListQuery {
    #[serde(default)]
    search: Option<String>,
    #[serde(default)]
    limit: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct PaymentBody {
    payment_status: PaymentStatus,
}

#[derive(Debug, Default, Deserialize)]
struct AgendaQuery {
    #[serde(default)]
    date: Option<NaiveDate>,
    #[serde(default)]
    from: Option<DateTime<Utc>>,
    #[serde(default)]
    to: Option<DateTime<Utc>>,
}

#[derive(Debug, Default, Deserialize)]
struct MonitoringQuery {
    #[serde(default)]
    days: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct AuditQuery {
    target_type: String,
    target_id: i64,
}

fn parse_id(raw: &str) -> Result<i64, ClinicError> {
    raw.parse::<i64>()
        .map_err(|_| ClinicError::NotFound(format!("No resource with id '{}'", raw)))
}

/// Resolve `X-Staff-Id` to a staff user
fn acting_user(services: &Services, req: &ApiRequest) -> Result<ActingUser, HttpResponse> {
    let raw = req
        .staff_id
        .as_deref()
        .ok_or_else(|| unauthenticated("Missing X-Staff-Id header"))?;
    let id = raw
        .parse::<i64>()
        .map_err(|_| unauthenticated("X-Staff-Id must be a staff user id"))?;

    match services.staff.get_user(id) {
        Ok(user) => Ok(user.as_acting_user()),
        Err(ClinicError::NotFound(_)) => Err(unauthenticated("Unknown staff user")),
        Err(e) => Err(error_response(e)),
    }
}

fn dispatch(services: &Services, req: &ApiRequest) -> HttpResponse {
    let segments: Vec<&str> = req.path.split('/').filter(|s| !s.is_empty()).collect();

    match (req.method.clone(), segments.as_slice()) {
        (Method::GET, ["health"]) => health(services),

        // Patient portal
        (Method::POST, ["portal", "login"]) => from_result(
            req.json::<TokenBody>()
                .and_then(|body| services.consent.redeem_token(&body.token)),
        ),
        (Method::GET, ["portal", "login", token]) => from_result(services.consent.redeem_token(token)),
        (Method::POST, ["portal", "consent"]) => from_result(
            req.json::<PortalConsentBody>()
                .and_then(|body| services.consent.redeem_and_submit(&body.token, &body.form)),
        ),

        // The first staff user is created without an acting user
        (Method::POST, ["staff"]) if req.staff_id.is_none() => from_create_result(
            req.json::<NewStaffUser>()
                .and_then(|input| services.staff.create_user(None, &input)),
        ),

        _ => match acting_user(services, req) {
            Ok(actor) => staff_routes(services, req, &actor, &segments),
            Err(response) => response,
        },
    }
}

fn staff_routes(services: &Services, req: &ApiRequest, actor: &ActingUser, segments: &[&str]) -> HttpResponse {
    match (req.method.clone(), segments) {
        // Staff directory
        (Method::POST, ["staff"]) => from_create_result(
            req.json::<NewStaffUser>()
                .and_then(|input| services.staff.create_user(Some(actor), &input)),
        ),
        (Method::GET, ["staff"]) => from_result(services.staff.list_users(actor)),
        (Method::GET, ["staff", id]) => from_result(parse_id(id).and_then(|id| services.staff.get_user(id))),
        (Method::PATCH, ["staff", id]) => from_result(parse_id(id).and_then(|id| {
            let update = req.json::<StaffUpdate>()?;
            services.staff.update_user(actor, id, &update)
        })),
        (Method::DELETE, ["staff", id]) => {
            from_delete_result(parse_id(id).and_then(|id| services.staff.delete_user(actor, id)))
        }
        (Method::GET, ["staff", id, "patients"]) => from_result(
            parse_id(id).and_then(|id| services.patients.list_treated_patients(actor, id)),
        ),

        // Patient directory
        (Method::POST, ["patients"]) => from_create_result(
            req.json::<NewPatient>()
                .and_then(|input| services.patients.create_patient(actor, &input)),
        ),
        (Method::GET, ["patients"]) => from_result(req.query::<ListQuery>().and_then(|q| {
            services.patients.search_patients(
                actor,
                q.search.as_deref().unwrap_or(""),
                q.limit.unwrap_or(DEFAULT_LIST_LIMIT),
            )
        })),
        (Method::GET, ["patients", "pending-consent"]) => from_result(req.query::<ListQuery>().and_then(|q| {
            services
                .patients
                .list_pending_consents(actor, q.limit.unwrap_or(DEFAULT_LIST_LIMIT))
        })),
        (Method::GET, ["patients", id]) => {
            from_result(parse_id(id).and_then(|id| services.patients.get_patient(actor, id)))
        }
        (Method::PATCH, ["patients", id]) => from_result(parse_id(id).and_then(|id| {
            let update = req.json::<DemographicsUpdate>()?;
            services.patients.update_demographics(actor, id, &update)
        })),
        (Method::DELETE, ["patients", id]) => {
            from_delete_result(parse_id(id).and_then(|id| services.patients.delete_patient(actor, id)))
        }
        (Method::POST, ["patients", id, "token"]) => {
            from_result(parse_id(id).and_then(|id| services.consent.issue_token(actor, id)))
        }

        // Clinical ledger
        (Method::GET, ["patients", id, "chart"]) => {
            from_result(parse_id(id).and_then(|id| services.ledger.get_patient_chart(actor, id)))
        }
        (Method::GET, ["patients", id, "records"]) => from_result(parse_id(id).and_then(|id| {
            let limit = req.query::<ListQuery>()?.limit;
            let history = services.ledger.get_patient_history(actor, id)?;
            match limit {
                Some(n) => history.iter().take(n as usize).collect::<Result<Vec<_>, _>>(),
                None => history.to_vec(),
            }
        })),
        (Method::GET, ["patients", id, "records", "latest"]) => {
            from_result(parse_id(id).and_then(|id| services.ledger.get_latest_record(actor, id)))
        }
        (Method::POST, ["patients", id, "records"]) => from_create_result(parse_id(id).and_then(|id| {
            let body = req.json::<RecordBody>()?;
            services
                .ledger
                .record_clinical_update(actor, id, &body.observation, body.expected_version)
        })),

        // Appointment book
        (Method::GET, ["patients", id, "appointments"]) => {
            from_result(parse_id(id).and_then(|id| services.appointments.list_for_patient(actor, id)))
        }
        (Method::POST, ["appointments"]) => from_create_result(
            req.json::<NewAppointment>()
                .and_then(|input| services.appointments.schedule(actor, &input)),
        ),
        (Method::PATCH, ["appointments", id]) => from_result(parse_id(id).and_then(|id| {
            let slot = req.json::<RescheduleAppointment>()?;
            services.appointments.reschedule(actor, id, &slot)
        })),
        (Method::POST, ["appointments", id, action]) => {
            let id = match parse_id(id) {
                Ok(id) => id,
                Err(e) => return error_response(e),
            };
            match *action {
                "cancel" => from_result(services.appointments.cancel(actor, id)),
                "complete" => from_result(services.appointments.complete(actor, id)),
                "pay" => from_result(services.appointments.mark_paid(actor, id)),
                "payment" => from_result(
                    req.json::<PaymentBody>()
                        .and_then(|body| services.appointments.set_payment(actor, id, body.payment_status)),
                ),
                _ => not_found("Not Found"),
            }
        }
        (Method::GET, ["agenda"]) => match req.query::<AgendaQuery>() {
            Ok(AgendaQuery { from: Some(from), to: Some(to), .. }) => {
                from_result(services.appointments.agenda(actor, from, to))
            }
            Ok(AgendaQuery { from: None, to: None, date }) => {
                let date = date.unwrap_or_else(|| Utc::now().date_naive());
                from_result(services.appointments.week_agenda(actor, date))
            }
            Ok(_) => error_response(ValidationErrors::single("to", "from and to must be given together")),
            Err(e) => error_response(e),
        },

        // Audit trail
        (Method::GET, ["audit"]) => from_result(
            req.query::<AuditQuery>()
                .and_then(|q| services.audit.list_entries(actor, &q.target_type, q.target_id)),
        ),
        (Method::GET, ["monitoring"]) => from_result(
            req.query::<MonitoringQuery>()
                .and_then(|q| services.monitoring.report(actor, q.days)),
        ),

        _ => not_found("Not Found"),
    }
}

fn health(services: &Services) -> HttpResponse {
    match services.db.stats() {
        Ok(stats) => json_response(
            StatusCode::OK,
            &serde_json::json!({
                "status": "ok",
                "consent_policy": services.consent.policy(),
                "stats": stats,
            }),
        ),
        Err(e) => error_response(e),
    }
}
