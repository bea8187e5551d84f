//! HTTP response building helpers
//!
//! Provides a consistent API for building HTTP responses across all handlers.
//! Errors are rendered as `{"error": ...}`; validation failures additionally
//! carry `fields` and `submitted` so a form can be re-rendered.

use bytes::Bytes;
use http_body_util::Full;
use hyper::header::{self, HeaderValue};
use hyper::{Response, StatusCode};
use serde::Serialize;
use tracing::error;

use crate::error::ClinicError;

/// Build a JSON response with the given status code
pub fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<Full<Bytes>> {
    let json = serde_json::to_string(body).unwrap_or_else(|_| "{}".to_string());
    let mut response = Response::new(Full::new(Bytes::from(json)));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

/// Build a JSON response with 200 OK status
pub fn ok<T: Serialize>(body: &T) -> Response<Full<Bytes>> {
    json_response(StatusCode::OK, body)
}

/// Build a JSON response with 201 Created status
pub fn created<T: Serialize>(body: &T) -> Response<Full<Bytes>> {
    json_response(StatusCode::CREATED, body)
}

/// Build an empty response with 204 No Content status
pub fn no_content() -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::new()));
    *response.status_mut() = StatusCode::NO_CONTENT;
    response
}

pub fn not_found(message: &str) -> Response<Full<Bytes>> {
    json_response(StatusCode::NOT_FOUND, &serde_json::json!({ "error": message }))
}

pub fn bad_request(message: &str) -> Response<Full<Bytes>> {
    json_response(StatusCode::BAD_REQUEST, &serde_json::json!({ "error": message }))
}

pub fn method_not_allowed() -> Response<Full<Bytes>> {
    json_response(
        StatusCode::METHOD_NOT_ALLOWED,
        &serde_json::json!({ "error": "Method not allowed" }),
    )
}

/// Missing or unknown `X-Staff-Id`
pub fn unauthenticated(message: &str) -> Response<Full<Bytes>> {
    json_response(StatusCode::UNAUTHORIZED, &serde_json::json!({ "error": message }))
}

/// Status code for an error
pub fn error_status(error: &ClinicError) -> StatusCode {
    match error {
        ClinicError::PatientNotFound(_)
        | ClinicError::AuthorNotFound(_)
        | ClinicError::RecordNotFound(_)
        | ClinicError::NotFound(_)
        | ClinicError::InvalidToken => StatusCode::NOT_FOUND,
        ClinicError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
        ClinicError::Unauthorized(_) => StatusCode::FORBIDDEN,
        ClinicError::Conflict(_) => StatusCode::CONFLICT,
        ClinicError::Json(_) => StatusCode::BAD_REQUEST,
        ClinicError::Database(_) | ClinicError::Io(_) | ClinicError::Config(_) | ClinicError::Internal(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

/// Convert a ClinicError to an appropriate HTTP response
pub fn error_response(error: ClinicError) -> Response<Full<Bytes>> {
    let status = error_status(&error);

    match error {
        ClinicError::Validation(errors) => json_response(
            status,
            &serde_json::json!({
                "error": "Validation failed",
                "fields": errors.fields,
                "submitted": errors.submitted,
            }),
        ),
        other => {
            if status == StatusCode::INTERNAL_SERVER_ERROR {
                error!(error = %other, "Request failed");
            }
            json_response(status, &serde_json::json!({ "error": other.to_string() }))
        }
    }
}

/// Wrap a service result into an HTTP response
pub fn from_result<T: Serialize>(result: Result<T, ClinicError>) -> Response<Full<Bytes>> {
    match result {
        Ok(value) => ok(&value),
        Err(e) => error_response(e),
    }
}

/// Wrap a create result into an HTTP response with 201 Created
pub fn from_create_result<T: Serialize>(result: Result<T, ClinicError>) -> Response<Full<Bytes>> {
    match result {
        Ok(value) => created(&value),
        Err(e) => error_response(e),
    }
}

/// Wrap a delete result into an HTTP response with 204 No Content
pub fn from_delete_result(result: Result<(), ClinicError>) -> Response<Full<Bytes>> {
    match result {
        Ok(()) => no_content(),
        Err(e) => error_response(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ValidationErrors;
    use http_body_util::BodyExt;

    #[test]
    fn test_ok_response() {
        let resp = ok(&serde_json::json!({"test": true}));
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()[header::CONTENT_TYPE], "application/json");
    }

    #[test]
    fn test_error_statuses() {
        assert_eq!(error_status(&ClinicError::PatientNotFound(1)), StatusCode::NOT_FOUND);
        assert_eq!(error_status(&ClinicError::InvalidToken), StatusCode::NOT_FOUND);
        assert_eq!(error_status(&ClinicError::Unauthorized("x".into())), StatusCode::FORBIDDEN);
        assert_eq!(error_status(&ClinicError::Conflict("x".into())), StatusCode::CONFLICT);
        assert_eq!(
            error_status(&ClinicError::Internal("x".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[tokio::test]
    async fn test_validation_body_carries_submitted_values() {
        let mut errors = ValidationErrors::new();
        errors.add("cpf", "invalid");
        errors.keep_value("cpf", "123");
        let resp = error_response(ClinicError::Validation(errors));
        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);

        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["fields"]["cpf"], "invalid");
        assert_eq!(json["submitted"]["cpf"], "123");
    }
}
