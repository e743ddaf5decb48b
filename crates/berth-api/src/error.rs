//! API error types and HTTP response mapping.

use axum::Json;
use axum::http::HeaderValue;
use axum::http::StatusCode;
use axum::http::header::HeaderName;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use berth_core::Error as CoreError;
use berth_provision::error::{Error as ProvisionCrateError, ProvisionError, ProvisionErrorKind};

/// API result type.
pub type ApiResult<T> = Result<T, ApiError>;

/// Message used for every upstream panel failure.
///
/// Panel responses carry node hostnames, egg ids, and other internals that
/// must not reach storefront clients; the full detail stays in logs and on
/// the order's recorded failure.
const PANEL_OPAQUE_MESSAGE: &str = "upstream panel request failed";

/// Standard JSON error response body.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiErrorBody {
    /// Stable machine-readable error code.
    pub code: String,
    /// Human-readable message (safe for clients).
    pub message: String,
    /// Optional error category (e.g., `unprocessable_entity`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    /// Optional request ID for correlation.
    pub request_id: Option<String>,
}

/// HTTP API error with stable machine-readable code.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
    error: Option<&'static str>,
    request_id: Option<String>,
    retry_after_secs: Option<u64>,
}

impl ApiError {
    /// Returns an error response for invalid input.
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "BAD_REQUEST", message)
    }

    /// Returns an error response for authentication failures.
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "UNAUTHORIZED", message)
    }

    /// Returns an error response when the Authorization header is missing.
    #[must_use]
    pub fn missing_auth() -> Self {
        Self::new(
            StatusCode::UNAUTHORIZED,
            "MISSING_AUTH",
            "Authorization header required",
        )
    }

    /// Returns an error response when a webhook signature does not verify.
    #[must_use]
    pub fn invalid_signature() -> Self {
        Self::new(
            StatusCode::UNAUTHORIZED,
            "INVALID_SIGNATURE",
            "webhook signature verification failed",
        )
    }

    /// Returns an error response for missing resources.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "NOT_FOUND", message)
    }

    /// Returns an error response for conflict (wrong state / CAS).
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, "CONFLICT", message)
    }

    /// Returns an unprocessable entity error response.
    pub fn unprocessable_entity(code: &'static str, message: impl Into<String>) -> Self {
        Self::new_with_error(
            StatusCode::UNPROCESSABLE_ENTITY,
            code,
            message,
            Some("unprocessable_entity"),
        )
    }

    /// Returns an error response for a failed upstream panel call.
    ///
    /// Always carries the opaque message, whatever the panel said.
    #[must_use]
    pub fn upstream_panel() -> Self {
        Self::new(
            StatusCode::BAD_GATEWAY,
            "UPSTREAM_PANEL",
            PANEL_OPAQUE_MESSAGE,
        )
    }

    /// Returns an internal error response.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL", message)
    }

    /// Attaches a request ID for correlation.
    #[must_use]
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    /// Attaches a Retry-After header value in seconds.
    #[must_use]
    pub fn with_retry_after(mut self, seconds: u64) -> Self {
        self.retry_after_secs = Some(seconds);
        self
    }

    /// Returns the HTTP status code for this error.
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        self.status
    }

    /// Returns the human-readable error message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Returns the request ID, if one was attached.
    #[must_use]
    pub fn request_id(&self) -> Option<&str> {
        self.request_id.as_deref()
    }

    /// Returns the stable machine-readable error code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        self.code
    }

    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self::new_with_error(status, code, message, None)
    }

    fn new_with_error(
        status: StatusCode,
        code: &'static str,
        message: impl Into<String>,
        error: Option<&'static str>,
    ) -> Self {
        Self {
            status,
            code,
            message: message.into(),
            error,
            request_id: None,
            retry_after_secs: None,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let request_id = self.request_id;
        let retry_after_secs = self.retry_after_secs;
        let mut response = (
            self.status,
            Json(ApiErrorBody {
                code: self.code.to_string(),
                message: self.message,
                error: self.error.map(str::to_string),
                request_id: request_id.clone(),
            }),
        )
            .into_response();

        if let Some(request_id) = request_id {
            if let Ok(value) = HeaderValue::from_str(&request_id) {
                response
                    .headers_mut()
                    .insert(HeaderName::from_static("x-request-id"), value);
            }
        }

        if let Some(secs) = retry_after_secs {
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response
                    .headers_mut()
                    .insert(HeaderName::from_static("retry-after"), value);
            }
        }

        response
    }
}

impl From<ProvisionCrateError> for ApiError {
    fn from(value: ProvisionCrateError) -> Self {
        match value {
            ProvisionCrateError::OrderNotFound { order_id } => {
                Self::not_found(format!("order not found: {order_id}"))
            }
            ProvisionCrateError::NodeNotFound { node_id } => {
                Self::not_found(format!("node not found: {node_id}"))
            }
            ProvisionCrateError::PlanNotFound { plan_id } => {
                Self::not_found(format!("plan not found: {plan_id}"))
            }
            ProvisionCrateError::InvalidStateTransition { from, to, reason } => {
                Self::conflict(format!("invalid transition {from} -> {to}: {reason}"))
            }
            ProvisionCrateError::InvalidEvent { message } => {
                Self::unprocessable_entity("INVALID_EVENT", message)
            }
            ProvisionCrateError::Panel { .. } => Self::upstream_panel(),
            ProvisionCrateError::Storage { message, .. }
            | ProvisionCrateError::Serialization { message }
            | ProvisionCrateError::Configuration { message } => Self::internal(message),
            ProvisionCrateError::Core(core) => core.into(),
        }
    }
}

impl From<CoreError> for ApiError {
    fn from(value: CoreError) -> Self {
        match value {
            CoreError::InvalidId { message } => Self::bad_request(message),
            CoreError::InvalidInput(message) => Self::bad_request(message),
            CoreError::ResourceNotFound { resource_type, id } => {
                Self::not_found(format!("{resource_type} not found: {id}"))
            }
            CoreError::PreconditionFailed { message } => Self::conflict(message),
            CoreError::Storage { message, .. }
            | CoreError::Serialization { message }
            | CoreError::Internal { message } => Self::internal(message),
        }
    }
}

impl From<ProvisionError> for ApiError {
    fn from(value: ProvisionError) -> Self {
        match value.kind {
            ProvisionErrorKind::PlanConfig => {
                Self::unprocessable_entity("PLAN_CONFIG", value.message)
            }
            ProvisionErrorKind::NodeCapacity => {
                Self::conflict(format!("no capacity: {}", value.message))
            }
            ProvisionErrorKind::AllocationPool => {
                Self::conflict(format!("no free endpoint: {}", value.message))
            }
            ProvisionErrorKind::RemoteCall => Self::upstream_panel(),
            ProvisionErrorKind::Persistence => Self::internal(value.message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn with_retry_after_sets_header() {
        let error = ApiError::conflict("no capacity in region").with_retry_after(60);
        let response = error.into_response();

        let retry_after = response
            .headers()
            .get("retry-after")
            .expect("Retry-After header should be present");
        assert_eq!(retry_after.to_str().unwrap(), "60");
    }

    #[test]
    fn regular_conflict_has_no_retry_after() {
        let error = ApiError::conflict("test");
        let response = error.into_response();

        assert!(response.headers().get("retry-after").is_none());
    }

    #[test]
    fn panel_errors_never_leak_detail() {
        let upstream = ProvisionCrateError::panel_status(
            500,
            "node wings-03.internal refused egg 17: disk full on /var/lib/pterodactyl",
        );
        let api: ApiError = upstream.into();

        assert_eq!(api.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(api.code(), "UPSTREAM_PANEL");
        assert!(!api.message().contains("wings-03"));
        assert!(!api.message().contains("egg"));
    }

    #[test]
    fn remote_call_retry_failures_stay_opaque() {
        let failure = ProvisionError::new(
            ProvisionErrorKind::RemoteCall,
            "create server: 504 from https://panel.internal/api/application/servers",
        );
        let api: ApiError = failure.into();

        assert_eq!(api.status(), StatusCode::BAD_GATEWAY);
        assert!(!api.message().contains("panel.internal"));
    }

    #[test]
    fn invalid_event_maps_to_unprocessable() {
        let err = ProvisionCrateError::InvalidEvent {
            message: "subscription_id is empty".to_string(),
        };
        let api: ApiError = err.into();

        assert_eq!(api.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(api.code(), "INVALID_EVENT");
    }

    #[test]
    fn precondition_failures_map_to_conflict() {
        let err = CoreError::precondition_failed("node 3 is enabled");
        let api: ApiError = err.into();

        assert_eq!(api.status(), StatusCode::CONFLICT);
        assert!(api.message().contains("node 3"));
    }

    #[test]
    fn request_id_round_trips_into_the_response() {
        let error = ApiError::not_found("order not found").with_request_id("req-7");
        assert_eq!(error.request_id(), Some("req-7"));

        let response = error.into_response();
        assert_eq!(
            response
                .headers()
                .get("x-request-id")
                .and_then(|v| v.to_str().ok()),
            Some("req-7")
        );
    }
}
