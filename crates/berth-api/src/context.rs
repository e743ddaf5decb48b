//! Request context extraction and admin authentication middleware.
//!
//! Every request gets a [`RequestContext`] carrying a correlation id, echoed
//! back in the `x-request-id` response header. Admin routes additionally
//! require a static bearer token; in debug mode with no token configured the
//! check is skipped for local development.

use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::extract::FromRequestParts;
use axum::extract::State;
use axum::http::header::HeaderName;
use axum::http::request::Parts;
use axum::http::{HeaderMap, HeaderValue, Request};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use sha2::{Digest, Sha256};
use ulid::Ulid;

use crate::error::ApiError;
use crate::server::AppState;

/// Header name for request IDs.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Per-request context derived from headers.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Request ID for tracing/correlation.
    pub request_id: String,
}

#[async_trait]
impl FromRequestParts<Arc<AppState>> for RequestContext {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        _state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        if let Some(existing) = parts.extensions.get::<Self>() {
            return Ok(existing.clone());
        }

        let request_id =
            request_id_from_headers(&parts.headers).unwrap_or_else(|| Ulid::new().to_string());

        let ctx = Self { request_id };
        parts.extensions.insert(ctx.clone());
        Ok(ctx)
    }
}

fn request_id_from_headers(headers: &HeaderMap) -> Option<String> {
    header_string(headers, "X-Request-Id").or_else(|| header_string(headers, "X-Request-ID"))
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let raw = header_string(headers, "Authorization")?;
    let token = raw.strip_prefix("Bearer ")?;
    Some(token.to_string())
}

fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    let value = headers.get(name)?;
    value.to_str().ok().map(str::to_string)
}

/// Compares two tokens by SHA-256 digest so the comparison length does not
/// depend on where the strings first differ.
fn token_matches(provided: &str, expected: &str) -> bool {
    Sha256::digest(provided.as_bytes()) == Sha256::digest(expected.as_bytes())
}

/// Request context middleware.
///
/// Injects a [`RequestContext`] into request extensions and mirrors its id
/// into the `x-request-id` response header.
pub async fn request_context_middleware(
    State(state): State<Arc<AppState>>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let (mut parts, body) = req.into_parts();

    let ctx = match RequestContext::from_request_parts(&mut parts, &state).await {
        Ok(ctx) => ctx,
        Err(err) => return err.into_response(),
    };

    let mut req = Request::from_parts(parts, body);
    let request_id = ctx.request_id.clone();
    req.extensions_mut().insert(ctx);

    let mut response = next.run(req).await;
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response
            .headers_mut()
            .insert(HeaderName::from_static(REQUEST_ID_HEADER), value);
    }
    response
}

/// Admin authentication middleware.
///
/// Requires `Authorization: Bearer <token>` matching the configured admin
/// token. Runs after [`request_context_middleware`] so rejections carry the
/// request id.
pub async fn admin_auth_middleware(
    State(state): State<Arc<AppState>>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let request_id = req
        .extensions()
        .get::<RequestContext>()
        .map(|ctx| ctx.request_id.clone())
        .unwrap_or_else(|| Ulid::new().to_string());

    let Some(expected) = state.config.admin.token.as_deref() else {
        if state.config.debug {
            return next.run(req).await;
        }
        return ApiError::unauthorized("admin access is not configured")
            .with_request_id(request_id)
            .into_response();
    };

    let Some(provided) = bearer_token(req.headers()) else {
        return ApiError::missing_auth()
            .with_request_id(request_id)
            .into_response();
    };

    if !token_matches(&provided, expected) {
        return ApiError::unauthorized("invalid admin token")
            .with_request_id(request_id)
            .into_response();
    }

    next.run(req).await
}
