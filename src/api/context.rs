use axum::{
    extract::FromRequestParts,
    http::{request::Parts, HeaderMap},
};
use std::convert::Infallible;
use std::sync::Arc;
use uuid::Uuid;

use crate::api::error::{ApiError, ErrorResponse};
use crate::api::routes::AppState;
use crate::core::service::SYSTEM_PRINCIPAL;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Who made the request, set by the auth middleware.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal(pub String);

pub fn request_id_of(headers: &HeaderMap) -> String {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("unknown")
        .to_string()
}

/// Per-request bits every handler wants: correlation id, principal, and
/// whether internal error text may be shown.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: String,
    pub principal: String,
    expose_internal: bool,
}

impl RequestContext {
    pub fn fail(&self, error: impl Into<ApiError>) -> ErrorResponse {
        ErrorResponse::new(error, self.request_id.clone(), self.expose_internal)
    }

    pub fn parse_id(&self, raw: &str) -> Result<Uuid, ErrorResponse> {
        Uuid::parse_str(raw).map_err(|_| {
            tracing::warn!(request_id = %self.request_id, "Invalid VM ID format: {}", raw);
            self.fail(ApiError::InvalidInput("Invalid UUID format".to_string()))
        })
    }
}

impl FromRequestParts<Arc<AppState>> for RequestContext {
    type Rejection = Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let principal = parts
            .extensions
            .get::<Principal>()
            .map(|p| p.0.clone())
            .unwrap_or_else(|| SYSTEM_PRINCIPAL.to_string());

        Ok(Self {
            request_id: request_id_of(&parts.headers),
            principal,
            expose_internal: state.settings.is_debug(),
        })
    }
}
