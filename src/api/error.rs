use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Map, Value};
use thiserror::Error;

use crate::errors::VmManagerError;

/// Everything a handler or middleware can answer with besides success.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Service(#[from] VmManagerError),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Body or query string that could not even be deserialized.
    #[error("Malformed request: {0}")]
    Malformed(String),

    #[error("Authentication required")]
    Unauthorized,

    #[error("Invalid API key")]
    InvalidToken,

    #[error("Rate limit exceeded")]
    RateLimited,

    #[error("Resource not found")]
    RouteNotFound,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Service(err) => match err {
                VmManagerError::ValidationFailed { .. } => StatusCode::BAD_REQUEST,
                VmManagerError::AlreadyExists { .. } => StatusCode::CONFLICT,
                VmManagerError::NotFound { .. } => StatusCode::NOT_FOUND,
                VmManagerError::InvalidVmState { .. } => StatusCode::CONFLICT,
                VmManagerError::ResourceExceeded { .. } => StatusCode::UNPROCESSABLE_ENTITY,
                VmManagerError::Storage { .. } | VmManagerError::Unknown(_) => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            },
            ApiError::InvalidInput(_) | ApiError::Malformed(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized | ApiError::InvalidToken => StatusCode::UNAUTHORIZED,
            ApiError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ApiError::RouteNotFound => StatusCode::NOT_FOUND,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ApiError::Service(err) => err.code(),
            ApiError::InvalidInput(_) => "INVALID_INPUT",
            ApiError::Malformed(_) => "VALIDATION_FAILED",
            ApiError::Unauthorized => "UNAUTHORIZED",
            ApiError::InvalidToken => "INVALID_TOKEN",
            ApiError::RateLimited => "RATE_LIMIT_EXCEEDED",
            ApiError::RouteNotFound => "NOT_FOUND",
        }
    }

    fn message(&self) -> String {
        match self {
            ApiError::Service(VmManagerError::Storage { .. }) => {
                "Database operation failed".to_string()
            }
            ApiError::Service(VmManagerError::Unknown(_)) => {
                "An unexpected error occurred".to_string()
            }
            ApiError::Service(VmManagerError::ValidationFailed { .. }) => {
                "Validation failed".to_string()
            }
            ApiError::InvalidInput(_) => "Invalid input".to_string(),
            ApiError::Malformed(_) => "Validation failed".to_string(),
            other => other.to_string(),
        }
    }

    /// Driver text for internal failures only leaks out when `expose_internal`.
    fn details(&self, expose_internal: bool) -> Option<String> {
        match self {
            ApiError::Service(err) if err.is_internal() => expose_internal.then(|| err.to_string()),
            ApiError::Service(VmManagerError::ValidationFailed { details }) => Some(details.clone()),
            ApiError::InvalidInput(details) | ApiError::Malformed(details) => Some(details.clone()),
            _ => None,
        }
    }

    fn context(&self) -> Option<Value> {
        let ApiError::Service(err) = self else {
            return None;
        };
        let mut ctx = Map::new();
        match err {
            VmManagerError::InvalidVmState {
                vm_id,
                current,
                required,
            } => {
                ctx.insert("vm_id".into(), json!(vm_id));
                ctx.insert("current_status".into(), json!(current.as_str()));
                ctx.insert("required_status".into(), json!(required.to_string()));
            }
            VmManagerError::ResourceExceeded {
                resource,
                requested,
                limit,
            } => {
                ctx.insert("resource".into(), json!(resource.to_string()));
                ctx.insert("requested".into(), json!(requested));
                ctx.insert("limit".into(), json!(limit));
            }
            VmManagerError::NotFound { resource, id } => {
                ctx.insert("resource".into(), json!(resource));
                ctx.insert("id".into(), json!(id));
            }
            VmManagerError::AlreadyExists { resource, name } => {
                ctx.insert("resource".into(), json!(resource));
                ctx.insert("name".into(), json!(name));
            }
            VmManagerError::Storage { operation, .. } => {
                ctx.insert("operation".into(), json!(operation));
            }
            _ => return None,
        }
        Some(Value::Object(ctx))
    }
}

/// An [`ApiError`] bound to the request it failed.
#[derive(Debug)]
pub struct ErrorResponse {
    pub error: ApiError,
    pub request_id: String,
    pub expose_internal: bool,
}

impl ErrorResponse {
    pub fn new(error: impl Into<ApiError>, request_id: impl Into<String>, expose_internal: bool) -> Self {
        Self {
            error: error.into(),
            request_id: request_id.into(),
            expose_internal,
        }
    }

    pub fn body(&self) -> Value {
        let mut error = Map::new();
        error.insert("code".into(), json!(self.error.code()));
        error.insert("message".into(), json!(self.error.message()));
        if let Some(details) = self.error.details(self.expose_internal) {
            error.insert("details".into(), json!(details));
        }
        if let Some(context) = self.error.context() {
            error.insert("context".into(), context);
        }

        let mut body = json!({
            "error": Value::Object(error),
            "request_id": self.request_id,
        });
        if matches!(self.error, ApiError::RateLimited) {
            body["retry_after"] = json!("60");
        }
        body
    }
}

impl IntoResponse for ErrorResponse {
    fn into_response(self) -> Response {
        (self.error.status(), Json(self.body())).into_response()
    }
}
