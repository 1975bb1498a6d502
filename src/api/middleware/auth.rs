use axum::{
    extract::{Request, State},
    http::header::AUTHORIZATION,
    middleware::Next,
    response::Response,
};
use std::sync::Arc;
use tracing::warn;

use crate::api::context::{request_id_of, Principal};
use crate::api::error::{ApiError, ErrorResponse};
use crate::api::routes::AppState;
use crate::config::AuthSettings;

/// Principal attached to requests carrying a valid static key.
pub const API_PRINCIPAL: &str = "api-user";

/// Static API-key check for the API group. Accepts the configured header or
/// `Authorization: Bearer <key>`. A no-op when auth is disabled.
pub async fn require_api_key(
    State(state): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Result<Response, ErrorResponse> {
    let auth = &state.settings.auth;
    if !auth.enabled {
        return Ok(next.run(req).await);
    }

    let request_id = request_id_of(req.headers());
    let fail = |error: ApiError| ErrorResponse::new(error, request_id.clone(), state.settings.is_debug());

    let key = match presented_key(&req, auth) {
        Presented::Missing => return Err(fail(ApiError::Unauthorized)),
        Presented::Key(key) => key,
    };

    if !is_valid_key(auth, &key) {
        warn!(request_id = %request_id, "Invalid API key provided");
        return Err(fail(ApiError::InvalidToken));
    }

    req.extensions_mut()
        .insert(Principal(API_PRINCIPAL.to_string()));
    Ok(next.run(req).await)
}

enum Presented {
    Missing,
    Key(String),
}

fn presented_key(req: &Request, auth: &AuthSettings) -> Presented {
    let headers = req.headers();
    if let Some(key) = headers
        .get(auth.api_key_header.as_str())
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
    {
        return Presented::Key(key.to_string());
    }

    match headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok()) {
        None | Some("") => Presented::Missing,
        // Anything that is not a bearer token is an invalid key, not a missing one.
        Some(value) => Presented::Key(value.strip_prefix("Bearer ").unwrap_or("").to_string()),
    }
}

fn is_valid_key(auth: &AuthSettings, key: &str) -> bool {
    !key.is_empty() && auth.api_keys.iter().any(|valid| valid == key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;

    fn auth() -> AuthSettings {
        AuthSettings {
            enabled: true,
            api_key_header: "X-API-Key".into(),
            api_keys: vec!["k1".into(), "k2".into()],
        }
    }

    fn request(headers: &[(&str, &str)]) -> Request {
        let mut builder = Request::builder().uri("/vms");
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder.body(Body::empty()).unwrap()
    }

    #[test]
    fn header_and_bearer_are_both_accepted() {
        let auth = auth();
        match presented_key(&request(&[("X-API-Key", "k1")]), &auth) {
            Presented::Key(key) => assert!(is_valid_key(&auth, &key)),
            Presented::Missing => panic!("header key not seen"),
        }
        match presented_key(&request(&[("Authorization", "Bearer k2")]), &auth) {
            Presented::Key(key) => assert!(is_valid_key(&auth, &key)),
            Presented::Missing => panic!("bearer key not seen"),
        }
    }

    #[test]
    fn missing_and_malformed_credentials_differ() {
        let auth = auth();
        assert!(matches!(presented_key(&request(&[]), &auth), Presented::Missing));
        match presented_key(&request(&[("Authorization", "Basic Zm9v")]), &auth) {
            Presented::Key(key) => assert!(!is_valid_key(&auth, &key)),
            Presented::Missing => panic!("basic auth should count as a bad key"),
        }
    }
}
