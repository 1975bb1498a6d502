use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use std::sync::Arc;
use std::time::Instant;

use crate::api::routes::AppState;

/// Counts and times every request that makes it past the request-id layer.
pub async fn track_metrics(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Response {
    let method = req.method().as_str().to_owned();
    let started = Instant::now();
    let response = next.run(req).await;
    state
        .metrics
        .observe_request(&method, response.status().as_u16(), started.elapsed());
    response
}
