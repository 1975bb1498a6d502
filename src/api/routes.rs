/*
* VM Lifecycle Manager API Routes
* -------------------------------
* @project: vm-lifecycle-manager
*
* The HTTP face of the orchestration service. Handlers stay thin: bind the
* request, call VmService, wrap the answer in {"data": ..., "request_id": ...}.
*
* API Endpoints (under server.api_prefix, /api/v1 by default):
* ------------------------------------------------------------
* POST   /vms                  - Create a VM (lands in pending, stopped ~2s later)
* GET    /vms                  - List with filters, sorting and pagination
* GET    /vms/by-name/{name}   - Look a VM up by its unique name
* GET    /vms/{id}             - VM details
* PUT    /vms/{id}             - Partial update, stopped VMs only
* DELETE /vms/{id}             - Soft delete, stopped VMs only
* POST   /vms/{id}/start       - 202, running ~3s later
* POST   /vms/{id}/stop        - 202, {"force": true} skips the wait
* POST   /vms/{id}/restart     - 202
* POST   /vms/{id}/suspend     - 202
* POST   /vms/{id}/resume      - 202
* GET    /vms/{id}/stats       - Fresh stats when running
* GET    /stats/summary        - Fleet-wide resource summary
*
* Outside the prefix, no auth: /health /ready /live /version and the metrics path.
*
* Middleware, outermost first: request id -> trace -> metrics -> CORS ->
* security headers -> timeout -> body limit -> rate limit -> API key (API group only).
*/

use axum::{
    body::{Body, Bytes},
    extract::{rejection::JsonRejection, rejection::QueryRejection, Path, Query, State},
    http::{header, HeaderName, HeaderValue, Request, StatusCode},
    middleware,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    limit::RequestBodyLimitLayer,
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    set_header::SetResponseHeaderLayer,
    timeout::TimeoutLayer,
    trace::TraceLayer,
};
use tracing::{info, info_span, warn};

use crate::api::context::{RequestContext, REQUEST_ID_HEADER};
use crate::api::error::{ApiError, ErrorResponse};
use crate::api::middleware::{rate_limit, require_api_key, track_metrics, GlobalRateLimit};
use crate::api::system;
use crate::config::settings::CorsSettings;
use crate::config::Settings;
use crate::core::service::VmService;
use crate::core::vm::{
    CreateVmRequest, ListOptions, StateChangeRequest, UpdateVmRequest, VMStatus, VmResponse,
};
use crate::errors::VmResult;
use crate::monitoring::{ApiMetrics, Outcome};

pub struct AppState {
    pub service: Arc<VmService>,
    pub settings: Arc<Settings>,
    pub metrics: ApiMetrics,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(service: Arc<VmService>, settings: Arc<Settings>, metrics: ApiMetrics) -> Self {
        Self {
            service,
            settings,
            metrics,
            started_at: Utc::now(),
        }
    }

    fn record<T>(&self, operation: &str, result: &VmResult<T>) {
        let outcome = if result.is_ok() {
            Outcome::Success
        } else {
            Outcome::Failure
        };
        self.metrics.record_operation(operation, outcome);
    }
}

type HandlerResult = Result<axum::response::Response, ErrorResponse>;

pub fn create_router(state: Arc<AppState>) -> Router {
    let settings = Arc::clone(&state.settings);

    let api = Router::new()
        .route("/vms", post(create_vm).get(list_vms))
        .route("/vms/by-name/{name}", get(get_vm_by_name))
        .route("/vms/{id}", get(get_vm).put(update_vm).delete(delete_vm))
        .route("/vms/{id}/start", post(start_vm))
        .route("/vms/{id}/stop", post(stop_vm))
        .route("/vms/{id}/restart", post(restart_vm))
        .route("/vms/{id}/suspend", post(suspend_vm))
        .route("/vms/{id}/resume", post(resume_vm))
        .route("/vms/{id}/stats", get(get_vm_stats))
        .route("/stats/summary", get(get_resource_summary))
        .route_layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            require_api_key,
        ));

    let mut router = Router::new()
        .route("/health", get(system::health))
        .route("/ready", get(system::ready))
        .route("/live", get(system::live))
        .route("/version", get(system::version));

    if settings.metrics.enabled {
        router = router.route(&settings.metrics.path, get(system::metrics));
    }

    let prefix = settings.server.api_prefix.trim_end_matches('/');
    router = if prefix.is_empty() {
        router.merge(api)
    } else {
        router.nest(prefix, api)
    };

    let mut router = router.fallback(fallback).with_state(Arc::clone(&state));

    if let Some(limit) = GlobalRateLimit::from_settings(&settings.rate_limit, settings.is_debug()) {
        router = router.layer(middleware::from_fn_with_state(
            Arc::new(limit),
            rate_limit::enforce,
        ));
    }

    let router = router
        .layer(RequestBodyLimitLayer::new(settings.server.body_limit_bytes))
        .layer(
            ServiceBuilder::new()
                .layer(cors_layer(&settings.server.cors))
                .layer(SetResponseHeaderLayer::overriding(
                    header::X_CONTENT_TYPE_OPTIONS,
                    HeaderValue::from_static("nosniff"),
                ))
                .layer(SetResponseHeaderLayer::overriding(
                    header::X_FRAME_OPTIONS,
                    HeaderValue::from_static("DENY"),
                ))
                .layer(SetResponseHeaderLayer::overriding(
                    header::X_XSS_PROTECTION,
                    HeaderValue::from_static("1; mode=block"),
                ))
                .layer(SetResponseHeaderLayer::overriding(
                    header::REFERRER_POLICY,
                    HeaderValue::from_static("strict-origin-when-cross-origin"),
                ))
                .layer(TimeoutLayer::with_status_code(
                    StatusCode::REQUEST_TIMEOUT,
                    Duration::from_secs(settings.server.request_timeout_secs),
                )),
        )
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            track_metrics,
        ));

    // Added last, so these wrap everything above.
    let request_id = HeaderName::from_static(REQUEST_ID_HEADER);
    router.layer(
        ServiceBuilder::new()
            .layer(SetRequestIdLayer::new(request_id.clone(), MakeRequestUuid))
            .layer(PropagateRequestIdLayer::new(request_id))
            .layer(
                TraceLayer::new_for_http().make_span_with(|req: &Request<Body>| {
                    let request_id = req
                        .headers()
                        .get(REQUEST_ID_HEADER)
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("unknown");
                    info_span!(
                        "http_request",
                        method = %req.method(),
                        uri = %req.uri(),
                        request_id = %request_id,
                    )
                }),
            ),
    )
}

fn cors_layer(cors: &CorsSettings) -> CorsLayer {
    let base = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if cors.allow_origins.iter().any(|origin| origin == "*") {
        return base.allow_origin(Any);
    }

    let origins = cors
        .allow_origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!("Ignoring invalid CORS origin: {}", origin);
                None
            }
        })
        .collect::<Vec<_>>();
    base.allow_origin(AllowOrigin::list(origins))
}

async fn fallback(ctx: RequestContext) -> ErrorResponse {
    ctx.fail(ApiError::RouteNotFound)
}

fn data<T: serde::Serialize>(status: StatusCode, ctx: &RequestContext, data: T) -> axum::response::Response {
    (
        status,
        Json(json!({
            "data": data,
            "request_id": ctx.request_id,
        })),
    )
        .into_response()
}

// =============================================================================
// VM CRUD
// =============================================================================

async fn create_vm(
    State(state): State<Arc<AppState>>,
    ctx: RequestContext,
    body: Result<Json<CreateVmRequest>, JsonRejection>,
) -> HandlerResult {
    let Json(mut req) = body.map_err(|e| {
        warn!(request_id = %ctx.request_id, "Invalid request body: {}", e.body_text());
        ctx.fail(ApiError::Malformed(e.body_text()))
    })?;
    req.created_by = ctx.principal.clone();

    let result = state.service.create_vm(req).await;
    state.record("create", &result);
    let vm = result.map_err(|e| ctx.fail(e))?;

    info!(request_id = %ctx.request_id, vm_id = %vm.id, "VM created successfully: {}", vm.name);
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "data": VmResponse::new(vm, Utc::now()),
            "message": "VM created successfully",
            "request_id": ctx.request_id,
        })),
    )
        .into_response())
}

async fn list_vms(
    State(state): State<Arc<AppState>>,
    ctx: RequestContext,
    query: Result<Query<ListOptions>, QueryRejection>,
) -> HandlerResult {
    let Query(opts) = query.map_err(|e| ctx.fail(ApiError::Malformed(e.body_text())))?;

    let list = state
        .service
        .list_vms(opts)
        .await
        .map_err(|e| ctx.fail(e))?;
    tracing::debug!(
        request_id = %ctx.request_id,
        "Listed {} VMs (total: {})",
        list.vms.len(),
        list.pagination.total
    );
    Ok(data(StatusCode::OK, &ctx, list))
}

async fn get_vm(
    State(state): State<Arc<AppState>>,
    ctx: RequestContext,
    Path(raw_id): Path<String>,
) -> HandlerResult {
    let id = ctx.parse_id(&raw_id)?;
    let vm = state.service.get_vm(id).await.map_err(|e| ctx.fail(e))?;
    Ok(data(StatusCode::OK, &ctx, VmResponse::new(vm, Utc::now())))
}

async fn get_vm_by_name(
    State(state): State<Arc<AppState>>,
    ctx: RequestContext,
    Path(name): Path<String>,
) -> HandlerResult {
    let vm = state
        .service
        .get_vm_by_name(&name)
        .await
        .map_err(|e| ctx.fail(e))?;
    Ok(data(StatusCode::OK, &ctx, VmResponse::new(vm, Utc::now())))
}

async fn update_vm(
    State(state): State<Arc<AppState>>,
    ctx: RequestContext,
    Path(raw_id): Path<String>,
    body: Result<Json<UpdateVmRequest>, JsonRejection>,
) -> HandlerResult {
    let id = ctx.parse_id(&raw_id)?;
    let Json(mut req) = body.map_err(|e| ctx.fail(ApiError::Malformed(e.body_text())))?;
    req.updated_by = Some(ctx.principal.clone());

    let result = state.service.update_vm(id, req).await;
    state.record("update", &result);
    let vm = result.map_err(|e| ctx.fail(e))?;

    info!(request_id = %ctx.request_id, vm_id = %id, "VM updated successfully");
    Ok((
        StatusCode::OK,
        Json(json!({
            "data": VmResponse::new(vm, Utc::now()),
            "message": "VM updated successfully",
            "request_id": ctx.request_id,
        })),
    )
        .into_response())
}

async fn delete_vm(
    State(state): State<Arc<AppState>>,
    ctx: RequestContext,
    Path(raw_id): Path<String>,
) -> HandlerResult {
    let id = ctx.parse_id(&raw_id)?;
    let result = state.service.delete_vm(id).await;
    state.record("delete", &result);
    result.map_err(|e| ctx.fail(e))?;

    info!(request_id = %ctx.request_id, vm_id = %id, "VM deleted successfully");
    Ok(Json(json!({
        "message": "VM deleted successfully",
        "request_id": ctx.request_id,
    }))
    .into_response())
}

// =============================================================================
// Lifecycle operations
// =============================================================================

#[derive(Debug, Clone, Copy)]
enum LifecycleOp {
    Start,
    Stop,
    Restart,
    Suspend,
    Resume,
}

impl LifecycleOp {
    fn as_str(&self) -> &'static str {
        match self {
            LifecycleOp::Start => "start",
            LifecycleOp::Stop => "stop",
            LifecycleOp::Restart => "restart",
            LifecycleOp::Suspend => "suspend",
            LifecycleOp::Resume => "resume",
        }
    }
}

/// The body is optional; anything unparsable counts as "no options".
fn state_change_options(body: &Bytes, principal: &str) -> StateChangeRequest {
    let mut req = if body.is_empty() {
        StateChangeRequest::default()
    } else {
        serde_json::from_slice(body).unwrap_or_default()
    };
    req.updated_by = Some(principal.to_string());
    req
}

async fn change_state(
    state: Arc<AppState>,
    ctx: RequestContext,
    raw_id: String,
    body: Bytes,
    op: LifecycleOp,
) -> HandlerResult {
    let id = ctx.parse_id(&raw_id)?;
    let req = state_change_options(&body, &ctx.principal);

    let service = &state.service;
    let result = match op {
        LifecycleOp::Start => service.start_vm(id, &req).await,
        LifecycleOp::Stop => service.stop_vm(id, &req).await,
        LifecycleOp::Restart => service.restart_vm(id, &req).await,
        LifecycleOp::Suspend => service.suspend_vm(id, &req).await,
        LifecycleOp::Resume => service.resume_vm(id, &req).await,
    };
    state.record(op.as_str(), &result);
    result.map_err(|e| {
        warn!(request_id = %ctx.request_id, vm_id = %id, "Failed to {} VM: {}", op.as_str(), e);
        ctx.fail(e)
    })?;

    info!(request_id = %ctx.request_id, vm_id = %id, "VM {} operation initiated successfully", op.as_str());
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "message": format!("VM {} operation initiated", op.as_str()),
            "request_id": ctx.request_id,
            "vm_id": id,
        })),
    )
        .into_response())
}

async fn start_vm(
    State(state): State<Arc<AppState>>,
    ctx: RequestContext,
    Path(id): Path<String>,
    body: Bytes,
) -> HandlerResult {
    change_state(state, ctx, id, body, LifecycleOp::Start).await
}

async fn stop_vm(
    State(state): State<Arc<AppState>>,
    ctx: RequestContext,
    Path(id): Path<String>,
    body: Bytes,
) -> HandlerResult {
    change_state(state, ctx, id, body, LifecycleOp::Stop).await
}

async fn restart_vm(
    State(state): State<Arc<AppState>>,
    ctx: RequestContext,
    Path(id): Path<String>,
    body: Bytes,
) -> HandlerResult {
    change_state(state, ctx, id, body, LifecycleOp::Restart).await
}

async fn suspend_vm(
    State(state): State<Arc<AppState>>,
    ctx: RequestContext,
    Path(id): Path<String>,
    body: Bytes,
) -> HandlerResult {
    change_state(state, ctx, id, body, LifecycleOp::Suspend).await
}

async fn resume_vm(
    State(state): State<Arc<AppState>>,
    ctx: RequestContext,
    Path(id): Path<String>,
    body: Bytes,
) -> HandlerResult {
    change_state(state, ctx, id, body, LifecycleOp::Resume).await
}

// =============================================================================
// Stats
// =============================================================================

async fn get_vm_stats(
    State(state): State<Arc<AppState>>,
    ctx: RequestContext,
    Path(raw_id): Path<String>,
) -> HandlerResult {
    let id = ctx.parse_id(&raw_id)?;
    let vm = state.service.get_vm(id).await.map_err(|e| ctx.fail(e))?;

    let stats = if vm.status == VMStatus::Running {
        match state.service.update_vm_stats(id).await {
            Ok(Some(fresh)) => fresh,
            Ok(None) => vm.stats,
            Err(e) => {
                warn!(request_id = %ctx.request_id, vm_id = %id, "Stats refresh failed: {}", e);
                vm.stats
            }
        }
    } else {
        vm.stats
    };

    Ok(data(StatusCode::OK, &ctx, stats))
}

async fn get_resource_summary(
    State(state): State<Arc<AppState>>,
    ctx: RequestContext,
) -> HandlerResult {
    let summary = state
        .service
        .get_resource_summary()
        .await
        .map_err(|e| ctx.fail(e))?;
    Ok(data(StatusCode::OK, &ctx, summary))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_change_body_is_optional_and_lenient() {
        let empty = state_change_options(&Bytes::new(), "system");
        assert!(!empty.force);
        assert_eq!(empty.updated_by.as_deref(), Some("system"));

        let forced = state_change_options(&Bytes::from_static(br#"{"force":true,"reason":"hung"}"#), "api-user");
        assert!(forced.force);
        assert_eq!(forced.reason.as_deref(), Some("hung"));
        assert_eq!(forced.updated_by.as_deref(), Some("api-user"));

        let garbage = state_change_options(&Bytes::from_static(b"not json"), "system");
        assert!(!garbage.force);
    }
}
