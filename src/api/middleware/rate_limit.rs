use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use std::num::NonZeroU32;
use std::sync::Arc;
use tracing::warn;

use crate::api::context::request_id_of;
use crate::api::error::{ApiError, ErrorResponse};
use crate::config::settings::RateLimitSettings;

/// One token bucket shared by every client. Good enough until someone asks
/// for per-IP fairness.
pub struct GlobalRateLimit {
    limiter: DefaultDirectRateLimiter,
    expose_internal: bool,
}

impl GlobalRateLimit {
    /// `None` when limiting is switched off or misconfigured with zeros.
    pub fn from_settings(settings: &RateLimitSettings, expose_internal: bool) -> Option<Self> {
        if !settings.enabled {
            return None;
        }
        let per_second = NonZeroU32::new(settings.requests_per_second)?;
        let burst = NonZeroU32::new(settings.burst)?;
        let quota = Quota::per_second(per_second).allow_burst(burst);
        Some(Self {
            limiter: RateLimiter::direct(quota),
            expose_internal,
        })
    }

    pub fn allow(&self) -> bool {
        self.limiter.check().is_ok()
    }
}

pub async fn enforce(
    State(limit): State<Arc<GlobalRateLimit>>,
    req: Request,
    next: Next,
) -> Result<Response, ErrorResponse> {
    if !limit.allow() {
        let request_id = request_id_of(req.headers());
        warn!(request_id = %request_id, "Rate limit exceeded");
        return Err(ErrorResponse::new(
            ApiError::RateLimited,
            request_id,
            limit.expose_internal,
        ));
    }
    Ok(next.run(req).await)
}
