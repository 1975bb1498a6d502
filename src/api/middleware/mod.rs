pub mod auth;
pub mod metrics;
pub mod rate_limit;

pub use auth::require_api_key;
pub use metrics::track_metrics;
pub use rate_limit::GlobalRateLimit;
