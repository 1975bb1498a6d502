pub mod metrics;

pub use metrics::{ApiMetrics, Outcome};
