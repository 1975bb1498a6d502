/*
* Prometheus metrics for the VM manager
* -------------------------------------
*
* Everything lives in a private Registry owned by ApiMetrics, so tests can
* spin up as many routers as they like without fighting over global names.
*
* What we track:
*   - vm_manager_http_requests_total{method,status}     every request that got a response
*   - vm_manager_http_request_duration_seconds{method}  how long it took
*   - vm_manager_vm_operations_total{operation,outcome} create/start/stop/... and how they went
*   - vm_manager_vms{status}                            fleet gauges, refreshed on every scrape
*
* Scrape it, graph it, page someone at 3am with it.
*/

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry,
    TextEncoder,
};
use std::time::Duration;

use crate::core::summary::ResourceSummary;

const NAMESPACE: &str = "vm_manager";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Failure => "failure",
        }
    }
}

#[derive(Clone)]
pub struct ApiMetrics {
    registry: Registry,
    http_requests: IntCounterVec,
    http_duration: HistogramVec,
    vm_operations: IntCounterVec,
    vms: IntGaugeVec,
}

impl ApiMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let http_requests = IntCounterVec::new(
            Opts::new("http_requests_total", "HTTP requests served")
                .namespace(NAMESPACE),
            &["method", "status"],
        )?;
        let http_duration = HistogramVec::new(
            HistogramOpts::new("http_request_duration_seconds", "HTTP request latency")
                .namespace(NAMESPACE),
            &["method"],
        )?;
        let vm_operations = IntCounterVec::new(
            Opts::new("vm_operations_total", "VM operations by outcome")
                .namespace(NAMESPACE),
            &["operation", "outcome"],
        )?;
        let vms = IntGaugeVec::new(
            Opts::new("vms", "VMs by status bucket").namespace(NAMESPACE),
            &["status"],
        )?;

        registry.register(Box::new(http_requests.clone()))?;
        registry.register(Box::new(http_duration.clone()))?;
        registry.register(Box::new(vm_operations.clone()))?;
        registry.register(Box::new(vms.clone()))?;

        Ok(Self {
            registry,
            http_requests,
            http_duration,
            vm_operations,
            vms,
        })
    }

    pub fn observe_request(&self, method: &str, status: u16, elapsed: Duration) {
        self.http_requests
            .with_label_values(&[method, &status.to_string()])
            .inc();
        self.http_duration
            .with_label_values(&[method])
            .observe(elapsed.as_secs_f64());
    }

    pub fn record_operation(&self, operation: &str, outcome: Outcome) {
        self.vm_operations
            .with_label_values(&[operation, outcome.as_str()])
            .inc();
    }

    pub fn update_fleet(&self, summary: &ResourceSummary) {
        let counts = &summary.vms;
        for (status, value) in [
            ("total", counts.total),
            ("running", counts.running),
            ("stopped", counts.stopped),
            ("error", counts.error),
            ("suspended", counts.suspended),
        ] {
            self.vms
                .with_label_values(&[status])
                .set(i64::try_from(value).unwrap_or(i64::MAX));
        }
    }

    /// Text exposition format, ready to hand to a scraper.
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}
