use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;

pub const PIPELINE_REQUESTS_TOTAL: &str = "pipeline_requests_total";
pub const PIPELINE_FORWARDED_TOTAL: &str = "pipeline_forwarded_total";
pub const CONTROL_GROUP_PENDING_TOTAL: &str = "control_group_pending_total";
pub const LOCKOUT_REJECTIONS_TOTAL: &str = "lockout_rejections_total";
pub const REGISTRATION_FAILURES_TOTAL: &str = "registration_failures_total";

static HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the global Prometheus recorder. Safe to call more than once.
pub fn init_metrics() {
    if HANDLE.get().is_some() {
        return;
    }

    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => {
            let _ = HANDLE.set(handle);
        }
        Err(e) => {
            // Another recorder is already global (e.g. a second router in tests)
            tracing::warn!("Metrics recorder not installed: {}", e);
        }
    }
}

pub fn get_metrics() -> String {
    match HANDLE.get() {
        Some(handle) => handle.render(),
        None => {
            tracing::error!("Metrics recorder not initialized");
            "# Metrics recorder not initialized\n".to_string()
        }
    }
}
