//! Prometheus metrics for osintflow.
//!
//! ### Counters
//! - `osintflow_workflow_runs_total` - Finished runs by status and trigger source
//! - `osintflow_steps_total` - Finished steps by step_type and status
//! - `osintflow_target_queries_total` - Query target calls by status
//!
//! ### Histograms
//! - `osintflow_run_duration_seconds` - Run duration
//!
//! ### Gauges
//! - `osintflow_active_runs` - Runs currently executing

use std::net::SocketAddr;
use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::error::{Error, Result};

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the Prometheus recorder.
///
/// With `listen` set, the exporter also serves `/metrics` on that address.
/// Must be called from within a Tokio runtime when `listen` is set.
pub fn init_metrics(listen: Option<&str>) -> Result<()> {
    if PROMETHEUS_HANDLE.get().is_some() {
        return Ok(());
    }

    let builder = PrometheusBuilder::new();
    let handle = match listen {
        Some(addr) => {
            let addr: SocketAddr = addr
                .parse()
                .map_err(|e| Error::Config(format!("Invalid metrics address '{}': {}", addr, e)))?;
            let (recorder, exporter) = builder
                .with_http_listener(addr)
                .build()
                .map_err(|e| Error::Internal(format!("Failed to build exporter: {}", e)))?;
            let handle = recorder.handle();
            metrics::set_global_recorder(recorder)
                .map_err(|e| Error::Internal(format!("Failed to install recorder: {}", e)))?;
            tokio::spawn(async move {
                if let Err(e) = exporter.await {
                    tracing::error!("Metrics exporter stopped: {:?}", e);
                }
            });
            handle
        }
        None => builder
            .install_recorder()
            .map_err(|e| Error::Internal(format!("Failed to install recorder: {}", e)))?,
    };

    let _ = PROMETHEUS_HANDLE.set(handle);
    Ok(())
}

/// Render current metrics in Prometheus text format.
pub fn render_metrics() -> String {
    match PROMETHEUS_HANDLE.get() {
        Some(handle) => handle.render(),
        None => "# Metrics not initialized\n".to_string(),
    }
}

pub fn inc_active_runs() {
    gauge!("osintflow_active_runs").increment(1.0);
}

pub fn dec_active_runs() {
    gauge!("osintflow_active_runs").decrement(1.0);
}

pub fn record_run(status: &str, trigger: &str, duration: Duration) {
    counter!(
        "osintflow_workflow_runs_total",
        "status" => status.to_string(),
        "trigger" => trigger.to_string()
    )
    .increment(1);
    histogram!("osintflow_run_duration_seconds").record(duration.as_secs_f64());
}

pub fn record_step(step_type: &str, status: &str) {
    counter!(
        "osintflow_steps_total",
        "step_type" => step_type.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

pub fn record_target_query(status: &str) {
    counter!(
        "osintflow_target_queries_total",
        "status" => status.to_string()
    )
    .increment(1);
}
