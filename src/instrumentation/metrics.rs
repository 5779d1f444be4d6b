//! Metric naming and the optional Prometheus exporter
//!
//! All metrics follow `corsproxy_{area}_{name}` with a `_total` suffix for
//! counters. The exporter is only installed when a listen address is configured.

use std::net::SocketAddr;
use std::sync::OnceLock;
use tracing::{info, warn};

static INSTALLED: OnceLock<SocketAddr> = OnceLock::new();

macro_rules! proxy_metric {
    (counter, $area:literal, $name:literal) => {
        concat!("corsproxy_", $area, "_", $name, "_total")
    };
    (histogram, $area:literal, $name:literal) => {
        concat!("corsproxy_", $area, "_", $name)
    };
}

pub mod names {
    pub const EVENTS: &str = proxy_metric!(counter, "instrumentation", "events");
    pub const EVENT_ERRORS: &str = proxy_metric!(counter, "instrumentation", "event_errors");
    pub const TIMING_SECONDS: &str = proxy_metric!(histogram, "instrumentation", "timing_seconds");
    pub const JOBS_COMPLETED: &str = proxy_metric!(counter, "jobs", "completed");
    pub const JOB_DURATION_SECONDS: &str = proxy_metric!(histogram, "jobs", "duration_seconds");
}

#[derive(Debug, Clone, Copy)]
pub enum MetricType {
    Counter,
    Histogram,
}

/// Documentation for a single metric
#[derive(Debug, Clone)]
pub struct MetricDoc {
    pub name: &'static str,
    pub metric_type: MetricType,
    pub help: &'static str,
    pub labels: &'static [&'static str],
}

pub fn metrics_documentation() -> Vec<MetricDoc> {
    vec![
        MetricDoc {
            name: names::EVENTS,
            metric_type: MetricType::Counter,
            help: "Instrumentation events by name",
            labels: &["event"],
        },
        MetricDoc {
            name: names::EVENT_ERRORS,
            metric_type: MetricType::Counter,
            help: "Instrumentation error events by name",
            labels: &["event"],
        },
        MetricDoc {
            name: names::TIMING_SECONDS,
            metric_type: MetricType::Histogram,
            help: "Timed sections inside a job",
            labels: &["event"],
        },
        MetricDoc {
            name: names::JOBS_COMPLETED,
            metric_type: MetricType::Counter,
            help: "Completed request jobs by outcome",
            labels: &["status"],
        },
        MetricDoc {
            name: names::JOB_DURATION_SECONDS,
            metric_type: MetricType::Histogram,
            help: "Request job duration by outcome",
            labels: &["status"],
        },
    ]
}

fn describe_all() {
    for doc in metrics_documentation() {
        match doc.metric_type {
            MetricType::Counter => ::metrics::describe_counter!(doc.name, doc.help),
            MetricType::Histogram => ::metrics::describe_histogram!(doc.name, doc.help),
        }
    }
}

/// Install the Prometheus recorder and spawn its HTTP listener on `addr`.
///
/// Must run inside a tokio runtime. Idempotent; failures are logged, not fatal.
pub fn init_prometheus(addr: SocketAddr) {
    if INSTALLED.get().is_some() {
        return;
    }
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new().with_http_listener(addr);
    match builder.install() {
        Ok(()) => {
            let _ = INSTALLED.set(addr);
            describe_all();
            info!("Prometheus exporter listening on http://{}/metrics", addr);
        }
        Err(e) => {
            warn!("Failed to install Prometheus recorder: {}", e);
        }
    }
}
