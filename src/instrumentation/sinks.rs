use super::metrics::names;
use super::{CompletionStatus, EventSink, Kvs, Record};
use std::sync::Mutex;
use tracing::{error, info};

/// Writes every record as a structured tracing event
#[derive(Debug, Default)]
pub struct TracingSink;

impl TracingSink {
    pub fn new() -> Self {
        Self
    }
}

impl EventSink for TracingSink {
    fn emit(&self, record: &Record) {
        match record {
            Record::Event { job, event, kvs } => {
                info!(
                    target: "corsproxy::instrumentation",
                    job = job.as_deref().unwrap_or("-"),
                    event = %event,
                    kvs = %format_kvs(kvs),
                    "event"
                );
            }
            Record::EventErr {
                job,
                event,
                error: err,
                kvs,
            } => {
                error!(
                    target: "corsproxy::instrumentation",
                    job = job.as_deref().unwrap_or("-"),
                    event = %event,
                    error = %err,
                    kvs = %format_kvs(kvs),
                    "event error"
                );
            }
            Record::Timing {
                job,
                event,
                nanos,
                kvs,
            } => {
                info!(
                    target: "corsproxy::instrumentation",
                    job = job.as_deref().unwrap_or("-"),
                    event = %event,
                    elapsed_ms = *nanos as f64 / 1_000_000.0,
                    kvs = %format_kvs(kvs),
                    "timing"
                );
            }
            Record::Complete {
                job,
                status,
                nanos,
                kvs,
            } => {
                info!(
                    target: "corsproxy::instrumentation",
                    job = %job,
                    status = %status,
                    elapsed_ms = *nanos as f64 / 1_000_000.0,
                    kvs = %format_kvs(kvs),
                    "job complete"
                );
            }
        }
    }
}

fn format_kvs(kvs: &Kvs) -> String {
    kvs.iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Maps records onto counters and histograms of the installed metrics recorder.
///
/// Job names are request URIs, so they are never used as labels.
#[derive(Debug, Default)]
pub struct MetricsSink;

impl MetricsSink {
    pub fn new() -> Self {
        Self
    }
}

impl EventSink for MetricsSink {
    fn emit(&self, record: &Record) {
        match record {
            Record::Event { event, .. } => {
                ::metrics::counter!(names::EVENTS, "event" => event.clone()).increment(1);
            }
            Record::EventErr { event, .. } => {
                ::metrics::counter!(names::EVENT_ERRORS, "event" => event.clone()).increment(1);
            }
            Record::Timing { event, nanos, .. } => {
                ::metrics::histogram!(names::TIMING_SECONDS, "event" => event.clone())
                    .record(*nanos as f64 / 1_000_000_000.0);
            }
            Record::Complete { status, nanos, .. } => {
                ::metrics::counter!(names::JOBS_COMPLETED, "status" => status.as_str())
                    .increment(1);
                ::metrics::histogram!(names::JOB_DURATION_SECONDS, "status" => status.as_str())
                    .record(*nanos as f64 / 1_000_000_000.0);
            }
        }
    }
}

/// Keeps records in memory; used by tests and for ad-hoc diagnostics
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Mutex<Vec<Record>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<Record> {
        match self.records.lock() {
            Ok(records) => records.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// `(job, status)` for every completion, in emission order
    pub fn completions(&self) -> Vec<(String, CompletionStatus)> {
        self.records()
            .into_iter()
            .filter_map(|r| match r {
                Record::Complete { job, status, .. } => Some((job, status)),
                _ => None,
            })
            .collect()
    }

    /// Names of all error events, in emission order
    pub fn error_events(&self) -> Vec<String> {
        self.records()
            .into_iter()
            .filter_map(|r| match r {
                Record::EventErr { event, .. } => Some(event),
                _ => None,
            })
            .collect()
    }

    /// Names of all plain events, in emission order
    pub fn events(&self) -> Vec<String> {
        self.records()
            .into_iter()
            .filter_map(|r| match r {
                Record::Event { event, .. } => Some(event),
                _ => None,
            })
            .collect()
    }
}

impl EventSink for MemorySink {
    fn emit(&self, record: &Record) {
        match self.records.lock() {
            Ok(mut records) => records.push(record.clone()),
            Err(poisoned) => poisoned.into_inner().push(record.clone()),
        }
    }
}
