//! Instrumentation stream and per-request jobs
//!
//! A [`Stream`] fans key-value records out to a set of [`EventSink`]s. Each
//! inbound request opens a [`Job`] on the stream; the job collects events while
//! the request runs and is completed exactly once with a [`CompletionStatus`].
//! A job dropped without an explicit completion reports itself as `Panic`.

pub mod metrics;
pub mod sinks;

pub use sinks::{MemorySink, MetricsSink, TracingSink};

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Key-value pairs attached to records
pub type Kvs = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompletionStatus {
    Success,
    Error,
    Panic,
}

impl CompletionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompletionStatus::Success => "success",
            CompletionStatus::Error => "error",
            CompletionStatus::Panic => "panic",
        }
    }
}

impl fmt::Display for CompletionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single record delivered to every sink. `job` is `None` for stream-level events.
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    Event {
        job: Option<String>,
        event: String,
        kvs: Kvs,
    },
    EventErr {
        job: Option<String>,
        event: String,
        error: String,
        kvs: Kvs,
    },
    Timing {
        job: Option<String>,
        event: String,
        nanos: u64,
        kvs: Kvs,
    },
    Complete {
        job: String,
        status: CompletionStatus,
        nanos: u64,
        kvs: Kvs,
    },
}

/// Write-only destination for records. Implementations must tolerate concurrent calls.
pub trait EventSink: Send + Sync {
    fn emit(&self, record: &Record);
}

#[derive(Default)]
pub struct Stream {
    sinks: Vec<Arc<dyn EventSink>>,
    kvs: Kvs,
}

impl Stream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Attach a key-value pair to every record emitted through this stream
    pub fn with_kv(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.kvs.insert(key.into(), value.into());
        self
    }

    pub fn event_kv(&self, event: &str, kvs: Kvs) {
        self.emit(Record::Event {
            job: None,
            event: event.to_string(),
            kvs: self.merged(kvs),
        });
    }

    pub fn event_err_kv(&self, event: &str, err: &dyn fmt::Display, kvs: Kvs) {
        self.emit(Record::EventErr {
            job: None,
            event: event.to_string(),
            error: err.to_string(),
            kvs: self.merged(kvs),
        });
    }

    /// Open a job bound to this stream
    pub fn new_job(self: &Arc<Self>, name: impl Into<String>) -> Job {
        Job {
            stream: Arc::clone(self),
            name: name.into(),
            kvs: Kvs::new(),
            start: Instant::now(),
            completed: false,
        }
    }

    fn merged(&self, kvs: Kvs) -> Kvs {
        let mut out = self.kvs.clone();
        out.extend(kvs);
        out
    }

    fn emit(&self, record: Record) {
        for sink in &self.sinks {
            sink.emit(&record);
        }
    }
}

/// Tracking handle for one unit of work (one inbound request)
pub struct Job {
    stream: Arc<Stream>,
    name: String,
    kvs: Kvs,
    start: Instant,
    completed: bool,
}

impl Job {
    pub fn with_kv(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.kvs.insert(key.into(), value.into());
    }

    pub fn event_kv(&self, event: &str, kvs: Kvs) {
        self.stream.emit(Record::Event {
            job: Some(self.name.clone()),
            event: event.to_string(),
            kvs: self.merged(kvs),
        });
    }

    pub fn event_err(&self, event: &str, err: &dyn fmt::Display) {
        self.event_err_kv(event, err, Kvs::new());
    }

    pub fn event_err_kv(&self, event: &str, err: &dyn fmt::Display, kvs: Kvs) {
        self.stream.emit(Record::EventErr {
            job: Some(self.name.clone()),
            event: event.to_string(),
            error: err.to_string(),
            kvs: self.merged(kvs),
        });
    }

    pub fn timing(&self, event: &str, elapsed: Duration) {
        self.stream.emit(Record::Timing {
            job: Some(self.name.clone()),
            event: event.to_string(),
            nanos: duration_nanos(elapsed),
            kvs: self.merged(Kvs::new()),
        });
    }

    /// Complete the job. Consuming `self` makes a second completion impossible.
    pub fn complete(mut self, status: CompletionStatus) {
        self.finish(status);
    }

    fn finish(&mut self, status: CompletionStatus) {
        if self.completed {
            return;
        }
        self.completed = true;
        self.stream.emit(Record::Complete {
            job: self.name.clone(),
            status,
            nanos: duration_nanos(self.start.elapsed()),
            kvs: self.merged(Kvs::new()),
        });
    }

    fn merged(&self, kvs: Kvs) -> Kvs {
        let mut out = self.stream.kvs.clone();
        out.extend(self.kvs.clone());
        out.extend(kvs);
        out
    }
}

impl Drop for Job {
    fn drop(&mut self) {
        if !self.completed {
            self.finish(CompletionStatus::Panic);
        }
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("name", &self.name)
            .field("completed", &self.completed)
            .finish()
    }
}

fn duration_nanos(d: Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}

/// Build a [`Kvs`] from string pairs
pub fn kvs<const N: usize>(pairs: [(&str, &str); N]) -> Kvs {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}
