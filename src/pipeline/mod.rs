//! Request pipeline.
//!
//! Every inbound request runs through an ordered slice of [`Interceptor`]s
//! wrapped around one [`Handler`]. Each interceptor receives a [`Next`] and
//! continues the chain by calling [`Next::run`]; not calling it stops the
//! chain. [`Pipeline::standard`] builds the fixed production order:
//!
//! 1. [`Instrumentation`] opens the job and completes it on the way out
//! 2. [`RequestLogger`]
//! 3. [`ShowErrors`] turns panics below it into a 500
//! 4. [`Cors`] sets the CORS headers before anything is written
//! 5. [`NodeStatePersistence`] upserts the observation after the handler returns
//! 6. [`ProxyHandler`] forwards the request

pub mod handler;
pub mod interceptors;

pub use handler::ProxyHandler;
pub use interceptors::{Cors, Instrumentation, NodeStatePersistence, RequestLogger, ShowErrors};

use crate::constants::JSON_CONTENT_TYPE;
use crate::error::ProxyError;
use crate::forwarder::{Forwarder, Target};
use crate::instrumentation::{Job, Kvs, Stream};
use crate::store::NodeStore;
use async_trait::async_trait;
use axum::http::header::{HeaderName, HeaderValue, CONTENT_TYPE};
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

/// The parts of an inbound request the pipeline needs
#[derive(Debug, Clone)]
pub struct InboundRequest {
    pub method: Method,
    pub uri: Uri,
    pub target: Target,
}

impl InboundRequest {
    pub fn new(method: Method, uri: Uri, target: Target) -> Self {
        Self {
            method,
            uri,
            target,
        }
    }

    /// Resource identifier used to name the instrumentation job
    pub fn resource(&self) -> String {
        self.uri.to_string()
    }
}

/// Per-request state, owned by one pipeline invocation
#[derive(Debug)]
pub struct RequestContext {
    pub request_id: Uuid,
    pub job: Option<Job>,
    error: Option<ProxyError>,
    observed_key: Option<String>,
    observed_status: Option<String>,
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestContext {
    pub fn new() -> Self {
        Self {
            request_id: Uuid::new_v4(),
            job: None,
            error: None,
            observed_key: None,
            observed_status: None,
        }
    }

    /// Record a failure under its event name. The first error is kept; later
    /// ones are still reported as events. Returns whether `err` was kept.
    pub fn fail(&mut self, err: ProxyError) -> bool {
        self.event_err(err.event_name(), &err);
        if self.error.is_some() {
            return false;
        }
        self.error = Some(err);
        true
    }

    pub fn error(&self) -> Option<&ProxyError> {
        self.error.as_ref()
    }

    pub fn observe(&mut self, key: impl Into<String>, status: impl Into<String>) {
        self.observed_key = Some(key.into());
        self.observed_status = Some(status.into());
    }

    /// `(key, status)` when the handler observed a node status
    pub fn observation(&self) -> Option<(&str, &str)> {
        match (&self.observed_key, &self.observed_status) {
            (Some(key), Some(status)) => Some((key.as_str(), status.as_str())),
            _ => None,
        }
    }

    pub fn event(&self, event: &str) {
        self.event_kv(event, Kvs::new());
    }

    pub fn event_kv(&self, event: &str, kvs: Kvs) {
        if let Some(job) = &self.job {
            job.event_kv(event, kvs);
        }
    }

    pub fn event_err(&self, event: &str, err: &dyn std::fmt::Display) {
        match &self.job {
            Some(job) => job.event_err(event, err),
            None => warn!(request_id = %self.request_id, event, error = %err, "error outside a job"),
        }
    }
}

/// Response under construction. Status and headers are frozen once a body is
/// written, the same way they are on an HTTP response stream.
#[derive(Debug)]
pub struct ResponseWriter {
    status: StatusCode,
    headers: HeaderMap,
    body: Option<Bytes>,
}

impl Default for ResponseWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseWriter {
    pub fn new() -> Self {
        Self {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            body: None,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> Option<&Bytes> {
        self.body.as_ref()
    }

    pub fn is_committed(&self) -> bool {
        self.body.is_some()
    }

    /// Returns false (and changes nothing) once the body is committed
    pub fn set_header(&mut self, name: HeaderName, value: HeaderValue) -> bool {
        if self.is_committed() {
            warn!(header = %name, "header set after body was written; ignored");
            return false;
        }
        self.headers.insert(name, value);
        true
    }

    pub fn set_status(&mut self, status: StatusCode) -> bool {
        if self.is_committed() {
            return false;
        }
        self.status = status;
        true
    }

    /// Commit `body`. A second write is ignored.
    pub fn write(&mut self, body: Bytes) -> bool {
        if self.is_committed() {
            return false;
        }
        self.body = Some(body);
        true
    }

    /// Write the `{"error": "<message>"}` envelope with status 500
    pub fn write_error(&mut self, message: &str) -> bool {
        if self.is_committed() {
            return false;
        }
        self.set_header(CONTENT_TYPE, HeaderValue::from_static(JSON_CONTENT_TYPE));
        self.set_status(StatusCode::INTERNAL_SERVER_ERROR);
        self.write(Bytes::from(
            serde_json::json!({ "error": message }).to_string(),
        ))
    }
}

impl IntoResponse for ResponseWriter {
    fn into_response(self) -> Response {
        let body = self.body.unwrap_or_default();
        let mut response = Response::new(axum::body::boxed(axum::body::Full::new(body)));
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        response
    }
}

#[async_trait]
pub trait Interceptor: Send + Sync {
    async fn intercept(
        &self,
        cx: &mut RequestContext,
        req: &InboundRequest,
        rw: &mut ResponseWriter,
        next: Next<'_>,
    );
}

/// The innermost step of the pipeline
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, cx: &mut RequestContext, req: &InboundRequest, rw: &mut ResponseWriter);
}

/// Continuation handed to each interceptor
pub struct Next<'a> {
    interceptors: &'a [Arc<dyn Interceptor>],
    handler: &'a dyn Handler,
}

impl<'a> Next<'a> {
    pub async fn run(self, cx: &mut RequestContext, req: &InboundRequest, rw: &mut ResponseWriter) {
        match self.interceptors.split_first() {
            Some((first, rest)) => {
                let next = Next {
                    interceptors: rest,
                    handler: self.handler,
                };
                first.intercept(cx, req, rw, next).await;
            }
            None => self.handler.handle(cx, req, rw).await,
        }
    }
}

/// Collaborators injected at startup
#[derive(Clone)]
pub struct PipelineDeps {
    pub stream: Arc<Stream>,
    pub forwarder: Forwarder,
    pub store: Option<NodeStore>,
}

#[derive(Clone)]
pub struct Pipeline {
    interceptors: Vec<Arc<dyn Interceptor>>,
    handler: Arc<dyn Handler>,
}

impl Pipeline {
    pub fn new(interceptors: Vec<Arc<dyn Interceptor>>, handler: Arc<dyn Handler>) -> Self {
        Self {
            interceptors,
            handler,
        }
    }

    /// The production chain. State persistence is included only with a store.
    pub fn standard(deps: PipelineDeps) -> Self {
        let mut interceptors: Vec<Arc<dyn Interceptor>> = vec![
            Arc::new(Instrumentation::new(deps.stream)),
            Arc::new(RequestLogger),
            Arc::new(ShowErrors),
            Arc::new(Cors),
        ];
        if let Some(store) = deps.store {
            interceptors.push(Arc::new(NodeStatePersistence::new(store)));
        }
        Self::new(interceptors, Arc::new(ProxyHandler::new(deps.forwarder)))
    }

    pub async fn serve(&self, req: InboundRequest) -> ResponseWriter {
        let mut cx = RequestContext::new();
        let mut rw = ResponseWriter::new();
        let next = Next {
            interceptors: &self.interceptors,
            handler: self.handler.as_ref(),
        };
        next.run(&mut cx, &req, &mut rw).await;
        rw
    }
}
