use super::{InboundRequest, Interceptor, Next, RequestContext, ResponseWriter};
use crate::constants::{
    ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_ORIGIN, INTERNAL_ERROR_MESSAGE,
};
use crate::error::ProxyError;
use crate::instrumentation::{kvs, CompletionStatus, Stream};
use crate::store::{NodeStore, Upserted};
use async_trait::async_trait;
use axum::http::header::{
    HeaderValue, ACCESS_CONTROL_ALLOW_HEADERS as ALLOW_HEADERS,
    ACCESS_CONTROL_ALLOW_ORIGIN as ALLOW_ORIGIN,
};
use axum::http::StatusCode;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info};

/// Opens the request's job and completes it exactly once when the chain returns.
///
/// If the chain left an error and nothing was written yet, the error is turned
/// into the 500 JSON envelope here.
pub struct Instrumentation {
    stream: Arc<Stream>,
}

impl Instrumentation {
    pub fn new(stream: Arc<Stream>) -> Self {
        Self { stream }
    }
}

#[async_trait]
impl Interceptor for Instrumentation {
    async fn intercept(
        &self,
        cx: &mut RequestContext,
        req: &InboundRequest,
        rw: &mut ResponseWriter,
        next: Next<'_>,
    ) {
        let mut job = self.stream.new_job(req.resource());
        job.with_kv("request_id", cx.request_id.to_string());
        cx.job = Some(job);

        next.run(cx, req, rw).await;

        let status = match cx.error() {
            None => CompletionStatus::Success,
            Some(err) => {
                rw.write_error(&err.to_string());
                CompletionStatus::Error
            }
        };
        if let Some(job) = cx.job.take() {
            job.complete(status);
        }
    }
}

/// One log line per request, written after the response is settled
pub struct RequestLogger;

#[async_trait]
impl Interceptor for RequestLogger {
    async fn intercept(
        &self,
        cx: &mut RequestContext,
        req: &InboundRequest,
        rw: &mut ResponseWriter,
        next: Next<'_>,
    ) {
        let start = Instant::now();
        next.run(cx, req, rw).await;
        let elapsed = start.elapsed();

        if let Some(job) = &cx.job {
            job.timing("http.request", elapsed);
        }
        let outcome = if cx.error().is_some() { "error" } else { "ok" };
        info!(
            request_id = %cx.request_id,
            method = %req.method,
            path = %req.uri,
            status = settled_status(cx, rw).as_u16(),
            outcome,
            elapsed_ms = elapsed.as_secs_f64() * 1000.0,
            "request"
        );
    }
}

/// Status the client will see. A pending error with nothing written becomes
/// the 500 envelope once `Instrumentation` unwinds.
fn settled_status(cx: &RequestContext, rw: &ResponseWriter) -> StatusCode {
    if cx.error().is_some() && !rw.is_committed() {
        StatusCode::INTERNAL_SERVER_ERROR
    } else {
        rw.status()
    }
}

/// Catches panics from the layers below and answers with a generic 500
pub struct ShowErrors;

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[async_trait]
impl Interceptor for ShowErrors {
    async fn intercept(
        &self,
        cx: &mut RequestContext,
        req: &InboundRequest,
        rw: &mut ResponseWriter,
        next: Next<'_>,
    ) {
        let outcome = AssertUnwindSafe(next.run(cx, req, rw)).catch_unwind().await;
        if let Err(payload) = outcome {
            let message = panic_message(payload.as_ref());
            error!(request_id = %cx.request_id, panic = %message, "handler panicked");
            cx.fail(ProxyError::Fault(message));
            rw.write_error(INTERNAL_ERROR_MESSAGE);
        }
    }
}

/// Sets the CORS headers before the inner layers can write a body
pub struct Cors;

#[async_trait]
impl Interceptor for Cors {
    async fn intercept(
        &self,
        cx: &mut RequestContext,
        req: &InboundRequest,
        rw: &mut ResponseWriter,
        next: Next<'_>,
    ) {
        rw.set_header(
            ALLOW_ORIGIN,
            HeaderValue::from_static(ACCESS_CONTROL_ALLOW_ORIGIN),
        );
        rw.set_header(
            ALLOW_HEADERS,
            HeaderValue::from_static(ACCESS_CONTROL_ALLOW_HEADERS),
        );
        next.run(cx, req, rw).await;
    }
}

/// Upserts the observed node status once the handler has finished.
///
/// Store failures are reported on the job and never change the response.
pub struct NodeStatePersistence {
    store: NodeStore,
}

impl NodeStatePersistence {
    pub fn new(store: NodeStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Interceptor for NodeStatePersistence {
    async fn intercept(
        &self,
        cx: &mut RequestContext,
        req: &InboundRequest,
        rw: &mut ResponseWriter,
        next: Next<'_>,
    ) {
        next.run(cx, req, rw).await;

        if cx.error().is_some() {
            return;
        }
        let Some((ip, state)) = cx.observation() else {
            return;
        };

        match self.store.upsert(ip, state).await {
            Ok(Upserted::Created) => {
                cx.event_kv("update_node_state.created", kvs([("ip", ip), ("state", state)]));
            }
            Ok(Upserted::Updated) => {
                cx.event_kv("update_node_state.updated", kvs([("ip", ip), ("state", state)]));
            }
            Err(e) => cx.event_err(e.event_name(), &e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forwarder::Target;
    use crate::instrumentation::MemorySink;
    use crate::pipeline::{Handler, Pipeline};
    use axum::http::header::CONTENT_TYPE;
    use axum::http::{Method, StatusCode, Uri};
    use bytes::Bytes;

    enum Behaviour {
        Ok,
        Fail,
        Panic,
        Observe(&'static str),
    }

    struct Scripted(Behaviour);

    #[async_trait]
    impl Handler for Scripted {
        async fn handle(&self, cx: &mut RequestContext, _req: &InboundRequest, rw: &mut ResponseWriter) {
            match self.0 {
                Behaviour::Ok => {
                    rw.write(Bytes::from_static(b"fine"));
                }
                Behaviour::Fail => {
                    cx.fail(ProxyError::UpstreamStatus(500));
                }
                Behaviour::Panic => panic!("handler exploded"),
                Behaviour::Observe(status) => {
                    cx.observe("10.0.0.1", status);
                    rw.write(Bytes::from_static(b"{}"));
                }
            }
        }
    }

    fn chain(
        behaviour: Behaviour,
        store: Option<NodeStore>,
    ) -> (Pipeline, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::new());
        let stream = Arc::new(Stream::new().with_sink(sink.clone()));
        let mut interceptors: Vec<Arc<dyn Interceptor>> = vec![
            Arc::new(Instrumentation::new(stream)),
            Arc::new(RequestLogger),
            Arc::new(ShowErrors),
            Arc::new(Cors),
        ];
        if let Some(store) = store {
            interceptors.push(Arc::new(NodeStatePersistence::new(store)));
        }
        (Pipeline::new(interceptors, Arc::new(Scripted(behaviour))), sink)
    }

    fn request() -> InboundRequest {
        InboundRequest::new(
            Method::GET,
            Uri::from_static("/status/10.0.0.1"),
            Target::NodeStatus {
                ip: "10.0.0.1".into(),
            },
        )
    }

    fn assert_cors(rw: &ResponseWriter) {
        assert_eq!(rw.headers()[ALLOW_ORIGIN], "*");
        assert_eq!(
            rw.headers()[ALLOW_HEADERS],
            "Origin, X-Requested-With, Content-Type, Accept"
        );
    }

    #[tokio::test]
    async fn test_success_completes_job_as_success() {
        let (pipeline, sink) = chain(Behaviour::Ok, None);
        let rw = pipeline.serve(request()).await;

        assert_eq!(rw.status(), StatusCode::OK);
        assert_cors(&rw);
        assert_eq!(
            sink.completions(),
            vec![("/status/10.0.0.1".to_string(), CompletionStatus::Success)]
        );
    }

    #[tokio::test]
    async fn test_error_writes_envelope_and_completes_as_error() {
        let (pipeline, sink) = chain(Behaviour::Fail, None);
        let rw = pipeline.serve(request()).await;

        assert_eq!(rw.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(rw.headers()[CONTENT_TYPE], "application/json");
        assert_eq!(
            rw.body().map(|b| &b[..]),
            Some(&br#"{"error":"Error in HTTP request: 500"}"#[..])
        );
        assert_cors(&rw);
        assert_eq!(sink.error_events(), vec!["proxy.request_url"]);
        assert_eq!(sink.completions().len(), 1);
        assert_eq!(sink.completions()[0].1, CompletionStatus::Error);
    }

    #[tokio::test]
    async fn test_panic_becomes_generic_500() {
        let (pipeline, sink) = chain(Behaviour::Panic, None);
        let rw = pipeline.serve(request()).await;

        assert_eq!(rw.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            rw.body().map(|b| &b[..]),
            Some(&br#"{"error":"internal server error"}"#[..])
        );
        assert_cors(&rw);
        assert_eq!(sink.error_events(), vec!["panic"]);
        assert_eq!(sink.completions().len(), 1);
        assert_eq!(sink.completions()[0].1, CompletionStatus::Error);
    }

    #[tokio::test]
    async fn test_observation_is_upserted_after_handler() {
        let store = NodeStore::open_in_memory(Default::default()).unwrap();
        let (pipeline, sink) = chain(Behaviour::Observe("up"), Some(store.clone()));

        pipeline.serve(request()).await;
        pipeline.serve(request()).await;

        let row = store.get("10.0.0.1", "up").unwrap().unwrap();
        assert!(row.created_at <= row.updated_at);
        assert_eq!(
            sink.events(),
            vec!["update_node_state.created", "update_node_state.updated"]
        );
    }

    #[tokio::test]
    async fn test_store_failure_keeps_successful_response() {
        let store = NodeStore::open_in_memory(Default::default()).unwrap();
        // Drop the table so the upsert statement cannot be prepared
        store.drop_table_for_tests();
        let (pipeline, sink) = chain(Behaviour::Observe("up"), Some(store));

        let rw = pipeline.serve(request()).await;

        assert_eq!(rw.status(), StatusCode::OK);
        assert_eq!(rw.body().map(|b| &b[..]), Some(&b"{}"[..]));
        assert_eq!(sink.error_events(), vec!["update_node_state.prepare"]);
        assert_eq!(sink.completions()[0].1, CompletionStatus::Success);
    }

    #[tokio::test]
    async fn test_failed_request_is_not_persisted() {
        let store = NodeStore::open_in_memory(Default::default()).unwrap();
        let (pipeline, _sink) = chain(Behaviour::Fail, Some(store.clone()));

        pipeline.serve(request()).await;
        assert!(store.observations("10.0.0.1").unwrap().is_empty());
    }

    #[test]
    fn test_pending_error_is_logged_as_500() {
        let mut cx = RequestContext::new();
        let mut rw = ResponseWriter::new();
        assert_eq!(settled_status(&cx, &rw), StatusCode::OK);

        cx.fail(ProxyError::UpstreamStatus(503));
        assert_eq!(rw.status(), StatusCode::OK);
        assert_eq!(settled_status(&cx, &rw), StatusCode::INTERNAL_SERVER_ERROR);

        // A body already on the wire keeps its status
        rw.set_status(StatusCode::OK);
        rw.write(Bytes::from_static(b"partial"));
        assert_eq!(settled_status(&cx, &rw), StatusCode::OK);
    }

    #[test]
    fn test_panic_message_extraction() {
        let boxed: Box<dyn Any + Send> = Box::new("static");
        assert_eq!(panic_message(boxed.as_ref()), "static");
        let boxed: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(boxed.as_ref()), "owned");
        let boxed: Box<dyn Any + Send> = Box::new(42u8);
        assert_eq!(panic_message(boxed.as_ref()), "unknown panic");
    }
}
