#![allow(dead_code)]

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, Response};
use bytes::Bytes;
use corsproxy::error::{ProxyError, Result};
use corsproxy::forwarder::{Forwarder, Upstream, UpstreamResponse};
use corsproxy::instrumentation::{MemorySink, Stream};
use corsproxy::pipeline::{Pipeline, PipelineDeps};
use corsproxy::server::{create_router, RouteMode};
use corsproxy::store::NodeStore;
use reqwest::Url;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tower::ServiceExt;

/// Canned upstream keyed by absolute URL; unknown URLs fail like a refused connection
#[derive(Default)]
pub struct StubUpstream {
    responses: Mutex<HashMap<String, (u16, String)>>,
    pub requests: Mutex<Vec<String>>,
}

impl StubUpstream {
    pub fn respond(&self, url: &str, status: u16, body: &str) {
        self.responses
            .lock()
            .unwrap()
            .insert(url.to_string(), (status, body.to_string()));
    }
}

#[async_trait]
impl Upstream for StubUpstream {
    async fn get(&self, url: &Url) -> Result<UpstreamResponse> {
        self.requests.lock().unwrap().push(url.to_string());
        let canned = self.responses.lock().unwrap().get(url.as_str()).cloned();
        match canned {
            Some((status, body)) => Ok(UpstreamResponse {
                status,
                content_type: Some("application/json".to_string()),
                body: Bytes::from(body),
            }),
            None => Err(ProxyError::Transport(Box::new(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "connection refused",
            )))),
        }
    }
}

pub struct Harness {
    pub app: axum::Router,
    pub upstream: Arc<StubUpstream>,
    pub sink: Arc<MemorySink>,
    pub store: Option<NodeStore>,
}

impl Harness {
    pub fn new(mode: RouteMode, store: Option<NodeStore>) -> Self {
        let upstream = Arc::new(StubUpstream::default());
        let sink = Arc::new(MemorySink::new());
        let stream = Arc::new(Stream::new().with_sink(sink.clone()));
        let pipeline = Pipeline::standard(PipelineDeps {
            stream,
            forwarder: Forwarder::new(upstream.clone()),
            store: store.clone(),
        });
        Self {
            app: create_router(pipeline, mode),
            upstream,
            sink,
            store,
        }
    }

    pub async fn get(&self, uri: &str) -> (Response<axum::body::BoxBody>, String) {
        let request = Request::builder()
            .method("GET")
            .uri(uri)
            .body(Body::empty())
            .expect("request builder should succeed");
        let response = self
            .app
            .clone()
            .oneshot(request)
            .await
            .expect("router is infallible");
        let (parts, body) = response.into_parts();
        let bytes = hyper::body::to_bytes(body)
            .await
            .expect("body should be readable");
        let text = String::from_utf8_lossy(&bytes).to_string();
        (Response::from_parts(parts, axum::body::boxed(Body::empty())), text)
    }
}

pub fn assert_cors<B>(response: &Response<B>) {
    assert_eq!(
        response.headers()["access-control-allow-origin"],
        corsproxy::constants::ACCESS_CONTROL_ALLOW_ORIGIN
    );
    assert_eq!(
        response.headers()["access-control-allow-headers"],
        corsproxy::constants::ACCESS_CONTROL_ALLOW_HEADERS
    );
}
