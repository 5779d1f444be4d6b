use crate::error::ConfigError;
use crate::forwarder::Target;
use crate::pipeline::{InboundRequest, Pipeline};
use axum::{
    extract::{Path, Query, State},
    http::{Method, Uri},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use hyper::Server;
use serde::Deserialize;
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use tracing::info;

/// Which path shape a deployment serves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RouteMode {
    /// `GET /*target` and `GET /?url=<target>`
    Url,
    /// `GET /status/:ip`, with node state tracking
    #[default]
    Status,
}

impl FromStr for RouteMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "url" => Ok(RouteMode::Url),
            "status" => Ok(RouteMode::Status),
            other => Err(ConfigError::RouteMode(other.to_string())),
        }
    }
}

impl fmt::Display for RouteMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouteMode::Url => f.write_str("url"),
            RouteMode::Status => f.write_str("status"),
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<Pipeline>,
}

#[derive(Debug, Deserialize)]
struct RootParams {
    url: Option<String>,
}

async fn run_pipeline(state: AppState, method: Method, uri: Uri, target: Target) -> Response {
    state
        .pipeline
        .serve(InboundRequest::new(method, uri, target))
        .await
        .into_response()
}

/// `GET /?url=<target>`
async fn proxy_root(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    params: Option<Query<RootParams>>,
) -> Response {
    let target = params
        .and_then(|Query(p)| p.url)
        .unwrap_or_default();
    run_pipeline(state, method, uri, Target::Url(target)).await
}

/// `GET /<target>`; everything after the first slash, query included, is the target
async fn proxy_path(State(state): State<AppState>, method: Method, uri: Uri) -> Response {
    let raw = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    let target = raw.strip_prefix('/').unwrap_or(raw).to_string();
    run_pipeline(state, method, uri, Target::Url(target)).await
}

/// `GET /status/:ip`
async fn proxy_node_status(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    Path(ip): Path<String>,
) -> Response {
    run_pipeline(state, method, uri, Target::NodeStatus { ip }).await
}

/// Build the router for one route mode around an assembled pipeline
pub fn create_router(pipeline: Pipeline, mode: RouteMode) -> Router {
    let state = AppState {
        pipeline: Arc::new(pipeline),
    };
    let router = match mode {
        RouteMode::Url => Router::new()
            .route("/", get(proxy_root))
            .route("/*target", get(proxy_path)),
        RouteMode::Status => Router::new().route("/status/:ip", get(proxy_node_status)),
    };
    router.with_state(state)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}

/// Serve `app` on `addr` until Ctrl-C
pub async fn start_server(app: Router, addr: SocketAddr) -> anyhow::Result<()> {
    info!("corsproxy listening on http://{}", addr);
    Server::try_bind(&addr)?
        .serve(app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}
