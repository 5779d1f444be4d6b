//! Outbound side of the proxy.
//!
//! [`Forwarder`] turns a [`Target`] into one GET through an [`Upstream`] port and
//! maps every outcome onto [`ProxyError`]. [`ReqwestUpstream`] is the production
//! adapter: TLS certificates are not validated and requests are bounded by a
//! fixed timeout.

use crate::constants::{FALLBACK_CONTENT_TYPE, NODE_STATUS_PATH, NODE_STATUS_PORT};
use crate::error::{ProxyError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::CONTENT_TYPE;
use reqwest::Url;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// What an inbound request asks the proxy to fetch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// Arbitrary address; fetched over https regardless of the scheme given
    Url(String),
    /// Status endpoint of a node, `https://<ip>:8080/status`
    NodeStatus { ip: String },
}

impl Target {
    pub fn resolve(&self) -> Result<Url> {
        match self {
            Target::Url(raw) => resolve_url(raw),
            Target::NodeStatus { ip } => resolve_node_status(ip),
        }
    }

    /// Identity under which a successful observation of this target is stored
    pub fn node_key(&self) -> Option<&str> {
        match self {
            Target::NodeStatus { ip } => Some(ip),
            Target::Url(_) => None,
        }
    }
}

fn strip_scheme<'a>(s: &'a str, scheme: &str) -> Option<&'a str> {
    let head = s.get(..scheme.len())?;
    if head.eq_ignore_ascii_case(scheme) {
        s.get(scheme.len()..)
    } else {
        None
    }
}

fn resolve_url(raw: &str) -> Result<Url> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ProxyError::parse(raw, "empty target"));
    }

    let rest = if let Some(rest) = strip_scheme(trimmed, "https://") {
        rest
    } else if let Some(rest) = strip_scheme(trimmed, "http://") {
        rest
    } else if trimmed.contains("://") {
        return Err(ProxyError::parse(raw, "unsupported scheme"));
    } else {
        trimmed
    };

    let url = Url::parse(&format!("https://{rest}"))
        .map_err(|e| ProxyError::parse(raw, e.to_string()))?;
    match url.host_str() {
        Some(host) if !host.is_empty() => Ok(url),
        _ => Err(ProxyError::parse(raw, "missing host")),
    }
}

fn resolve_node_status(ip: &str) -> Result<Url> {
    if ip.is_empty() || ip.contains(['/', '?', '#', '@']) {
        return Err(ProxyError::parse(ip, "not a node address"));
    }
    let url = Url::parse(&format!("https://{ip}:{NODE_STATUS_PORT}{NODE_STATUS_PATH}"))
        .map_err(|e| ProxyError::parse(ip, e.to_string()))?;
    if url.port() != Some(NODE_STATUS_PORT) || url.path() != NODE_STATUS_PATH {
        return Err(ProxyError::parse(ip, "not a node address"));
    }
    Ok(url)
}

/// Response as seen by the forwarder. Bodies of non-200 responses are not read.
#[derive(Clone, Debug)]
pub struct UpstreamResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Bytes,
}

#[async_trait]
pub trait Upstream: Send + Sync {
    async fn get(&self, url: &Url) -> Result<UpstreamResponse>;
}

pub struct ReqwestUpstream {
    client: reqwest::Client,
}

impl ReqwestUpstream {
    pub fn new(timeout: Duration) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .timeout(timeout)
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Upstream for ReqwestUpstream {
    async fn get(&self, url: &Url) -> Result<UpstreamResponse> {
        let resp = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| ProxyError::Transport(Box::new(e)))?;
        let status = resp.status().as_u16();
        let content_type = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        if status != 200 {
            return Ok(UpstreamResponse {
                status,
                content_type,
                body: Bytes::new(),
            });
        }
        let body = resp
            .bytes()
            .await
            .map_err(|e| ProxyError::BodyRead(Box::new(e)))?;
        Ok(UpstreamResponse {
            status,
            content_type,
            body,
        })
    }
}

/// Body of a node status endpoint
#[derive(Debug, Deserialize)]
pub struct StatusResponse {
    pub status: String,
}

/// Successful forward: verbatim upstream bytes plus anything decoded from them
#[derive(Debug, Clone)]
pub struct Forwarded {
    pub body: Bytes,
    pub content_type: String,
    pub observed_status: Option<String>,
}

#[derive(Clone)]
pub struct Forwarder {
    upstream: Arc<dyn Upstream>,
}

impl Forwarder {
    pub fn new(upstream: Arc<dyn Upstream>) -> Self {
        Self { upstream }
    }

    pub async fn forward(&self, target: &Target) -> Result<Forwarded> {
        let url = target.resolve()?;
        debug!(%url, "forwarding request");

        let resp = self.upstream.get(&url).await?;
        if resp.status != 200 {
            return Err(ProxyError::UpstreamStatus(resp.status));
        }

        let observed_status = match target {
            Target::NodeStatus { .. } => {
                let decoded: StatusResponse = serde_json::from_slice(&resp.body)?;
                Some(decoded.status)
            }
            Target::Url(_) => None,
        };

        Ok(Forwarded {
            body: resp.body,
            content_type: resp
                .content_type
                .unwrap_or_else(|| FALLBACK_CONTENT_TYPE.to_string()),
            observed_status,
        })
    }
}
