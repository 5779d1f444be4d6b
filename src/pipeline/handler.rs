use super::{Handler, InboundRequest, RequestContext, ResponseWriter};
use crate::constants::FALLBACK_CONTENT_TYPE;
use crate::forwarder::Forwarder;
use async_trait::async_trait;
use axum::http::header::{HeaderValue, CONTENT_TYPE};
use axum::http::StatusCode;

/// Innermost step: forward the request and copy the upstream body through
pub struct ProxyHandler {
    forwarder: Forwarder,
}

impl ProxyHandler {
    pub fn new(forwarder: Forwarder) -> Self {
        Self { forwarder }
    }
}

#[async_trait]
impl Handler for ProxyHandler {
    async fn handle(&self, cx: &mut RequestContext, req: &InboundRequest, rw: &mut ResponseWriter) {
        let forwarded = match self.forwarder.forward(&req.target).await {
            Ok(forwarded) => forwarded,
            Err(err) => {
                cx.fail(err);
                return;
            }
        };

        if let (Some(key), Some(status)) = (req.target.node_key(), forwarded.observed_status) {
            cx.observe(key, status);
        }

        let content_type = HeaderValue::from_str(&forwarded.content_type)
            .unwrap_or_else(|_| HeaderValue::from_static(FALLBACK_CONTENT_TYPE));
        rw.set_header(CONTENT_TYPE, content_type);
        rw.set_status(StatusCode::OK);
        if !rw.write(forwarded.body) {
            cx.event("proxy.write_body.skipped");
        }
    }
}
