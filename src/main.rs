use anyhow::Context;
use corsproxy::config::Config;
use corsproxy::forwarder::{Forwarder, ReqwestUpstream};
use corsproxy::instrumentation::{self, kvs, MetricsSink, Stream, TracingSink};
use corsproxy::logging;
use corsproxy::pipeline::{Pipeline, PipelineDeps};
use corsproxy::server;
use corsproxy::store::NodeStore;
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::load();
    let _log_guard = logging::init_logging(config.log_dir.as_deref());

    if let Some(addr) = config.metrics_addr {
        instrumentation::metrics::init_prometheus(addr);
    }

    let stream = Arc::new(
        Stream::new()
            .with_kv("service", env!("CARGO_PKG_NAME"))
            .with_sink(Arc::new(TracingSink::new()))
            .with_sink(Arc::new(MetricsSink::new())),
    );

    let upstream = ReqwestUpstream::new(config.timeout()).context("building upstream client")?;
    let forwarder = Forwarder::new(Arc::new(upstream));

    let store = if config.tracks_node_state() {
        let db_file = config.db_file.display().to_string();
        match NodeStore::open(&config.db_file, config.node_key) {
            Ok(store) => Some(store),
            Err(e) => {
                stream.event_err_kv(e.event_name(), &e, kvs([("file", db_file.as_str())]));
                return Err(e.into());
            }
        }
    } else {
        None
    };

    let addr = config.bind_addr()?;
    let pipeline = Pipeline::standard(PipelineDeps {
        stream: stream.clone(),
        forwarder,
        store,
    });
    let app = server::create_router(pipeline, config.mode);

    let port = config.port.to_string();
    let mode = config.mode.to_string();
    stream.event_kv(
        "server_listening",
        kvs([
            ("host", config.host.as_str()),
            ("port", port.as_str()),
            ("mode", mode.as_str()),
        ]),
    );
    server::start_server(app, addr).await
}
