use crate::constants::{
    DEFAULT_DB_FILE, DEFAULT_HOST, DEFAULT_PORT, DEFAULT_TIMEOUT_SECS,
};
use crate::error::ConfigError;
use crate::server::RouteMode;
use crate::store::NodeKeyShape;
use clap::Parser;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::time::Duration;

/// Process configuration. Every flag falls back to a `CORS_PROXY_*` environment
/// variable (a `.env` file is loaded first) and then to a default.
#[derive(Debug, Clone, Parser)]
#[command(name = "corsproxy")]
#[command(about = "CORS-enabling forwarding proxy")]
#[command(version)]
pub struct Config {
    /// Address to bind
    #[arg(long, env = "CORS_PROXY_HOST", default_value = DEFAULT_HOST)]
    pub host: String,

    /// Port to bind
    #[arg(long, env = "CORS_PROXY_PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// SQLite file for node observations
    #[arg(long = "db-file", env = "CORS_PROXY_DB_FILE", default_value = DEFAULT_DB_FILE)]
    pub db_file: PathBuf,

    /// Path shape to serve: `url` or `status`
    #[arg(long, env = "CORS_PROXY_MODE", default_value = "status")]
    pub mode: RouteMode,

    /// Observation identity: `address_state` or `address`
    #[arg(long = "node-key", env = "CORS_PROXY_NODE_KEY", default_value = "address_state")]
    pub node_key: NodeKeyShape,

    /// Upstream read/write timeout in seconds
    #[arg(long = "timeout-secs", env = "CORS_PROXY_TIMEOUT_SECS", default_value_t = DEFAULT_TIMEOUT_SECS)]
    pub timeout_secs: u64,

    /// Prometheus listen address; no exporter when unset
    #[arg(long = "metrics-addr", env = "CORS_PROXY_METRICS_ADDR")]
    pub metrics_addr: Option<SocketAddr>,

    /// Directory for JSON log files; console only when unset
    #[arg(long = "log-dir", env = "CORS_PROXY_LOG_DIR")]
    pub log_dir: Option<PathBuf>,
}

impl Config {
    /// Read `.env`, then flags and environment
    pub fn load() -> Self {
        dotenv::dotenv().ok();
        Self::parse()
    }

    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        let display = format!("{}:{}", self.host, self.port);
        (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|_| ConfigError::BindAddr(display.clone()))?
            .next()
            .ok_or(ConfigError::BindAddr(display))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Node state is only tracked when serving node status routes
    pub fn tracks_node_state(&self) -> bool {
        self.mode == RouteMode::Status
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_defaults() {
        let config = Config::try_parse_from([
            "corsproxy",
            "--host",
            "0.0.0.0",
            "--port",
            "9000",
            "--db-file",
            "/tmp/nodes.db",
            "--mode",
            "url",
            "--node-key",
            "address",
            "--timeout-secs",
            "3",
        ])
        .unwrap();

        assert_eq!(config.bind_addr().unwrap(), "0.0.0.0:9000".parse().unwrap());
        assert_eq!(config.db_file, PathBuf::from("/tmp/nodes.db"));
        assert_eq!(config.mode, RouteMode::Url);
        assert_eq!(config.node_key, NodeKeyShape::Address);
        assert_eq!(config.timeout(), Duration::from_secs(3));
        assert!(!config.tracks_node_state());
    }

    #[test]
    fn test_invalid_mode_is_rejected() {
        let result = Config::try_parse_from(["corsproxy", "--mode", "everything"]);
        assert!(result.is_err());
    }
}
