use thiserror::Error;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Failures on the request path. Only the display text ever reaches the caller.
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("invalid target '{target}': {reason}")]
    Parse { target: String, reason: String },

    #[error("HTTP request failed: {0}")]
    Transport(#[source] BoxError),

    #[error("Error in HTTP request: {0}")]
    UpstreamStatus(u16),

    #[error("failed to read response body: {0}")]
    BodyRead(#[source] BoxError),

    #[error("failed to decode status response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("{0}")]
    Fault(String),
}

impl ProxyError {
    pub fn parse(target: impl Into<String>, reason: impl Into<String>) -> Self {
        ProxyError::Parse {
            target: target.into(),
            reason: reason.into(),
        }
    }

    /// Instrumentation event name reported alongside the error.
    pub fn event_name(&self) -> &'static str {
        match self {
            ProxyError::Parse { .. } => "proxy.parse_target",
            ProxyError::Transport(_) | ProxyError::UpstreamStatus(_) => "proxy.request_url",
            ProxyError::BodyRead(_) => "proxy.read_body",
            ProxyError::Decode(_) => "proxy.parse_body",
            ProxyError::Fault(_) => "panic",
        }
    }
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("failed to open database '{path}': {source}")]
    Open {
        path: String,
        #[source]
        source: rusqlite::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to set up schema: {0}")]
    Schema(#[source] rusqlite::Error),

    #[error("nodes table does not fit node key shape '{shape}': {detail}")]
    SchemaMismatch { shape: &'static str, detail: String },

    #[error("failed to prepare statement: {0}")]
    Prepare(#[source] rusqlite::Error),

    #[error("failed to execute statement: {0}")]
    Exec(#[source] rusqlite::Error),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn event_name(&self) -> &'static str {
        match self {
            StoreError::Open { .. } | StoreError::Io(_) => "open_db.connect",
            StoreError::Schema(_) | StoreError::SchemaMismatch { .. } => "create_table",
            StoreError::Prepare(_) => "update_node_state.prepare",
            StoreError::Exec(_) => "update_node_state.execute",
            StoreError::Unavailable(_) => "update_node_state.unavailable",
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("unknown route mode '{0}' (expected 'url' or 'status')")]
    RouteMode(String),

    #[error("unknown node key shape '{0}' (expected 'address' or 'address_state')")]
    NodeKeyShape(String),

    #[error("invalid bind address '{0}'")]
    BindAddr(String),
}

pub type Result<T> = std::result::Result<T, ProxyError>;
