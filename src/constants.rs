/// Fixed values shared by the proxy, the router and the tests

// CORS headers injected on every response
pub const ACCESS_CONTROL_ALLOW_ORIGIN: &str = "*";
pub const ACCESS_CONTROL_ALLOW_HEADERS: &str = "Origin, X-Requested-With, Content-Type, Accept";

// Node status endpoint layout (https://<ip>:8080/status)
pub const NODE_STATUS_PORT: u16 = 8080;
pub const NODE_STATUS_PATH: &str = "/status";

// Defaults for environment-driven configuration
pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_DB_FILE: &str = "/opt/corsproxy.db";
pub const DEFAULT_TIMEOUT_SECS: u64 = 15;

pub const JSON_CONTENT_TYPE: &str = "application/json";
pub const FALLBACK_CONTENT_TYPE: &str = "application/octet-stream";

/// Message used when a handler faults; internals are never echoed back
pub const INTERNAL_ERROR_MESSAGE: &str = "internal server error";
