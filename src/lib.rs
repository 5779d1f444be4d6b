pub mod config;
pub mod constants;
pub mod error;
pub mod forwarder;
pub mod instrumentation;
pub mod logging;
pub mod pipeline;
pub mod server;
pub mod store;
