//! Error hierarchy for Tether.

use std::path::PathBuf;
use thiserror::Error;

/// Errors from locating the host through the native-messaging handshake.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("No discovery manifest found (searched {} locations)", searched.len())]
    ManifestNotFound { searched: Vec<PathBuf> },

    #[error("Invalid discovery manifest at {}: {message}", path.display())]
    ManifestInvalid { path: PathBuf, message: String },

    #[error("Failed to spawn discovery binary {}: {source}", path.display())]
    Spawn {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Discovery handshake timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Discovery protocol error: {0}")]
    Protocol(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from the reverse-connection link to the host.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("Discovery failed: {0}")]
    Discovery(#[from] DiscoveryError),

    #[error("Failed to open event stream: {0}")]
    Connect(String),

    #[error("Host does not expose the '{tool}' registrar tool")]
    RegistrarMissing { tool: String },

    #[error("Registration rejected: {0}")]
    RegistrationRejected(String),

    #[error("Request '{method}' timed out after {timeout_ms}ms")]
    RequestTimeout { method: String, timeout_ms: u64 },

    #[error("POST rejected by host: {status} {body}")]
    Transport { status: u16, body: String },

    #[error("JSON-RPC error (code {code}): {message}")]
    JsonRpc { code: i64, message: String },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Channel closed before a reply arrived")]
    ChannelClosed,

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Link protocol error: {0}")]
    Protocol(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors from configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Config file parse error at {path}: {message}")]
    Parse { path: String, message: String },

    #[error("Missing required configuration: {key}")]
    MissingKey { key: String },

    #[error("Invalid configuration value for '{key}': {message}")]
    InvalidValue { key: String, message: String },
}
