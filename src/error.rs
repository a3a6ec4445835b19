//! Error types and handling for the tunnel session library

use thiserror::Error;

/// Reasons a connection link or configuration document cannot be translated
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// Input is neither a JSON document nor a supported link scheme
    #[error("Unsupported protocol: {0}")]
    UnsupportedProtocol(String),

    /// Payload could not be decoded (bad URI, Base64 or JSON)
    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    /// The link carries no credential identifier
    #[error("Missing credential")]
    MissingCredential,

    /// The link carries no host
    #[error("Missing host")]
    MissingHost,
}

/// Main error type for tunnel session operations
#[derive(Error, Debug)]
pub enum TunError {
    /// Link or document translation errors
    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    /// The engine rejected a structurally valid configuration
    #[error("Configuration rejected by engine: {0}")]
    Validation(String),

    /// Engine start/stop failures
    #[error("Engine error: {0}")]
    Engine(String),

    /// Virtual interface errors
    #[error("Interface error: {0}")]
    Interface(String),

    /// Tunnel permission denied by the OS
    #[error("Permission error: {0}")]
    Permission(String),

    /// Transient network errors (probe timeouts, connectivity checks)
    #[error("Network error: {0}")]
    Network(String),

    /// Persistence errors
    #[error("Storage error: {0}")]
    Storage(String),

    /// Settings errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid state errors
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Other errors
    #[error("Other error: {0}")]
    Other(String),
}

/// Result type alias for tunnel session operations
pub type Result<T> = std::result::Result<T, TunError>;

/// Helper trait for converting errors to TunError
pub trait IntoTunError<T> {
    fn into_tun_error(self, context: &str) -> Result<T>;
}

impl<T, E> IntoTunError<T> for std::result::Result<T, E>
where
    E: std::fmt::Display,
{
    fn into_tun_error(self, context: &str) -> Result<T> {
        self.map_err(|e| TunError::Other(format!("{context}: {e}")))
    }
}

impl From<toml::de::Error> for TunError {
    fn from(err: toml::de::Error) -> Self {
        TunError::Config(format!("TOML parsing error: {err}"))
    }
}

impl From<reqwest::Error> for TunError {
    fn from(err: reqwest::Error) -> Self {
        TunError::Network(err.to_string())
    }
}

impl From<serde_json::Error> for ParseError {
    fn from(err: serde_json::Error) -> Self {
        ParseError::MalformedPayload(format!("invalid JSON: {err}"))
    }
}
