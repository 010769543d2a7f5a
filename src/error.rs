//! Error types for rustrepro.
//!
//! Configuration and listener errors are fatal and travel up to the caller of
//! [`crate::Repro::start`]. Per-request errors never leave the engine: they are
//! turned into an HTTP response via [`ReproError::status_code`].

use hyper::StatusCode;
use thiserror::Error;

/// Main error type for rustrepro.
#[derive(Error, Debug)]
pub enum ReproError {
    /// A mapping for this local host is already registered.
    #[error("duplicate local host: {host}")]
    DuplicateLocalHost { host: String },

    /// A host string is empty or malformed.
    #[error("invalid host '{host}': {reason}")]
    InvalidHost { host: String, reason: String },

    /// Mapping scheme is neither http nor https.
    #[error("invalid scheme '{scheme}' (expected http or https)")]
    InvalidScheme { scheme: String },

    /// A rewrite route is not a valid regular expression.
    #[error("invalid rewrite route '{pattern}': {source}")]
    InvalidRewriteRule {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    /// No mapping is registered for this local host.
    #[error("no mapping for local host: {host}")]
    NotFound { host: String },

    /// The configuration is inconsistent or could not be understood.
    #[error("invalid configuration: {message}")]
    ConfigInvalid { message: String },

    /// The YAML configuration file could not be read or parsed.
    #[error("failed to load config file {path}: {message}")]
    ConfigFile { path: String, message: String },

    /// The local listener for a mapping could not be bound.
    #[error("failed to bind listener for {local}: {source}")]
    ListenerBindFailure {
        local: String,
        #[source]
        source: std::io::Error,
    },

    /// The inbound Host header matches no configured local host.
    #[error("unknown host: {host}")]
    UnknownHost { host: String },

    /// The inbound request carries no Host header and no authority.
    #[error("missing Host header")]
    MissingHost,

    /// The upstream could not be reached at the transport level.
    #[error("upstream {remote} unreachable: {message}")]
    UpstreamUnreachable { remote: String, message: String },

    /// TLS handshake with the upstream failed.
    #[error("TLS handshake with {remote} failed: {message}")]
    TlsValidationFailure { remote: String, message: String },

    /// The upstream broke the HTTP exchange.
    #[error("upstream error: {0}")]
    Upstream(String),
}

impl ReproError {
    /// Creates a new configuration error.
    pub fn config_invalid(message: impl Into<String>) -> Self {
        Self::ConfigInvalid {
            message: message.into(),
        }
    }

    /// Creates a new invalid host error.
    pub fn invalid_host(host: &str, reason: impl Into<String>) -> Self {
        Self::InvalidHost {
            host: host.to_string(),
            reason: reason.into(),
        }
    }

    /// Status code sent to the client when this error ends a request.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::UnknownHost { .. } | Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::MissingHost => StatusCode::BAD_REQUEST,
            _ => StatusCode::BAD_GATEWAY,
        }
    }
}

/// Result type alias using ReproError.
pub type Result<T> = std::result::Result<T, ReproError>;
