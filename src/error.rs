//! Error types for the tunnel endpoints.

use std::fmt;

use thiserror::Error;
use tokio_tungstenite::tungstenite;

use crate::filter::FilterError;

/// Boxed cause of a failed dial.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Result type alias for tunnel operations.
pub type Result<T> = std::result::Result<T, TunnelError>;

/// Errors raised by bridges, registries and mapping construction.
#[derive(Error, Debug)]
pub enum TunnelError {
    /// The client endpoint could not reach the remote WebSocket endpoint
    #[error("the server endpoint is not available at {url}: {source}")]
    EndpointNotAvailable {
        url: String,
        #[source]
        source: BoxError,
    },

    /// The server endpoint could not reach the TCP service mapped on a path
    #[error("mapped service is not available at {address}: {source}")]
    MappedServiceNotAvailable {
        address: String,
        #[source]
        source: std::io::Error,
    },

    /// A filter refused the data flowing through it
    #[error(transparent)]
    Filter(#[from] FilterError),

    /// A listener could not be bound
    #[error("failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },

    /// Network I/O error
    #[error("network error: {0}")]
    Io(#[from] std::io::Error),

    /// WebSocket protocol or handshake error
    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    /// Malformed `host:port` string
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// Malformed or non-WebSocket URL
    #[error("invalid websocket url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    /// No constructor registered under this filter name
    #[error("unknown filter: {0}")]
    UnknownFilter(String),

    /// Any other configuration mistake
    #[error("configuration error: {0}")]
    Config(String),
}

impl TunnelError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Classify this error for reports and events.
    #[must_use]
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::EndpointNotAvailable { .. } => FailureKind::EndpointNotAvailable,
            Self::MappedServiceNotAvailable { .. } => FailureKind::MappedServiceNotAvailable,
            Self::Filter(_) => FailureKind::Filter,
            Self::Bind { .. } | Self::Io(_) | Self::WebSocket(_) => FailureKind::Io,
            Self::InvalidAddress(_)
            | Self::InvalidUrl { .. }
            | Self::UnknownFilter(_)
            | Self::Config(_) => FailureKind::Config,
        }
    }

    /// True for errors detected while building mappings, before any socket is used.
    #[must_use]
    pub fn is_config(&self) -> bool {
        self.kind() == FailureKind::Config
    }
}

/// Plain classification of a bridge or endpoint failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    EndpointNotAvailable,
    MappedServiceNotAvailable,
    Filter,
    Io,
    Config,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::EndpointNotAvailable => "endpoint not available",
            Self::MappedServiceNotAvailable => "mapped service not available",
            Self::Filter => "filter failure",
            Self::Io => "i/o failure",
            Self::Config => "configuration error",
        };
        f.write_str(name)
    }
}
