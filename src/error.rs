//! Error types for hal-remote.

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// mDNS daemon error.
    #[error("mDNS error: {0}")]
    MdnsSd(#[from] mdns_sd::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The listening socket could not be bound.
    #[error("bind {url} failed: {source}")]
    Bind {
        /// URL the server tried to bind.
        url: String,
        /// Underlying socket error.
        #[source]
        source: std::io::Error,
    },

    /// A URL could not be parsed or resolved.
    #[error("invalid URL '{0}'")]
    InvalidUrl(String),

    /// A port string was not a decimal 16-bit number.
    #[error("invalid port '{0}'")]
    InvalidPort(String),

    /// Discovery metadata could not be built.
    #[error("metadata error: {0}")]
    Metadata(String),

    /// A discovery reply was malformed or signalled an error.
    #[error("discovery protocol error: {0}")]
    Protocol(String),

    /// A connection worker failed while handling its connection.
    #[error("worker error: {0}")]
    Worker(String),
}

impl Error {
    /// Create a discovery protocol error.
    pub fn protocol<S: Into<String>>(msg: S) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create a worker error.
    pub fn worker<S: Into<String>>(msg: S) -> Self {
        Self::Worker(msg.into())
    }
}
