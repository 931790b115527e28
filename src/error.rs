//! Error types for SetuLink

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// SetuLink error types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Datagram port could not be bound - messaging disabled for this process
    #[error("Bind failed on port {port}: {source}")]
    Bind {
        /// Port the transport attempted to bind
        port: u16,
        /// Underlying socket error
        source: std::io::Error,
    },

    /// Malformed wire frame - the message is dropped, never fatal
    #[error("Decode error: {0}")]
    Decode(String),

    /// Socket error during send/receive - receive loop re-arms itself
    #[error("Transport error: {0}")]
    Transport(String),

    /// Streaming fallback listener was never connected to
    #[error("Fallback listener timed out after {0:?}")]
    FallbackTimeout(std::time::Duration),

    /// Configuration file error
    #[error("Config error: {0}")]
    Config(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Error::Config(e.to_string())
    }
}

impl From<toml::ser::Error> for Error {
    fn from(e: toml::ser::Error) -> Self {
        Error::Config(e.to_string())
    }
}
