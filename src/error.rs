//! Error types for the connection subsystem.

/// Result type alias for connection-subsystem operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error taxonomy for the connection subsystem.
///
/// `WouldBlock` is deliberately absent: per spec it is swallowed at the call
/// site and surfaced as a successful no-op, never as an `Err`.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Underlying I/O failure not covered by a more specific variant.
    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    /// `connect()` returned a hard failure (not EINPROGRESS).
    #[error("connect to {addr} failed: {message}")]
    ConnectFailed { addr: String, message: String },

    /// A real `accept()` error, distinct from would-block. The listener must close.
    #[error("listener accept failed: {message}")]
    ListenerFatal { message: String },

    /// Bind/listen setup failed during `create_listener`.
    #[error("failed to bind listener on {addr}: {message}")]
    BindFailed { addr: String, message: String },

    /// The TLS session reported `Error`/`Close`, or peer verification failed.
    #[error("TLS handshake failed: {message}")]
    TlsFailed { message: String },

    /// The connection table is at its configured capacity.
    #[error("connection table full (capacity {capacity})")]
    TableFull { capacity: usize },

    /// A kind's `process_inbuf`/`finished_flushing` hook returned break.
    #[error("protocol handler broke the connection: {message}")]
    ProtocolBroke { message: String },

    /// Configuration is missing a value an operation needs.
    #[error("configuration error: {message}")]
    Config { message: String },
}

impl Error {
    pub fn connect_failed(addr: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ConnectFailed { addr: addr.into(), message: message.into() }
    }

    pub fn bind_failed(addr: impl Into<String>, message: impl Into<String>) -> Self {
        Self::BindFailed { addr: addr.into(), message: message.into() }
    }

    pub fn tls_failed(message: impl Into<String>) -> Self {
        Self::TlsFailed { message: message.into() }
    }

    pub fn protocol_broke(message: impl Into<String>) -> Self {
        Self::ProtocolBroke { message: message.into() }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config { message: message.into() }
    }

    /// Category string, used for log fields rather than free-text matching.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Io { .. } => "io",
            Self::ConnectFailed { .. } => "connect",
            Self::ListenerFatal { .. } => "listener",
            Self::BindFailed { .. } => "bind",
            Self::TlsFailed { .. } => "tls",
            Self::TableFull { .. } => "table",
            Self::ProtocolBroke { .. } => "protocol",
            Self::Config { .. } => "config",
        }
    }
}
