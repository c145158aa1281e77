use std::sync::Arc;

/// Represents a result type for client construction and lifecycle operations.
///
/// Flag resolution never returns this type: resolution failures are embedded into
/// [`ResolutionDetail`](crate::ResolutionDetail) as an [`ErrorKind`](crate::ErrorKind).
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while configuring, starting or stopping the client.
#[derive(thiserror::Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// Host/port combination does not form a valid endpoint.
    #[error("invalid endpoint configuration")]
    InvalidEndpoint(#[source] url::ParseError),

    /// A unix socket path was configured on a platform without unix sockets.
    #[error("unix socket {0:?} is not supported on this platform")]
    UnsupportedSocket(String),

    /// The configuration is internally inconsistent.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(&'static str),

    /// The TLS trust root could not be used.
    #[error("invalid TLS certificate: {0}")]
    InvalidCertificate(String),

    /// The client did not become ready within the requested time.
    #[error("provider did not become ready in time")]
    ReadyTimeout,

    /// The stream reached the terminal error state before the first successful connect.
    #[error("provider failed to connect: retries exhausted")]
    RetriesExhausted,

    /// The client has been shut down.
    #[error("client has been shut down")]
    ShutDown,

    /// [`ResolutionClient::start`](crate::ResolutionClient::start) was called outside of a tokio
    /// runtime.
    #[error("no tokio runtime is available to run the change stream")]
    NoRuntime,

    /// Indicates that the change stream task panicked. This should normally never happen.
    #[error("change stream task panicked")]
    StreamTaskPanicked,

    /// An I/O error.
    #[error(transparent)]
    // std::io::Error is not clonable, so we're wrapping it in an Arc.
    Io(Arc<std::io::Error>),

    /// Network error.
    #[error(transparent)]
    Network(Arc<reqwest::Error>),
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(Arc::new(value))
    }
}

impl From<reqwest::Error> for Error {
    fn from(value: reqwest::Error) -> Self {
        Error::Network(Arc::new(value.without_url()))
    }
}
