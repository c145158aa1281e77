//! The boundary to the remote flag-evaluation backend.
//!
//! [`FlagService`] is everything the client needs from the backend: one unary resolve call and
//! one long-lived change stream. [`ConnectTransport`] implements it over HTTP using the Connect
//! protocol with a JSON codec. Other transports (or test doubles) can be plugged in with
//! [`ResolutionClient::with_service`](crate::ResolutionClient::with_service).
use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::{EvaluationContext, ErrorKind, FlagKind, FlagMetadata};

mod connect;
mod frame;

pub use connect::ConnectTransport;

/// Status codes reported by the backend, following the gRPC/Connect code set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Code {
    /// The call was cancelled by the caller.
    Canceled,
    /// Unknown error, or a code this client does not recognize.
    Unknown,
    /// The request was malformed, for example a type mismatch.
    InvalidArgument,
    /// The call did not complete within its deadline.
    DeadlineExceeded,
    /// The flag does not exist.
    NotFound,
    /// The entity already exists.
    AlreadyExists,
    /// The caller may not perform this call.
    PermissionDenied,
    /// A quota or rate limit was hit.
    ResourceExhausted,
    /// The backend is not in a state to serve the call.
    FailedPrecondition,
    /// The call was aborted by the backend.
    Aborted,
    /// A value was outside its valid range.
    OutOfRange,
    /// The backend does not implement the method.
    Unimplemented,
    /// The backend failed internally.
    Internal,
    /// The backend could not be reached.
    Unavailable,
    /// The response could not be decoded.
    DataLoss,
    /// The caller is not authenticated.
    Unauthenticated,
}

impl Code {
    /// Parse a Connect error code (`"not_found"`, `"data_loss"`, ...).
    pub fn from_wire(s: &str) -> Code {
        match s {
            "canceled" | "cancelled" => Code::Canceled,
            "invalid_argument" => Code::InvalidArgument,
            "deadline_exceeded" => Code::DeadlineExceeded,
            "not_found" => Code::NotFound,
            "already_exists" => Code::AlreadyExists,
            "permission_denied" => Code::PermissionDenied,
            "resource_exhausted" => Code::ResourceExhausted,
            "failed_precondition" => Code::FailedPrecondition,
            "aborted" => Code::Aborted,
            "out_of_range" => Code::OutOfRange,
            "unimplemented" => Code::Unimplemented,
            "internal" => Code::Internal,
            "unavailable" => Code::Unavailable,
            "data_loss" => Code::DataLoss,
            "unauthenticated" => Code::Unauthenticated,
            _ => Code::Unknown,
        }
    }

    /// Code implied by an HTTP status when the body carries no Connect error.
    pub fn from_http_status(status: u16) -> Code {
        match status {
            400 => Code::Internal,
            401 => Code::Unauthenticated,
            403 => Code::PermissionDenied,
            404 => Code::Unimplemented,
            408 => Code::DeadlineExceeded,
            429 | 502 | 503 | 504 => Code::Unavailable,
            _ => Code::Unknown,
        }
    }
}

impl From<Code> for ErrorKind {
    fn from(code: Code) -> ErrorKind {
        match code {
            Code::Unavailable | Code::Unimplemented => ErrorKind::ProviderNotReady,
            Code::NotFound => ErrorKind::FlagNotFound,
            Code::InvalidArgument => ErrorKind::TypeMismatch,
            Code::DataLoss => ErrorKind::ParseError,
            _ => ErrorKind::General,
        }
    }
}

/// A failed call to the backend.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("{code:?}: {message}")]
pub struct TransportError {
    /// Status code of the failure.
    pub code: Code,
    /// Description reported by the backend or the transport.
    pub message: String,
}

impl TransportError {
    /// An error with `code` and `message`.
    pub fn new(code: Code, message: impl Into<String>) -> TransportError {
        TransportError {
            code,
            message: message.into(),
        }
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> TransportError {
        let code = if err.is_timeout() {
            Code::DeadlineExceeded
        } else if err.is_connect() || err.is_request() || err.is_body() {
            Code::Unavailable
        } else if err.is_decode() {
            Code::DataLoss
        } else {
            Code::Unknown
        };
        TransportError::new(code, err.without_url().to_string())
    }
}

/// A successful unary resolution, before it is checked against the requested type.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolveResponse {
    /// Resolved value as JSON.
    pub value: serde_json::Value,
    /// Name of the selected variant.
    pub variant: Option<String>,
    /// Reason string as sent by the backend, such as `"STATIC"`.
    pub reason: String,
    /// Metadata attached to the flag.
    pub metadata: FlagMetadata,
}

/// Kind of message received on the change stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotificationKind {
    /// The backend is (again) serving up-to-date values.
    Ready,
    /// Flag configuration changed.
    ConfigChange,
    /// The backend is closing the stream on purpose.
    Shutdown,
    /// Liveness ping. Carries no information.
    KeepAlive,
}

/// A message received on the change stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeNotification {
    /// Kind of message.
    pub kind: NotificationKind,
    /// Flags affected by a [`NotificationKind::ConfigChange`]. `None` means any flag may have
    /// changed.
    pub affected_keys: Option<Vec<String>>,
}

impl ChangeNotification {
    /// A notification of `kind` that names no flags.
    pub fn new(kind: NotificationKind) -> ChangeNotification {
        ChangeNotification {
            kind,
            affected_keys: None,
        }
    }

    /// A [`NotificationKind::ConfigChange`] affecting `affected_keys`.
    pub fn config_change(affected_keys: Option<Vec<String>>) -> ChangeNotification {
        ChangeNotification {
            kind: NotificationKind::ConfigChange,
            affected_keys,
        }
    }
}

/// Messages of an open change stream. The stream ends when the backend closes it.
pub type EventStream = BoxStream<'static, Result<ChangeNotification, TransportError>>;

/// Remote flag-evaluation backend.
#[async_trait]
pub trait FlagService: Send + Sync {
    /// Resolve one flag. Deadlines are the implementation's responsibility.
    async fn resolve(
        &self,
        kind: FlagKind,
        flag_key: &str,
        context: &EvaluationContext,
    ) -> Result<ResolveResponse, TransportError>;

    /// Open the change stream.
    async fn event_stream(&self) -> Result<EventStream, TransportError>;
}
