//! Resolution results and the values they carry.
use std::collections::HashMap;

use derive_more::From;
use serde::{Deserialize, Serialize};

/// Key-value description of the caller consumed by the backend's targeting rules.
pub type EvaluationContext = HashMap<String, serde_json::Value>;

/// Arbitrary metadata attached by the backend to a resolved flag.
pub type FlagMetadata = HashMap<String, serde_json::Value>;

/// JSON object returned by object flags.
pub type ObjectValue = serde_json::Map<String, serde_json::Value>;

/// Why a particular value was returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Reason {
    /// Value is independent of the evaluation context. The only reason that allows caching.
    Static,
    /// The flag's default variant was served.
    Default,
    /// A targeting rule matched.
    TargetingMatch,
    /// A pseudorandom split assigned the value.
    Split,
    /// Value was served from the local cache.
    Cached,
    /// The flag is disabled.
    Disabled,
    /// The backend returned a reason this client does not know.
    Unknown,
    /// Resolution failed; the caller's default was returned.
    Error,
}

impl Reason {
    /// Parse a backend reason string. Unrecognized reasons map to [`Reason::Unknown`].
    pub fn from_wire(s: &str) -> Reason {
        match s {
            "STATIC" => Reason::Static,
            "DEFAULT" => Reason::Default,
            "TARGETING_MATCH" => Reason::TargetingMatch,
            "SPLIT" => Reason::Split,
            "CACHED" => Reason::Cached,
            "DISABLED" => Reason::Disabled,
            "ERROR" => Reason::Error,
            _ => Reason::Unknown,
        }
    }
}

/// Classification of a failed resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// No connection has been established yet, or the backend is unavailable.
    ProviderNotReady,
    /// The backend does not know the flag.
    FlagNotFound,
    /// The flag's value is not of the requested type.
    TypeMismatch,
    /// The context or the response could not be parsed.
    ParseError,
    /// Any other failure.
    General,
}

/// The result of a single resolution.
///
/// Resolution never fails from the caller's perspective: on error, `value` holds the default
/// passed by the caller and `error_kind` describes what went wrong.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolutionDetail<T> {
    /// Resolved value, or the caller's default on error.
    pub value: T,
    /// Name of the variant the backend selected, if it reported one.
    pub variant: Option<String>,
    /// Why this value was returned.
    pub reason: Reason,
    /// Set when `reason` is [`Reason::Error`].
    pub error_kind: Option<ErrorKind>,
    /// Human-readable description of the failure.
    pub error_message: Option<String>,
    /// Metadata the backend attached to the flag.
    pub metadata: FlagMetadata,
}

impl<T> ResolutionDetail<T> {
    /// Build an error detail that carries the caller's default value.
    pub fn error(default: T, kind: ErrorKind, message: impl Into<String>) -> Self {
        ResolutionDetail {
            value: default,
            variant: None,
            reason: Reason::Error,
            error_kind: Some(kind),
            error_message: Some(message.into()),
            metadata: FlagMetadata::new(),
        }
    }

    /// Returns `true` if this detail reports a failed resolution.
    pub fn is_error(&self) -> bool {
        self.error_kind.is_some()
    }

    /// Map `ResolutionDetail.value` using the `f` function.
    pub fn map<T2, F: FnOnce(T) -> T2>(self, f: F) -> ResolutionDetail<T2> {
        ResolutionDetail {
            value: f(self.value),
            variant: self.variant,
            reason: self.reason,
            error_kind: self.error_kind,
            error_message: self.error_message,
            metadata: self.metadata,
        }
    }
}

/// The type of flag a resolve call asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlagKind {
    /// `bool` flags.
    Boolean,
    /// `String` flags.
    String,
    /// `i64` flags.
    Int,
    /// `f64` flags.
    Float,
    /// JSON object flags.
    Object,
}

impl FlagKind {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            FlagKind::Boolean => "boolean",
            FlagKind::String => "string",
            FlagKind::Int => "int",
            FlagKind::Float => "float",
            FlagKind::Object => "object",
        }
    }
}

/// Any flag value. Used by the cache and the transport so that one code path serves all flag
/// types.
#[derive(Debug, Clone, PartialEq, From, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FlagValue {
    /// Value of a [`FlagKind::Boolean`] flag.
    Boolean(bool),
    /// Value of a [`FlagKind::Int`] flag.
    Int(i64),
    /// Value of a [`FlagKind::Float`] flag.
    Float(f64),
    /// Value of a [`FlagKind::String`] flag.
    String(String),
    /// Value of a [`FlagKind::Object`] flag.
    Object(ObjectValue),
}

impl FlagValue {
    /// Interpret a raw JSON value as a flag value of the given kind.
    ///
    /// Integers are accepted for float flags. Connect/JSON encodes 64-bit integers as strings,
    /// so those are accepted for int flags.
    pub fn from_json(kind: FlagKind, value: serde_json::Value) -> Option<FlagValue> {
        use serde_json::Value;

        match (kind, value) {
            (FlagKind::Boolean, Value::Bool(b)) => Some(FlagValue::Boolean(b)),
            (FlagKind::String, Value::String(s)) => Some(FlagValue::String(s)),
            (FlagKind::Int, Value::Number(n)) => n.as_i64().map(FlagValue::Int),
            (FlagKind::Int, Value::String(s)) => s.parse().ok().map(FlagValue::Int),
            (FlagKind::Float, Value::Number(n)) => n.as_f64().map(FlagValue::Float),
            (FlagKind::Object, Value::Object(o)) => Some(FlagValue::Object(o)),
            _ => None,
        }
    }

    /// The flag kind this value belongs to.
    pub fn kind(&self) -> FlagKind {
        match self {
            FlagValue::Boolean(_) => FlagKind::Boolean,
            FlagValue::Int(_) => FlagKind::Int,
            FlagValue::Float(_) => FlagKind::Float,
            FlagValue::String(_) => FlagKind::String,
            FlagValue::Object(_) => FlagKind::Object,
        }
    }
}

mod sealed {
    pub trait Sealed {}
    impl Sealed for bool {}
    impl Sealed for String {}
    impl Sealed for i64 {}
    impl Sealed for f64 {}
    impl Sealed for super::ObjectValue {}
}

/// Rust types that flags can resolve to.
///
/// This trait is sealed: the set of flag types is fixed by the backend protocol.
pub trait FlagType: sealed::Sealed + Sized + Clone {
    /// Kind requested from the backend for this type.
    const KIND: FlagKind;

    /// Extract `Self` from a value, or `None` if it holds another type.
    fn from_flag_value(value: FlagValue) -> Option<Self>;

    /// Wrap `self` for storage in the cache.
    fn into_flag_value(self) -> FlagValue;
}

impl FlagType for bool {
    const KIND: FlagKind = FlagKind::Boolean;

    fn from_flag_value(value: FlagValue) -> Option<Self> {
        match value {
            FlagValue::Boolean(b) => Some(b),
            _ => None,
        }
    }

    fn into_flag_value(self) -> FlagValue {
        FlagValue::Boolean(self)
    }
}

impl FlagType for String {
    const KIND: FlagKind = FlagKind::String;

    fn from_flag_value(value: FlagValue) -> Option<Self> {
        match value {
            FlagValue::String(s) => Some(s),
            _ => None,
        }
    }

    fn into_flag_value(self) -> FlagValue {
        FlagValue::String(self)
    }
}

impl FlagType for i64 {
    const KIND: FlagKind = FlagKind::Int;

    fn from_flag_value(value: FlagValue) -> Option<Self> {
        match value {
            FlagValue::Int(i) => Some(i),
            _ => None,
        }
    }

    fn into_flag_value(self) -> FlagValue {
        FlagValue::Int(self)
    }
}

impl FlagType for f64 {
    const KIND: FlagKind = FlagKind::Float;

    fn from_flag_value(value: FlagValue) -> Option<Self> {
        match value {
            FlagValue::Float(f) => Some(f),
            _ => None,
        }
    }

    fn into_flag_value(self) -> FlagValue {
        FlagValue::Float(self)
    }
}

impl FlagType for ObjectValue {
    const KIND: FlagKind = FlagKind::Object;

    fn from_flag_value(value: FlagValue) -> Option<Self> {
        match value {
            FlagValue::Object(o) => Some(o),
            _ => None,
        }
    }

    fn into_flag_value(self) -> FlagValue {
        FlagValue::Object(self)
    }
}
