//! Error types for cleave.
//!
//! All fallible operations in the crate return [`CleaveError`]. Variants are
//! grouped by the stage that raises them: configuration and lifecycle,
//! frame protocol, transport, the remote side of a bridge, and service
//! dispatch itself.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, CleaveError>;

/// The unified error type for all cleave operations.
#[derive(Debug, Error)]
pub enum CleaveError {
    // Configuration and lifecycle errors
    /// Invalid or unusable configuration.
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// An activation selector does not name any configured service.
    #[error("Unknown service: {name} (configured services: {known})")]
    UnknownActiveService { name: String, known: String },

    /// Two descriptors claim the same name or service locator.
    #[error("Duplicate service declaration: {name}")]
    DuplicateService { name: String },

    /// A descriptor references a bridge locator with no registered factory.
    #[error("Unknown bridge: {locator}")]
    UnknownBridge { locator: String },

    /// A descriptor references a middleware locator with no registered factory.
    #[error("Unknown middleware: {locator}")]
    UnknownMiddleware { locator: String },

    /// An operation was attempted in the wrong lifecycle stage.
    #[error("Controller cannot {operation} while {state}")]
    Lifecycle {
        operation: &'static str,
        state: &'static str,
    },

    // Protocol errors
    /// A frame arrived with a protocol version this build does not speak.
    #[error("Unsupported protocol version {version} (supported: {supported})")]
    UnsupportedVersion { version: u16, supported: u16 },

    /// The frame signature did not match the payload under the shared secret.
    #[error("Frame signature mismatch")]
    InvalidSignature,

    /// A frame was truncated, oversized, or otherwise undecodable.
    #[error("Malformed frame: {message}")]
    Frame { message: String },

    // Transport errors
    /// A connection to a bridge server could not be established.
    #[error("Unable to connect to {addr}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// I/O failure on an established connection.
    #[error("I/O error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    /// A bridge operation exceeded its deadline.
    #[error("Timed out after {after:?} while {what}")]
    Timeout { what: &'static str, after: Duration },

    /// A bridge server did not start accepting connections in time.
    #[error("Service on {addr} not ready after {after:?}")]
    ReadyTimeout { addr: String, after: Duration },

    // Remote errors
    /// A failure that occurred in the remote process serving the call.
    ///
    /// `kind` and `message` mirror the error the service raised; the full
    /// remote diagnostic is attached as the error source and shows up when
    /// the chain is walked or rendered.
    #[error("{kind}: {message}")]
    Remote {
        kind: String,
        message: String,
        #[source]
        trace: RemoteTrace,
    },

    // Service dispatch errors
    /// A domain failure raised by a service method.
    #[error("{kind}: {message}")]
    Service { kind: String, message: String },

    /// A dispatch named a method the service does not implement.
    #[error("Unknown method {method} on service {service}")]
    UnknownMethod { service: String, method: String },

    /// A call payload addressed a different service than the host serves.
    #[error("Service identity mismatch: host serves {expected}, payload addressed {received}")]
    ServiceMismatch { expected: String, received: String },

    /// A launch task was torn down abnormally.
    #[error("Launch task {task} failed: {message}")]
    Launch { task: String, message: String },

    /// A broken invariant inside the crate itself.
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl CleaveError {
    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        CleaveError::Config {
            message: message.into(),
        }
    }

    /// Create a malformed-frame error.
    pub fn frame(message: impl Into<String>) -> Self {
        CleaveError::Frame {
            message: message.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        CleaveError::Internal {
            message: message.into(),
        }
    }

    /// Create a domain error for a service method to raise.
    ///
    /// `kind` is the stable tag callers match on; it survives the trip
    /// across a bridge unchanged.
    pub fn service(kind: impl Into<String>, message: impl Into<String>) -> Self {
        CleaveError::Service {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// Stable tag identifying the failure class.
    ///
    /// For `Service` and `Remote` this is the domain tag the service chose;
    /// every other variant maps to a fixed name.
    pub fn kind(&self) -> &str {
        match self {
            CleaveError::Config { .. } => "Config",
            CleaveError::UnknownActiveService { .. } => "UnknownActiveService",
            CleaveError::DuplicateService { .. } => "DuplicateService",
            CleaveError::UnknownBridge { .. } => "UnknownBridge",
            CleaveError::UnknownMiddleware { .. } => "UnknownMiddleware",
            CleaveError::Lifecycle { .. } => "Lifecycle",
            CleaveError::UnsupportedVersion { .. } => "UnsupportedVersion",
            CleaveError::InvalidSignature => "InvalidSignature",
            CleaveError::Frame { .. } => "Frame",
            CleaveError::Connect { .. } => "Connect",
            CleaveError::Io { .. } => "Io",
            CleaveError::Timeout { .. } => "Timeout",
            CleaveError::ReadyTimeout { .. } => "ReadyTimeout",
            CleaveError::Remote { kind, .. } => kind,
            CleaveError::Service { kind, .. } => kind,
            CleaveError::UnknownMethod { .. } => "UnknownMethod",
            CleaveError::ServiceMismatch { .. } => "ServiceMismatch",
            CleaveError::Launch { .. } => "Launch",
            CleaveError::Internal { .. } => "Internal",
        }
    }

    /// Bare message without the kind prefix, for capture into descriptors.
    pub fn message(&self) -> String {
        match self {
            CleaveError::Service { message, .. } | CleaveError::Remote { message, .. } => {
                message.clone()
            }
            other => other.to_string(),
        }
    }

    /// True for failures of the connection itself rather than the call.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            CleaveError::Connect { .. }
                | CleaveError::Io { .. }
                | CleaveError::Timeout { .. }
                | CleaveError::ReadyTimeout { .. }
        )
    }

    /// True for frames that could not be accepted as written.
    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            CleaveError::UnsupportedVersion { .. }
                | CleaveError::InvalidSignature
                | CleaveError::Frame { .. }
        )
    }

    /// True for errors a process cannot recover from without new configuration.
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            CleaveError::Config { .. }
                | CleaveError::UnknownActiveService { .. }
                | CleaveError::DuplicateService { .. }
                | CleaveError::UnknownBridge { .. }
                | CleaveError::UnknownMiddleware { .. }
        )
    }
}

impl From<std::io::Error> for CleaveError {
    fn from(err: std::io::Error) -> Self {
        CleaveError::Io {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for CleaveError {
    fn from(err: serde_json::Error) -> Self {
        CleaveError::Frame {
            message: format!("payload codec error: {err}"),
        }
    }
}

/// Diagnostic text captured in the process that served a failed call.
///
/// Attached as the source of [`CleaveError::Remote`], so walking the error
/// chain of a bridged failure ends at the serving side's rendered trace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrace {
    text: String,
}

impl RemoteTrace {
    const SEPARATOR: &'static str =
        "---------------------------------------------";

    pub fn new(text: impl Into<String>) -> Self {
        RemoteTrace { text: text.into() }
    }

    /// The trace text as rendered by the serving process.
    pub fn text(&self) -> &str {
        &self.text
    }
}

impl fmt::Display for RemoteTrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}\n{}\nThe above trace came from a remote service\n{}",
            self.text,
            Self::SEPARATOR,
            Self::SEPARATOR
        )
    }
}

impl std::error::Error for RemoteTrace {}
