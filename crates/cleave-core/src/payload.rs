//! Payloads exchanged across a bridge: one call in, one result out.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{CleaveError, RemoteTrace, Result};

/// Positional and keyword arguments for one method call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CallArgs {
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
}

impl CallArgs {
    pub fn new(args: Vec<Value>, kwargs: Map<String, Value>) -> Self {
        CallArgs { args, kwargs }
    }

    /// Positional arguments only.
    pub fn positional(args: Vec<Value>) -> Self {
        CallArgs {
            args,
            kwargs: Map::new(),
        }
    }

    /// No arguments at all.
    pub fn none() -> Self {
        CallArgs::default()
    }

    pub fn arg(&self, index: usize) -> Option<&Value> {
        self.args.get(index)
    }

    pub fn kwarg(&self, name: &str) -> Option<&Value> {
        self.kwargs.get(name)
    }
}

/// One method call addressed to a service.
///
/// The service identity travels with the call so the serving side can
/// reject payloads that were routed to the wrong host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodCallPayload {
    pub service: String,
    pub method: String,
    #[serde(flatten)]
    pub call: CallArgs,
}

impl MethodCallPayload {
    pub fn new(service: impl Into<String>, method: impl Into<String>, call: CallArgs) -> Self {
        MethodCallPayload {
            service: service.into(),
            method: method.into(),
            call,
        }
    }
}

/// Outcome of one bridged call: the value, or a captured failure.
///
/// Transport and protocol failures are not results and never take this
/// form; they surface as raised errors on whichever side hit them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultPayload {
    Ok(Value),
    Err(ErrorDescriptor),
}

impl ResultPayload {
    /// Unwrap into a plain result, rebuilding the remote error on `Err`.
    pub fn into_result(self) -> Result<Value> {
        match self {
            ResultPayload::Ok(value) => Ok(value),
            ResultPayload::Err(descriptor) => Err(descriptor.into_error()),
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, ResultPayload::Ok(_))
    }
}

/// A failure captured on the serving side of a bridge.
///
/// `kind` and `message` carry the identity of the original error; `trace`
/// is an opaque rendering of its full chain for diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorDescriptor {
    pub kind: String,
    pub message: String,
    pub trace: String,
}

impl ErrorDescriptor {
    /// Capture an error raised while serving `service.method`.
    pub fn capture(service: &str, method: &str, err: &CleaveError) -> Self {
        ErrorDescriptor {
            kind: err.kind().to_string(),
            message: err.message(),
            trace: render_trace(service, method, err),
        }
    }

    /// Rebuild the caller-side error, with the trace attached as its source.
    pub fn into_error(self) -> CleaveError {
        CleaveError::Remote {
            kind: self.kind,
            message: self.message,
            trace: RemoteTrace::new(self.trace),
        }
    }
}

fn render_trace(service: &str, method: &str, err: &CleaveError) -> String {
    let mut out = format!("error in {service}.{method}: {err}");
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        out.push_str("\n  caused by: ");
        out.push_str(&cause.to_string());
        source = cause.source();
    }
    out
}
