//! Framing and payload schema for the parent/worker wire protocol.
//!
//! Messages travel over the child's stdin/stdout as compact JSON frames,
//! one per line, each terminated by [`SENTINEL`]. Compact JSON escapes
//! control characters inside strings and contains no literal newline
//! anywhere else, so an encoded frame can never collide with the
//! sentinel.

use crate::errors::PoolError;
use serde_json::Value;

/// End-of-frame marker on the wire.
pub const SENTINEL: u8 = b'\n';

/// Response status for a successful task.
pub const STATUS_OK: u8 = 0;
/// Response status for a failed task.
pub const STATUS_ERR: u8 = 1;

/// One framed message: request identifier plus opaque payload.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Frame {
    /// Identifier multiplexing this message within one mailbox.
    pub id: u64,
    /// Message body; the framing layer does not interpret it.
    pub payload: Value,
}

/// Serialize a frame and terminate it with the sentinel.
pub fn encode(frame: &Frame) -> Result<Vec<u8>, PoolError> {
    let mut buf = serde_json::to_vec(frame).map_err(|e| PoolError::Codec(e.to_string()))?;
    buf.push(SENTINEL);
    Ok(buf)
}

/// Deserialize a frame, tolerating a trailing sentinel.
pub fn decode(bytes: &[u8]) -> Result<Frame, PoolError> {
    let body = match bytes.split_last() {
        Some((&SENTINEL, head)) => head,
        _ => bytes,
    };
    serde_json::from_slice(body).map_err(|e| PoolError::Codec(e.to_string()))
}

/// Worker-side calling convention selector.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    /// A registered function, invoked with the request arguments.
    Func,
    /// A registered constructor: built with the request arguments, then
    /// run once.
    Class,
}

/// Descriptor of a worker-side task: calling convention plus registered
/// name. Arguments are supplied per dispatch.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Task {
    pub(crate) kind: TaskKind,
    pub(crate) name: String,
}

impl Task {
    /// Descriptor for a registered function task.
    pub fn func<S: Into<String>>(name: S) -> Self {
        Task {
            kind: TaskKind::Func,
            name: name.into(),
        }
    }

    /// Descriptor for a registered class task.
    pub fn class<S: Into<String>>(name: S) -> Self {
        Task {
            kind: TaskKind::Class,
            name: name.into(),
        }
    }

    pub(crate) fn request(&self, args: Vec<Value>) -> TaskRequest {
        TaskRequest {
            kind: self.kind,
            name: self.name.clone(),
            args,
        }
    }
}

/// Request payload: what the parent asks a worker to run.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct TaskRequest {
    /// Calling convention on the worker side.
    pub kind: TaskKind,
    /// Registered task name.
    pub name: String,
    /// Positional arguments.
    #[serde(default)]
    pub args: Vec<Value>,
}

/// Response payload: status code plus result or diagnostic.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct TaskResponse {
    /// [`STATUS_OK`] or [`STATUS_ERR`].
    pub status: u8,
    /// Result value on success, diagnostic text on failure.
    pub body: Value,
}

impl TaskResponse {
    /// Successful response carrying `value`.
    pub fn ok(value: Value) -> Self {
        TaskResponse {
            status: STATUS_OK,
            body: value,
        }
    }

    /// Failed response carrying a diagnostic.
    pub fn fail<S: std::fmt::Display>(diagnostic: S) -> Self {
        TaskResponse {
            status: STATUS_ERR,
            body: Value::String(diagnostic.to_string()),
        }
    }

    /// Fold the status into a `Result`, surfacing failures as
    /// [`PoolError::TaskFailure`].
    pub fn into_result(self) -> Result<Value, PoolError> {
        if self.status == STATUS_OK {
            Ok(self.body)
        } else {
            let diagnostic = match self.body {
                Value::String(text) => text,
                other => other.to_string(),
            };
            Err(PoolError::TaskFailure(diagnostic))
        }
    }
}
