//! Request lifecycle events delivered to a user-supplied logger.

use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;

/// Identifies one request across all of its attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(u64);

impl RequestId {
    pub(crate) fn new(id: u64) -> Self {
        Self(id)
    }

    /// The raw numeric id.
    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

/// The lifecycle point a [`Log`] record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum LogKind {
    /// Response headers were received.
    ResponseHeader,

    /// The response body finished.
    ResponseBody,

    /// An attempt failed and another one will be made.
    Retry,

    /// A transient failure the caller asked to be told about.
    Failure,
}

impl fmt::Display for LogKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LogKind::ResponseHeader => "response-header",
            LogKind::ResponseBody => "response-body",
            LogKind::Retry => "retry",
            LogKind::Failure => "failure",
        };
        f.write_str(name)
    }
}

/// A single lifecycle event.
#[derive(Debug, Clone)]
pub struct Log {
    /// The request this event belongs to.
    pub id: RequestId,

    /// When the event happened.
    pub time: SystemTime,

    /// What happened.
    pub kind: LogKind,

    /// Human readable detail.
    pub message: String,
}

impl Log {
    pub(crate) fn new(id: RequestId, kind: LogKind, message: impl Into<String>) -> Self {
        Self {
            id,
            time: SystemTime::now(),
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for Log {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.id, self.kind, self.message)
    }
}

/// Receives [`Log`] records.
pub type Logger = Arc<dyn Fn(Log) + Send + Sync>;
