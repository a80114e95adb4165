//! The reply envelope: everything a worker ever pushes onto the ingress.

use std::collections::BTreeMap;
use std::fmt::Display;
use std::fmt::Formatter;

use serde_derive::Deserialize;
use serde_derive::Serialize;
use thiserror::Error;

use crate::monitor::Monitor;
use crate::pack::Packed;
use crate::pack::PackedSeq;
use crate::WorkerId;

/// Failure kind for a missing-key lookup; widened to a plain runtime error
/// at the consumer so the formatted multi-line message survives.
pub const KEY_NOT_FOUND: &str = "KeyNotFound";

/// Failure kind reported when user task code panics.
pub const TASK_PANIC: &str = "TaskPanic";

/// Failure kind for a worker running an incompatible engine or config.
pub const VERSION_MISMATCH: &str = "VersionMismatch";

/// Failure kind for a worker crossing the hard memory limit.
pub const HARD_MEMORY_LIMIT: &str = "HardMemoryLimit";

/// Failure kind synthesized when a worker dies without an end-of-task.
pub const WORKER_LOST: &str = "WorkerLost";

/// A task error re-raised on the dispatcher side, preserving the kind it
/// had on the worker and the formatted backtrace.
#[derive(Error, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[error("\n{backtrace}{kind}: {msg}")]
pub struct RemoteFailure {
    pub kind: String,
    pub msg: String,
    pub backtrace: String,
}

impl RemoteFailure {
    pub fn new(
        kind: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self {
            kind: kind.into(),
            msg: msg.into(),
            backtrace: String::new(),
        }
    }

    pub fn with_backtrace(
        mut self,
        backtrace: impl Into<String>,
    ) -> Self {
        self.backtrace = backtrace.into();
        self
    }

    /// Converts into the error raised at the consumer. The mapping is the
    /// identity except for [`KEY_NOT_FOUND`], which becomes an anonymous
    /// runtime error wrapping the already-formatted message.
    pub fn into_error(self) -> anyhow::Error {
        if self.kind == KEY_NOT_FOUND {
            anyhow::Error::msg(self.to_string())
        } else {
            anyhow::Error::new(self)
        }
    }
}

/// What a single reply message carries.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Reply {
    /// A normal partial output of the task.
    Value(Packed),

    /// The task's value stream finished naturally; `sent_bytes` is the
    /// cumulative payload this task pushed, credited to transfer telemetry.
    TaskEnded { sent_bytes: u64 },

    /// The task asks the dispatcher to enqueue `(func, args)` as new work.
    Subtask { func: String, args: PackedSeq },

    /// The worker crossed the soft memory limit; logged once, not fatal.
    Warning(String),

    /// The task failed; carries kind, message and formatted backtrace.
    Failure(RemoteFailure),
}

impl Display for Reply {
    fn fmt(
        &self,
        f: &mut Formatter<'_>,
    ) -> std::fmt::Result {
        match self {
            Reply::Value(packed) => write!(f, "value ({})", crate::humansize(packed.len() as u64)),
            Reply::TaskEnded { .. } => write!(f, "task ended"),
            Reply::Subtask { func, .. } => write!(f, "subtask {func}"),
            Reply::Warning(_) => write!(f, "warning"),
            Reply::Failure(failure) => write!(f, "failure {}", failure.kind),
        }
    }
}

/// One message on the ingress: a reply plus the monitor and the identity of
/// the worker that produced it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReplyEnvelope {
    pub body: Reply,

    pub monitor: Monitor,

    pub worker_id: WorkerId,

    /// Per-key payload sizes when the value is a mapping, `{"tot": n}`
    /// otherwise.
    pub nbytes: BTreeMap<String, u64>,
}

impl ReplyEnvelope {
    pub fn new(
        body: Reply,
        monitor: Monitor,
    ) -> Self {
        let nbytes = match &body {
            Reply::Value(packed) => {
                BTreeMap::from([("tot".to_string(), packed.len() as u64)])
            },
            Reply::Subtask { args, .. } => {
                BTreeMap::from([("args".to_string(), args.nbytes())])
            },
            _ => BTreeMap::new(),
        };
        Self {
            body,
            monitor,
            worker_id: worker_id(),
            nbytes,
        }
    }

    pub fn with_nbytes(
        mut self,
        nbytes: BTreeMap<String, u64>,
    ) -> Self {
        self.nbytes = nbytes;
        self
    }

    /// Bytes this reply accounts for on the transport.
    pub fn payload_len(&self) -> u64 {
        match &self.body {
            Reply::Value(packed) => packed.len() as u64,
            Reply::TaskEnded { sent_bytes } => *sent_bytes,
            Reply::Subtask { args, .. } => args.nbytes(),
            Reply::Warning(msg) => msg.len() as u64,
            Reply::Failure(failure) => (failure.msg.len() + failure.backtrace.len()) as u64,
        }
    }

    pub fn calc_id(&self) -> Option<u32> {
        self.monitor.calc_id
    }
}

/// `(hostname, pid)` of the current process.
pub fn worker_id() -> WorkerId {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
    (host, std::process::id())
}

#[cfg(test)]
mod tests {
    use super::RemoteFailure;
    use super::KEY_NOT_FOUND;

    #[test]
    fn failure_kind_is_preserved() {
        let failure = RemoteFailure::new("ValueError", "boom").with_backtrace("at foo\n");
        let err = failure.clone().into_error();
        let back = err.downcast_ref::<RemoteFailure>().expect("kind lost");
        assert_eq!(back.kind, "ValueError");
        assert!(err.to_string().contains("boom"));
        assert!(err.to_string().contains("at foo"));
    }

    #[test]
    fn key_not_found_is_widened() {
        let failure = RemoteFailure::new(KEY_NOT_FOUND, "no such site\nline two");
        let err = failure.into_error();
        assert!(err.downcast_ref::<RemoteFailure>().is_none());
        assert!(err.to_string().contains("line two"));
    }
}
