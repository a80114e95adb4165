//! The task envelope sent from the dispatcher to a worker.

use serde_derive::Deserialize;
use serde_derive::Serialize;

use crate::monitor::Monitor;
use crate::pack::PackedSeq;

/// One unit of work: a registered function name, its packed positional
/// arguments and the monitor the worker must run under. Immutable once
/// submitted.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Envelope {
    /// Registry name of the task function.
    pub func: String,

    /// Positional arguments, identity-deduplicated.
    pub args: PackedSeq,

    /// Ordinal assigned by the dispatcher at submit time.
    pub task_no: u32,

    pub monitor: Monitor,
}

impl Envelope {
    pub fn new(
        func: impl Into<String>,
        args: PackedSeq,
        task_no: u32,
        monitor: Monitor,
    ) -> Self {
        Self {
            func: func.into(),
            args,
            task_no,
            monitor,
        }
    }

    /// Total argument bytes, unique blobs counted once.
    pub fn sent_bytes(&self) -> u64 {
        self.args.nbytes()
    }
}
