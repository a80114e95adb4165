use oq_messages::pack::PackError;
use thiserror::Error;

/// Errors raised by the dispatcher itself. Failures that happen inside a
/// task travel as [`oq_messages::reply::RemoteFailure`] instead.
#[derive(Error, Debug)]
pub enum DispatchError {
    /// A task argument could not be encoded; the task is not sent.
    #[error("cannot encode task arguments. err: {0}")]
    Serialization(#[from] PackError),

    /// The selected backend cannot accept work.
    #[error("backend {backend} is not available. reason: {reason}")]
    BackendUnavailable { backend: &'static str, reason: String },

    /// `DISTRIBUTE` or `distribution.oq_distribute` holds an unknown name.
    #[error("invalid oq_distribute value: {0}")]
    InvalidDistribution(String),

    /// The machine crossed the hard memory limit.
    #[error(
        "using more memory than allowed by configuration \
         (used: {used_percent:.0}% / allowed: {hard_percent:.0}%), shutting down"
    )]
    HardMemoryLimit {
        used_percent: f64,
        hard_percent: f64,
    },

    /// A worker went away without reporting an end of task.
    #[error("worker lost: {worker} terminated without an end-of-task reply")]
    WorkerLost { worker: String },

    /// Tasks much slower than the mean, escalated under the strict flag.
    #[error("{count} task(s) took more than 3x the mean duration, worst: {worst:.0}s")]
    SlowTasks { count: usize, worst: f64 },
}
