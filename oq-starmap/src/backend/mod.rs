//! Pluggable submission strategies.
//!
//! Every backend satisfies the same contract: a submitted envelope
//! eventually produces at least one terminal reply (end-of-task or
//! failure) on the dispatcher's ingress.

use std::fmt::Display;
use std::fmt::Formatter;
use std::str::FromStr;

use async_trait::async_trait;
use oq_messages::Envelope;

use crate::config::Config;
use crate::errors::DispatchError;

pub mod pool;
pub mod remote;
pub mod threads;

/// The submission strategies the dispatcher knows about.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Backend {
    /// Execute in the caller's thread; parallelism 1, useful to debug.
    Inline,

    /// Fixed pool of spawned worker processes.
    ProcessPool,

    /// Fixed pool of OS threads, suited to I/O-bound tasks.
    ThreadPool,

    /// Round-robin over configured remote worker hosts.
    Remote,

    /// An external cluster client supplied by the embedder.
    Cluster,
}

impl FromStr for Backend {
    type Err = DispatchError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "no" => Ok(Backend::Inline),
            "processpool" => Ok(Backend::ProcessPool),
            "threadpool" => Ok(Backend::ThreadPool),
            "remote" => Ok(Backend::Remote),
            "cluster" => Ok(Backend::Cluster),
            other => Err(DispatchError::InvalidDistribution(other.to_owned())),
        }
    }
}

impl Display for Backend {
    fn fmt(
        &self,
        f: &mut Formatter<'_>,
    ) -> std::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Backend::Inline => "no",
                Backend::ProcessPool => "processpool",
                Backend::ThreadPool => "threadpool",
                Backend::Remote => "remote",
                Backend::Cluster => "cluster",
            }
        )
    }
}

/// The configured backend: the `DISTRIBUTE` variable wins over
/// `distribution.oq_distribute`. Unknown names fail fast.
pub fn oq_distribute(config: &Config) -> Result<Backend, DispatchError> {
    let name = match std::env::var("DISTRIBUTE") {
        Ok(name) if !name.is_empty() => name,
        _ => config.distribution.oq_distribute.clone(),
    };
    name.parse()
}

/// The cores this process may actually run on: the CPU affinity mask when
/// the OS exposes one, the total count otherwise.
pub fn visible_cores() -> usize {
    #[cfg(target_os = "linux")]
    {
        use nix::sched::CpuSet;

        if let Ok(set) = nix::sched::sched_getaffinity(nix::unistd::Pid::from_raw(0)) {
            let visible = (0..CpuSet::count())
                .filter(|&cpu| set.is_set(cpu).unwrap_or(false))
                .count();
            if visible > 0 {
                return visible;
            }
        }
    }
    num_cpus::get()
}

/// Seam for the optional `cluster` backend: the embedder brings its own
/// client, the dispatcher only hands envelopes over.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    async fn submit(
        &self,
        envelope: Envelope,
    ) -> anyhow::Result<()>;
}

#[cfg(test)]
mod tests {
    use super::visible_cores;
    use super::Backend;

    #[test]
    fn backend_names_roundtrip() {
        for name in ["no", "processpool", "threadpool", "remote", "cluster"] {
            let backend: Backend = name.parse().unwrap();
            assert_eq!(backend.to_string(), name);
        }
        assert!("celery".parse::<Backend>().is_err());
    }

    #[test]
    fn some_cores_are_visible() {
        assert!(visible_cores() >= 1);
    }
}
