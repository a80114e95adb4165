//! The thread-pool backend: a fixed set of OS threads pulling from one
//! shared feed, so a free thread always takes the next task.

use crossbeam_channel::Sender;
use oq_messages::Envelope;
use tracing::debug;

use crate::errors::DispatchError;
use crate::runner::run_task;
use crate::runner::ReplySender;
use crate::runner::WorkerContext;

struct Job {
    ctx: WorkerContext,
    envelope: Envelope,
    sender: ReplySender,
}

pub struct ThreadPool {
    pub size: usize,
    feed: Sender<Job>,
    handles: Vec<std::thread::JoinHandle<()>>,
}

impl ThreadPool {
    pub fn start(size: usize) -> Self {
        let (feed, jobs) = crossbeam_channel::unbounded::<Job>();
        let handles = (0..size)
            .map(|index| {
                let jobs = jobs.clone();
                std::thread::Builder::new()
                    .name(format!("oq-worker-{index}"))
                    .spawn(move || {
                        while let Ok(job) = jobs.recv() {
                            run_task(&job.ctx, job.envelope, &job.sender);
                        }
                    })
                    .expect("spawning a pool thread")
            })
            .collect();
        debug!("Thread pool started. size: {}", size);
        Self {
            size,
            feed,
            handles,
        }
    }

    pub fn submit(
        &self,
        ctx: WorkerContext,
        envelope: Envelope,
        sender: ReplySender,
    ) -> Result<(), DispatchError> {
        self.feed
            .send(Job {
                ctx,
                envelope,
                sender,
            })
            .map_err(|_| {
                DispatchError::BackendUnavailable {
                    backend: "threadpool",
                    reason: "the pool threads are gone".to_owned(),
                }
            })
    }

    /// Drops the feed and joins every thread; in-flight tasks finish first.
    pub fn shutdown(self) {
        drop(self.feed);
        for handle in self.handles {
            let _ = handle.join();
        }
    }
}
