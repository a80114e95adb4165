//! The process-pool backend.
//!
//! A fixed number of worker processes is spawned once and kept for the
//! life of the pool. Children pull jobs over a feed socket: each one
//! announces `Ready`, receives a `Todo`, pushes its replies straight to
//! the ingress address carried in the envelope, then announces `Ready`
//! again. A child dying mid-task is reported as a lost worker.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::path::PathBuf;

use anyhow::Context;
use nix::sys::signal::signal;
use nix::sys::signal::SigHandler;
use nix::sys::signal::Signal;
use oq_messages::reply::RemoteFailure;
use oq_messages::reply::WORKER_LOST;
use oq_messages::wire::read_frame_async;
use oq_messages::wire::write_frame_async;
use oq_messages::wire::Downstream;
use oq_messages::wire::Upstream;
use oq_messages::Envelope;
use oq_messages::Reply;
use oq_messages::ReplyEnvelope;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::errors::DispatchError;
use crate::runner::ReplySender;

/// Environment variable pointing a pool child at its feed address.
pub const POOL_FEED_ENV: &str = "OQ_POOL_FEED";

pub struct ProcessPool {
    pub size: usize,
    pub pids: Vec<u32>,
    job_tx: mpsc::UnboundedSender<Envelope>,
    children: Vec<std::process::Child>,
    matchmaker: JoinHandle<()>,
}

enum Event {
    Ready(usize),
    Dead(usize),
}

impl ProcessPool {
    /// Spawns `size` children of `worker_exe` and starts the feed.
    ///
    /// The parent's TERM/INT handlers are reset to default/ignore across
    /// the spawn and restored afterwards, so the children do not inherit
    /// the supervisor's shutdown handlers and race during teardown.
    pub async fn start(
        size: usize,
        worker_exe: PathBuf,
        ingress_tx: ReplySender,
    ) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(("127.0.0.1", 0))
            .await
            .context("binding the pool feed")?;
        let feed_addr = listener.local_addr()?.to_string();

        let saved = disable_signals().context("resetting signal handlers")?;
        let mut children = Vec::with_capacity(size);
        let mut spawn_error = None;
        for _ in 0..size {
            match std::process::Command::new(&worker_exe)
                .env(POOL_FEED_ENV, &feed_addr)
                .spawn()
            {
                Ok(child) => children.push(child),
                Err(err) => {
                    spawn_error = Some(err);
                    break;
                },
            }
        }
        restore_signals(saved).context("restoring signal handlers")?;
        if let Some(err) = spawn_error {
            for mut child in children {
                let _ = child.kill();
                let _ = child.wait();
            }
            return Err(DispatchError::BackendUnavailable {
                backend: "processpool",
                reason: format!("cannot spawn {}: {err}", worker_exe.display()),
            }
            .into());
        }
        let pids = children.iter().map(|child| child.id()).collect();
        info!(
            "Process pool started. size: {} worker: {}",
            size,
            worker_exe.display()
        );

        let (job_tx, job_rx) = mpsc::unbounded_channel();
        let matchmaker = tokio::spawn(matchmake(listener, job_rx, ingress_tx));
        Ok(Self {
            size,
            pids,
            job_tx,
            children,
            matchmaker,
        })
    }

    pub fn submit(
        &self,
        envelope: Envelope,
    ) -> Result<(), DispatchError> {
        self.job_tx.send(envelope).map_err(|_| {
            DispatchError::BackendUnavailable {
                backend: "processpool",
                reason: "the pool feed is closed".to_owned(),
            }
        })
    }

    /// Kills and reaps every child; safe to call more than once.
    pub fn shutdown(&mut self) {
        self.matchmaker.abort();
        for child in &mut self.children {
            let _ = child.kill();
        }
        for child in &mut self.children {
            let _ = child.wait();
        }
        self.children.clear();
        self.pids.clear();
    }
}

impl Drop for ProcessPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Matches queued envelopes with idle children, one task per child at a
/// time, and synthesizes a lost-worker failure when a busy child dies.
async fn matchmake(
    listener: TcpListener,
    mut job_rx: mpsc::UnboundedReceiver<Envelope>,
    ingress_tx: ReplySender,
) {
    let mut writers: Vec<OwnedWriteHalf> = Vec::new();
    let mut busy: HashMap<usize, Envelope> = HashMap::new();
    let mut ready: VecDeque<usize> = VecDeque::new();
    let mut queue: VecDeque<Envelope> = VecDeque::new();
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<Event>();

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let Ok((conn, peer)) = accepted else { break };
                debug!("Pool child connected. peer: {}", peer);
                let (mut reader, writer) = conn.into_split();
                let index = writers.len();
                writers.push(writer);
                let event_tx = event_tx.clone();
                tokio::spawn(async move {
                    loop {
                        match read_frame_async::<Upstream>(&mut reader).await {
                            Ok(Some(Upstream::Ready { .. })) => {
                                if event_tx.send(Event::Ready(index)).is_err() {
                                    break;
                                }
                            },
                            _ => {
                                let _ = event_tx.send(Event::Dead(index));
                                break;
                            },
                        }
                    }
                });
            },
            Some(event) = event_rx.recv() => {
                match event {
                    Event::Ready(index) => {
                        busy.remove(&index);
                        ready.push_back(index);
                    },
                    Event::Dead(index) => {
                        ready.retain(|&idle| idle != index);
                        if let Some(envelope) = busy.remove(&index) {
                            warn!(
                                "Pool child died mid-task. task: {}#{}",
                                envelope.func, envelope.task_no
                            );
                            let failure = RemoteFailure::new(
                                WORKER_LOST,
                                format!(
                                    "pool worker died while running {}#{}",
                                    envelope.func, envelope.task_no
                                ),
                            );
                            let _ = ingress_tx.send(ReplyEnvelope::new(
                                Reply::Failure(failure),
                                envelope.monitor.clone(),
                            ));
                        }
                    },
                }
                dispatch(&mut queue, &mut ready, &mut busy, &mut writers).await;
            },
            job = job_rx.recv() => {
                match job {
                    Some(envelope) => {
                        queue.push_back(envelope);
                        dispatch(&mut queue, &mut ready, &mut busy, &mut writers).await;
                    },
                    None => break,
                }
            },
        }
    }
}

async fn dispatch(
    queue: &mut VecDeque<Envelope>,
    ready: &mut VecDeque<usize>,
    busy: &mut HashMap<usize, Envelope>,
    writers: &mut [OwnedWriteHalf],
) {
    while !queue.is_empty() && !ready.is_empty() {
        let Some(envelope) = queue.pop_front() else { break };
        let Some(index) = ready.pop_front() else {
            queue.push_front(envelope);
            break;
        };
        let frame = Downstream::Todo {
            envelope: envelope.clone(),
        };
        match write_frame_async(&mut writers[index], &frame).await {
            Ok(()) => {
                busy.insert(index, envelope);
            },
            Err(err) => {
                // the reader side will report this child as dead
                debug!("Pool feed write failed. child: {} err: {:?}", index, err);
                queue.push_front(envelope);
            },
        }
    }
}

fn disable_signals() -> nix::Result<(SigHandler, SigHandler)> {
    let term = unsafe { signal(Signal::SIGTERM, SigHandler::SigDfl) }?;
    let int = unsafe { signal(Signal::SIGINT, SigHandler::SigIgn) }?;
    Ok((term, int))
}

fn restore_signals(
    (term, int): (SigHandler, SigHandler),
) -> nix::Result<()> {
    unsafe {
        signal(Signal::SIGTERM, term)?;
        signal(Signal::SIGINT, int)?;
    }
    Ok(())
}
