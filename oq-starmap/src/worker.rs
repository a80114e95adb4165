//! Worker-side entry points for the process-pool and remote backends.
//!
//! A pool child connects to the parent's feed, runs one task at a time
//! and announces `Ready` between tasks. A serving worker listens for feed
//! connections from remote dispatchers and runs up to `num_cores` tasks
//! concurrently. Both push their replies to the ingress address carried
//! in each envelope.

use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use anyhow::Context;
use oq_messages::reply::worker_id;
use oq_messages::wire::read_frame_async;
use oq_messages::wire::write_frame_async;
use oq_messages::wire::Downstream;
use oq_messages::wire::Upstream;
use oq_messages::Envelope;
use tokio::net::TcpListener;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::sync::Semaphore;
use tracing::debug;
use tracing::error;
use tracing::info;

use crate::backend::pool::POOL_FEED_ENV;
use crate::backend::visible_cores;
use crate::config::Config;
use crate::registry::Registry;
use crate::runner::run_task;
use crate::runner::WorkerContext;

/// The process title operators see for every worker.
pub const WORKER_TITLE: &str = "oq-worker";

fn worker_context(
    registry: Arc<Registry>,
    config: &Config,
) -> WorkerContext {
    WorkerContext {
        registry,
        config_digest: config.digest(),
        memory: config.memory.clone(),
        compress: config.distribution.compress,
    }
}

fn set_title(title: &str) {
    #[cfg(target_os = "linux")]
    {
        if let Ok(name) = std::ffi::CString::new(title) {
            let _ = nix::sys::prctl::set_name(&name);
        }
    }
    #[cfg(not(target_os = "linux"))]
    let _ = title;
}

/// The feed address of the pool this process is a child of, when it is
/// one.
pub fn pool_feed_addr() -> Option<String> {
    std::env::var(POOL_FEED_ENV).ok().filter(|addr| !addr.is_empty())
}

/// Runs as a process-pool child: pull one task, run it, report ready,
/// until the feed says stop or goes away.
pub async fn pool_child(
    registry: Arc<Registry>,
    config: &Config,
) -> anyhow::Result<()> {
    let feed_addr = pool_feed_addr().context("no pool feed address in the environment")?;
    set_title(WORKER_TITLE);
    let ctx = worker_context(registry, config);

    let stream = TcpStream::connect(&feed_addr)
        .await
        .with_context(|| format!("connecting the pool feed at {feed_addr}"))?;
    let (mut reader, mut writer) = stream.into_split();
    write_frame_async(&mut writer, &Upstream::Ready { worker_id: worker_id() }).await?;
    debug!("Pool child ready. feed: {}", feed_addr);

    // one ingress connection per backurl, kept for the life of the child
    let mut conns: HashMap<String, TcpStream> = HashMap::new();
    loop {
        match read_frame_async::<Downstream>(&mut reader).await? {
            None | Some(Downstream::Stop) => break,
            Some(Downstream::Todo { envelope }) => {
                run_streaming(&ctx, envelope, &mut conns).await?;
                write_frame_async(&mut writer, &Upstream::Ready { worker_id: worker_id() })
                    .await?;
            },
        }
    }
    Ok(())
}

/// Runs one envelope on a blocking thread while streaming its replies to
/// the ingress connection, so values reach the dispatcher as they are
/// produced.
async fn run_streaming(
    ctx: &WorkerContext,
    envelope: Envelope,
    conns: &mut HashMap<String, TcpStream>,
) -> anyhow::Result<()> {
    let backurl = envelope
        .monitor
        .backurl
        .clone()
        .context("envelope without a backurl")?;
    if !conns.contains_key(&backurl) {
        let conn = TcpStream::connect(&backurl)
            .await
            .with_context(|| format!("connecting the ingress at {backurl}"))?;
        conns.insert(backurl.clone(), conn);
    }
    let conn = conns.get_mut(&backurl).expect("inserted above");

    let (tx, mut rx) = mpsc::unbounded_channel();
    let ctx = ctx.clone();
    let runner = tokio::task::spawn_blocking(move || run_task(&ctx, envelope, &tx));
    while let Some(reply) = rx.recv().await {
        write_frame_async(conn, &reply).await?;
    }
    runner.await.context("task runner aborted")?;
    Ok(())
}

/// Serves feed connections from remote dispatchers, running up to
/// `num_cores` tasks concurrently. `last_task` is stamped after every
/// task for liveness probes.
pub async fn serve(
    registry: Arc<Registry>,
    listen: &str,
    config: &Config,
    last_task: Option<Arc<AtomicU64>>,
) -> anyhow::Result<()> {
    set_title(WORKER_TITLE);
    let num_cores = if config.distribution.num_cores > 0 {
        config.distribution.num_cores
    } else {
        visible_cores()
    };
    let ctx = worker_context(registry, config);
    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("binding the worker feed at {listen}"))?;
    info!("Worker serving. listen: {} num_cores: {}", listen, num_cores);

    let semaphore = Arc::new(Semaphore::new(num_cores));
    loop {
        let (conn, peer) = listener.accept().await?;
        debug!("Feed connection accepted. peer: {}", peer);
        let ctx = ctx.clone();
        let semaphore = Arc::clone(&semaphore);
        let last_task = last_task.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_feed(ctx, conn, semaphore, last_task).await {
                error!("Feed connection failed. err: {:?}", err);
            }
        });
    }
}

async fn handle_feed(
    ctx: WorkerContext,
    conn: TcpStream,
    semaphore: Arc<Semaphore>,
    last_task: Option<Arc<AtomicU64>>,
) -> anyhow::Result<()> {
    let (mut reader, _writer) = conn.into_split();
    loop {
        match read_frame_async::<Downstream>(&mut reader).await? {
            None | Some(Downstream::Stop) => return Ok(()),
            Some(Downstream::Todo { envelope }) => {
                let permit = Arc::clone(&semaphore)
                    .acquire_owned()
                    .await
                    .context("worker semaphore closed")?;
                let ctx = ctx.clone();
                let last_task = last_task.clone();
                tokio::spawn(async move {
                    let _permit = permit;
                    if let Err(err) = run_isolated(&ctx, envelope).await {
                        error!("Task connection failed. err: {:?}", err);
                    }
                    if let Some(stamp) = last_task {
                        stamp.store(now_secs(), Ordering::Relaxed);
                    }
                });
            },
        }
    }
}

/// Like [`run_streaming`] but over a connection of its own, so replies of
/// concurrent tasks never interleave on the wire.
async fn run_isolated(
    ctx: &WorkerContext,
    envelope: Envelope,
) -> anyhow::Result<()> {
    let backurl = envelope
        .monitor
        .backurl
        .clone()
        .context("envelope without a backurl")?;
    let mut conn = TcpStream::connect(&backurl)
        .await
        .with_context(|| format!("connecting the ingress at {backurl}"))?;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let ctx = ctx.clone();
    let runner = tokio::task::spawn_blocking(move || run_task(&ctx, envelope, &tx));
    while let Some(reply) = rx.recv().await {
        write_frame_async(&mut conn, &reply).await?;
    }
    runner.await.context("task runner aborted")?;
    Ok(())
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("Epoch can not be in the future")
        .as_secs()
}
