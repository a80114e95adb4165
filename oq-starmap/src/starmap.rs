//! The Starmap dispatcher: owns one MapReduce job end to end.
//!
//! A `Starmap` pickles task arguments, submits them through the selected
//! backend, multiplexes every worker reply over a single ingress, feeds
//! values to the consumer, injects dynamically spawned subtasks back into
//! its queue, reports progress and records per-task telemetry.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::marker::PhantomData;
use std::ops::AddAssign;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Instant;

use anyhow::Context;
use oq_messages::engine_version;
use oq_messages::humansize;
use oq_messages::pack::PackError;
use oq_messages::Envelope;
use oq_messages::Monitor;
use oq_messages::Packed;
use oq_messages::PackedSeq;
use oq_messages::Reply;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::accum::add_maps;
use crate::accum::AccumMap;
use crate::backend::oq_distribute;
use crate::backend::pool::ProcessPool;
use crate::backend::remote::RemoteConns;
use crate::backend::threads::ThreadPool;
use crate::backend::visible_cores;
use crate::backend::Backend;
use crate::backend::ClusterClient;
use crate::config::Config;
use crate::errors::DispatchError;
use crate::ingress::Ingress;
use crate::memory::check_mem_usage;
use crate::memory::memory_rss_sum;
use crate::registry::Registry;
use crate::registry::SPLIT_TASK;
use crate::runner::run_task;
use crate::runner::WorkerContext;
use crate::shared::SharedArray;
use crate::split::block_splitter;
use crate::split::split_in_blocks;
use crate::telemetry::JsonlSink;
use crate::telemetry::SentMap;
use crate::telemetry::SinkHandle;
use crate::telemetry::TaskInfo;
use crate::telemetry::TelemetrySink;

const GB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Tasks slower than 3x the mean and than this many seconds are reported.
const SLOW_TASK_SECONDS: f64 = 180.0;

// Pools persist across Starmaps; `shutdown` tears them down.
static THREAD_POOL: Mutex<Option<ThreadPool>> = Mutex::new(None);
static PROCESS_POOL: Mutex<Option<ProcessPool>> = Mutex::new(None);
static SHARED_ARRAYS: Mutex<Vec<SharedArray>> = Mutex::new(Vec::new());

type Progress = Arc<dyn Fn(String) + Send + Sync>;

/// Positional task arguments, packed at enqueue time.
pub trait IntoTaskArgs {
    fn into_packed(
        self,
        compress: bool,
    ) -> Result<Vec<Packed>, PackError>;
}

/// Already-packed arguments are passed through untouched.
impl IntoTaskArgs for Vec<Packed> {
    fn into_packed(
        self,
        _compress: bool,
    ) -> Result<Vec<Packed>, PackError> {
        Ok(self)
    }
}

fn pack_one<T: Serialize + ?Sized>(
    value: &T,
    compress: bool,
) -> Result<Packed, PackError> {
    if compress {
        Packed::compressed(value)
    } else {
        Packed::new(value)
    }
}

macro_rules! impl_into_task_args {
    ($($name:ident : $idx:tt),+) => {
        impl<$($name: Serialize),+> IntoTaskArgs for ($($name,)+) {
            fn into_packed(
                self,
                compress: bool,
            ) -> Result<Vec<Packed>, PackError> {
                Ok(vec![$(pack_one(&self.$idx, compress)?),+])
            }
        }
    };
}

impl_into_task_args!(A: 0);
impl_into_task_args!(A: 0, B: 1);
impl_into_task_args!(A: 0, B: 1, C: 2);
impl_into_task_args!(A: 0, B: 1, C: 2, D: 3);
impl_into_task_args!(A: 0, B: 1, C: 2, D: 3, E: 4);

enum Queued {
    Args {
        func: String,
        args: PackedSeq,
        weight: f64,
    },

    /// Filtered out by `TASK_NO` debug mode before packing; still consumes
    /// an ordinal.
    Skipped,
}

pub struct Starmap {
    registry: Arc<Registry>,
    config: Config,
    distribute: Backend,
    num_cores: usize,
    concurrent_tasks: usize,
    pub(crate) name: String,
    task_func: String,
    pub calc_id: u32,
    monitor: Monitor,
    store: SinkHandle,
    pub store_path: Option<PathBuf>,
    task_args: Vec<Queued>,
    progress: Progress,
    cluster: Option<Arc<dyn ClusterClient>>,
    compress: bool,
    worker_ctx: WorkerContext,

    // submission state
    ingress: Option<Ingress>,
    remote: Option<RemoteConns>,
    sent: SentMap,
    task_no: u32,
    submitted: u32,
    t0: Instant,
}

impl Starmap {
    /// A new job running `task` (a registered function name) under the
    /// given configuration. The telemetry store is autocreated in the data
    /// directory and assigns the calculation id.
    pub fn new(
        registry: &Arc<Registry>,
        task: &str,
        config: Config,
    ) -> anyhow::Result<Self> {
        let distribute = oq_distribute(&config)?;
        let num_cores = if config.distribution.num_cores > 0 {
            config.distribution.num_cores
        } else {
            visible_cores()
        };
        let entry = registry
            .get(task)
            .with_context(|| format!("task function {task} is not registered"))?;

        let (calc_id, sink) = JsonlSink::create(&config.data_dir())?;
        let store_path = Some(sink.path().to_owned());
        let sink: Box<dyn TelemetrySink> = Box::new(sink);
        let store: SinkHandle = Arc::new(Mutex::new(sink));

        let mut monitor = Monitor::new(task);
        monitor.calc_id = Some(calc_id);
        monitor.version = engine_version().to_owned();
        monitor.config_digest = config.digest();
        monitor.inject = entry.inject();

        let worker_ctx = WorkerContext {
            registry: Arc::clone(registry),
            config_digest: config.digest(),
            memory: config.memory.clone(),
            compress: config.distribution.compress,
        };

        Ok(Self {
            registry: Arc::clone(registry),
            compress: config.distribution.compress,
            distribute,
            num_cores,
            concurrent_tasks: num_cores * 2,
            name: task.to_owned(),
            task_func: task.to_owned(),
            calc_id,
            monitor,
            store,
            store_path,
            task_args: Vec::new(),
            progress: Arc::new(|line| info!("{line}")),
            cluster: None,
            worker_ctx,
            ingress: None,
            remote: None,
            sent: SentMap::new(),
            task_no: 0,
            submitted: 0,
            t0: Instant::now(),
            config,
        })
    }

    pub fn with_distribute(
        mut self,
        distribute: Backend,
    ) -> Self {
        self.distribute = distribute;
        self
    }

    pub fn with_num_cores(
        mut self,
        num_cores: usize,
    ) -> Self {
        self.num_cores = num_cores;
        self.concurrent_tasks = num_cores * 2;
        self
    }

    pub fn with_concurrent_tasks(
        mut self,
        concurrent_tasks: usize,
    ) -> Self {
        self.concurrent_tasks = concurrent_tasks;
        self
    }

    pub fn with_progress(
        mut self,
        progress: impl Fn(String) + Send + Sync + 'static,
    ) -> Self {
        self.progress = Arc::new(progress);
        self
    }

    pub fn with_cluster(
        mut self,
        cluster: Arc<dyn ClusterClient>,
    ) -> Self {
        self.cluster = Some(cluster);
        self
    }

    /// Replaces the autocreated telemetry store with the caller's.
    pub fn with_store(
        mut self,
        store: SinkHandle,
        calc_id: u32,
    ) -> Self {
        self.store = store;
        self.store_path = None;
        self.calc_id = calc_id;
        self.monitor.calc_id = Some(calc_id);
        self
    }

    /// Enqueues one task invocation. In `TASK_NO` debug mode every other
    /// ordinal is dropped before any encoding happens.
    pub fn add_args(
        &mut self,
        args: impl IntoTaskArgs,
    ) -> anyhow::Result<()> {
        let compress = self.compress;
        let func = self.task_func.clone();
        self.push_queued(func, 1.0, move || args.into_packed(compress))
    }

    fn push_queued(
        &mut self,
        func: String,
        weight: f64,
        pack: impl FnOnce() -> Result<Vec<Packed>, PackError>,
    ) -> anyhow::Result<()> {
        let ordinal = self.task_args.len() as u32;
        if let Some(only) = self.config.debug_task_no() {
            if ordinal != only {
                self.task_args.push(Queued::Skipped);
                return Ok(());
            }
        }
        let packed = pack().map_err(DispatchError::Serialization)?;
        self.task_args.push(Queued::Args {
            func,
            args: PackedSeq::new(packed),
            weight,
        });
        Ok(())
    }

    /// Splits `seq` with [`split_in_blocks`] (or, with `max_weight`, the
    /// lazy [`block_splitter`]) and enqueues one task per block; each task
    /// receives `(block, *rest)`. `B` is the collection type the task
    /// declares as its first argument.
    #[allow(clippy::too_many_arguments)]
    pub fn apply<T, B, K, WF, KF>(
        registry: &Arc<Registry>,
        task: &str,
        seq: Vec<T>,
        rest: Vec<Packed>,
        config: Config,
        concurrent_tasks: Option<usize>,
        max_weight: Option<f64>,
        weight: WF,
        key: KF,
    ) -> anyhow::Result<Starmap>
    where
        B: FromIterator<T> + Serialize,
        K: PartialEq,
        WF: Fn(&T) -> f64,
        KF: Fn(&T) -> K,
    {
        let mut smap = Starmap::new(registry, task, config)?;
        let blocks = match max_weight {
            Some(max_weight) => block_splitter(seq, max_weight, &weight, &key, false).collect(),
            None => {
                let hint = concurrent_tasks.unwrap_or(smap.concurrent_tasks).max(1);
                split_in_blocks(seq, hint, &weight, &key)
            },
        };
        let compress = smap.compress;
        for block in blocks {
            let block_weight = block.weight;
            let func = smap.task_func.clone();
            let rest = rest.clone();
            smap.push_queued(func, block_weight, move || {
                let first: B = block.items.into_iter().collect();
                let mut args = vec![pack_one(&first, compress)?];
                args.extend(rest);
                Ok(args)
            })?;
        }
        Ok(smap)
    }

    /// Like [`Starmap::apply`], but wraps every block in the splitting
    /// task, so long-running blocks spawn subtasks for their remaining
    /// shards. The wrapped task takes a `Vec<Packed>` shard as its first
    /// argument.
    #[allow(clippy::too_many_arguments)]
    pub fn apply_split<T, K, WF, KF>(
        registry: &Arc<Registry>,
        task: &str,
        seq: Vec<T>,
        rest: Vec<Packed>,
        config: Config,
        concurrent_tasks: Option<usize>,
        duration: Option<f64>,
        outs_per_task: Option<u32>,
        weight: WF,
        key: KF,
    ) -> anyhow::Result<Starmap>
    where
        T: Serialize,
        K: PartialEq,
        WF: Fn(&T) -> f64,
        KF: Fn(&T) -> K,
    {
        let mut smap = Starmap::new(registry, SPLIT_TASK, config)?;
        smap.name = task.to_owned();
        let duration = duration.unwrap_or(smap.config.task.duration);
        let outs_per_task = outs_per_task.unwrap_or(smap.config.task.outs_per_task);
        let hint = concurrent_tasks.unwrap_or(2 * smap.num_cores).max(1);
        let compress = smap.compress;
        let task = task.to_owned();
        for block in split_in_blocks(seq, hint, &weight, &key) {
            let block_weight = block.weight;
            let task = task.clone();
            let rest = rest.clone();
            smap.push_queued(SPLIT_TASK.to_owned(), block_weight, move || {
                // elements are packed one by one so the worker can
                // re-slice the shard without knowing the element type
                let elements: Vec<Packed> = block
                    .items
                    .iter()
                    .map(|element| pack_one(element, compress))
                    .collect::<Result<_, _>>()?;
                Ok(vec![
                    Packed::new(&elements)?,
                    Packed::new(&task)?,
                    Packed::new(&rest)?,
                    Packed::new(&duration)?,
                    Packed::new(&outs_per_task)?,
                ])
            })?;
        }
        Ok(smap)
    }

    /// Submits everything and returns the result iterator.
    pub fn submit_all<V: DeserializeOwned>(mut self) -> IterResult<V> {
        let real_tasks = self
            .task_args
            .iter()
            .filter(|queued| matches!(queued, Queued::Args { .. }))
            .count();
        if real_tasks == 1 || self.config.debug_task_no().is_some() {
            self.distribute = Backend::Inline;
        }
        let queue = std::mem::take(&mut self.task_args).into();
        IterResult::new(self, queue)
    }

    /// Submits everything and folds the values with `agg`.
    pub async fn reduce<V, A, F>(
        self,
        agg: F,
        acc: A,
    ) -> anyhow::Result<A>
    where
        V: DeserializeOwned,
        F: Fn(A, V) -> A,
    {
        self.submit_all().reduce(agg, acc).await
    }

    /// [`Starmap::reduce`] with the default accumulator: an additive map.
    pub async fn reduce_counts<K, N>(self) -> anyhow::Result<AccumMap<K, N>>
    where
        K: Ord + DeserializeOwned,
        N: AddAssign + Default + DeserializeOwned,
    {
        self.reduce(add_maps, AccumMap::new()).await
    }

    /// Allocates a named shared-memory buffer visible to pool workers.
    /// Returns the deterministic name; `shutdown` unlinks it.
    pub fn create_shared(
        &self,
        len: usize,
        value: f64,
    ) -> anyhow::Result<String> {
        let mut arrays = SHARED_ARRAYS.lock().expect("shared arrays lock");
        let name = format!("oq-shm-{}-{}", self.calc_id, arrays.len());
        let array = SharedArray::create(&name, len, value)?;
        arrays.push(array);
        Ok(name)
    }

    /// Closes the pools and unlinks every shared buffer; idempotent.
    pub fn shutdown() {
        if let Some(pool) = THREAD_POOL.lock().expect("thread pool lock").take() {
            pool.shutdown();
        }
        if let Some(mut pool) = PROCESS_POOL.lock().expect("process pool lock").take() {
            pool.shutdown();
        }
        for array in SHARED_ARRAYS.lock().expect("shared arrays lock").drain(..) {
            array.unlink();
        }
    }

    fn pool_pids() -> Vec<u32> {
        PROCESS_POOL
            .lock()
            .expect("process pool lock")
            .as_ref()
            .map(|pool| pool.pids.clone())
            .unwrap_or_default()
    }

    /// The submission pipeline: lazy ingress bind, per-argument byte
    /// accounting, then the backend dispatch.
    async fn submit(
        &mut self,
        func: String,
        args: PackedSeq,
        weight: f64,
        host: Option<String>,
    ) -> anyhow::Result<()> {
        if self.ingress.is_none() {
            let return_ip = match self.distribute {
                Backend::Inline | Backend::ProcessPool | Backend::ThreadPool => {
                    "127.0.0.1".to_owned()
                },
                _ => {
                    if self.config.ingress.receiver_host.is_empty() {
                        std::env::var("HOSTNAME").unwrap_or_else(|_| "127.0.0.1".to_owned())
                    } else {
                        self.config.ingress.receiver_host.clone()
                    }
                },
            };
            let ingress = Ingress::bind(&return_ip, self.config.ingress.port_range()).await?;
            self.monitor.backurl = Some(ingress.backurl.clone());
            self.ingress = Some(ingress);
            self.t0 = Instant::now();
        }

        let argnames: Vec<String> = match self.registry.get(&func) {
            Some(entry) => entry.data_argnames().to_vec(),
            None => (0..args.len()).map(|index| format!("arg{index}")).collect(),
        };
        let per_func = self.sent.entry(func.clone()).or_default();
        for (index, argname) in argnames.iter().enumerate().take(args.len()) {
            *per_func.entry(argname.clone()).or_default() += args.item_len(index);
        }

        let mut monitor = self.monitor.clone();
        monitor.weight = weight;
        monitor.task_no = self.task_no;
        monitor.host = host;
        let envelope = Envelope::new(func, args, self.task_no, monitor);
        self.task_no += 1;
        self.submitted += 1;
        self.dispatch(envelope).await
    }

    async fn dispatch(
        &mut self,
        envelope: Envelope,
    ) -> anyhow::Result<()> {
        let sender = self
            .ingress
            .as_ref()
            .expect("ingress bound on first submit")
            .sender();
        match self.distribute {
            Backend::Inline => {
                run_task(&self.worker_ctx, envelope, &sender);
                Ok(())
            },
            Backend::ThreadPool => {
                let mut slot = THREAD_POOL.lock().expect("thread pool lock");
                let pool = slot.get_or_insert_with(|| ThreadPool::start(self.num_cores));
                pool.submit(self.worker_ctx.clone(), envelope, sender)?;
                Ok(())
            },
            Backend::ProcessPool => {
                let running = PROCESS_POOL.lock().expect("process pool lock").is_some();
                if !running {
                    let worker_exe = if self.config.distribution.worker_executable.is_empty() {
                        std::env::current_exe().context("locating the worker executable")?
                    } else {
                        PathBuf::from(&self.config.distribution.worker_executable)
                    };
                    let pool =
                        ProcessPool::start(self.num_cores, worker_exe, sender.clone()).await?;
                    let mut slot = PROCESS_POOL.lock().expect("process pool lock");
                    if slot.is_none() {
                        *slot = Some(pool);
                    }
                }
                let slot = PROCESS_POOL.lock().expect("process pool lock");
                let pool = slot.as_ref().ok_or_else(|| {
                    DispatchError::BackendUnavailable {
                        backend: "processpool",
                        reason: "the pool was shut down".to_owned(),
                    }
                })?;
                pool.submit(envelope)?;
                Ok(())
            },
            Backend::Remote => {
                if self.remote.is_none() {
                    self.remote = Some(RemoteConns::new(self.config.distribution.hosts.clone())?);
                }
                self.remote
                    .as_mut()
                    .expect("created just above")
                    .submit(envelope)
                    .await
            },
            Backend::Cluster => {
                match &self.cluster {
                    Some(client) => client.submit(envelope).await,
                    None => {
                        Err(DispatchError::BackendUnavailable {
                            backend: "cluster",
                            reason: "no cluster client configured".to_owned(),
                        }
                        .into())
                    },
                }
            },
        }
    }
}

/// Iterator over one job's values: each `Value` reply exactly once, in
/// arrival order, stopping when no task is in flight anymore.
pub struct IterResult<V> {
    smap: Starmap,
    queue: VecDeque<Queued>,
    todo: usize,
    done: u32,
    busytime: HashMap<String, f64>,
    durations: Vec<(u32, f64)>,
    nbytes_recv: BTreeMap<String, u64>,
    prev_percent: Option<u32>,
    seeded: bool,
    finalized: bool,
    mem_warned: bool,
    _values: PhantomData<fn() -> V>,
}

impl<V: DeserializeOwned> IterResult<V> {
    fn new(
        smap: Starmap,
        queue: VecDeque<Queued>,
    ) -> Self {
        Self {
            smap,
            queue,
            todo: 0,
            done: 0,
            busytime: HashMap::new(),
            durations: Vec::new(),
            nbytes_recv: BTreeMap::new(),
            prev_percent: None,
            seeded: false,
            finalized: false,
            mem_warned: false,
            _values: PhantomData,
        }
    }

    /// The next decoded value, or `Some(Err)` on the first failure
    /// observed, or `None` once every task ended.
    pub async fn next(&mut self) -> Option<anyhow::Result<V>> {
        loop {
            if !self.seeded {
                self.seeded = true;
                let seed = self.smap.num_cores;
                if let Err(err) = self.pump(seed, None).await {
                    return Some(Err(err));
                }
                self.log_sent();
            }
            if self.todo == 0 {
                return self.finalize().await.map(Err);
            }

            let reply = {
                let Some(ingress) = self.smap.ingress.as_mut() else {
                    return self.finalize().await.map(Err);
                };
                match ingress.recv().await {
                    Some(reply) => reply,
                    None => {
                        return Some(Err(DispatchError::WorkerLost {
                            worker: "ingress".to_owned(),
                        }
                        .into()));
                    },
                }
            };

            match check_mem_usage(&self.smap.config.memory) {
                Err(err) => return Some(Err(err.into())),
                Ok(Some(msg)) if !self.mem_warned => {
                    self.mem_warned = true;
                    warn!("{msg}");
                },
                Ok(_) => {},
            }

            if reply.calc_id() != Some(self.smap.calc_id) {
                warn!(
                    "Discarding a result from job {:?}, since this is job {}",
                    reply.calc_id(),
                    self.smap.calc_id
                );
                continue;
            }

            self.log_percent();
            match reply.body {
                Reply::TaskEnded { sent_bytes } => {
                    let worker = format!("{}:{}", reply.worker_id.0, reply.worker_id.1);
                    *self.busytime.entry(worker).or_default() += reply.monitor.duration;
                    self.durations
                        .push((reply.monitor.task_no, reply.monitor.duration));
                    self.todo -= 1;
                    self.done += 1;

                    // pull one queued task, on the same host for locality;
                    // the worker reports a hostname, the feed addresses
                    // carry a port
                    let host = if self.smap.distribute == Backend::Remote {
                        self.smap
                            .config
                            .distribution
                            .hosts
                            .iter()
                            .find(|addr| {
                                addr.split(':').next() == Some(reply.worker_id.0.as_str())
                            })
                            .cloned()
                    } else {
                        None
                    };
                    if let Err(err) = self.pump(1, host).await {
                        return Some(Err(err));
                    }
                    debug!(
                        "{} tasks running, {} in queue",
                        self.todo,
                        self.queue.len()
                    );

                    let mut pids = vec![std::process::id()];
                    pids.extend(Starmap::pool_pids());
                    let mem_gb = memory_rss_sum(&pids) as f64 / GB;
                    debug!("Memory on master and workers: {:.2} GB", mem_gb);
                    if let Err(err) = self.record_task_end(reply.monitor, sent_bytes) {
                        return Some(Err(err));
                    }
                },
                Reply::Subtask { func, args } => {
                    self.queue.push_back(Queued::Args {
                        func,
                        args,
                        weight: 1.0,
                    });
                    if let Err(err) = self.pump(1, None).await {
                        return Some(Err(err));
                    }
                },
                Reply::Warning(msg) => {
                    if !self.mem_warned {
                        self.mem_warned = true;
                        warn!("{msg}");
                    }
                },
                Reply::Failure(failure) => {
                    self.todo -= 1;
                    self.done += 1;
                    return Some(Err(failure.into_error()));
                },
                Reply::Value(packed) => {
                    for (key, bytes) in &reply.nbytes {
                        *self.nbytes_recv.entry(key.clone()).or_default() += bytes;
                    }
                    return Some(packed.unpack::<V>().map_err(Into::into));
                },
            }
        }
    }

    /// Folds the remaining values; the default arguments of the original
    /// API are [`add_maps`] and an empty [`AccumMap`].
    pub async fn reduce<A, F>(
        mut self,
        agg: F,
        mut acc: A,
    ) -> anyhow::Result<A>
    where
        F: Fn(A, V) -> A,
    {
        while let Some(value) = self.next().await {
            acc = agg(acc, value?);
        }
        Ok(acc)
    }

    /// Submits up to `how_many` queued tasks, skipping over the ordinals
    /// dropped by `TASK_NO` debug mode.
    async fn pump(
        &mut self,
        how_many: usize,
        host: Option<String>,
    ) -> anyhow::Result<()> {
        for _ in 0..how_many {
            while let Some(queued) = self.queue.pop_front() {
                match queued {
                    Queued::Skipped => {
                        self.smap.task_no += 1;
                        continue;
                    },
                    Queued::Args { func, args, weight } => {
                        self.smap.submit(func, args, weight, host.clone()).await?;
                        self.todo += 1;
                        break;
                    },
                }
            }
        }
        Ok(())
    }

    fn record_task_end(
        &mut self,
        mut monitor: Monitor,
        received_bytes: u64,
    ) -> anyhow::Result<()> {
        let operation = monitor
            .operation
            .strip_prefix("total ")
            .unwrap_or(&monitor.operation)
            .to_owned();
        let row = TaskInfo {
            operation,
            time_sec: monitor.duration,
            memory_mb: monitor.mem_mb,
            counts: monitor.counts,
            task_no: monitor.task_no,
            weight: monitor.weight,
            duration: monitor.duration,
            received_bytes,
        };
        let mut sink = self.smap.store.lock().expect("telemetry lock");
        sink.task_sent(&self.smap.sent)?;
        sink.task_info(&row)?;
        sink.flush_monitor(&mut monitor)?;
        Ok(())
    }

    fn log_sent(&self) {
        let nbytes: u64 = self
            .smap
            .sent
            .get(&self.smap.task_func)
            .map(|per_arg| per_arg.values().sum())
            .unwrap_or(0);
        if nbytes > 1_000_000 {
            info!(
                "Sent {} {} tasks, {} in {} seconds",
                self.smap.submitted,
                self.smap.name,
                humansize(nbytes),
                self.smap.t0.elapsed().as_secs()
            );
        }
    }

    /// Emits a progress line every time the integer percentage grows.
    fn log_percent(&mut self) {
        let queued = self
            .queue
            .iter()
            .filter(|queued| matches!(queued, Queued::Args { .. }))
            .count();
        let total = self.done as usize + self.todo + queued;
        if total == 0 {
            return;
        }
        let percent = (self.done as f64 / total as f64 * 100.0) as u32;
        match self.prev_percent {
            None => self.prev_percent = Some(0),
            Some(prev) if percent > prev => {
                (self.smap.progress)(format!(
                    "{} {:3}% [{} submitted, {} queued]",
                    self.smap.name, percent, self.smap.submitted, queued
                ));
                self.prev_percent = Some(percent);
            },
            Some(_) => {},
        }
    }

    /// Closes the ingress, logs the receive/busy-time summaries and runs
    /// the post-hoc slow-task check. Returns an error only under the
    /// strict flag.
    async fn finalize(&mut self) -> Option<anyhow::Error> {
        if self.finalized {
            return None;
        }
        self.finalized = true;
        if let Some(mut remote) = self.smap.remote.take() {
            remote.close().await;
        }
        if let Some(ingress) = self.smap.ingress.take() {
            ingress.close();
        }

        let total: u64 = self.nbytes_recv.values().sum();
        let pretty: BTreeMap<&String, String> = self
            .nbytes_recv
            .iter()
            .map(|(key, bytes)| (key, humansize(*bytes)))
            .collect();
        info!(
            "Received {:?} ({}) in {} seconds from {}",
            pretty,
            humansize(total),
            self.smap.t0.elapsed().as_secs(),
            self.smap.name
        );

        if self.busytime.len() > 1 {
            let times: Vec<f64> = self.busytime.values().copied().collect();
            let mean = times.iter().sum::<f64>() / times.len() as f64;
            let var =
                times.iter().map(|t| (t - mean) * (t - mean)).sum::<f64>() / times.len() as f64;
            let min = times.iter().copied().fold(f64::INFINITY, f64::min);
            let max = times.iter().copied().fold(0.0, f64::max);
            info!(
                "Mean time per core={:.0}s, std={:.1}s, min={:.0}s, max={:.0}s",
                mean,
                var.sqrt(),
                min,
                max
            );
        }

        if !self.durations.is_empty() {
            let mean = self.durations.iter().map(|(_, d)| d).sum::<f64>()
                / self.durations.len() as f64;
            let slow: Vec<(u32, f64)> = self
                .durations
                .iter()
                .copied()
                .filter(|(_, duration)| {
                    *duration > 3.0 * mean && *duration > SLOW_TASK_SECONDS
                })
                .collect();
            if !slow.is_empty() {
                let worst = slow.iter().map(|(_, d)| *d).fold(0.0, f64::max);
                warn!(
                    "{} slow task(s) detected (mean={:.0}s): {:?}",
                    slow.len(),
                    mean,
                    slow
                );
                if self.smap.config.task.strict_slow_tasks {
                    return Some(
                        DispatchError::SlowTasks {
                            count: slow.len(),
                            worst,
                        }
                        .into(),
                    );
                }
            }
        }
        None
    }
}

/// [`Starmap::apply`] forced onto the inline backend; handy to debug a
/// parallel computation sequentially.
#[allow(clippy::too_many_arguments)]
pub fn sequential_apply<T, B, K, WF, KF>(
    registry: &Arc<Registry>,
    task: &str,
    seq: Vec<T>,
    rest: Vec<Packed>,
    config: Config,
    concurrent_tasks: Option<usize>,
    weight: WF,
    key: KF,
) -> anyhow::Result<Starmap>
where
    B: FromIterator<T> + Serialize,
    K: PartialEq,
    WF: Fn(&T) -> f64,
    KF: Fn(&T) -> K,
{
    Ok(Starmap::apply::<T, B, K, WF, KF>(
        registry,
        task,
        seq,
        rest,
        config,
        concurrent_tasks,
        None,
        weight,
        key,
    )?
    .with_distribute(Backend::Inline))
}
