//! Worker-side execution of one task envelope.
//!
//! [`run_task`] is the single entry point used by every backend: it checks
//! versions, drives the task's value stream under a measuring monitor,
//! traps errors and panics, and guarantees that exactly one terminal reply
//! (end-of-task or failure) reaches the ingress.

use std::collections::BTreeMap;
use std::fmt::Display;
use std::panic;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use backtrace::Backtrace;
use metrics::counter;
use metrics::histogram;
use oq_messages::engine_version;
use oq_messages::pack::PackError;
use oq_messages::pack::Packed;
use oq_messages::pack::PackedSeq;
use oq_messages::reply::RemoteFailure;
use oq_messages::reply::HARD_MEMORY_LIMIT;
use oq_messages::reply::KEY_NOT_FOUND;
use oq_messages::reply::TASK_PANIC;
use oq_messages::reply::VERSION_MISMATCH;
use oq_messages::Envelope;
use oq_messages::Monitor;
use oq_messages::Reply;
use oq_messages::ReplyEnvelope;
use serde::Serialize;

use crate::config::MemoryConfig;
use crate::errors::DispatchError;
use crate::memory::check_mem_usage;
use crate::registry::Registry;
use crate::registry::TaskArgs;
use crate::registry::TaskStream;

pub const ERROR_VERSION_MISMATCH: &str = "version_mismatch";
pub const ERROR_UNKNOWN_FUNCTION: &str = "unknown_function";
pub const ERROR_TASK_FAILED: &str = "task_failed";
pub const ERROR_TASK_PANIC: &str = "task_panic";
pub const ERROR_HARD_MEMORY_LIMIT: &str = "hard_memory_limit";

/// Every error tag emitted by the runner, for zeroed metric initialisation.
pub const ERROR_TAGS: [&str; 5] = [
    ERROR_VERSION_MISMATCH,
    ERROR_UNKNOWN_FUNCTION,
    ERROR_TASK_FAILED,
    ERROR_TASK_PANIC,
    ERROR_HARD_MEMORY_LIMIT,
];

/// Channel workers push replies into; routed to the dispatcher's ingress
/// either directly or over a TCP connection.
pub type ReplySender = tokio::sync::mpsc::UnboundedSender<ReplyEnvelope>;

/// Everything a worker needs besides the envelope itself.
#[derive(Clone)]
pub struct WorkerContext {
    pub registry: Arc<Registry>,
    pub config_digest: String,
    pub memory: MemoryConfig,
    pub compress: bool,
}

/// The side channel a running task emits through.
pub struct TaskIo<'a> {
    registry: &'a Registry,
    monitor: &'a mut Monitor,
    sender: &'a ReplySender,
    memory: &'a MemoryConfig,
    compress: bool,
    inject: bool,
    calc_tag: String,
    sent_bytes: u64,
    values_emitted: u32,
    soft_warned: bool,
}

impl TaskIo<'_> {
    /// Emits one partial output value.
    pub fn emit<T: Serialize>(
        &mut self,
        value: &T,
    ) -> anyhow::Result<()> {
        self.check_mem()?;
        let packed = self.pack(value)?;
        self.sent_bytes += packed.len() as u64;
        self.values_emitted += 1;
        self.send(ReplyEnvelope::new(Reply::Value(packed), self.monitor.clone()))
    }

    /// Emits a mapping value, recording the packed size of every key.
    pub fn emit_keyed<K, V>(
        &mut self,
        map: &BTreeMap<K, V>,
    ) -> anyhow::Result<()>
    where
        K: Display + Ord + Serialize,
        V: Serialize,
    {
        self.check_mem()?;
        let mut nbytes = BTreeMap::new();
        for (key, value) in map {
            nbytes.insert(key.to_string(), Packed::new(value)?.len() as u64);
        }
        let packed = self.pack(map)?;
        self.sent_bytes += packed.len() as u64;
        self.values_emitted += 1;
        self.send(
            ReplyEnvelope::new(Reply::Value(packed), self.monitor.clone()).with_nbytes(nbytes),
        )
    }

    /// Asks the dispatcher to enqueue `(func, args)` as a new task.
    pub fn spawn_subtask(
        &mut self,
        func: &str,
        args: Vec<Packed>,
    ) -> anyhow::Result<()> {
        let args = PackedSeq::new(args);
        self.sent_bytes += args.nbytes();
        self.send(ReplyEnvelope::new(
            Reply::Subtask {
                func: func.to_owned(),
                args,
            },
            self.monitor.clone(),
        ))
    }

    /// The injected monitor, when the task declared a `mon` parameter.
    pub fn monitor(&mut self) -> Option<&mut Monitor> {
        if self.inject {
            Some(self.monitor)
        } else {
            None
        }
    }

    pub fn registry(&self) -> &Registry {
        self.registry
    }

    fn pack<T: Serialize + ?Sized>(
        &self,
        value: &T,
    ) -> Result<Packed, PackError> {
        let packed = if self.compress {
            Packed::compressed(value)?
        } else {
            Packed::new(value)?
        };
        Ok(packed.with_calc_id(self.calc_tag.clone()))
    }

    /// Resident-memory admission check, run on every emit. The hard limit
    /// fails the task; the soft limit sends one warning reply.
    fn check_mem(&mut self) -> anyhow::Result<()> {
        match check_mem_usage(self.memory) {
            Err(err) => Err(anyhow::Error::new(err)),
            Ok(Some(warning)) if !self.soft_warned => {
                self.soft_warned = true;
                self.send(ReplyEnvelope::new(
                    Reply::Warning(warning),
                    self.monitor.clone(),
                ))
            },
            Ok(_) => Ok(()),
        }
    }

    fn send(
        &self,
        reply: ReplyEnvelope,
    ) -> anyhow::Result<()> {
        self.sender
            .send(reply)
            .map_err(|_| anyhow::anyhow!("ingress channel closed"))
    }
}

/// Runs one envelope to completion, pushing every reply through `sender`.
pub fn run_task(
    ctx: &WorkerContext,
    envelope: Envelope,
    sender: &ReplySender,
) {
    let Envelope {
        func,
        args,
        task_no,
        monitor: template,
    } = envelope;

    counter!("oq_worker_tasks_received_total", "task_type" => func.clone()).increment(1);
    let start = Instant::now();

    // split_task rows are recorded under the wrapped function's name
    let name = if func == crate::registry::SPLIT_TASK {
        TaskArgs::new(&args).get::<String>(1).unwrap_or_else(|_| func.clone())
    } else {
        func.clone()
    };
    let mut monitor = template.new_child(format!("total {name}"), true);
    monitor.task_no = task_no;

    if !template.version.is_empty() && template.version != engine_version() {
        let msg = format!(
            "the master is at version {} while this worker is at version {}",
            template.version,
            engine_version(),
        );
        send_failure(sender, &monitor, VERSION_MISMATCH, msg);
        finish(&func, start, Err(ERROR_VERSION_MISMATCH));
        return;
    }
    if !template.config_digest.is_empty() && template.config_digest != ctx.config_digest {
        let msg = format!(
            "the master's config fingerprint {} differs from this worker's {}",
            template.config_digest, ctx.config_digest,
        );
        send_failure(sender, &monitor, VERSION_MISMATCH, msg);
        finish(&func, start, Err(ERROR_VERSION_MISMATCH));
        return;
    }

    let Some(entry) = ctx.registry.get(&func) else {
        let msg = format!("task function {func} is not registered on this worker");
        send_failure(sender, &monitor, KEY_NOT_FOUND, msg);
        finish(&func, start, Err(ERROR_UNKNOWN_FUNCTION));
        return;
    };

    let calc_tag = monitor
        .calc_id
        .map(|calc_id| calc_id.to_string())
        .unwrap_or_default();
    let operation = monitor.operation.clone();
    let scope = monitor.enter(&operation, true);
    let mut io = TaskIo {
        registry: ctx.registry.as_ref(),
        monitor: &mut monitor,
        sender,
        memory: &ctx.memory,
        compress: ctx.compress,
        inject: entry.inject(),
        calc_tag,
        sent_bytes: 0,
        values_emitted: 0,
        soft_warned: false,
    };

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        entry.stream.run(TaskArgs::new(&args), &mut io)
    }));
    let sent_bytes = io.sent_bytes;
    let values_emitted = io.values_emitted;
    drop(io);

    monitor.exit(scope).expect("scope opened just above");
    // stream exhaustion is not a call: counts is the number of values
    monitor.counts = values_emitted;

    match outcome {
        Ok(Ok(())) => {
            let _ = sender.send(ReplyEnvelope::new(
                Reply::TaskEnded { sent_bytes },
                monitor,
            ));
            finish(&func, start, Ok(sent_bytes));
        },
        Ok(Err(err)) => {
            let kind = failure_kind(&err);
            send_failure(sender, &monitor, &kind, format!("{err:#}"));
            finish(&func, start, Err(error_tag(&kind)));
        },
        Err(payload) => {
            let panic_msg = match payload.downcast_ref::<&'static str>() {
                Some(msg) => (*msg).to_owned(),
                None => {
                    match payload.downcast::<String>() {
                        Ok(msg) => *msg,
                        Err(payload) => format!("{:?}", payload),
                    }
                },
            };
            send_failure(sender, &monitor, TASK_PANIC, panic_msg);
            finish(&func, start, Err(ERROR_TASK_PANIC));
        },
    }
}

fn send_failure(
    sender: &ReplySender,
    monitor: &Monitor,
    kind: &str,
    msg: String,
) {
    let backtrace = format!("{:?}", Backtrace::new());
    let failure = RemoteFailure::new(kind, msg).with_backtrace(backtrace);
    let _ = sender.send(ReplyEnvelope::new(
        Reply::Failure(failure),
        monitor.clone(),
    ));
}

/// Maps a task error to the failure kind shipped over the wire.
fn failure_kind(err: &anyhow::Error) -> String {
    if let Some(remote) = err.downcast_ref::<RemoteFailure>() {
        return remote.kind.clone();
    }
    if err.downcast_ref::<PackError>().is_some() {
        return "SerializationError".to_owned();
    }
    if let Some(DispatchError::HardMemoryLimit { .. }) = err.downcast_ref::<DispatchError>() {
        return HARD_MEMORY_LIMIT.to_owned();
    }
    "Error".to_owned()
}

fn error_tag(kind: &str) -> &'static str {
    match kind {
        HARD_MEMORY_LIMIT => ERROR_HARD_MEMORY_LIMIT,
        _ => ERROR_TASK_FAILED,
    }
}

fn finish(
    func: &str,
    start: Instant,
    result: Result<u64, &'static str>,
) {
    let elapsed = start.elapsed().as_secs_f64();
    match result {
        Ok(sent_bytes) => {
            counter!("oq_worker_tasks_successful_total", "task_type" => func.to_owned())
                .increment(1);
            histogram!(
                "oq_worker_task_successful_processing_duration_seconds",
                "task_type" => func.to_owned(),
            )
            .record(elapsed);
            histogram!("oq_worker_reply_size_bytes", "task_type" => func.to_owned())
                .record(sent_bytes as f64);
        },
        Err(tag) => {
            counter!(
                "oq_worker_tasks_error_total",
                "task_type" => func.to_owned(),
                "type" => tag,
            )
            .increment(1);
            histogram!(
                "oq_worker_task_failed_processing_duration_seconds",
                "task_type" => func.to_owned(),
            )
            .record(elapsed);
        },
    }
}

/// The canonical subtask producer: slices its elements into interleaved
/// shards, runs the first shard in place, and when the wall clock exceeds
/// the configured duration turns the remaining shards into subtasks.
pub(crate) struct SplitTask;

impl TaskStream for SplitTask {
    fn run(
        &self,
        args: TaskArgs<'_>,
        io: &mut TaskIo<'_>,
    ) -> anyhow::Result<()> {
        let elements: Vec<Packed> = args.get(0)?;
        let func: String = args.get(1)?;
        let rest: Vec<Packed> = args.get(2)?;
        let duration: f64 = args.get(3)?;
        let outs_per_task: u32 = args.get(4)?;

        if elements.is_empty() {
            return Ok(());
        }
        let outs = (outs_per_task as usize).clamp(1, elements.len());
        let shards: Vec<Vec<Packed>> = (0..outs)
            .map(|lane| elements.iter().skip(lane).step_by(outs).cloned().collect())
            .collect();

        let entry = io.registry().get(&func).ok_or_else(|| {
            RemoteFailure::new(KEY_NOT_FOUND, format!("unknown task function {func}"))
                .into_error()
        })?;

        let t0 = Instant::now();
        for (index, shard) in shards.iter().enumerate() {
            if index > 0 && t0.elapsed().as_secs_f64() > duration {
                for shard in &shards[index..] {
                    let mut subtask_args = vec![Packed::new(shard)?];
                    subtask_args.extend(rest.iter().cloned());
                    io.spawn_subtask(&func, subtask_args)?;
                }
                break;
            }
            let mut shard_args = vec![Packed::new(shard)?];
            shard_args.extend(rest.iter().cloned());
            let seq = PackedSeq::new(shard_args);
            entry.stream.run(TaskArgs::new(&seq), io)?;
        }
        Ok(())
    }
}
