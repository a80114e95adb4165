//! The task registry: maps function names to runnable value streams.
//!
//! Functions cross process boundaries by name, so every backend except
//! `inline`/`threadpool` requires the worker side to hold an equivalent
//! registry. Tasks are "value streams": they receive packed arguments and
//! push zero or more values (and possibly subtask requests) through a
//! [`TaskIo`] before finishing.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use oq_messages::pack::PackedSeq;
use oq_messages::reply::RemoteFailure;
use oq_messages::reply::KEY_NOT_FOUND;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::info;

use crate::runner::SplitTask;
use crate::runner::TaskIo;

/// Registry name of the built-in splitting wrapper.
pub const SPLIT_TASK: &str = "split_task";

/// Positional arguments handed to a task, decoded on demand.
pub struct TaskArgs<'a> {
    seq: &'a PackedSeq,
}

impl<'a> TaskArgs<'a> {
    pub fn new(seq: &'a PackedSeq) -> Self {
        Self { seq }
    }

    /// Decodes argument `index`. A missing argument is a key-not-found
    /// failure; a blob of the wrong shape is a serialization failure.
    pub fn get<T: DeserializeOwned>(
        &self,
        index: usize,
    ) -> anyhow::Result<T> {
        match self.seq.get(index) {
            Some(packed) => Ok(packed.unpack()?),
            None => {
                Err(RemoteFailure::new(
                    KEY_NOT_FOUND,
                    format!("task argument #{index} is missing"),
                )
                .into_error())
            },
        }
    }

    pub fn raw(
        &self,
        index: usize,
    ) -> Option<&oq_messages::Packed> {
        self.seq.get(index)
    }

    pub fn len(&self) -> usize {
        self.seq.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seq.is_empty()
    }
}

/// A runnable task. Plain functions become streams emitting exactly one
/// value; long-running tasks emit as they go and may request subtasks.
pub trait TaskStream: Send + Sync {
    fn run(
        &self,
        args: TaskArgs<'_>,
        io: &mut TaskIo<'_>,
    ) -> anyhow::Result<()>;
}

/// A registered task: its name, declared argument names and the stream.
pub struct TaskEntry {
    pub name: String,
    pub argnames: Vec<String>,
    pub stream: Arc<dyn TaskStream>,
}

impl TaskEntry {
    /// Whether the task declared a trailing monitor parameter: the last
    /// argument name begins or ends with `mon`.
    pub fn inject(&self) -> bool {
        match self.argnames.last() {
            Some(last) => last.starts_with("mon") || last.ends_with("mon"),
            None => false,
        }
    }

    /// Argument names that carry user data, i.e. all but the injected
    /// monitor.
    pub fn data_argnames(&self) -> &[String] {
        if self.inject() {
            &self.argnames[..self.argnames.len() - 1]
        } else {
            &self.argnames
        }
    }
}

/// Name-to-stream map shared by the dispatcher and its workers.
#[derive(Default)]
pub struct Registry {
    tasks: HashMap<String, Arc<TaskEntry>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry preloaded with the built-in tasks: `count`, `debug` and
    /// the splitting wrapper.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("count", &["word"], Count);
        registry.register("debug", &["msg"], Debug);
        registry.register(
            SPLIT_TASK,
            &["elements", "func", "args", "duration", "outs_per_task", "monitor"],
            SplitTask,
        );
        registry
    }

    pub fn register(
        &mut self,
        name: &str,
        argnames: &[&str],
        stream: impl TaskStream + 'static,
    ) {
        let entry = TaskEntry {
            name: name.to_owned(),
            argnames: argnames.iter().map(|a| (*a).to_owned()).collect(),
            stream: Arc::new(stream),
        };
        self.tasks.insert(name.to_owned(), Arc::new(entry));
    }

    pub fn get(
        &self,
        name: &str,
    ) -> Option<Arc<TaskEntry>> {
        self.tasks.get(name).cloned()
    }
}

/// Adapts a one-argument function returning a single value.
pub struct PlainFn1<F, A, R>(pub F, pub PhantomData<fn(A) -> R>);

impl<A, R, F> TaskStream for PlainFn1<F, A, R>
where
    A: DeserializeOwned,
    R: Serialize,
    F: Fn(A) -> anyhow::Result<R> + Send + Sync,
{
    fn run(
        &self,
        args: TaskArgs<'_>,
        io: &mut TaskIo<'_>,
    ) -> anyhow::Result<()> {
        let a: A = args.get(0)?;
        let out = (self.0)(a)?;
        io.emit(&out)
    }
}

/// Adapts a two-argument function returning a single value.
pub struct PlainFn2<F, A, B, R>(pub F, pub PhantomData<fn(A, B) -> R>);

impl<A, B, R, F> TaskStream for PlainFn2<F, A, B, R>
where
    A: DeserializeOwned,
    B: DeserializeOwned,
    R: Serialize,
    F: Fn(A, B) -> anyhow::Result<R> + Send + Sync,
{
    fn run(
        &self,
        args: TaskArgs<'_>,
        io: &mut TaskIo<'_>,
    ) -> anyhow::Result<()> {
        let a: A = args.get(0)?;
        let b: B = args.get(1)?;
        let out = (self.0)(a, b)?;
        io.emit(&out)
    }
}

/// Adapts a one-argument function that also takes the injected monitor.
pub struct MonFn1<F, A, R>(pub F, pub PhantomData<fn(A) -> R>);

impl<A, R, F> TaskStream for MonFn1<F, A, R>
where
    A: DeserializeOwned,
    R: Serialize,
    F: Fn(A, &mut oq_messages::Monitor) -> anyhow::Result<R> + Send + Sync,
{
    fn run(
        &self,
        args: TaskArgs<'_>,
        io: &mut TaskIo<'_>,
    ) -> anyhow::Result<()> {
        let a: A = args.get(0)?;
        let out = {
            let monitor = io
                .monitor()
                .ok_or_else(|| anyhow::anyhow!("task registered without a monitor argument"))?;
            (self.0)(a, monitor)?
        };
        io.emit(&out)
    }
}

/// Counts the letters of a word; the canonical MapReduce example.
struct Count;

impl TaskStream for Count {
    fn run(
        &self,
        args: TaskArgs<'_>,
        io: &mut TaskIo<'_>,
    ) -> anyhow::Result<()> {
        let word: String = args.get(0)?;
        let mut counts: BTreeMap<char, u64> = BTreeMap::new();
        for ch in word.chars() {
            *counts.entry(ch).or_default() += 1;
        }
        io.emit_keyed(&counts)
    }
}

/// Logs its argument and produces nothing; useful to exercise a backend.
struct Debug;

impl TaskStream for Debug {
    fn run(
        &self,
        args: TaskArgs<'_>,
        _io: &mut TaskIo<'_>,
    ) -> anyhow::Result<()> {
        let msg: String = args.get(0)?;
        info!("{msg}");
        Ok(())
    }
}
