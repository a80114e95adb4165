//! Per-task measurement record, carried inside every envelope and reply.

use std::time::Instant;

use serde_derive::Deserialize;
use serde_derive::Serialize;
use sysinfo::Pid;
use sysinfo::ProcessesToUpdate;
use sysinfo::System;
use thiserror::Error;

const MB: f64 = 1024.0 * 1024.0;

/// A scope was exited that is not the innermost open one.
#[derive(Error, Debug)]
#[error("monitor scope exited out of order. operation: {operation} depth: {depth}")]
pub struct InvalidMonitorState {
    pub operation: String,
    pub depth: usize,
}

/// Token returned by [`Monitor::enter`]; must be passed back to
/// [`Monitor::exit`] in strictly nested order.
#[derive(Debug)]
#[must_use]
pub struct Scope {
    depth: usize,
}

#[derive(Clone, Debug)]
struct Frame {
    /// `None` measures the monitor's own operation, `Some(i)` a child.
    target: Option<usize>,
    started: Instant,
    rss_before: u64,
    measure_mem: bool,
}

/// Measures wall-clock time and peak resident memory for one operation,
/// plus any nested operations entered while it is open. Monitors are
/// created on the dispatcher, mutated inside the task, shipped back in the
/// final reply and merged into the job-wide telemetry.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Monitor {
    pub operation: String,

    /// Calculation this monitor belongs to; `None` outside a job.
    pub calc_id: Option<u32>,

    pub task_no: u32,

    /// Heuristic cost of the task's input, used in `task_info` rows.
    pub weight: f64,

    /// Whether the dispatcher should append this monitor to the task args.
    pub inject: bool,

    pub measure_mem: bool,

    /// Ingress address workers push replies to.
    pub backurl: Option<String>,

    /// When set, pins the task to one remote host.
    pub host: Option<String>,

    /// Master's engine version, checked by every worker.
    pub version: String,

    /// Fingerprint of the coordination section of the master's config.
    pub config_digest: String,

    pub duration: f64,
    pub mem_mb: f64,
    pub counts: u32,

    /// Nested operations measured while this monitor was active.
    pub children: Vec<Monitor>,

    #[serde(skip)]
    stack: Vec<Frame>,
}

impl Monitor {
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            calc_id: None,
            task_no: 0,
            weight: 1.0,
            inject: false,
            measure_mem: false,
            backurl: None,
            host: None,
            version: crate::engine_version().to_owned(),
            config_digest: String::new(),
            duration: 0.0,
            mem_mb: 0.0,
            counts: 0,
            children: Vec::new(),
            stack: Vec::new(),
        }
    }

    /// Derives a child monitor carrying the parent identity, with fresh
    /// counters.
    pub fn new_child(
        &self,
        operation: impl Into<String>,
        measure_mem: bool,
    ) -> Self {
        Self {
            operation: operation.into(),
            measure_mem,
            duration: 0.0,
            mem_mb: 0.0,
            counts: 0,
            children: Vec::new(),
            stack: Vec::new(),
            ..self.clone()
        }
    }

    /// Opens a measurement scope for `operation`.
    pub fn enter(
        &mut self,
        operation: &str,
        measure_mem: bool,
    ) -> Scope {
        let target = if operation == self.operation {
            None
        } else {
            Some(self.child_index(operation))
        };
        let rss_before = if measure_mem { memory_rss(std::process::id()) } else { 0 };
        self.stack.push(Frame {
            target,
            started: Instant::now(),
            rss_before,
            measure_mem,
        });
        Scope {
            depth: self.stack.len() - 1,
        }
    }

    /// Closes a scope, recording elapsed time and the resident-memory
    /// delta. Scopes are strictly nested: closing anything but the
    /// innermost open scope is a programming error.
    pub fn exit(
        &mut self,
        scope: Scope,
    ) -> Result<(), InvalidMonitorState> {
        if self.stack.len() != scope.depth + 1 {
            return Err(InvalidMonitorState {
                operation: self.operation.clone(),
                depth: scope.depth,
            });
        }
        let frame = self.stack.pop().expect("checked above");
        let elapsed = frame.started.elapsed().as_secs_f64();
        let mem_mb = if frame.measure_mem {
            let rss_after = memory_rss(std::process::id());
            (rss_after.saturating_sub(frame.rss_before)) as f64 / MB
        } else {
            0.0
        };
        let target = match frame.target {
            None => self,
            Some(index) => &mut self.children[index],
        };
        target.duration += elapsed;
        target.mem_mb = target.mem_mb.max(mem_mb);
        target.counts += 1;
        Ok(())
    }

    /// Runs `f` inside a scope for `operation`; the scope is closed on both
    /// the normal and the error path.
    pub fn measure<R>(
        &mut self,
        operation: &str,
        measure_mem: bool,
        f: impl FnOnce() -> R,
    ) -> R {
        let scope = self.enter(operation, measure_mem);
        let out = f();
        self.exit(scope).expect("scope opened just above");
        out
    }

    /// Folds another monitor's totals into this one, matching operations by
    /// name. Used to aggregate across the tree of subtasks.
    pub fn merge(
        &mut self,
        other: &Monitor,
    ) {
        self.absorb(&other.operation, other.duration, other.mem_mb, other.counts);
        for child in &other.children {
            self.absorb(&child.operation, child.duration, child.mem_mb, child.counts);
        }
    }

    /// Drains the accumulated counters into `performance` rows, one per
    /// operation with at least one successful exit.
    pub fn take_rows(&mut self) -> Vec<PerfRow> {
        let mut rows = Vec::new();
        if self.counts > 0 {
            rows.push(PerfRow {
                operation: self.operation.clone(),
                time_sec: self.duration,
                memory_mb: self.mem_mb,
                counts: self.counts,
            });
        }
        for child in &self.children {
            if child.counts > 0 {
                rows.push(PerfRow {
                    operation: child.operation.clone(),
                    time_sec: child.duration,
                    memory_mb: child.mem_mb,
                    counts: child.counts,
                });
            }
        }
        self.duration = 0.0;
        self.mem_mb = 0.0;
        self.counts = 0;
        self.children.clear();
        rows
    }

    fn absorb(
        &mut self,
        operation: &str,
        duration: f64,
        mem_mb: f64,
        counts: u32,
    ) {
        let target = if operation == self.operation {
            self
        } else {
            let index = self.child_index(operation);
            &mut self.children[index]
        };
        target.duration += duration;
        target.mem_mb = target.mem_mb.max(mem_mb);
        target.counts += counts;
    }

    fn child_index(
        &mut self,
        operation: &str,
    ) -> usize {
        match self.children.iter().position(|child| child.operation == operation) {
            Some(index) => index,
            None => {
                let child = self.new_child(operation, false);
                self.children.push(child);
                self.children.len() - 1
            },
        }
    }
}

/// One `performance` dataset row.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PerfRow {
    pub operation: String,
    pub time_sec: f64,
    pub memory_mb: f64,
    pub counts: u32,
}

/// Resident set size of `pid` in bytes, 0 when the process is gone.
pub fn memory_rss(pid: u32) -> u64 {
    let pid = Pid::from_u32(pid);
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    system.process(pid).map(|process| process.memory()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::Monitor;

    #[test]
    fn nested_scopes_accumulate() {
        let mut mon = Monitor::new("total count");
        let outer = mon.enter("total count", false);
        let inner = mon.enter("read sources", false);
        mon.exit(inner).unwrap();
        mon.exit(outer).unwrap();
        assert_eq!(mon.counts, 1);
        assert_eq!(mon.children.len(), 1);
        assert_eq!(mon.children[0].operation, "read sources");
        assert!(mon.duration >= 0.0);
    }

    #[test]
    fn out_of_order_exit_is_rejected() {
        let mut mon = Monitor::new("total count");
        let outer = mon.enter("total count", false);
        let _inner = mon.enter("read sources", false);
        assert!(mon.exit(outer).is_err());
    }

    #[test]
    fn measure_records_on_error_path() {
        let mut mon = Monitor::new("total count");
        let res: Result<(), String> = mon.measure("total count", false, || Err("boom".into()));
        assert!(res.is_err());
        assert_eq!(mon.counts, 1);
    }

    #[test]
    fn merge_matches_operations_by_name() {
        let mut parent = Monitor::new("total count");
        parent.measure("total count", false, || ());
        let mut child = parent.new_child("total count", true);
        child.measure("total count", false, || ());
        child.measure("read sources", false, || ());
        parent.merge(&child);
        assert_eq!(parent.counts, 2);
        assert_eq!(parent.children.len(), 1);
        let rows = parent.take_rows();
        assert_eq!(rows.len(), 2);
        assert_eq!(parent.counts, 0);
    }
}
