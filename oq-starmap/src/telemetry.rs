//! Append-only store for per-task measurements.
//!
//! Rows go into a JSON-lines file, one dataset-tagged object per line.
//! The dispatcher is the single writer; anything able to read JSON lines
//! can consume the file while the job is still running.

use std::collections::BTreeMap;
use std::fs::File;
use std::fs::OpenOptions;
use std::io::BufRead;
use std::io::BufReader;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;

use anyhow::Context;
use oq_messages::monitor::Monitor;
use oq_messages::monitor::PerfRow;
use serde_derive::Deserialize;
use serde_derive::Serialize;

/// Cumulative bytes sent per task function and argument name.
pub type SentMap = BTreeMap<String, BTreeMap<String, u64>>;

/// One `task_info` dataset row, recorded per end-of-task.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskInfo {
    pub operation: String,
    pub time_sec: f64,
    pub memory_mb: f64,
    pub counts: u32,
    pub task_no: u32,
    pub weight: f64,
    pub duration: f64,
    pub received_bytes: u64,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "dataset", rename_all = "snake_case")]
enum Row {
    TaskInfo(TaskInfo),
    TaskSent { sent: SentMap },
    Performance(PerfRow),
}

/// Where the dispatcher persists measurements. Implementations must be
/// append-only; the dispatcher serializes all writes.
pub trait TelemetrySink: Send {
    fn task_info(
        &mut self,
        row: &TaskInfo,
    ) -> anyhow::Result<()>;

    fn task_sent(
        &mut self,
        sent: &SentMap,
    ) -> anyhow::Result<()>;

    fn performance(
        &mut self,
        rows: &[PerfRow],
    ) -> anyhow::Result<()>;

    /// Drains a monitor's counters into `performance` rows.
    fn flush_monitor(
        &mut self,
        monitor: &mut Monitor,
    ) -> anyhow::Result<()> {
        let rows = monitor.take_rows();
        self.performance(&rows)
    }
}

/// Shared handle to a sink; the dispatcher is the only writer during a job.
pub type SinkHandle = Arc<Mutex<Box<dyn TelemetrySink>>>;

/// The default sink: `calc_N.jsonl` in the data directory.
pub struct JsonlSink {
    path: PathBuf,
    file: File,
}

impl JsonlSink {
    /// Creates `calc_{calc_id}.jsonl` under `dir` with the next free
    /// calculation id.
    pub fn create(dir: &Path) -> anyhow::Result<(u32, Self)> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("creating data directory {}", dir.display()))?;
        let calc_id = next_calc_id(dir)?;
        let path = dir.join(format!("calc_{calc_id}.jsonl"));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("creating telemetry store {}", path.display()))?;
        Ok((calc_id, Self { path, file }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append(
        &mut self,
        row: &Row,
    ) -> anyhow::Result<()> {
        let mut line = serde_json::to_vec(row)?;
        line.push(b'\n');
        self.file.write_all(&line)?;
        Ok(())
    }
}

impl TelemetrySink for JsonlSink {
    fn task_info(
        &mut self,
        row: &TaskInfo,
    ) -> anyhow::Result<()> {
        self.append(&Row::TaskInfo(row.clone()))
    }

    fn task_sent(
        &mut self,
        sent: &SentMap,
    ) -> anyhow::Result<()> {
        self.append(&Row::TaskSent { sent: sent.clone() })
    }

    fn performance(
        &mut self,
        rows: &[PerfRow],
    ) -> anyhow::Result<()> {
        for row in rows {
            self.append(&Row::Performance(row.clone()))?;
        }
        Ok(())
    }
}

/// A sink that drops everything, for jobs that opt out of telemetry.
pub struct NullSink;

impl TelemetrySink for NullSink {
    fn task_info(
        &mut self,
        _row: &TaskInfo,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    fn task_sent(
        &mut self,
        _sent: &SentMap,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    fn performance(
        &mut self,
        _rows: &[PerfRow],
    ) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Scans `dir` for `calc_N.jsonl` files and returns the next free id.
fn next_calc_id(dir: &Path) -> anyhow::Result<u32> {
    let mut max = 0;
    for entry in std::fs::read_dir(dir)? {
        let name = entry?.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some(digits) = name
            .strip_prefix("calc_")
            .and_then(|rest| rest.strip_suffix(".jsonl"))
        else {
            continue;
        };
        if let Ok(calc_id) = digits.parse::<u32>() {
            max = max.max(calc_id);
        }
    }
    Ok(max + 1)
}

/// Aggregates the `performance` rows of a store by operation.
pub fn performance_view(path: &Path) -> anyhow::Result<Vec<PerfRow>> {
    let mut by_op: BTreeMap<String, PerfRow> = BTreeMap::new();
    for row in read_rows(path)? {
        if let Row::Performance(perf) = row {
            by_op
                .entry(perf.operation.clone())
                .and_modify(|acc| {
                    acc.time_sec += perf.time_sec;
                    acc.memory_mb = acc.memory_mb.max(perf.memory_mb);
                    acc.counts += perf.counts;
                })
                .or_insert(perf);
        }
    }
    Ok(by_op.into_values().collect())
}

/// All `task_info` rows of a store, in append order.
pub fn task_info_view(path: &Path) -> anyhow::Result<Vec<TaskInfo>> {
    Ok(read_rows(path)?
        .into_iter()
        .filter_map(|row| {
            match row {
                Row::TaskInfo(info) => Some(info),
                _ => None,
            }
        })
        .collect())
}

/// The last `task_sent` row of a store, i.e. the cumulative byte counts.
pub fn task_sent_view(path: &Path) -> anyhow::Result<SentMap> {
    Ok(read_rows(path)?
        .into_iter()
        .filter_map(|row| {
            match row {
                Row::TaskSent { sent } => Some(sent),
                _ => None,
            }
        })
        .next_back()
        .unwrap_or_default())
}

fn read_rows(path: &Path) -> anyhow::Result<Vec<Row>> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let mut rows = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        rows.push(serde_json::from_str(&line)?);
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use oq_messages::monitor::Monitor;

    use super::performance_view;
    use super::task_info_view;
    use super::JsonlSink;
    use super::TaskInfo;
    use super::TelemetrySink;

    #[test]
    fn rows_roundtrip() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let (calc_id, mut sink) = JsonlSink::create(dir.path())?;
        assert_eq!(calc_id, 1);

        let mut mon = Monitor::new("total count");
        mon.measure("total count", false, || ());
        mon.measure("total count", false, || ());
        sink.flush_monitor(&mut mon)?;
        assert_eq!(mon.counts, 0, "flush must reset the counters");

        sink.task_info(&TaskInfo {
            operation: "count".to_string(),
            time_sec: 0.5,
            memory_mb: 1.0,
            counts: 2,
            task_no: 0,
            weight: 1.0,
            duration: 0.5,
            received_bytes: 42,
        })?;

        let perf = performance_view(sink.path())?;
        assert_eq!(perf.len(), 1);
        assert_eq!(perf[0].operation, "total count");
        assert_eq!(perf[0].counts, 2);
        assert!(perf[0].time_sec >= 0.0);
        assert!(perf[0].memory_mb >= 0.0);

        let infos = task_info_view(sink.path())?;
        assert_eq!(infos[0].received_bytes, 42);
        Ok(())
    }

    #[test]
    fn calc_ids_increment() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let (first, _) = JsonlSink::create(dir.path())?;
        let (second, _) = JsonlSink::create(dir.path())?;
        assert_eq!((first, second), (1, 2));
        Ok(())
    }
}
