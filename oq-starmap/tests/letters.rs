//! End-to-end scenarios over the in-process backends: letter counting,
//! apply over a sequence, subtask splitting, failure propagation and
//! cross-job isolation.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::bail;
use oq_messages::reply::RemoteFailure;
use oq_messages::Packed;
use oq_starmap::accum::AccumMap;
use oq_starmap::config::Config;
use oq_starmap::registry::Registry;
use oq_starmap::registry::TaskArgs;
use oq_starmap::registry::TaskStream;
use oq_starmap::runner::TaskIo;
use oq_starmap::split::no_key;
use oq_starmap::split::unit_weight;
use oq_starmap::starmap::Starmap;
use oq_starmap::telemetry::performance_view;
use oq_starmap::telemetry::task_info_view;
use oq_starmap::Backend;

fn test_config(dir: &Path) -> Config {
    let mut config = Config::load(None);
    config.telemetry.data_dir = dir.display().to_string();
    config
}

/// Counts the letters of a shard of individually-packed words; the shape
/// `apply_split` hands to its wrapped task.
struct CountShard;

impl TaskStream for CountShard {
    fn run(
        &self,
        args: TaskArgs<'_>,
        io: &mut TaskIo<'_>,
    ) -> anyhow::Result<()> {
        let shard: Vec<Packed> = args.get(0)?;
        let mut counts: BTreeMap<char, u64> = BTreeMap::new();
        for element in &shard {
            let word: String = element.unpack()?;
            for ch in word.chars() {
                *counts.entry(ch).or_default() += 1;
            }
        }
        io.emit_keyed(&counts)
    }
}

/// Emits two values, then fails with a typed kind.
struct Boom;

impl TaskStream for Boom {
    fn run(
        &self,
        args: TaskArgs<'_>,
        io: &mut TaskIo<'_>,
    ) -> anyhow::Result<()> {
        let _word: String = args.get(0)?;
        io.emit(&1u32)?;
        io.emit(&2u32)?;
        Err(RemoteFailure::new("ValueError", "boom").into_error())
    }
}

/// Emits one value under a forged calculation id, then one real value.
struct Leaky;

impl TaskStream for Leaky {
    fn run(
        &self,
        args: TaskArgs<'_>,
        io: &mut TaskIo<'_>,
    ) -> anyhow::Result<()> {
        let _seed: u32 = args.get(0)?;
        let own_calc_id = io.monitor().expect("registered with a mon argument").calc_id;
        io.monitor().expect("mon").calc_id = Some(99_999);
        io.emit(&999u32)?;
        io.monitor().expect("mon").calc_id = own_calc_id;
        io.emit(&42u32)?;
        Ok(())
    }
}

fn test_registry() -> Arc<Registry> {
    let mut registry = Registry::with_builtins();
    registry.register("count_shard", &["shard"], CountShard);
    registry.register("boom", &["word"], Boom);
    registry.register("leaky", &["seed", "mon"], Leaky);
    Arc::new(registry)
}

fn expected_hello_world() -> Vec<(char, u64)> {
    vec![
        ('d', 1),
        ('e', 1),
        ('h', 1),
        ('l', 3),
        ('o', 2),
        ('r', 1),
        ('w', 1),
    ]
}

async fn count_hello_world(backend: Backend) -> anyhow::Result<Vec<(char, u64)>> {
    let dir = tempfile::tempdir()?;
    let registry = test_registry();
    let mut smap =
        Starmap::new(&registry, "count", test_config(dir.path()))?.with_distribute(backend);
    smap.add_args(("hello".to_string(),))?;
    smap.add_args(("world".to_string(),))?;
    let counts: AccumMap<char, u64> = smap.reduce_counts().await?;
    Ok(counts.into_iter().collect())
}

#[tokio::test]
async fn letter_count_inline() -> anyhow::Result<()> {
    assert_eq!(count_hello_world(Backend::Inline).await?, expected_hello_world());
    Ok(())
}

#[tokio::test]
async fn letter_count_threadpool() -> anyhow::Result<()> {
    assert_eq!(
        count_hello_world(Backend::ThreadPool).await?,
        expected_hello_world()
    );
    Starmap::shutdown();
    Starmap::shutdown();
    Ok(())
}

#[tokio::test]
async fn apply_over_a_sequence() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let registry = test_registry();
    let smap = Starmap::apply::<char, String, _, _, _>(
        &registry,
        "count",
        "helloworld".chars().collect(),
        vec![],
        test_config(dir.path()),
        Some(4),
        None,
        unit_weight,
        no_key,
    )?
    .with_distribute(Backend::Inline);
    let counts: AccumMap<char, u64> = smap.reduce_counts().await?;
    assert_eq!(counts.into_iter().collect::<Vec<_>>(), expected_hello_world());
    Ok(())
}

#[tokio::test]
async fn split_task_spawns_subtasks() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let registry = test_registry();
    let words: Vec<String> = ["hello", "world", "again", "more", "words"]
        .iter()
        .map(|word| (*word).to_string())
        .collect();

    let mut expected: AccumMap<char, u64> = AccumMap::new();
    for word in &words {
        for ch in word.chars() {
            expected.add(ch, 1);
        }
    }

    // one block of five elements; a zero duration budget makes the first
    // shard run in place and the remaining four come back as subtasks
    let smap = Starmap::apply_split::<String, _, _, _>(
        &registry,
        "count_shard",
        words,
        vec![],
        test_config(dir.path()),
        Some(1),
        Some(0.0),
        Some(5),
        unit_weight,
        no_key,
    )?
    .with_distribute(Backend::Inline);
    let store = smap.store_path.clone().expect("autocreated store");

    let mut iter = smap.submit_all::<AccumMap<char, u64>>();
    let mut observed = 0;
    let mut acc: AccumMap<char, u64> = AccumMap::new();
    while let Some(value) = iter.next().await {
        acc.merge(value?);
        observed += 1;
    }
    assert_eq!(observed, 5, "parent value + four subtask values");
    assert_eq!(acc, expected);

    // the parent and each subtask recorded one task_info row
    let rows = task_info_view(&store)?;
    assert_eq!(rows.len(), 5);
    assert!(rows.iter().all(|row| row.operation == "count_shard"));

    // and the performance rows aggregate with sane counters
    let perf = performance_view(&store)?;
    assert!(!perf.is_empty());
    assert!(perf.iter().all(|row| row.counts >= 1 && row.time_sec >= 0.0 && row.memory_mb >= 0.0));
    Ok(())
}

#[tokio::test]
async fn failures_propagate_with_kind_and_backtrace() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let registry = test_registry();
    let mut smap = Starmap::new(&registry, "boom", test_config(dir.path()))?;
    smap.add_args(("x".to_string(),))?;

    let mut iter = smap.submit_all::<u32>();
    let Some(Ok(1)) = iter.next().await else {
        bail!("first value lost");
    };
    let Some(Ok(2)) = iter.next().await else {
        bail!("second value lost");
    };
    let Some(Err(err)) = iter.next().await else {
        bail!("the failure was swallowed");
    };
    let failure = err
        .downcast_ref::<RemoteFailure>()
        .expect("failure kind lost");
    assert_eq!(failure.kind, "ValueError");
    assert!(err.to_string().contains("boom"));
    assert!(!failure.backtrace.is_empty());
    Ok(())
}

#[tokio::test]
async fn results_of_other_jobs_are_discarded() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let registry = test_registry();
    let mut smap = Starmap::new(&registry, "leaky", test_config(dir.path()))?;
    smap.add_args((7u32,))?;

    let mut iter = smap.submit_all::<u32>();
    let mut values = Vec::new();
    while let Some(value) = iter.next().await {
        values.push(value?);
    }
    // the forged 999 was dropped with a warning
    assert_eq!(values, vec![42]);
    Ok(())
}
