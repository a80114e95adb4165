//! Debug single-task mode: with `TASK_NO` set, only the task with that
//! ordinal is ever submitted. Lives in its own test binary because the
//! variable is process-global.

use std::sync::Arc;

use oq_starmap::accum::AccumMap;
use oq_starmap::config::Config;
use oq_starmap::registry::Registry;
use oq_starmap::starmap::Starmap;

#[tokio::test]
async fn only_the_selected_ordinal_runs() -> anyhow::Result<()> {
    std::env::set_var("TASK_NO", "1");
    let dir = tempfile::tempdir()?;
    let mut config = Config::load(None);
    config.telemetry.data_dir = dir.path().display().to_string();

    let registry = Arc::new(Registry::with_builtins());
    let mut smap = Starmap::new(&registry, "count", config)?;
    smap.add_args(("aa".to_string(),))?;
    smap.add_args(("bb".to_string(),))?;
    smap.add_args(("cc".to_string(),))?;

    let counts: AccumMap<char, u64> = smap.reduce_counts().await?;
    assert_eq!(counts.into_iter().collect::<Vec<_>>(), vec![('b', 2)]);

    std::env::remove_var("TASK_NO");
    Ok(())
}
