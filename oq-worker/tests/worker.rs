//! End-to-end scenarios against the real worker binary: the process pool
//! spawns it as children, the remote backend talks to a serving instance.

use std::path::Path;
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use oq_starmap::accum::AccumMap;
use oq_starmap::config::Config;
use oq_starmap::registry::Registry;
use oq_starmap::starmap::Starmap;
use oq_starmap::Backend;

fn worker_exe() -> &'static str {
    env!("CARGO_BIN_EXE_oq-worker")
}

fn test_config(dir: &Path) -> Config {
    let mut config = Config::load(None);
    config.telemetry.data_dir = dir.display().to_string();
    config
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

#[tokio::test]
async fn letter_count_processpool() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let registry = Arc::new(Registry::with_builtins());
    let mut config = test_config(dir.path());
    config.distribution.worker_executable = worker_exe().to_string();

    let mut smap = Starmap::new(&registry, "count", config)?
        .with_distribute(Backend::ProcessPool)
        .with_num_cores(2);
    smap.add_args(("hello".to_string(),))?;
    smap.add_args(("world".to_string(),))?;

    let counts: AccumMap<char, u64> = smap.reduce_counts().await?;
    assert_eq!(counts.into_iter().collect::<Vec<_>>(), expected_hello_world());

    Starmap::shutdown();
    Starmap::shutdown();
    Ok(())
}

#[tokio::test]
async fn letter_count_remote() -> anyhow::Result<()> {
    let listen = "127.0.0.1:19939";
    let mut worker = Command::new(worker_exe())
        .arg("--listen")
        .arg(listen)
        .arg("--prometheus-port")
        .arg("0")
        // the worker must agree with the master's config fingerprint
        .env("INGRESS__RECEIVER_HOST", "127.0.0.1")
        .spawn()?;
    // give the worker a moment to bind its feed
    tokio::time::sleep(Duration::from_millis(500)).await;

    let dir = tempfile::tempdir()?;
    let registry = Arc::new(Registry::with_builtins());
    let mut config = test_config(dir.path());
    config.distribution.hosts = vec![listen.to_string()];
    config.ingress.receiver_host = "127.0.0.1".to_string();

    let mut smap =
        Starmap::new(&registry, "count", config)?.with_distribute(Backend::Remote);
    smap.add_args(("hello".to_string(),))?;
    smap.add_args(("world".to_string(),))?;

    let counts: AccumMap<char, u64> = smap.reduce_counts().await?;
    assert_eq!(counts.into_iter().collect::<Vec<_>>(), expected_hello_world());

    worker.kill()?;
    worker.wait()?;
    Ok(())
}
