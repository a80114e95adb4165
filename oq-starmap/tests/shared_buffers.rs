//! Shared-memory buffer lifecycle: deterministic names, visible to other
//! mappers, gone after `shutdown`. Lives in its own test binary because
//! `shutdown` tears down the process-wide pools.

use std::sync::Arc;

use oq_starmap::config::Config;
use oq_starmap::registry::Registry;
use oq_starmap::shared::SharedArrayView;
use oq_starmap::starmap::Starmap;

#[tokio::test]
async fn shutdown_unlinks_shared_buffers() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let mut config = Config::load(None);
    config.telemetry.data_dir = dir.path().display().to_string();

    let registry = Arc::new(Registry::with_builtins());
    let smap = Starmap::new(&registry, "count", config)?;
    let name = smap.create_shared(8, 1.5)?;
    assert!(name.starts_with("oq-shm-"));

    let view = SharedArrayView::attach(&name)?;
    assert_eq!(view.read(7), 1.5);
    drop(view);

    Starmap::shutdown();
    assert!(SharedArrayView::attach(&name).is_err());
    // a second shutdown is a no-op
    Starmap::shutdown();
    Ok(())
}
