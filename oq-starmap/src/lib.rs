//! The Starmap API
//! ===============
//!
//! A dispatcher for embarrassingly parallel computations: apply a task to
//! a list of argument tuples in parallel and combine the results — the
//! classic MapReduce shape. The letter-count example:
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use oq_starmap::accum::AccumMap;
//! use oq_starmap::config::Config;
//! use oq_starmap::registry::Registry;
//! use oq_starmap::starmap::Starmap;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let registry = Arc::new(Registry::with_builtins());
//! let mut smap = Starmap::new(&registry, "count", Config::load(None))?;
//! smap.add_args(("hello".to_string(),))?;
//! smap.add_args(("world".to_string(),))?;
//! let counts: AccumMap<char, u64> = smap.reduce_counts().await?;
//! assert_eq!(counts.get(&'l'), Some(&3));
//! # Ok(())
//! # }
//! ```
//!
//! The backend is selected by the `DISTRIBUTE` variable or
//! `distribution.oq_distribute`: `no` runs everything in the caller's
//! thread (useful to debug), `processpool` spawns a fixed pool of worker
//! processes, `threadpool` a fixed pool of threads, `remote` cycles over
//! configured worker hosts, and `cluster` delegates to an external
//! client. Whatever the backend, workers push their replies onto a single
//! ingress owned by the dispatcher, which tracks the in-flight set, logs
//! progress percentages, records per-task telemetry into an append-only
//! store, and feeds values to the consumer.
//!
//! Cleaning up at the end is always a good idea, even when the current
//! backend needs none:
//!
//! ```no_run
//! oq_starmap::starmap::Starmap::shutdown();
//! ```

pub mod accum;
pub mod backend;
pub mod config;
pub mod errors;
pub mod ingress;
pub mod memory;
pub mod registry;
pub mod runner;
pub mod shared;
pub mod split;
pub mod starmap;
pub mod telemetry;
pub mod worker;

pub use backend::Backend;
pub use config::Config;
pub use errors::DispatchError;
pub use registry::Registry;
pub use starmap::IterResult;
pub use starmap::Starmap;
