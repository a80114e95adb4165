//! Resident-memory probing and the soft/hard admission checks.

use sysinfo::System;

use crate::config::MemoryConfig;
use crate::errors::DispatchError;

pub use oq_messages::monitor::memory_rss;

/// Percentage of system RAM currently in use.
pub fn used_memory_percent() -> f64 {
    let mut system = System::new();
    system.refresh_memory();
    let total = system.total_memory();
    if total == 0 {
        return 0.0;
    }
    100.0 * system.used_memory() as f64 / total as f64
}

/// Checks memory usage against the configured limits.
///
/// Crossing the hard limit is an error; crossing the soft limit returns a
/// warning message for the caller to surface once.
pub fn check_mem_usage(memory: &MemoryConfig) -> Result<Option<String>, DispatchError> {
    let used_percent = used_memory_percent();
    if used_percent > memory.hard_mem_limit {
        return Err(DispatchError::HardMemoryLimit {
            used_percent,
            hard_percent: memory.hard_mem_limit,
        });
    }
    if used_percent > memory.soft_mem_limit {
        let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
        return Ok(Some(format!(
            "using over {used_percent:.0}% of the memory in {host}"
        )));
    }
    Ok(None)
}

/// Total resident memory of the given processes, in bytes.
pub fn memory_rss_sum(pids: &[u32]) -> u64 {
    pids.iter().map(|pid| memory_rss(*pid)).sum()
}

#[cfg(test)]
mod tests {
    use super::check_mem_usage;
    use super::used_memory_percent;
    use crate::config::MemoryConfig;

    #[test]
    fn percent_is_sane() {
        let used = used_memory_percent();
        assert!((0.0..=100.0).contains(&used));
    }

    #[test]
    fn limits_are_enforced() {
        let generous = MemoryConfig {
            soft_mem_limit: 100.0,
            hard_mem_limit: 100.0,
            pmap_max_mb: 0.0,
            pmap_max_gb: 1.0,
        };
        assert!(check_mem_usage(&generous).unwrap().is_none());

        let tiny = MemoryConfig {
            soft_mem_limit: 0.0,
            hard_mem_limit: 0.0,
            pmap_max_mb: 0.0,
            pmap_max_gb: 1.0,
        };
        assert!(check_mem_usage(&tiny).is_err());
    }
}
