use config::FileFormat;
use lazy_static_include::*;
use serde_derive::Deserialize;
use serde_derive::Serialize;
use sha2::Digest;
use sha2::Sha256;
use tracing::debug;

lazy_static_include_str! {
    DEFAULT_CONFIG => "src/config/default.toml",
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct Config {
    pub distribution: DistributionConfig,
    pub memory: MemoryConfig,
    pub ingress: IngressConfig,
    pub task: TaskConfig,
    pub telemetry: TelemetryConfig,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct DistributionConfig {
    /// Backend selection; overridden by the `DISTRIBUTE` variable.
    pub oq_distribute: String,

    /// Pool size; 0 means "use the visible cores".
    pub num_cores: usize,

    /// Compress packed arguments and values.
    pub compress: bool,

    /// Remote worker addresses, `host:port`.
    pub hosts: Vec<String>,

    /// Executable spawned as a process-pool child; empty means the
    /// current executable.
    pub worker_executable: String,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct MemoryConfig {
    /// Warn once above this percentage of system RAM.
    pub soft_mem_limit: f64,

    /// Fail the task above this percentage of system RAM.
    pub hard_mem_limit: f64,

    pub pmap_max_mb: f64,
    pub pmap_max_gb: f64,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct IngressConfig {
    /// Address remote workers push replies to; empty means the local
    /// hostname.
    pub receiver_host: String,

    /// Inclusive port range the ingress may bind, e.g. "1907-1927".
    pub receiver_ports: String,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct TaskConfig {
    /// Seconds after which a split task spawns subtasks for its remaining
    /// shards.
    pub duration: f64,

    pub outs_per_task: u32,

    /// Escalate the post-run slow-task report into an error.
    pub strict_slow_tasks: bool,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct TelemetryConfig {
    /// Directory for autogenerated telemetry stores; overridden by the
    /// `DATA` variable; empty means the system temp directory.
    pub data_dir: String,
}

impl Config {
    pub fn load(local_file: Option<String>) -> Config {
        let mut config_builder = config::Config::builder();
        config_builder = config_builder
            .add_source(config::File::from_str(&DEFAULT_CONFIG, FileFormat::Toml));

        if let Some(local_file) = local_file {
            debug!("Loading local configuration from {}", local_file);
            config_builder = config_builder.add_source(config::File::with_name(&local_file));
        }

        let config_builder = config_builder
            .add_source(
                config::Environment::default()
                    .separator("__")
                    .ignore_empty(true),
            )
            .build()
            .expect("Could not load configuration");

        config_builder
            .try_deserialize()
            .expect("Could not deserialize configuration")
    }

    pub fn validate(&self) {
        self.memory.validate();
        self.ingress.validate();
        assert!(
            self.task.outs_per_task > 0,
            "outs_per_task must be positive"
        );
    }

    /// Fingerprint of the coordination fields master and workers must
    /// agree on.
    pub fn digest(&self) -> String {
        let coordination = (
            &self.ingress.receiver_host,
            self.memory.soft_mem_limit.to_bits(),
            self.memory.hard_mem_limit.to_bits(),
        );
        let encoded = serde_json::to_vec(&coordination).expect("tuple of plain values");
        let mut hasher = Sha256::new();
        hasher.update(&encoded);
        hex::encode(hasher.finalize())
    }

    /// Directory for autogenerated telemetry stores.
    pub fn data_dir(&self) -> std::path::PathBuf {
        if let Ok(dir) = std::env::var("DATA") {
            if !dir.is_empty() {
                return dir.into();
            }
        }
        if self.telemetry.data_dir.is_empty() {
            std::env::temp_dir()
        } else {
            self.telemetry.data_dir.clone().into()
        }
    }

    /// Debug mode: run only the task with this ordinal.
    pub fn debug_task_no(&self) -> Option<u32> {
        std::env::var("TASK_NO").ok().and_then(|raw| raw.parse().ok())
    }
}

impl MemoryConfig {
    pub fn validate(&self) {
        assert!(
            self.soft_mem_limit <= self.hard_mem_limit,
            "soft_mem_limit must not exceed hard_mem_limit"
        );
        assert!(
            self.hard_mem_limit <= 100.0,
            "hard_mem_limit is a percentage of system RAM"
        );
    }
}

impl IngressConfig {
    pub fn validate(&self) {
        self.port_range();
    }

    /// Parses `receiver_ports` into an inclusive range.
    pub fn port_range(&self) -> (u16, u16) {
        let (lo, hi) = self
            .receiver_ports
            .split_once('-')
            .unwrap_or((self.receiver_ports.as_str(), self.receiver_ports.as_str()));
        let lo: u16 = lo.trim().parse().expect("invalid receiver_ports");
        let hi: u16 = hi.trim().parse().expect("invalid receiver_ports");
        assert!(lo <= hi, "receiver_ports range is reversed");
        (lo, hi)
    }
}

#[cfg(test)]
mod tests {
    use super::Config;

    #[test]
    fn defaults_load_and_validate() {
        let config = Config::load(None);
        config.validate();
        assert_eq!(config.ingress.port_range(), (1907, 1927));
        assert!(!config.digest().is_empty());
    }

    #[test]
    fn digest_tracks_coordination_fields_only() {
        let base = Config::load(None);
        let mut same = base.clone();
        same.distribution.worker_executable = "/usr/bin/oq-worker".to_string();
        assert_eq!(base.digest(), same.digest());

        let mut other = base.clone();
        other.ingress.receiver_host = "node1".to_string();
        assert_ne!(base.digest(), other.digest());
    }
}
