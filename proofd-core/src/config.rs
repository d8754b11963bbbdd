//! Configuration for the proof-session manager.

use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Largest timeout accepted anywhere in `[deadline]`, in seconds.
pub const MAX_TIMEOUT_SECONDS: f64 = 86_400.0;

/// Top-level daemon configuration, loaded from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub deadline: DeadlineConfig,
    #[serde(default)]
    pub scratch: ScratchConfig,
    #[serde(default)]
    pub workers: WorkerConfig,
    #[serde(default)]
    pub circuits: CircuitsConfig,
    #[serde(default)]
    pub prover: ProverConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DaemonConfig {
    /// Maximum number of requests handled concurrently by the daemon loop.
    /// Requests beyond this wait for a free slot before being dispatched.
    #[serde(default = "DaemonConfig::default_max_concurrent_requests")]
    pub max_concurrent_requests: usize,
}

impl DaemonConfig {
    fn default_max_concurrent_requests() -> usize {
        256
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            max_concurrent_requests: Self::default_max_concurrent_requests(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// Maximum number of loaded circuits kept in memory.
    #[serde(default = "CacheConfig::default_cache_capacity")]
    pub cache_capacity: usize,
}

impl CacheConfig {
    fn default_cache_capacity() -> usize {
        64
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_capacity: Self::default_cache_capacity(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeadlineConfig {
    /// Total response budget (arrival → response).
    #[serde(default = "DeadlineConfig::default_circuit_timeout_seconds")]
    pub circuit_timeout_seconds: f64,
    /// Budget from arrival until proving starts.
    #[serde(default = "DeadlineConfig::default_admission_timeout_seconds")]
    pub admission_timeout_seconds: f64,
    /// Per-circuit response budgets, overriding both the global value and
    /// the circuit's own settings.
    #[serde(default)]
    pub circuit_overrides: HashMap<String, f64>,
}

impl DeadlineConfig {
    fn default_circuit_timeout_seconds() -> f64 {
        45.0
    }
    fn default_admission_timeout_seconds() -> f64 {
        5.0
    }

    pub fn response_budget(&self) -> Duration {
        secs(self.circuit_timeout_seconds)
    }

    pub fn admission_budget(&self) -> Duration {
        secs(self.admission_timeout_seconds)
    }

    pub fn override_for(&self, circuit_id: &str) -> Option<Duration> {
        self.circuit_overrides.get(circuit_id).map(|s| secs(*s))
    }
}

impl Default for DeadlineConfig {
    fn default() -> Self {
        Self {
            circuit_timeout_seconds: Self::default_circuit_timeout_seconds(),
            admission_timeout_seconds: Self::default_admission_timeout_seconds(),
            circuit_overrides: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScratchConfig {
    /// Explicit scratch root. When unset, `/dev/shm` is used if it exists and
    /// has at least `min_free_space` available, else the system temp dir.
    #[serde(default)]
    pub scratch_root_path: Option<PathBuf>,
    /// Free space required to pick the memory-backed location (e.g. "256MiB").
    #[serde(default = "ScratchConfig::default_min_free_space")]
    pub min_free_space: String,
    /// Remove `proofd-*` leftovers from a previous run at startup.
    #[serde(default = "ScratchConfig::default_sweep_on_start")]
    pub sweep_on_start: bool,
}

impl ScratchConfig {
    fn default_min_free_space() -> String {
        "256MiB".to_string()
    }
    fn default_sweep_on_start() -> bool {
        true
    }

    pub fn min_free_space_bytes(&self) -> u64 {
        parse_size(&self.min_free_space)
    }
}

impl Default for ScratchConfig {
    fn default() -> Self {
        Self {
            scratch_root_path: None,
            min_free_space: Self::default_min_free_space(),
            sweep_on_start: Self::default_sweep_on_start(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    /// Number of proof workers. 0 = auto-detect (all CPUs).
    #[serde(default)]
    pub worker_pool_size: usize,
    /// Replace a worker after this many completed tasks.
    #[serde(default = "WorkerConfig::default_recycle_after")]
    pub worker_recycle_after_n_tasks: u32,
}

impl WorkerConfig {
    fn default_recycle_after() -> u32 {
        10
    }

    /// Resolved pool size.
    pub fn pool_size(&self) -> usize {
        if self.worker_pool_size > 0 {
            self.worker_pool_size
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_pool_size: 0,
            worker_recycle_after_n_tasks: Self::default_recycle_after(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CircuitsConfig {
    /// Directory containing `model_<id>/` circuit directories.
    #[serde(default = "CircuitsConfig::default_dir")]
    pub dir: PathBuf,
    /// Circuits to load at startup (e.g. ["age_v1"]).
    #[serde(default)]
    pub preload: Vec<String>,
    /// Circuit ids that are never served.
    #[serde(default)]
    pub ignored: Vec<String>,
}

impl CircuitsConfig {
    fn default_dir() -> PathBuf {
        PathBuf::from("/var/lib/proofd/circuits")
    }
}

impl Default for CircuitsConfig {
    fn default() -> Self {
        Self {
            dir: Self::default_dir(),
            preload: vec![],
            ignored: vec![],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProverConfig {
    /// External prover binary invoked per proof.
    #[serde(default = "ProverConfig::default_command")]
    pub command: PathBuf,
    /// Arguments placed before the step name, e.g. a script path when
    /// `command` is an interpreter.
    #[serde(default)]
    pub leading_args: Vec<String>,
    /// OOM score applied to prover children so the kernel picks them before
    /// the daemon. Ignored off Linux.
    #[serde(default = "ProverConfig::default_oom_score_adj")]
    pub oom_score_adj: i16,
}

impl ProverConfig {
    fn default_command() -> PathBuf {
        PathBuf::from("ezkl")
    }
    fn default_oom_score_adj() -> i16 {
        900
    }
}

impl Default for ProverConfig {
    fn default() -> Self {
        Self {
            command: Self::default_command(),
            leading_args: vec![],
            oom_score_adj: Self::default_oom_score_adj(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "LoggingConfig::default_level")]
    pub level: String,
    /// "json" for structured output, anything else for plain text.
    #[serde(default)]
    pub format: Option<String>,
}

impl LoggingConfig {
    fn default_level() -> String {
        "info".to_string()
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
            format: None,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &std::path::Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would make every request fail.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.cache.cache_capacity == 0 {
            anyhow::bail!("cache.cache_capacity must be at least 1");
        }
        if self.workers.worker_recycle_after_n_tasks == 0 {
            anyhow::bail!("workers.worker_recycle_after_n_tasks must be at least 1");
        }
        check_timeout("deadline.admission_timeout_seconds", self.deadline.admission_timeout_seconds)?;
        check_timeout("deadline.circuit_timeout_seconds", self.deadline.circuit_timeout_seconds)?;
        for (circuit_id, seconds) in &self.deadline.circuit_overrides {
            check_timeout(&format!("deadline.circuit_overrides.{}", circuit_id), *seconds)?;
        }
        if self.deadline.circuit_timeout_seconds < self.deadline.admission_timeout_seconds {
            anyhow::bail!(
                "deadline.circuit_timeout_seconds ({}) is shorter than the admission budget ({})",
                self.deadline.circuit_timeout_seconds,
                self.deadline.admission_timeout_seconds
            );
        }
        Ok(())
    }
}

fn check_timeout(key: &str, seconds: f64) -> anyhow::Result<()> {
    if !seconds.is_finite() || seconds <= 0.0 || seconds > MAX_TIMEOUT_SECONDS {
        anyhow::bail!(
            "{} must be a positive number of seconds no larger than {} (got {})",
            key,
            MAX_TIMEOUT_SECONDS,
            seconds
        );
    }
    Duration::try_from_secs_f64(seconds)
        .map_err(|e| anyhow::anyhow!("{} is not a valid duration: {}", key, e))?;
    Ok(())
}

/// Out-of-range values are clamped so an unvalidated config can never panic
/// here; `validate` is what rejects them.
fn secs(s: f64) -> Duration {
    let clamped = if s.is_nan() { 0.0 } else { s.clamp(0.0, MAX_TIMEOUT_SECONDS) };
    Duration::try_from_secs_f64(clamped).unwrap_or(Duration::ZERO)
}

/// Parse a human-readable size string like "256MiB" or "2GiB" into bytes.
pub fn parse_size(s: &str) -> u64 {
    let s = s.trim();
    if let Some(n) = s.strip_suffix("GiB") {
        n.trim().parse::<u64>().unwrap_or(0) * 1024 * 1024 * 1024
    } else if let Some(n) = s.strip_suffix("MiB") {
        n.trim().parse::<u64>().unwrap_or(0) * 1024 * 1024
    } else if let Some(n) = s.strip_suffix("KiB") {
        n.trim().parse::<u64>().unwrap_or(0) * 1024
    } else if let Some(n) = s.strip_suffix("GB") {
        n.trim().parse::<u64>().unwrap_or(0) * 1_000_000_000
    } else if let Some(n) = s.strip_suffix("MB") {
        n.trim().parse::<u64>().unwrap_or(0) * 1_000_000
    } else {
        // Assume bytes
        s.parse::<u64>().unwrap_or(0)
    }
}
