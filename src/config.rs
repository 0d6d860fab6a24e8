use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Main configuration loaded from analysis_bridge.toml and environment variables
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub log_level: LogLevel,
    pub process: ProcessConfig,
    pub retry: RetryConfig,
    pub cache: CacheConfig,
    pub pipelines: PipelinesConfig,
    pub pool: PoolConfig,
}

/// Tracing filter directive, e.g. "analysis_bridge=debug"
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(transparent)]
pub struct LogLevel(pub String);

impl Default for LogLevel {
    fn default() -> Self {
        Self("analysis_bridge=info".to_string())
    }
}

/// How pipeline processes are launched
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ProcessConfig {
    pub executable: PathBuf,
    /// Working directory of every pipeline process
    pub scripts_root: PathBuf,
    /// Environment variable that receives the scripts root as module search path
    pub module_path_var: String,
    /// Environment variable that forces UTF-8 I/O in the child
    pub encoding_var: String,
    pub stdout_cap_bytes: usize,
    pub stderr_cap_bytes: usize,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            executable: PathBuf::from("python"),
            scripts_root: PathBuf::from("ai"),
            module_path_var: "PYTHONPATH".to_string(),
            encoding_var: "PYTHONIOENCODING".to_string(),
            stdout_cap_bytes: 8 * 1024 * 1024,
            stderr_cap_bytes: 10 * 1024,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Base of the linear backoff: attempt n waits `delay_ms * n`
    pub delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self { delay_ms: 1000 }
    }
}

impl RetryConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CacheConfig {
    pub ttl_secs: u64,
    pub max_entries: usize,
    /// Only feedback texts shorter than this many characters are cached
    pub max_text_chars: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 3600,
            max_entries: 5000,
            max_text_chars: 500,
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

/// Script identity and call budget of one pipeline
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PipelineConfig {
    pub script: String,
    pub max_retries: u32,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HealthCheckConfig {
    pub script: String,
    /// Fixed input token the health script recognises
    pub input: String,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(from = "PipelinesFile")]
pub struct PipelinesConfig {
    pub feedback: PipelineConfig,
    pub coaching: PipelineConfig,
    pub health: HealthCheckConfig,
}

impl Default for PipelinesConfig {
    fn default() -> Self {
        Self {
            feedback: PipelineConfig {
                script: "pipeline1_living_manual.py".to_string(),
                max_retries: 3,
                timeout_secs: 30,
            },
            // Costlier pipeline: fewer retries to bound tail latency
            coaching: PipelineConfig {
                script: "pipeline2_coaching_generation.py".to_string(),
                max_retries: 2,
                timeout_secs: 60,
            },
            health: HealthCheckConfig {
                script: "test_scripts.py".to_string(),
                input: "health_check".to_string(),
                timeout_secs: 10,
            },
        }
    }
}

/// File form of [`PipelinesConfig`]. Each key left out keeps the default of
/// the pipeline it belongs to.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PipelinesFile {
    feedback: PipelinePatch,
    coaching: PipelinePatch,
    health: HealthCheckPatch,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PipelinePatch {
    script: Option<String>,
    max_retries: Option<u32>,
    timeout_secs: Option<u64>,
}

impl PipelinePatch {
    fn apply_to(self, pipeline: &mut PipelineConfig) {
        if let Some(script) = self.script {
            pipeline.script = script;
        }
        if let Some(retries) = self.max_retries {
            pipeline.max_retries = retries;
        }
        if let Some(secs) = self.timeout_secs {
            pipeline.timeout_secs = secs;
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct HealthCheckPatch {
    script: Option<String>,
    input: Option<String>,
    timeout_secs: Option<u64>,
}

impl From<PipelinesFile> for PipelinesConfig {
    fn from(file: PipelinesFile) -> Self {
        let mut config = Self::default();
        file.feedback.apply_to(&mut config.feedback);
        file.coaching.apply_to(&mut config.coaching);
        if let Some(script) = file.health.script {
            config.health.script = script;
        }
        if let Some(input) = file.health.input {
            config.health.input = input;
        }
        if let Some(secs) = file.health.timeout_secs {
            config.health.timeout_secs = secs;
        }
        config
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PoolConfig {
    pub max_workers: usize,
    /// Submissions waiting for a worker beyond this depth are rejected
    pub queue_capacity: usize,
    pub shutdown_grace_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_workers: 20,
            queue_capacity: 100,
            shutdown_grace_secs: 60,
        }
    }
}

impl PoolConfig {
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse::<T>().ok())
}

impl BridgeConfig {
    /// Load configuration from TOML file and environment variables.
    /// Uses ANALYSIS_BRIDGE_CONFIG or defaults to "analysis_bridge.toml".
    pub fn load() -> anyhow::Result<Self> {
        let path = std::env::var("ANALYSIS_BRIDGE_CONFIG")
            .unwrap_or_else(|_| "analysis_bridge.toml".to_string());
        Self::load_from(Path::new(&path))
    }

    pub fn load_from(config_path: &Path) -> anyhow::Result<Self> {
        // BRIDGE_ENV_FILE if set, else ./.env
        if let Ok(env_path) = std::env::var("BRIDGE_ENV_FILE") {
            let _ = dotenvy::from_path(env_path);
        } else {
            let _ = dotenvy::from_path(".env");
        }

        let mut config: BridgeConfig = match std::fs::read_to_string(config_path) {
            Ok(content) => toml::from_str(&content)?,
            Err(_) => {
                tracing::warn!(
                    "Config file {} not found, using defaults",
                    config_path.display()
                );
                Self::default()
            }
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Environment wins over the file for every key it sets.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(exe) = std::env::var("BRIDGE_PYTHON_PATH") {
            self.process.executable = PathBuf::from(exe);
            tracing::debug!("BRIDGE_PYTHON_PATH env override applied");
        }
        if let Ok(root) = std::env::var("BRIDGE_SCRIPTS_PATH") {
            self.process.scripts_root = PathBuf::from(root);
            tracing::debug!("BRIDGE_SCRIPTS_PATH env override applied");
        }
        if let Some(secs) = env_parse("BRIDGE_FEEDBACK_TIMEOUT_SECS") {
            self.pipelines.feedback.timeout_secs = secs;
        }
        if let Some(secs) = env_parse("BRIDGE_COACHING_TIMEOUT_SECS") {
            self.pipelines.coaching.timeout_secs = secs;
        }
        if let Some(delay) = env_parse("BRIDGE_RETRY_DELAY_MS") {
            self.retry.delay_ms = delay;
        }
        if let Some(ttl) = env_parse("BRIDGE_CACHE_TTL_SECS") {
            self.cache.ttl_secs = ttl;
        }
        if let Some(max) = env_parse("BRIDGE_CACHE_MAX") {
            self.cache.max_entries = max;
        }
        if let Some(workers) = env_parse("BRIDGE_MAX_WORKERS") {
            self.pool.max_workers = workers;
        }
        if let Some(depth) = env_parse("BRIDGE_QUEUE_CAPACITY") {
            self.pool.queue_capacity = depth;
        }
        if let Ok(filter) = std::env::var("RUST_LOG") {
            self.log_level = LogLevel(filter);
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        for (name, pipeline) in [
            ("feedback", &self.pipelines.feedback),
            ("coaching", &self.pipelines.coaching),
        ] {
            if pipeline.script.trim().is_empty() {
                anyhow::bail!("pipelines.{name}.script cannot be empty");
            }
            if pipeline.timeout_secs == 0 {
                anyhow::bail!("pipelines.{name}.timeout_secs must be > 0");
            }
            if pipeline.max_retries == 0 {
                anyhow::bail!("pipelines.{name}.max_retries must be >= 1");
            }
        }
        if self.pipelines.health.timeout_secs == 0 {
            anyhow::bail!("pipelines.health.timeout_secs must be > 0");
        }
        if self.cache.max_entries == 0 {
            anyhow::bail!("cache.max_entries must be > 0");
        }
        if self.pool.max_workers == 0 {
            anyhow::bail!("pool.max_workers must be > 0");
        }
        if self.process.stdout_cap_bytes == 0 {
            anyhow::bail!("process.stdout_cap_bytes must be > 0");
        }
        if self.retry.delay_ms > 60_000 {
            tracing::warn!(
                "retry.delay_ms {} is unusually large; backoff grows linearly from it",
                self.retry.delay_ms
            );
        }
        Ok(())
    }
}
