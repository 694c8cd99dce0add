//! Configuration Vault – reads/writes `~/.synapse/config.toml`.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use synapse_runtime::AnalysisBackend;

/// Persisted user configuration stored in `~/.synapse/config.toml`.
#[derive(Clone, Serialize, Deserialize)]
pub struct Config {
    /// Chosen analysis backend.
    #[serde(default)]
    pub analysis_backend: AnalysisBackend,

    /// Active model name (e.g. "llama3", "gpt-4o").
    #[serde(default = "default_model")]
    pub active_model: String,

    /// Base URL of the Ollama (or OpenAI-compatible) endpoint.
    #[serde(default = "default_ollama_url")]
    pub ollama_url: String,

    /// OpenAI-compatible API key (stored as plain text – users should
    /// restrict file permissions on `~/.synapse/config.toml`, which this
    /// module does for them).
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub openai_api_key: String,

    /// SQLite database path for [`synapse_memory::MemoryStore`] and
    /// [`synapse_memory::VectorIndex`].
    #[serde(default = "default_db_path")]
    pub db_path: String,

    /// Embedding model name used when upserting documents into the vector
    /// index.
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,

    /// TCP port the self-hosted Prometheus metrics endpoint listens on.
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,

    /// Worker-pool tuning (concurrency, timeouts, queue depth).
    #[serde(default)]
    pub worker_pool: WorkerPoolSettings,

    /// Event Observer tuning (systemd units watched, paths watched, poll
    /// intervals).
    #[serde(default)]
    pub observer: ObserverSettings,

    /// Affective Self-Regulator tuning (per-pressure-level delays, per-action
    /// cooldowns).
    #[serde(default)]
    pub self_regulator: SelfRegulatorSettings,

    /// Total usable GPU memory (MB) assumed by the rule engine's VLLM
    /// allocation-pressure guard.
    #[serde(default = "default_total_gpu_mb")]
    pub total_gpu_mb: f64,

    /// Id prefixes treated as meta-investigations (investigating the
    /// introspection system itself) and dropped before reaching a worker.
    #[serde(default = "default_meta_prefixes")]
    pub meta_prefixes: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerPoolSettings {
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_investigations: usize,
    #[serde(default = "default_min_delay_ms")]
    pub min_delay_between_investigations_ms: u64,
    #[serde(default = "default_normal_timeout_secs")]
    pub normal_timeout_secs: u64,
    #[serde(default = "default_emergency_timeout_secs")]
    pub emergency_timeout_secs: u64,
    #[serde(default = "default_max_queue_depth")]
    pub max_queue_depth: usize,
}

impl WorkerPoolSettings {
    pub fn min_delay_between_investigations(&self) -> Duration {
        Duration::from_millis(self.min_delay_between_investigations_ms)
    }

    pub fn normal_timeout(&self) -> Duration {
        Duration::from_secs(self.normal_timeout_secs)
    }

    pub fn emergency_timeout(&self) -> Duration {
        Duration::from_secs(self.emergency_timeout_secs)
    }
}

impl Default for WorkerPoolSettings {
    fn default() -> Self {
        Self {
            max_concurrent_investigations: default_max_concurrent(),
            min_delay_between_investigations_ms: default_min_delay_ms(),
            normal_timeout_secs: default_normal_timeout_secs(),
            emergency_timeout_secs: default_emergency_timeout_secs(),
            max_queue_depth: default_max_queue_depth(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObserverSettings {
    /// systemd units watched by [`synapse_runtime::sources::SystemdAuditSource`].
    #[serde(default)]
    pub watched_units: Vec<String>,
    /// Filesystem paths watched by [`synapse_runtime::sources::FileWatcherSource`].
    #[serde(default)]
    pub watched_paths: Vec<String>,
    #[serde(default = "default_metrics_poll_secs")]
    pub metrics_poll_interval_secs: u64,
    /// How often [`synapse_runtime::sources::SystemdAuditSource`] relists
    /// disabled units.
    #[serde(default = "default_systemd_audit_interval_secs")]
    pub systemd_audit_interval_secs: u64,
}

impl Default for ObserverSettings {
    fn default() -> Self {
        Self {
            watched_units: Vec::new(),
            watched_paths: Vec::new(),
            metrics_poll_interval_secs: default_metrics_poll_secs(),
            systemd_audit_interval_secs: default_systemd_audit_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelfRegulatorSettings {
    #[serde(default = "default_action_cooldown_secs")]
    pub action_cooldown_secs: u64,
}

impl SelfRegulatorSettings {
    pub fn action_cooldown(&self) -> Duration {
        Duration::from_secs(self.action_cooldown_secs)
    }
}

impl Default for SelfRegulatorSettings {
    fn default() -> Self {
        Self { action_cooldown_secs: default_action_cooldown_secs() }
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("analysis_backend", &self.analysis_backend)
            .field("active_model", &self.active_model)
            .field("ollama_url", &self.ollama_url)
            .field("openai_api_key", if self.openai_api_key.is_empty() { &"<not set>" } else { &"<redacted>" })
            .field("db_path", &self.db_path)
            .field("embedding_model", &self.embedding_model)
            .field("metrics_port", &self.metrics_port)
            .field("worker_pool", &self.worker_pool)
            .field("observer", &self.observer)
            .field("self_regulator", &self.self_regulator)
            .field("total_gpu_mb", &self.total_gpu_mb)
            .field("meta_prefixes", &self.meta_prefixes)
            .finish()
    }
}

fn default_model() -> String {
    "llama3".to_string()
}
fn default_ollama_url() -> String {
    "http://localhost:11434".to_string()
}
fn default_db_path() -> String {
    "~/.synapse/knowledge.db".to_string()
}
fn default_embedding_model() -> String {
    "nomic-embed-text".to_string()
}
fn default_metrics_port() -> u16 {
    9898
}
fn default_max_concurrent() -> usize {
    4
}
fn default_min_delay_ms() -> u64 {
    500
}
fn default_normal_timeout_secs() -> u64 {
    600
}
fn default_emergency_timeout_secs() -> u64 {
    300
}
fn default_max_queue_depth() -> usize {
    100
}
fn default_metrics_poll_secs() -> u64 {
    30
}
fn default_systemd_audit_interval_secs() -> u64 {
    300
}
fn default_action_cooldown_secs() -> u64 {
    300
}
fn default_total_gpu_mb() -> f64 {
    12288.0
}
fn default_meta_prefixes() -> Vec<String> {
    synapse_kernel::MetaLoopFilter::default_prefixes()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            analysis_backend: AnalysisBackend::default(),
            active_model: default_model(),
            ollama_url: default_ollama_url(),
            openai_api_key: String::new(),
            db_path: default_db_path(),
            embedding_model: default_embedding_model(),
            metrics_port: default_metrics_port(),
            worker_pool: WorkerPoolSettings::default(),
            observer: ObserverSettings::default(),
            self_regulator: SelfRegulatorSettings::default(),
            total_gpu_mb: default_total_gpu_mb(),
            meta_prefixes: default_meta_prefixes(),
        }
    }
}

/// Return the path to `~/.synapse/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME").or_else(|_| std::env::var("USERPROFILE")).unwrap_or_else(|_| ".".to_string()),
    )
}

/// Build the config path relative to the given home directory.
/// Extracted for testability without mutating environment variables.
pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".synapse").join("config.toml")
}

/// Load the config from disk.  Returns `None` if the file does not exist.
pub fn load() -> Result<Option<Config>, String> {
    load_from(&config_path())
}

/// Load the config from a specific path.
pub(crate) fn load_from(path: &PathBuf) -> Result<Option<Config>, String> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path).map_err(|e| format!("Failed to read config at {}: {}", path.display(), e))?;
    let mut cfg: Config = toml::from_str(&raw).map_err(|e| format!("Failed to parse config: {}", e))?;
    apply_env_overrides(&mut cfg);
    Ok(Some(cfg))
}

/// Apply `SYNAPSE_*` environment variable overrides to `cfg`.
///
/// Supported variables:
///
/// | Variable | Config field |
/// |---|---|
/// | `SYNAPSE_OLLAMA_URL` | `ollama_url` |
/// | `SYNAPSE_MODEL` | `active_model` |
/// | `SYNAPSE_DB_PATH` | `db_path` |
/// | `SYNAPSE_METRICS_PORT` | `metrics_port` |
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(v) = std::env::var("SYNAPSE_OLLAMA_URL") {
        cfg.ollama_url = v;
    }
    if let Ok(v) = std::env::var("SYNAPSE_MODEL") {
        cfg.active_model = v;
    }
    if let Ok(v) = std::env::var("SYNAPSE_DB_PATH") {
        cfg.db_path = v;
    }
    if let Ok(v) = std::env::var("SYNAPSE_METRICS_PORT")
        && let Ok(port) = v.parse::<u16>()
    {
        cfg.metrics_port = port;
    }
}

/// Save the config to disk, creating `~/.synapse/` if necessary.
pub fn save(cfg: &Config) -> Result<(), String> {
    save_to(cfg, &config_path())
}

/// Save the config to a specific path.
pub(crate) fn save_to(cfg: &Config, path: &PathBuf) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| format!("Failed to create config directory: {}", e))?;
        // Restrict the config directory to the owner only (rwx------) on Unix.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700))
                .map_err(|e| format!("Failed to set config directory permissions: {}", e))?;
        }
    }
    let raw = toml::to_string_pretty(cfg).map_err(|e| format!("Failed to serialize config: {}", e))?;
    // Write the file with owner-only read/write (rw-------) on Unix.
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| {
                use std::io::Write;
                f.write_all(raw.as_bytes())
            })
            .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw).map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_debug_redacts_api_key() {
        let mut cfg = Config::default();
        cfg.openai_api_key = "sk-super-secret".to_string();
        let debug_str = format!("{:?}", cfg);
        assert!(!debug_str.contains("sk-super-secret"), "api key must not appear in debug output");
        assert!(debug_str.contains("<redacted>"), "debug output must show <redacted> for a set key");
    }

    #[test]
    fn config_debug_shows_not_set_for_empty_key() {
        let cfg = Config::default();
        let debug_str = format!("{:?}", cfg);
        assert!(debug_str.contains("<not set>"), "empty API key must show <not set> in debug output");
    }

    #[cfg(unix)]
    #[test]
    fn config_file_has_restrictive_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());

        let cfg = Config::default();
        save_to(&cfg, &path).expect("save");

        let file_meta = std::fs::metadata(&path).expect("file metadata");
        let file_mode = file_meta.permissions().mode() & 0o777;
        assert_eq!(file_mode, 0o600, "config file must have 0o600 permissions");

        let dir_meta = std::fs::metadata(path.parent().unwrap()).expect("dir metadata");
        let dir_mode = dir_meta.permissions().mode() & 0o777;
        assert_eq!(dir_mode, 0o700, "config directory must have 0o700 permissions");
    }

    #[test]
    fn roundtrip_default_config() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());

        let cfg = Config::default();
        save_to(&cfg, &path).expect("save");

        let loaded = load_from(&path).expect("load ok").expect("some");
        assert_eq!(loaded.active_model, "llama3");
        assert_eq!(loaded.analysis_backend, AnalysisBackend::Ollama);
        assert_eq!(loaded.worker_pool.max_concurrent_investigations, 4);
        assert_eq!(loaded.total_gpu_mb, 12288.0);
        assert!(loaded.meta_prefixes.contains(&"meta.".to_string()));
    }

    #[test]
    fn config_path_points_to_synapse_dir() {
        let p = config_path_for_home("/home/testuser");
        assert!(p.to_string_lossy().contains(".synapse"));
        assert!(p.to_string_lossy().ends_with("config.toml"));
    }

    #[test]
    fn load_from_returns_none_when_missing() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());
        let result = load_from(&path).expect("no error");
        assert!(result.is_none());
    }

    #[test]
    fn apply_env_overrides_changes_ollama_url() {
        // SAFETY: single-threaded test; no data races on env vars.
        unsafe { std::env::set_var("SYNAPSE_OLLAMA_URL", "http://robot-host:11434") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.ollama_url, "http://robot-host:11434");
        unsafe { std::env::remove_var("SYNAPSE_OLLAMA_URL") };
    }

    #[test]
    fn apply_env_overrides_changes_model() {
        // SAFETY: single-threaded test; no data races on env vars.
        unsafe { std::env::set_var("SYNAPSE_MODEL", "gpt-4o") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.active_model, "gpt-4o");
        unsafe { std::env::remove_var("SYNAPSE_MODEL") };
    }

    #[test]
    fn apply_env_overrides_changes_db_path() {
        // SAFETY: single-threaded test; no data races on env vars.
        unsafe { std::env::set_var("SYNAPSE_DB_PATH", "/tmp/custom.db") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.db_path, "/tmp/custom.db");
        unsafe { std::env::remove_var("SYNAPSE_DB_PATH") };
    }

    #[test]
    fn apply_env_overrides_changes_metrics_port() {
        // SAFETY: single-threaded test; no data races on env vars.
        unsafe { std::env::set_var("SYNAPSE_METRICS_PORT", "9999") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.metrics_port, 9999);
        unsafe { std::env::remove_var("SYNAPSE_METRICS_PORT") };
    }

    #[test]
    fn apply_env_overrides_ignores_invalid_metrics_port() {
        // SAFETY: single-threaded test; no data races on env vars.
        unsafe { std::env::set_var("SYNAPSE_METRICS_PORT", "not-a-port") };
        let mut cfg = Config::default();
        let original_port = cfg.metrics_port;
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.metrics_port, original_port);
        unsafe { std::env::remove_var("SYNAPSE_METRICS_PORT") };
    }
}
