use std::path::{Path, PathBuf};
use std::time::Duration;

use jsonschema::{validator_for, Validator};
use once_cell::sync::Lazy;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::policy::PolicyValidator;
use crate::units::{GIB, MIB};

pub const ENV_CONFIG: &str = "SEEDKEEPER_CONFIG";
pub const ENV_STATE_DIR: &str = "SEEDKEEPER_STATE_DIR";
pub const ENV_DOWNLOAD_DIR: &str = "SEEDKEEPER_DOWNLOAD_DIR";
pub const ENV_MAX_TOTAL_BYTES: &str = "SEEDKEEPER_MAX_TOTAL_BYTES";
pub const ENV_PROBE_TIMEOUT_SECS: &str = "SEEDKEEPER_PROBE_TIMEOUT_SECS";

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {path}: {message}")]
    Parse { path: PathBuf, message: String },
    #[error("{path} does not match the config schema: {}", errors.join(", "))]
    Schema { path: PathBuf, errors: Vec<String> },
    #[error("invalid value for {key}: {value}")]
    Env { key: &'static str, value: String },
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(default)]
pub struct PathsConfig {
    pub state_dir: PathBuf,
    /// Fallback destination when content is neither a film nor a series.
    pub download_dir: PathBuf,
    pub movies_dir: Option<PathBuf>,
    pub series_dir: Option<PathBuf>,
    /// Active-transfer file; defaults to `active_downloads.json` in `state_dir`.
    pub persistence_file: Option<PathBuf>,
    /// Where fetched descriptor files are kept until their transfer ends.
    pub spool_dir: Option<PathBuf>,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from("./state"),
            download_dir: PathBuf::from("./downloads"),
            movies_dir: None,
            series_dir: None,
            persistence_file: None,
            spool_dir: None,
        }
    }
}

impl PathsConfig {
    pub fn persistence_path(&self) -> PathBuf {
        self.persistence_file
            .clone()
            .unwrap_or_else(|| self.state_dir.join("active_downloads.json"))
    }

    pub fn spool_path(&self) -> PathBuf {
        self.spool_dir
            .clone()
            .unwrap_or_else(|| self.state_dir.join("descriptors"))
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(default)]
pub struct PolicyConfig {
    pub max_total_bytes: u64,
    /// Extensions accepted for substantial files; case and leading dot are ignored.
    pub allowed_extensions: Vec<String>,
    pub substantial_floor_bytes: u64,
    pub substantial_percent: u8,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            max_total_bytes: 50 * GIB,
            allowed_extensions: [".mkv", ".mp4", ".avi", ".mov", ".m4v", ".webm"]
                .into_iter()
                .map(str::to_string)
                .collect(),
            substantial_floor_bytes: 10 * MIB,
            substantial_percent: 1,
        }
    }
}

impl PolicyConfig {
    pub fn validator(&self) -> PolicyValidator {
        PolicyValidator::new(self.max_total_bytes, &self.allowed_extensions)
            .with_substantial(self.substantial_floor_bytes, self.substantial_percent)
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(default)]
pub struct ProbeConfig {
    /// Metadata deadline for submitted transfers.
    pub timeout_secs: u64,
    /// Metadata deadline for dry-run inspection.
    pub quick_timeout_secs: u64,
    pub poll_interval_ms: u64,
    pub heartbeat_interval_ms: u64,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 120,
            quick_timeout_secs: 30,
            poll_interval_ms: 1000,
            heartbeat_interval_ms: 5000,
        }
    }
}

impl ProbeConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn quick_timeout(&self) -> Duration {
        Duration::from_secs(self.quick_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.clamp(1, 1000))
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms.max(1))
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(default)]
pub struct TransferConfig {
    pub status_interval_ms: u64,
    /// Minimum spacing of caller-visible progress updates.
    pub notify_min_interval_ms: u64,
    pub finalize_grace_ms: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            status_interval_ms: 5000,
            notify_min_interval_ms: 5000,
            finalize_grace_ms: 1000,
        }
    }
}

impl TransferConfig {
    pub fn status_interval(&self) -> Duration {
        Duration::from_millis(self.status_interval_ms.max(1))
    }

    pub fn notify_min_interval(&self) -> Duration {
        Duration::from_millis(self.notify_min_interval_ms)
    }

    pub fn finalize_grace(&self) -> Duration {
        Duration::from_millis(self.finalize_grace_ms)
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(default)]
pub struct FetchConfig {
    pub timeout_secs: u64,
    pub max_descriptor_bytes: u64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            max_descriptor_bytes: 10 * MIB,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(default)]
pub struct ShutdownConfig {
    /// Seconds to wait for transfers to drain; 0 waits without bound.
    pub grace_secs: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self { grace_secs: 30 }
    }
}

impl ShutdownConfig {
    pub fn grace(&self) -> Option<Duration> {
        (self.grace_secs > 0).then(|| Duration::from_secs(self.grace_secs))
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(default)]
pub struct LibraryConfig {
    /// Webhook that asks the media library to rescan after a completed transfer.
    pub refresh_url: Option<String>,
    pub auth_token: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(default)]
pub struct TitlesConfig {
    /// Replace the queued display name with the resolved content name.
    pub rename_on_redirect: bool,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(default)]
pub struct SupervisorConfig {
    pub paths: PathsConfig,
    pub policy: PolicyConfig,
    pub probe: ProbeConfig,
    pub transfer: TransferConfig,
    pub fetch: FetchConfig,
    pub shutdown: ShutdownConfig,
    pub library: LibraryConfig,
    pub titles: TitlesConfig,
}

static CONFIG_SCHEMA: Lazy<Validator> = Lazy::new(|| {
    let schema_value = config_schema_json();
    validator_for(&schema_value).expect("valid schema")
});

/// Returns the JSON schema describing the configuration structure.
///
/// # Panics
///
/// Panics if schema generation fails; this indicates a programming error.
pub fn config_schema_json() -> serde_json::Value {
    let schema = schemars::schema_for!(SupervisorConfig);
    serde_json::to_value(&schema).expect("schema json")
}

pub fn parse_config(path: &Path, content: &str) -> Result<SupervisorConfig, ConfigError> {
    let parse_err = |message: String| ConfigError::Parse {
        path: path.to_path_buf(),
        message,
    };
    let raw: toml::Value = toml::from_str(content).map_err(|e| parse_err(e.to_string()))?;
    let json_value = serde_json::to_value(&raw).map_err(|e| parse_err(e.to_string()))?;
    let errors: Vec<_> = CONFIG_SCHEMA
        .iter_errors(&json_value)
        .map(|e| e.to_string())
        .collect();
    if !errors.is_empty() {
        return Err(ConfigError::Schema {
            path: path.to_path_buf(),
            errors,
        });
    }
    toml::from_str(content).map_err(|e| parse_err(e.to_string()))
}

pub fn load_config(path: &Path) -> Result<SupervisorConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    parse_config(path, &content)
}

/// Load from `explicit`, else `SEEDKEEPER_CONFIG`, else defaults; then apply
/// environment overrides.
pub fn resolve_config(explicit: Option<&Path>) -> Result<SupervisorConfig, ConfigError> {
    let from_env = std::env::var_os(ENV_CONFIG).map(PathBuf::from);
    let mut cfg = match explicit.map(Path::to_path_buf).or(from_env) {
        Some(path) => load_config(&path)?,
        None => SupervisorConfig::default(),
    };
    apply_env_overrides(&mut cfg)?;
    Ok(cfg)
}

pub fn apply_env_overrides(cfg: &mut SupervisorConfig) -> Result<(), ConfigError> {
    if let Some(dir) = env_nonempty(ENV_STATE_DIR) {
        cfg.paths.state_dir = PathBuf::from(dir);
    }
    if let Some(dir) = env_nonempty(ENV_DOWNLOAD_DIR) {
        cfg.paths.download_dir = PathBuf::from(dir);
    }
    if let Some(value) = env_nonempty(ENV_MAX_TOTAL_BYTES) {
        cfg.policy.max_total_bytes = parse_env_u64(ENV_MAX_TOTAL_BYTES, value)?;
    }
    if let Some(value) = env_nonempty(ENV_PROBE_TIMEOUT_SECS) {
        cfg.probe.timeout_secs = parse_env_u64(ENV_PROBE_TIMEOUT_SECS, value)?;
    }
    Ok(())
}

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_env_u64(key: &'static str, value: String) -> Result<u64, ConfigError> {
    value
        .parse()
        .map_err(|_| ConfigError::Env { key, value })
}
