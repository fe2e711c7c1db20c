use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{Result, SyncError};
use crate::link::{same_dir, LinkRecord};

/// Name of the config file inside the global installation root
pub const CONFIG_FILE: &str = "config.toml";

/// Environment variable that overrides `global_dir`
pub const GLOBAL_DIR_ENV: &str = "OPENMEMORY_GLOBAL_DIR";

/// Installation-wide configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Shared installation root (registry, pid file, logs)
    #[serde(default = "default_global_dir")]
    pub global_dir: PathBuf,

    #[serde(default)]
    pub watcher: WatcherConfig,

    #[serde(default)]
    pub validator: ValidatorConfig,

    #[serde(default)]
    pub service: ServiceConfig,
}

/// Project watcher configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatcherConfig {
    /// Directories scanned for link records, in order
    #[serde(default)]
    pub roots: Vec<PathBuf>,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    /// Glob patterns for directories that are never descended into
    #[serde(default = "default_ignore")]
    pub ignore: Vec<String>,
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
    /// Consecutive missing passes before a stale entry becomes removed
    #[serde(default = "default_removal_after")]
    pub removal_after: u32,
    #[serde(default)]
    pub duplicate_policy: DuplicatePolicy,
    #[serde(default = "default_link_file")]
    pub link_file: String,
}

/// Tie-break when two directories declare the same project name
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicatePolicy {
    /// First directory in lexicographic path order wins
    #[default]
    Lexicographic,
    /// The path already in the registry wins, otherwise lexicographic
    PreferRegistered,
}

/// Pre-commit validator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidatorConfig {
    #[serde(default = "default_total_timeout_ms")]
    pub total_timeout_ms: u64,
    #[serde(default = "default_stage_timeout_ms")]
    pub stage_timeout_ms: u64,
    #[serde(default = "default_lookback_hours")]
    pub lookback_hours: u64,
    /// Local support directory the enforcement contract lives in
    #[serde(default = "default_support_dir")]
    pub support_dir: String,
    /// Extra paths (relative to the project) that must exist
    #[serde(default)]
    pub required_paths: Vec<String>,
    /// Staged paths that require a state file update in the same commit
    #[serde(default = "default_trigger_patterns")]
    pub trigger_patterns: Vec<String>,
    /// Designated state/log files; staging any of them satisfies the trigger
    #[serde(default = "default_state_files")]
    pub state_files: Vec<String>,
    #[serde(default = "default_doc_patterns")]
    pub doc_patterns: Vec<String>,
    #[serde(default = "default_generated_patterns")]
    pub generated_patterns: Vec<String>,
    /// Environment variable that downgrades an unreachable service to a warning
    #[serde(default = "default_bypass_env")]
    pub bypass_env: String,
    /// Only this agent's actions count as recent activity; any agent when unset
    #[serde(default)]
    pub agent_name: Option<String>,
}

/// Memory service client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default = "default_user_id")]
    pub user_id: String,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

fn default_global_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".openmemory-global")
}

fn default_interval_secs() -> u64 {
    60
}

fn default_ignore() -> Vec<String> {
    [
        "node_modules",
        ".git",
        "target",
        "venv",
        ".venv",
        "__pycache__",
        "dist",
        "build",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_max_depth() -> usize {
    6
}

fn default_removal_after() -> u32 {
    3
}

fn default_link_file() -> String {
    ".openmemory".to_string()
}

fn default_total_timeout_ms() -> u64 {
    5000
}

fn default_stage_timeout_ms() -> u64 {
    2000
}

/// Ten years; anything longer means "all history" in practice
pub const MAX_LOOKBACK_HOURS: u64 = 24 * 365 * 10;

fn default_lookback_hours() -> u64 {
    24
}

fn default_support_dir() -> String {
    ".ai-agents".to_string()
}

fn default_trigger_patterns() -> Vec<String> {
    ["**/schema.*", "**/models.*", "**/migrations/**", "**/*.sql"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_state_files() -> Vec<String> {
    vec![
        ".ai-agents/project-state.json".to_string(),
        ".ai-agents/session-log.md".to_string(),
    ]
}

fn default_doc_patterns() -> Vec<String> {
    ["**/*.md", "**/*.rst", "**/*.txt", "docs/**"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_generated_patterns() -> Vec<String> {
    [
        ".ai-agents/**",
        "**/*.lock",
        "dist/**",
        "build/**",
        "**/*.min.js",
        "**/generated/**",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_bypass_env() -> String {
    "OPENMEMORY_BYPASS".to_string()
}

fn default_user_id() -> String {
    "ai-agent-system".to_string()
}

fn default_api_key_env() -> String {
    "OPENMEMORY_API_KEY".to_string()
}

fn default_request_timeout_ms() -> u64 {
    3000
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            roots: Vec::new(),
            interval_secs: default_interval_secs(),
            ignore: default_ignore(),
            max_depth: default_max_depth(),
            removal_after: default_removal_after(),
            duplicate_policy: DuplicatePolicy::default(),
            link_file: default_link_file(),
        }
    }
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            total_timeout_ms: default_total_timeout_ms(),
            stage_timeout_ms: default_stage_timeout_ms(),
            lookback_hours: default_lookback_hours(),
            support_dir: default_support_dir(),
            required_paths: Vec::new(),
            trigger_patterns: default_trigger_patterns(),
            state_files: default_state_files(),
            doc_patterns: default_doc_patterns(),
            generated_patterns: default_generated_patterns(),
            bypass_env: default_bypass_env(),
            agent_name: None,
        }
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            user_id: default_user_id(),
            api_key_env: default_api_key_env(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            global_dir: default_global_dir(),
            watcher: WatcherConfig::default(),
            validator: ValidatorConfig::default(),
            service: ServiceConfig::default(),
        }
    }
}

impl WatcherConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }
}

impl ValidatorConfig {
    pub fn total_timeout(&self) -> Duration {
        Duration::from_millis(self.total_timeout_ms)
    }

    pub fn stage_timeout(&self) -> Duration {
        Duration::from_millis(self.stage_timeout_ms)
    }

    /// Activity window, capped at `MAX_LOOKBACK_HOURS`
    pub fn lookback(&self) -> chrono::Duration {
        chrono::Duration::hours(self.lookback_hours.min(MAX_LOOKBACK_HOURS) as i64)
    }
}

impl ServiceConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// API key read from the configured environment variable, if set
    pub fn api_key(&self) -> Option<String> {
        std::env::var(&self.api_key_env)
            .ok()
            .filter(|k| !k.trim().is_empty())
    }
}

impl Config {
    /// Load configuration from TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content =
            std::fs::read_to_string(path).map_err(|e| SyncError::io(path, e))?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| SyncError::config(format!("{}: {}", path.display(), e)))?;
        info!(path = %path.display(), roots = config.watcher.roots.len(), "configuration loaded");
        Ok(config)
    }

    /// Load `<global_dir>/config.toml`, falling back to defaults when it is absent.
    ///
    /// The returned config always points at `global_dir`, whatever the file says.
    pub fn load_or_default(global_dir: &Path) -> Result<Self> {
        let path = global_dir.join(CONFIG_FILE);
        let mut config = if path.is_file() {
            Self::from_file(&path)?
        } else {
            Self::default()
        };
        config.global_dir = global_dir.to_path_buf();
        Ok(config)
    }

    /// Configuration for work inside `project_dir`.
    ///
    /// Without an explicit global dir, the installation named by the project's
    /// link record wins over the environment default.
    pub fn for_project(explicit: Option<&Path>, project_dir: &Path) -> Result<Self> {
        match explicit {
            Some(dir) => Self::load_or_default(dir),
            None => Self::for_project_from(&Self::resolve_global_dir(None), project_dir),
        }
    }

    fn for_project_from(fallback_dir: &Path, project_dir: &Path) -> Result<Self> {
        let fallback = Self::load_or_default(fallback_dir)?;
        match LinkRecord::load(project_dir, &fallback.watcher.link_file) {
            Ok(record) if !same_dir(&record.global_dir, &fallback.global_dir) => {
                debug!(global_dir = %record.global_dir.display(), "using the project's installation");
                Self::load_or_default(&record.global_dir)
            }
            _ => Ok(fallback),
        }
    }

    /// Global dir from an explicit override, the environment, or the default
    pub fn resolve_global_dir(explicit: Option<&Path>) -> PathBuf {
        if let Some(dir) = explicit {
            return dir.to_path_buf();
        }
        match std::env::var_os(GLOBAL_DIR_ENV) {
            Some(dir) if !dir.is_empty() => PathBuf::from(dir),
            _ => default_global_dir(),
        }
    }

    pub fn registry_path(&self) -> PathBuf {
        self.global_dir.join("registry.json")
    }

    pub fn pid_path(&self) -> PathBuf {
        self.global_dir.join("watcher.pid")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.global_dir.join("logs")
    }
}
