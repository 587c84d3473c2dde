//! Configuration for ritual.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (RITUAL_HOME, RITUAL_PRIMARY_TOKEN,
//!    RITUAL_SECONDARY_TOKEN, RITUAL_REGISTRY_TOKEN)
//! 2. Config file (.ritual/config.yaml)
//! 3. Defaults (~/.ritual)
//!
//! Config file discovery:
//! - Searches current directory and parents for .ritual/config.yaml
//! - `paths.home` is relative to the .ritual/ directory, other paths are
//!   relative to home

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::core::orchestrator::OrchestratorConfig;
use crate::core::retry::RetryPolicy;
use crate::domain::RitualKind;
use crate::signatures::SignaturePolicy;

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub signatures: SignaturePolicy,
    #[serde(default)]
    pub event_log: EventLogConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub watcher: WatcherSettings,
    #[serde(default)]
    pub rituals: Vec<RitualSchedule>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// Engine state directory (relative to .ritual/)
    pub home: Option<String>,
    /// Where artifacts are read from (relative to home)
    pub artifacts: Option<String>,
    /// Snapshot store
    #[serde(default)]
    pub state: StateStoreKind,
}

/// Where snapshots are persisted
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateStoreKind {
    #[default]
    Sqlite,
    File,
    Memory,
}

/// One storage provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ProviderConfig {
    /// Remote pinning service
    Http {
        name: String,
        upload_url: String,
        gateway_url: String,
        #[serde(default)]
        pin_url: Option<String>,
        #[serde(default)]
        token: Option<String>,
        #[serde(default)]
        timeout_secs: Option<u64>,
    },
    /// Content-addressed directory
    Local { name: String, root: String },
}

impl ProviderConfig {
    pub fn name(&self) -> &str {
        match self {
            Self::Http { name, .. } | Self::Local { name, .. } => name,
        }
    }

    fn with_token(self, env_token: Option<String>) -> Self {
        match (self, env_token) {
            (Self::Http { name, upload_url, gateway_url, pin_url, timeout_secs, .. }, Some(token)) => Self::Http {
                name,
                upload_url,
                gateway_url,
                pin_url,
                token: Some(token),
                timeout_secs,
            },
            (provider, _) => provider,
        }
    }

    fn resolve_root(self, home: &Path) -> Self {
        match self {
            Self::Local { name, root } => Self::Local {
                root: resolve_path(home, &root).to_string_lossy().into_owned(),
                name,
            },
            other => other,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_primary")]
    pub primary: ProviderConfig,
    #[serde(default)]
    pub secondary: Option<ProviderConfig>,
    /// Primary attempts and backoff
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Timeout for a single provider call
    #[serde(default = "default_attempt_timeout")]
    pub attempt_timeout_secs: u64,
}

fn default_primary() -> ProviderConfig {
    ProviderConfig::Local {
        name: "local".to_string(),
        root: "objects".to_string(),
    }
}

fn default_attempt_timeout() -> u64 {
    30
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            primary: default_primary(),
            secondary: None,
            retry: RetryPolicy::default(),
            attempt_timeout_secs: default_attempt_timeout(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct EventLogConfig {
    #[serde(default = "default_hot_limit")]
    pub hot_limit: usize,
    #[serde(default = "default_retention_days")]
    pub retention_days: i64,
    /// Attempts per event log write before degrading
    #[serde(default = "default_log_attempts")]
    pub write_attempts: u32,
}

fn default_hot_limit() -> usize {
    1000
}
fn default_retention_days() -> i64 {
    7
}
fn default_log_attempts() -> u32 {
    3
}

impl Default for EventLogConfig {
    fn default() -> Self {
        Self {
            hot_limit: default_hot_limit(),
            retention_days: default_retention_days(),
            write_attempts: default_log_attempts(),
        }
    }
}

/// Completion notification target.
///
/// Without an endpoint, completions are appended to `completions.jsonl` in
/// the home directory.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
pub struct RegistryConfig {
    pub endpoint: Option<String>,
    pub token: Option<String>,
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct WatcherSettings {
    #[serde(default)]
    pub enabled: bool,
    /// Glob patterns matched against file names
    #[serde(default = "default_patterns")]
    pub patterns: Vec<String>,
    /// Seconds a file must stay unchanged before it is submitted
    #[serde(default = "default_stability")]
    pub stability_secs: u64,
}

fn default_patterns() -> Vec<String> {
    vec!["*".to_string()]
}
fn default_stability() -> u64 {
    2
}

impl Default for WatcherSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            patterns: default_patterns(),
            stability_secs: default_stability(),
        }
    }
}

/// Interval schedule for one ritual
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RitualSchedule {
    pub ritual: RitualKind,
    pub every_secs: u64,
}

fn default_rituals() -> Vec<RitualSchedule> {
    vec![
        RitualSchedule { ritual: RitualKind::Reconcile, every_secs: 900 },
        RitualSchedule { ritual: RitualKind::Pin, every_secs: 1800 },
        RitualSchedule { ritual: RitualKind::ExpireSignatures, every_secs: 3600 },
        RitualSchedule { ritual: RitualKind::ArchiveEvents, every_secs: 3600 },
    ]
}

/// Resolved configuration with absolute paths and env overrides applied
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// Absolute path to ritual home (engine state)
    pub home: PathBuf,
    /// Directory relative artifact paths resolve against
    pub artifacts_dir: PathBuf,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    pub state_store: StateStoreKind,
    pub orchestrator: OrchestratorConfig,
    pub storage: StorageConfig,
    pub signatures: SignaturePolicy,
    pub event_log: EventLogConfig,
    pub registry: RegistryConfig,
    pub watcher: WatcherSettings,
    pub rituals: Vec<RitualSchedule>,
}

impl ResolvedConfig {
    /// Directory holding events.jsonl and archive.jsonl
    pub fn events_dir(&self) -> PathBuf {
        self.home.join("events")
    }

    /// Snapshot location for file and sqlite stores
    pub fn state_path(&self) -> PathBuf {
        match self.state_store {
            StateStoreKind::File => self.home.join("state.json"),
            StateStoreKind::Sqlite | StateStoreKind::Memory => self.home.join("state.db"),
        }
    }

    /// Local completions file used when no registry endpoint is set
    pub fn completions_path(&self) -> PathBuf {
        self.home.join("completions.jsonl")
    }
}

/// Find config file by searching `start` and its parents
fn find_config_file(start: &Path) -> Option<PathBuf> {
    let mut current = start.to_path_buf();

    loop {
        let config_path = current.join(".ritual").join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content).with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to `base`
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path).canonicalize().unwrap_or_else(|_| base.join(path_str))
    }
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

/// Load configuration, searching for a config file from `start`
fn load_config_from(start: &Path) -> Result<ResolvedConfig> {
    let default_home = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(".ritual");

    let config_file = find_config_file(start);
    let file = match config_file {
        Some(ref path) => load_config_file(path)?,
        None => ConfigFile::default(),
    };

    let home = if let Some(env_home) = env_var("RITUAL_HOME") {
        PathBuf::from(env_home)
    } else if let (Some(config_path), Some(home_path)) = (&config_file, &file.paths.home) {
        let ritual_dir = config_path.parent().unwrap_or(Path::new("."));
        resolve_path(ritual_dir, home_path)
    } else {
        default_home
    };

    let artifacts_dir = match file.paths.artifacts {
        Some(ref dir) => resolve_path(&home, dir),
        None => home.join("artifacts"),
    };

    let mut storage = file.storage;
    storage.primary = storage
        .primary
        .with_token(env_var("RITUAL_PRIMARY_TOKEN"))
        .resolve_root(&home);
    storage.secondary = storage
        .secondary
        .map(|s| s.with_token(env_var("RITUAL_SECONDARY_TOKEN")).resolve_root(&home));

    let mut registry = file.registry;
    if let Some(token) = env_var("RITUAL_REGISTRY_TOKEN") {
        registry.token = Some(token);
    }

    let rituals = if file.rituals.is_empty() {
        default_rituals()
    } else {
        file.rituals
    };

    Ok(ResolvedConfig {
        home,
        artifacts_dir,
        config_file,
        state_store: file.paths.state,
        orchestrator: file.orchestrator,
        storage,
        signatures: file.signatures,
        event_log: file.event_log,
        registry,
        watcher: file.watcher,
        rituals,
    })
}

/// Load configuration from all sources
fn load_config() -> Result<ResolvedConfig> {
    let cwd = std::env::current_dir().context("Failed to determine current directory")?;
    load_config_from(&cwd)
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| e.to_string()));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}

/// Force reload configuration (useful for testing)
pub fn reload_config() -> Result<ResolvedConfig> {
    load_config()
}

/// Get the ritual home directory (engine state)
pub fn ritual_home() -> Result<PathBuf> {
    Ok(config()?.home.clone())
}
