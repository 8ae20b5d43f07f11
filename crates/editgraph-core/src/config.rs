//! Engine configuration loaded from defaults, a JSON file, and `EDITGRAPH_*` variables.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::errors::{EditGraphError, EditGraphResult};

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

/// Which embedded engine backs the record store.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnginePreference {
    /// Probe the analytical engine first, fall back to SQLite.
    #[default]
    Auto,
    Sqlite,
    DuckDb,
}

impl EnginePreference {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "auto" => Some(Self::Auto),
            "sqlite" => Some(Self::Sqlite),
            "duckdb" => Some(Self::DuckDb),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Database file; `None` keeps everything in memory.
    pub db_path: Option<PathBuf>,
    pub engine: EnginePreference,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TracerConfig {
    pub capture_args: bool,
    pub capture_return: bool,
    pub max_depth: usize,
    /// Module path prefixes that are never traced, matched per `::` segment.
    pub exclude_modules: Vec<String>,
    /// When non-empty, only these module prefixes are traced.
    pub include_only: Vec<String>,
}

impl Default for TracerConfig {
    fn default() -> Self {
        Self {
            capture_args: false,
            capture_return: false,
            max_depth: 50,
            exclude_modules: ["std", "core", "alloc"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            include_only: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    pub max_call_depth: usize,
    pub max_calls_shown: usize,
    pub include_timing: bool,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_call_depth: 5,
            max_calls_shown: 20,
            include_timing: true,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    pub run_tests: bool,
    pub run_type_check: bool,
    pub test_timeout_secs: u64,
    pub syntax_timeout_secs: u64,
    pub type_check_timeout_secs: u64,
    /// Program and leading arguments; test file paths are appended.
    pub test_command: Vec<String>,
    pub backup_dir: String,
    pub use_vcs: bool,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            run_tests: true,
            run_type_check: true,
            test_timeout_secs: 300,
            syntax_timeout_secs: 10,
            type_check_timeout_secs: 60,
            test_command: vec!["pytest".into(), "-x".into(), "--tb=short".into()],
            backup_dir: ".edit_backups".into(),
            use_vcs: true,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    pub max_files: usize,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self { max_files: 500 }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub enabled: bool,
    pub auto_test: bool,
    pub auto_test_timeout_secs: u64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            auto_test: false,
            auto_test_timeout_secs: 60,
        }
    }
}

// ---------------------------------------------------------------------------
// EngineConfig
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub store: StoreConfig,
    pub tracer: TracerConfig,
    pub context: ContextConfig,
    pub validation: ValidationConfig,
    pub snapshot: SnapshotConfig,
    pub memory: MemoryConfig,
}

impl EngineConfig {
    /// Defaults overlaid with `EDITGRAPH_*` environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    /// Load a JSON document; absent fields take their defaults.
    pub fn from_json_file(path: &Path) -> EditGraphResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        serde_json::from_str(&raw)
            .map_err(|e| EditGraphError::Config(format!("{}: {e}", path.display())))
    }

    /// Overlay `EDITGRAPH_*` environment variables onto this configuration.
    pub fn apply_env(&mut self) {
        if let Ok(path) = std::env::var("EDITGRAPH_DB_PATH") {
            let trimmed = path.trim();
            self.store.db_path = if trimmed.is_empty() || trimmed == ":memory:" {
                None
            } else {
                Some(expand_tilde(trimmed))
            };
        }
        if let Ok(engine) = std::env::var("EDITGRAPH_ENGINE") {
            match EnginePreference::parse(&engine) {
                Some(pref) => self.store.engine = pref,
                None => warn!("Ignoring unknown EDITGRAPH_ENGINE value: {engine}"),
            }
        }

        self.memory.enabled = env_flag("EDITGRAPH_MEMORY", self.memory.enabled);
        self.memory.auto_test = env_flag("EDITGRAPH_AUTO_TEST", self.memory.auto_test);
        self.validation.run_tests = env_flag("EDITGRAPH_RUN_TESTS", self.validation.run_tests);
        self.validation.run_type_check =
            env_flag("EDITGRAPH_RUN_TYPE_CHECK", self.validation.run_type_check);

        if let Some(v) = env_number("EDITGRAPH_TEST_TIMEOUT") {
            self.validation.test_timeout_secs = v;
        }
        if let Some(v) = env_number("EDITGRAPH_TRACE_MAX_DEPTH") {
            self.tracer.max_depth = v as usize;
        }
        if let Some(v) = env_number("EDITGRAPH_SNAPSHOT_MAX_FILES") {
            self.snapshot.max_files = v as usize;
        }
    }
}

/// Read a boolean toggle: unset keeps `default`, anything but 0/false/no/off is on.
pub fn env_flag(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(val) => parse_flag(&val),
        Err(_) => default,
    }
}

fn parse_flag(value: &str) -> bool {
    let v = value.trim().to_lowercase();
    !matches!(v.as_str(), "0" | "false" | "no" | "off")
}

fn env_number(name: &str) -> Option<u64> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse::<u64>() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!("Ignoring non-numeric {name} value: {raw}");
            None
        }
    }
}

/// Expand a leading `~` to the user's home directory.
pub fn expand_tilde(path: &str) -> PathBuf {
    if path == "~" || path.starts_with("~/") {
        if let Some(home) = std::env::var_os("HOME") {
            let mut expanded = PathBuf::from(home);
            if path.len() > 2 {
                expanded.push(&path[2..]);
            }
            return expanded;
        }
    }
    PathBuf::from(path)
}
