//! Configuration resolution for turncode.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (~/.config/turncode/settings.json)
//! 3. Project config (.turncode/settings.json)
//! 4. Environment variables
//! 5. CLI arguments (highest priority, applied by the binary)

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Complete turncode configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub concurrency: ConcurrencyConfig,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            executor: ExecutorConfig::default(),
            retry: RetryConfig::default(),
            concurrency: ConcurrencyConfig::default(),
            log_level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// How the external CLI is located and invoked.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Program name handed to the resolver.
    pub program: String,
    pub resolver: ResolverConfig,
    pub output_format: OutputFormat,
    /// Per-execution timeout unless the request carries its own.
    pub default_timeout_secs: u64,
    /// Seconds between SIGTERM and SIGKILL when a process must be stopped.
    pub terminate_grace_secs: u64,
    /// Pass `--dangerously-skip-permissions` for unattended runs.
    pub skip_permissions: bool,
    /// Pass `--debug` to the CLI.
    pub debug: bool,
    /// MCP server configuration handed to the CLI as `--mcp-config`.
    pub mcp_config: Option<PathBuf>,
    /// `KEY=VALUE` file merged into every child's environment, typically
    /// the credentials the MCP servers need.
    pub mcp_env_file: Option<PathBuf>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            program: "claude".to_string(),
            resolver: ResolverConfig::default(),
            output_format: OutputFormat::default(),
            default_timeout_secs: 300,
            terminate_grace_secs: 5,
            skip_permissions: true,
            debug: false,
            mcp_config: None,
            mcp_env_file: None,
        }
    }
}

/// Strategy used to turn the program name into a spawnable command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResolverConfig {
    /// Exec the program directly, relying on `PATH`.
    Direct,
    /// Run through `<shell> -ic` so aliases and functions from interactive
    /// shell init are available. `None` uses `$SHELL`, then `/bin/bash`.
    InteractiveShell { shell: Option<PathBuf> },
    /// Exec a fixed path, ignoring the program name.
    ExplicitPath { path: PathBuf },
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self::InteractiveShell { shell: None }
    }
}

/// CLI output format selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OutputFormat {
    /// One JSON result object.
    #[default]
    Json,
    /// Newline-delimited JSON records.
    StreamJson,
}

impl OutputFormat {
    pub const fn as_arg(self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::StreamJson => "stream-json",
        }
    }
}

/// Retry policy settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    pub jitter: bool,
    /// Non-zero exit codes treated as transient.
    pub transient_exit_codes: Vec<i32>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
            multiplier: 2.0,
            jitter: true,
            transient_exit_codes: Vec::new(),
        }
    }
}

/// Batch scheduling settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcurrencyConfig {
    /// Maximum executions running at once across all agents.
    pub max_parallel: usize,
    /// Skip an agent's remaining queued requests after a permanent failure.
    pub halt_agent_on_failure: bool,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            max_parallel: 10,
            halt_agent_on_failure: true,
        }
    }
}

/// Load configuration with hierarchical resolution.
pub fn load_config(project_dir: Option<&Path>) -> Result<Config> {
    let project_path = project_dir.map(|dir| dir.join(".turncode").join("settings.json"));
    load_layers(
        global_config_path().as_deref(),
        project_path.as_deref(),
        |key| std::env::var(key).ok(),
    )
}

fn load_layers(
    global_path: Option<&Path>,
    project_path: Option<&Path>,
    var: impl Fn(&str) -> Option<String>,
) -> Result<Config> {
    let mut config = Config::default();

    if let Some(path) = global_path
        && path.exists()
    {
        config = load_config_file(path)?;
    }

    if let Some(path) = project_path
        && path.exists()
    {
        merge_config(&mut config, read_json(path)?)?;
    }

    apply_env_overrides(&mut config, var);

    validate(&config)?;
    Ok(config)
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .ok()
            .map(|h| PathBuf::from(h).join(".turncode").join("settings.json"))
    }
    #[cfg(target_os = "macos")]
    {
        std::env::var("HOME")
            .ok()
            .map(|h| PathBuf::from(h).join("Library/Application Support/turncode/settings.json"))
    }
    #[cfg(target_os = "linux")]
    {
        std::env::var("XDG_CONFIG_HOME")
            .ok()
            .map(PathBuf::from)
            .or_else(|| std::env::var("HOME").ok().map(|h| PathBuf::from(h).join(".config")))
            .map(|p| p.join("turncode").join("settings.json"))
    }
    #[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
    {
        None
    }
}

fn read_json(path: &Path) -> Result<Value> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

fn load_config_file(path: &Path) -> Result<Config> {
    serde_json::from_value(read_json(path)?).map_err(|e| {
        Error::Config(format!("Invalid config file {}: {}", path.display(), e))
    })
}

/// Lay project settings over `base`. Only the keys the project file sets
/// change.
fn merge_config(base: &mut Config, overlay: Value) -> Result<()> {
    let mut merged = serde_json::to_value(&*base)?;
    merge_json(&mut merged, overlay);
    *base = serde_json::from_value(merged)
        .map_err(|e| Error::Config(format!("Invalid project config: {e}")))?;
    Ok(())
}

/// Objects merge key by key. Tagged objects (a `kind` key) and every other
/// value replace what was there.
fn merge_json(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) if !overlay.contains_key("kind") => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(slot) => merge_json(slot, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

fn apply_env_overrides(config: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(val) = var("TURNCODE_CLAUDE_BIN") {
        config.executor.program = val;
    }
    if let Some(val) = var("TURNCODE_SHELL")
        && let ResolverConfig::InteractiveShell { shell } = &mut config.executor.resolver
    {
        *shell = Some(PathBuf::from(val));
    }
    if let Some(val) = var("TURNCODE_MCP_CONFIG") {
        config.executor.mcp_config = Some(PathBuf::from(val));
    }
    if let Some(n) = var("TURNCODE_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
        config.executor.default_timeout_secs = n;
    }
    if let Some(n) = var("TURNCODE_MAX_ATTEMPTS").and_then(|v| v.parse().ok()) {
        config.retry.max_attempts = n;
    }
    if let Some(n) = var("TURNCODE_MAX_PARALLEL").and_then(|v| v.parse().ok()) {
        config.concurrency.max_parallel = n;
    }
    if let Some(val) = var("TURNCODE_LOG_LEVEL") {
        config.log_level = val;
    }
}

/// Reject settings that would make execution meaningless.
pub fn validate(config: &Config) -> Result<()> {
    if config.executor.program.trim().is_empty() {
        return Err(Error::Config("executor.program must not be empty".into()));
    }
    if config.executor.default_timeout_secs == 0 {
        return Err(Error::Config(
            "executor.default_timeout_secs must be positive".into(),
        ));
    }
    if config.retry.max_attempts == 0 {
        return Err(Error::Config("retry.max_attempts must be at least 1".into()));
    }
    if config.retry.multiplier < 1.0 {
        return Err(Error::Config("retry.multiplier must be >= 1.0".into()));
    }
    if config.retry.base_delay_ms > config.retry.max_delay_ms {
        return Err(Error::Config(
            "retry.base_delay_ms must not exceed retry.max_delay_ms".into(),
        ));
    }
    if config.concurrency.max_parallel == 0 {
        return Err(Error::Config(
            "concurrency.max_parallel must be at least 1".into(),
        ));
    }
    Ok(())
}
