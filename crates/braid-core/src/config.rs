use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{BraidError, Result};

/// Top-level Braid configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub run: RunConfig,
    #[serde(default)]
    pub store: Option<StoreConfig>,
    #[serde(default)]
    pub log: Option<LogConfig>,
}

/// Run-level execution limits. Applies per run, never per graph, so wide
/// graphs cannot starve the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    /// Global cap on blocks in flight within one run.
    #[serde(default = "default_max_concurrent_blocks")]
    pub max_concurrent_blocks: usize,
    /// Deadline for a block attempt that declares no timeout of its own.
    #[serde(default = "default_block_timeout_ms")]
    pub default_block_timeout_ms: u64,
    /// Ceiling on iterations of any loop region.
    #[serde(default = "default_max_loop_iterations")]
    pub max_loop_iterations: u32,
    /// Bound of the per-run event queue.
    #[serde(default = "default_event_queue_capacity")]
    pub event_queue_capacity: usize,
    /// How long a cancelled handler may take to wind down before it is abandoned.
    #[serde(default = "default_cancel_grace_ms")]
    pub cancel_grace_ms: u64,
    /// Redeliveries of a streaming chunk before it is given up. Lifecycle
    /// events are redelivered until the sink accepts them.
    #[serde(default = "default_delivery_retries")]
    pub delivery_retries: u32,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            max_concurrent_blocks: default_max_concurrent_blocks(),
            default_block_timeout_ms: default_block_timeout_ms(),
            max_loop_iterations: default_max_loop_iterations(),
            event_queue_capacity: default_event_queue_capacity(),
            cancel_grace_ms: default_cancel_grace_ms(),
            delivery_retries: default_delivery_retries(),
        }
    }
}

impl RunConfig {
    pub fn default_block_timeout(&self) -> Duration {
        Duration::from_millis(self.default_block_timeout_ms)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }

    /// Set the concurrency cap.
    pub fn with_max_concurrent_blocks(mut self, n: usize) -> Self {
        self.max_concurrent_blocks = n;
        self
    }

    /// Set the default block timeout.
    pub fn with_default_block_timeout(mut self, timeout: Duration) -> Self {
        self.default_block_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the loop iteration ceiling.
    pub fn with_max_loop_iterations(mut self, n: u32) -> Self {
        self.max_loop_iterations = n;
        self
    }

    /// Set the event queue bound.
    pub fn with_event_queue_capacity(mut self, n: usize) -> Self {
        self.event_queue_capacity = n;
        self
    }

    /// Set the cancellation grace period.
    pub fn with_cancel_grace(mut self, grace: Duration) -> Self {
        self.cancel_grace_ms = grace.as_millis() as u64;
        self
    }
}

fn default_max_concurrent_blocks() -> usize { 8 }
fn default_block_timeout_ms() -> u64 { 30_000 }
fn default_max_loop_iterations() -> u32 { 100 }
fn default_event_queue_capacity() -> usize { 256 }
fn default_cancel_grace_ms() -> u64 { 5_000 }
fn default_delivery_retries() -> u32 { 5 }

/// SQLite persistence for graphs and run ledgers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

impl StoreConfig {
    pub fn resolved_path(&self) -> PathBuf {
        expand_home(&self.path)
    }
}

fn default_store_path() -> String { "~/.braid/braid.db".to_string() }

/// JSONL run event logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Enable run logging (default: true when section is present).
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// Directory for per-run log files.
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    /// 1 = run lifecycle, 2 = + block lifecycle, 3 = + streaming chunks.
    #[serde(default = "default_log_level")]
    pub level: u8,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: default_log_dir(),
            level: default_log_level(),
        }
    }
}

impl LogConfig {
    pub fn resolved_dir(&self) -> PathBuf {
        expand_home(&self.log_dir)
    }
}

fn default_log_enabled() -> bool { true }
fn default_log_dir() -> String { "~/.braid/logs".to_string() }
fn default_log_level() -> u8 { 2 }

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| BraidError::ConfigNotFound(path.display().to_string()))?;

        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(&content);

        let config: Self =
            toml::from_str(&expanded).map_err(|e| BraidError::Config(e.to_string()))?;
        config.check()?;
        Ok(config)
    }

    /// Load the config if the file exists, otherwise fall back to defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    fn check(&self) -> Result<()> {
        if self.run.max_concurrent_blocks == 0 {
            return Err(BraidError::Config(
                "run.max_concurrent_blocks must be at least 1".into(),
            ));
        }
        if self.run.max_loop_iterations == 0 {
            return Err(BraidError::Config(
                "run.max_loop_iterations must be at least 1".into(),
            ));
        }
        if self.run.event_queue_capacity == 0 {
            return Err(BraidError::Config(
                "run.event_queue_capacity must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                Err(_) => {
                    // Keep original if env var not set
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}

/// Expand a leading `~/` to `$HOME`.
pub fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = std::env::var("HOME").ok().map(PathBuf::from) {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_env_vars() {
        std::env::set_var("TEST_BRAID_VAR", "hello");
        let result = expand_env_vars("key = \"${TEST_BRAID_VAR}\"");
        assert_eq!(result, "key = \"hello\"");
        std::env::remove_var("TEST_BRAID_VAR");
    }

    #[test]
    fn test_expand_env_vars_missing() {
        let result = expand_env_vars("key = \"${NONEXISTENT_BRAID_VAR}\"");
        assert_eq!(result, "key = \"${NONEXISTENT_BRAID_VAR}\"");
    }

    #[test]
    fn test_run_defaults_from_empty_toml() {
        let config: AppConfig = toml::from_str("").unwrap();
        assert_eq!(config.run.max_concurrent_blocks, 8);
        assert_eq!(config.run.default_block_timeout(), Duration::from_secs(30));
        assert_eq!(config.run.max_loop_iterations, 100);
        assert_eq!(config.run.event_queue_capacity, 256);
        assert!(config.store.is_none());
        assert!(config.log.is_none());
    }

    #[test]
    fn test_partial_run_section() {
        let config: AppConfig = toml::from_str(
            r#"
[run]
max_concurrent_blocks = 2

[log]
level = 3
"#,
        )
        .unwrap();
        assert_eq!(config.run.max_concurrent_blocks, 2);
        assert_eq!(config.run.cancel_grace(), Duration::from_secs(5));
        let log = config.log.unwrap();
        assert!(log.enabled);
        assert_eq!(log.level, 3);
    }

    #[test]
    fn test_check_rejects_zero_concurrency() {
        let mut config = AppConfig::default();
        config.run.max_concurrent_blocks = 0;
        assert!(matches!(config.check(), Err(BraidError::Config(_))));
    }

    #[test]
    fn test_check_rejects_zero_loop_cap() {
        let mut config = AppConfig::default();
        config.run.max_loop_iterations = 0;
        assert!(matches!(config.check(), Err(BraidError::Config(_))));
    }

    #[test]
    fn test_expand_home() {
        std::env::set_var("HOME", "/home/tester");
        assert_eq!(expand_home("~/x/y.db"), PathBuf::from("/home/tester/x/y.db"));
        assert_eq!(expand_home("/abs/y.db"), PathBuf::from("/abs/y.db"));
    }

    #[test]
    fn test_builders() {
        let c = RunConfig::default()
            .with_max_concurrent_blocks(3)
            .with_default_block_timeout(Duration::from_millis(250))
            .with_max_loop_iterations(7);
        assert_eq!(c.max_concurrent_blocks, 3);
        assert_eq!(c.default_block_timeout_ms, 250);
        assert_eq!(c.max_loop_iterations, 7);
    }
}
