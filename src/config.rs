//! Service configuration: CLI flags with env fallback (as `fileserver`'s
//! `Cli` does), optionally layered with a TOML file for the fields that
//! don't belong on a command line (interpreter argv, idle timeout).

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use serde::{Deserialize, Serialize};

#[derive(Parser, Debug)]
#[command(name = "ces")]
#[command(about = "Code Execution Service: isolated, stateful interpreter sandboxes over HTTP")]
#[command(version)]
pub struct Cli {
    /// Port to listen on.
    #[arg(short, long, env = "CES_PORT", default_value = "8088")]
    pub port: u16,

    /// Address to bind to.
    #[arg(short, long, env = "CES_BIND", default_value = "0.0.0.0")]
    pub bind: String,

    /// Root directory under which each session gets its own cwd.
    #[arg(short, long, env = "CES_WORKSPACE_ROOT", default_value = "./workspaces")]
    pub workspace_root: PathBuf,

    /// Shared-secret API key required on every request via `X-API-Key`.
    /// Unset disables authentication.
    #[arg(long, env = "CES_API_KEY")]
    pub api_key: Option<String>,

    /// Enable verbose logging.
    #[arg(short, long, env = "CES_VERBOSE")]
    pub verbose: bool,

    /// Optional TOML config file layering the fields below over their
    /// defaults (CLI flags above always take precedence over the file).
    #[arg(short, long, env = "CES_CONFIG")]
    pub config: Option<PathBuf>,
}

/// Fields that are more naturally expressed in a config file than on the
/// command line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default = "default_interpreter_command")]
    pub interpreter_command: String,

    #[serde(default = "default_interpreter_args")]
    pub interpreter_args: Vec<String>,

    #[serde(default = "default_startup_timeout_secs")]
    pub startup_timeout_secs: u64,

    #[serde(default = "default_execution_timeout_secs")]
    pub execution_timeout_secs: u64,

    /// `0` disables idle sweeping.
    #[serde(default)]
    pub idle_timeout_secs: u64,

    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

fn default_interpreter_command() -> String {
    "python3".to_string()
}

fn default_interpreter_args() -> Vec<String> {
    Vec::new()
}

fn default_startup_timeout_secs() -> u64 {
    30
}

fn default_execution_timeout_secs() -> u64 {
    300
}

fn default_sweep_interval_secs() -> u64 {
    60
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            interpreter_command: default_interpreter_command(),
            interpreter_args: default_interpreter_args(),
            startup_timeout_secs: default_startup_timeout_secs(),
            execution_timeout_secs: default_execution_timeout_secs(),
            idle_timeout_secs: 0,
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl FileConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("parsing config file {}", path.display()))
    }
}

/// The fully resolved configuration the rest of the service reads from.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub workspace_root: PathBuf,
    pub api_key: Option<String>,
    pub interpreter_command: String,
    pub interpreter_args: Vec<String>,
    pub startup_timeout: Duration,
    pub execution_timeout: Duration,
    pub idle_timeout: Option<Duration>,
    pub sweep_interval: Duration,
}

impl Config {
    pub fn load(cli: Cli) -> anyhow::Result<Self> {
        let file = match &cli.config {
            Some(path) => FileConfig::from_file(path)?,
            None => FileConfig::default(),
        };
        Ok(Self {
            bind: cli.bind,
            port: cli.port,
            workspace_root: cli.workspace_root,
            api_key: cli.api_key,
            interpreter_command: file.interpreter_command,
            interpreter_args: file.interpreter_args,
            startup_timeout: Duration::from_secs(file.startup_timeout_secs),
            execution_timeout: Duration::from_secs(file.execution_timeout_secs),
            idle_timeout: if file.idle_timeout_secs == 0 {
                None
            } else {
                Some(Duration::from_secs(file.idle_timeout_secs))
            },
            sweep_interval: Duration::from_secs(file.sweep_interval_secs),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_config_defaults_disable_idle_sweep() {
        let config = FileConfig::default();
        assert_eq!(config.idle_timeout_secs, 0);
        assert_eq!(config.interpreter_command, "python3");
    }

    #[test]
    fn zero_idle_timeout_becomes_none() {
        let cli = Cli {
            port: 8088,
            bind: "0.0.0.0".to_string(),
            workspace_root: PathBuf::from("./workspaces"),
            api_key: None,
            verbose: false,
            config: None,
        };
        let resolved = Config::load(cli).unwrap();
        assert!(resolved.idle_timeout.is_none());
    }
}
