//! Configuration for ptyline
//!
//! This module provides:
//! - XDG-compliant config file location
//! - CLI argument overrides
//! - Environment variable support
//! - Config precedence: CLI > env > file > defaults
//! - Validation with field-tagged errors

use clap::Parser;
use ptyline_pty::{LaunchSpec, Strategy, DEFAULT_UTEMPTER};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// CLI arguments for ptyline
#[derive(Parser, Debug, Clone, Default)]
#[command(name = "ptyline")]
#[command(version)]
#[command(about = "Run a program on a fresh pseudo-terminal", long_about = None)]
pub struct CliArgs {
    /// Path to custom config file
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Shell to run when no command is given
    #[arg(short, long, value_name = "SHELL")]
    pub shell: Option<String>,

    /// Value for TERM in the child
    #[arg(long, value_name = "TERM")]
    pub term: Option<String>,

    /// Columns when the size of the current terminal is unknown
    #[arg(long, value_name = "COLS")]
    pub columns: Option<u16>,

    /// Rows when the size of the current terminal is unknown
    #[arg(long, value_name = "ROWS")]
    pub rows: Option<u16>,

    /// Keep XON/XOFF flow control enabled in the child
    #[arg(long)]
    pub xon_xoff: bool,

    /// Record the session in login accounting
    #[arg(long)]
    pub accounting: bool,

    /// Privileged helper used to secure devices
    #[arg(long, value_name = "PATH")]
    pub helper: Option<PathBuf>,

    /// Copy everything the child writes to this file
    #[arg(long, value_name = "FILE")]
    pub tee: Option<PathBuf>,

    /// Device allocation strategy to try (openpty, ptmx, bsd); repeatable
    #[arg(long = "strategy", value_name = "NAME")]
    pub strategies: Vec<String>,

    /// Command and arguments to run instead of the shell
    #[arg(trailing_var_arg = true, value_name = "COMMAND")]
    pub command: Vec<String>,
}

/// Session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Program to run (None = use $SHELL)
    #[serde(default)]
    pub shell: Option<String>,

    /// Arguments passed to the program
    #[serde(default)]
    pub args: Vec<String>,

    /// TERM exported to the child
    #[serde(default = "default_term")]
    pub term: String,

    /// Fallback dimensions (columns, rows)
    #[serde(default = "default_dimensions")]
    pub dimensions: (u16, u16),

    #[serde(default)]
    pub xon_xoff: bool,

    #[serde(default)]
    pub accounting: bool,

    /// Grant helper (None = secure devices directly)
    #[serde(default)]
    pub helper: Option<PathBuf>,

    #[serde(default = "default_utempter")]
    pub utempter: PathBuf,

    /// Debug copy of the child's output
    #[serde(default)]
    pub tee: Option<PathBuf>,

    /// Allocation strategies, in order
    #[serde(default = "default_strategies")]
    pub strategies: Vec<String>,

    /// Extra environment exported to the child
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

fn default_term() -> String {
    "xterm-256color".to_string()
}
fn default_dimensions() -> (u16, u16) {
    (80, 24)
}
fn default_utempter() -> PathBuf {
    PathBuf::from(DEFAULT_UTEMPTER)
}
fn default_strategies() -> Vec<String> {
    Strategy::ALL.iter().map(|s| s.name().to_string()).collect()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            shell: None,
            args: Vec::new(),
            term: default_term(),
            dimensions: default_dimensions(),
            xon_xoff: false,
            accounting: false,
            helper: None,
            utempter: default_utempter(),
            tee: None,
            strategies: default_strategies(),
            tags: BTreeMap::new(),
        }
    }
}

/// Configuration error
#[derive(Debug, Clone)]
pub struct ConfigError {
    pub message: String,
    pub field: Option<String>,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(field) = &self.field {
            write!(f, "Config error in '{}': {}", field, self.message)
        } else {
            write!(f, "Config error: {}", self.message)
        }
    }
}

impl std::error::Error for ConfigError {}

fn is_truthy(value: &str) -> bool {
    value == "1" || value.eq_ignore_ascii_case("true")
}

impl Config {
    /// Load configuration with full precedence:
    /// CLI args > environment variables > config file > defaults
    pub fn load_with_args(args: &CliArgs) -> Result<Self, ConfigError> {
        let mut config = Config::default();

        let config_path = args.config.clone().or_else(Self::default_config_path);
        if let Some(path) = &config_path {
            if path.exists() {
                match Self::load_from_file(path) {
                    Ok(file_config) => config = file_config,
                    Err(e) => {
                        log::warn!("Failed to load config from {:?}: {}", path, e);
                    }
                }
            }
        }

        config.apply_env_vars();
        config.apply_cli_args(args);
        config.validate()?;

        Ok(config)
    }

    /// Load configuration from a specific file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|e| ConfigError {
            message: format!("Failed to read config file: {}", e),
            field: None,
        })?;

        toml::from_str(&content).map_err(|e| ConfigError {
            message: format!("Failed to parse config file: {}", e),
            field: None,
        })
    }

    fn apply_env_vars(&mut self) {
        self.apply_env(|name| env::var(name).ok());
    }

    /// Apply `PTYLINE_*` variables looked up through `lookup`
    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(val) = lookup("PTYLINE_SHELL") {
            self.shell = Some(val);
        }
        if let Some(val) = lookup("PTYLINE_TERM") {
            self.term = val;
        }
        if let Some(val) = lookup("PTYLINE_HELPER") {
            self.helper = Some(PathBuf::from(val));
        }
        if let Some(val) = lookup("PTYLINE_TEE") {
            self.tee = Some(PathBuf::from(val));
        }
        if let Some(val) = lookup("PTYLINE_XON_XOFF") {
            self.xon_xoff = is_truthy(&val);
        }
        if let Some(val) = lookup("PTYLINE_ACCOUNTING") {
            self.accounting = is_truthy(&val);
        }
        if let Some(val) = lookup("PTYLINE_STRATEGIES") {
            self.strategies = val
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
    }

    fn apply_cli_args(&mut self, args: &CliArgs) {
        if let Some(shell) = &args.shell {
            self.shell = Some(shell.clone());
        }
        if let Some((program, rest)) = args.command.split_first() {
            self.shell = Some(program.clone());
            self.args = rest.to_vec();
        }
        if let Some(term) = &args.term {
            self.term = term.clone();
        }
        if let Some(cols) = args.columns {
            self.dimensions.0 = cols;
        }
        if let Some(rows) = args.rows {
            self.dimensions.1 = rows;
        }
        if args.xon_xoff {
            self.xon_xoff = true;
        }
        if args.accounting {
            self.accounting = true;
        }
        if let Some(helper) = &args.helper {
            self.helper = Some(helper.clone());
        }
        if let Some(tee) = &args.tee {
            self.tee = Some(tee.clone());
        }
        if !args.strategies.is_empty() {
            self.strategies = args.strategies.clone();
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.dimensions.0 == 0 || self.dimensions.1 == 0 {
            return Err(ConfigError {
                message: "Columns and rows must be non-zero".to_string(),
                field: Some("dimensions".to_string()),
            });
        }

        if let Some(shell) = &self.shell {
            if shell.is_empty() {
                return Err(ConfigError {
                    message: "Shell must not be empty".to_string(),
                    field: Some("shell".to_string()),
                });
            }
        }

        self.strategies()?;
        Ok(())
    }

    /// Parsed allocation strategies
    pub fn strategies(&self) -> Result<Vec<Strategy>, ConfigError> {
        if self.strategies.is_empty() {
            return Err(ConfigError {
                message: "At least one allocation strategy is required".to_string(),
                field: Some("strategies".to_string()),
            });
        }
        self.strategies
            .iter()
            .map(|s| {
                s.parse().map_err(|message| ConfigError {
                    message,
                    field: Some("strategies".to_string()),
                })
            })
            .collect()
    }

    /// The program to run: configured shell, then $SHELL, then /bin/sh
    pub fn program(&self) -> String {
        self.shell
            .clone()
            .or_else(|| env::var("SHELL").ok().filter(|s| !s.is_empty()))
            .unwrap_or_else(|| "/bin/sh".to_string())
    }

    pub fn launch_spec(&self) -> LaunchSpec {
        self.tags.iter().fold(
            LaunchSpec::new(self.program())
                .args(self.args.iter().cloned())
                .term(self.term.clone())
                .accounting(self.accounting)
                .xon_xoff(self.xon_xoff),
            |spec, (name, value)| spec.tag(name.clone(), value.clone()),
        )
    }

    /// Get the default configuration file path
    pub fn default_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("ptyline").join("config.toml"))
    }
}
