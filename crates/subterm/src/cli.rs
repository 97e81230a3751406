//! Command-line arguments

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::ffi::OsString;
use std::path::PathBuf;
use subterm_pty::{SpawnRequest, WindowSize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => tracing::Level::TRACE,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Run programs on a pseudo-terminal")]
pub struct Cli {
    /// Log level, overridden by RUST_LOG when set
    #[arg(long, value_enum, default_value = "warn", global = true)]
    pub log_level: LogLevel,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Attach this terminal to the program until it exits
    Run(RunArgs),

    /// Run the program unattended and print what it writes
    Exec(ExecArgs),
}

/// What to launch and where
#[derive(Args, Debug)]
pub struct ChildArgs {
    /// Working directory for the program (defaults to the current one)
    #[arg(long)]
    pub cwd: Option<PathBuf>,

    /// Environment entry for the program; repeatable
    #[arg(long = "env", value_name = "KEY=VALUE", value_parser = parse_env_entry)]
    pub env: Vec<(String, String)>,

    /// Start from a copy of this process's environment
    #[arg(long)]
    pub inherit_env: bool,

    /// Program followed by its arguments; the first word is also argv[0]
    #[arg(required = true, last = true, value_name = "COMMAND")]
    pub command: Vec<OsString>,
}

#[derive(Args, Debug)]
pub struct RunArgs {
    #[command(flatten)]
    pub child: ChildArgs,

    /// TERM for the program (defaults to this terminal's TERM)
    #[arg(long)]
    pub term: Option<String>,
}

#[derive(Args, Debug)]
pub struct ExecArgs {
    #[command(flatten)]
    pub child: ChildArgs,

    /// Text written to the program before reading its output
    #[arg(long)]
    pub input: Option<String>,

    /// Empty polls in a row before a read gives up
    #[arg(long, default_value = "100")]
    pub idle_polls: u32,

    /// Pause between empty polls
    #[arg(long, default_value = "10")]
    pub poll_interval_ms: u64,
}

impl ChildArgs {
    /// Build the spawn request. `--env` entries are applied after the
    /// inherited environment, so they win on lookup.
    pub fn to_request(&self, size: WindowSize) -> Result<SpawnRequest> {
        let (program, _) = self
            .command
            .split_first()
            .context("No command given")?;

        let cwd = match &self.cwd {
            Some(dir) => dir.clone(),
            None => std::env::current_dir().context("Failed to resolve current directory")?,
        };

        let mut request = SpawnRequest::new(program, cwd)
            .args(self.command.iter().cloned())
            .window_size(size);
        if self.inherit_env {
            request = request.inherit_env();
        }
        for (key, value) in &self.env {
            request = request.env(key, value);
        }

        Ok(request)
    }

    /// Whether `--env` already names `key`
    pub fn sets_env(&self, key: &str) -> bool {
        self.env.iter().any(|(k, _)| k == key)
    }
}

fn parse_env_entry(entry: &str) -> Result<(String, String), String> {
    match entry.split_once('=') {
        Some((key, _)) if key.is_empty() => Err(format!("missing name in `{entry}`")),
        Some((key, value)) => Ok((key.to_string(), value.to_string())),
        None => Err(format!("expected KEY=VALUE, got `{entry}`")),
    }
}
