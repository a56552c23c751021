//! Command-line interface definitions using clap.

use std::path::PathBuf;

use anyhow::Context;
use clap::{ArgAction, Parser};
use herd::logging::{LogConfig, LogFormat};
use herd::{AdvancePolicy, Readiness, SupervisorConfig};

/// Keep a fixed number of worker processes running and replace them
/// without downtime on SIGHUP.
#[derive(Parser, Debug)]
#[command(name = "herd")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// TOML configuration file.
    #[arg(short, long, env = "HERD_CONFIG")]
    pub config: Option<PathBuf>,

    /// Number of workers to keep alive.
    #[arg(short, long)]
    pub workers: Option<usize>,

    /// Time a draining worker gets before it is killed.
    #[arg(long, value_name = "MS")]
    pub grace_period_ms: Option<u64>,

    /// Stdout line a worker prints once it accepts connections.
    #[arg(long, value_name = "TOKEN")]
    pub ready_token: Option<String>,

    /// Treat workers as ready as soon as they are spawned.
    #[arg(long, conflicts_with = "ready_token")]
    pub no_ready_token: bool,

    /// Which readiness releases the next drain: any-ready or replacement-ready.
    #[arg(long, value_name = "POLICY")]
    pub advance_policy: Option<AdvancePolicy>,

    /// More log output (-v debug, -vv trace).
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,

    /// Less log output (-q warnings, -qq errors).
    #[arg(short, long, action = ArgAction::Count, conflicts_with = "verbose")]
    pub quiet: u8,

    /// Log format: pretty, compact or json.
    #[arg(long, value_name = "FORMAT")]
    pub log_format: Option<LogFormat>,

    /// Worker program and its arguments.
    #[arg(last = true, value_name = "PROGRAM")]
    pub command: Vec<String>,
}

impl Cli {
    /// Logging configuration: flags first, then environment.
    pub fn log_config(&self) -> LogConfig {
        let mut config = LogConfig::new()
            .with_verbosity(self.verbose, self.quiet)
            .with_env_overrides();
        if self.verbose > 0 || self.quiet > 0 {
            config.filter = None;
        }
        if let Some(format) = self.log_format {
            config.format = format;
        }
        config
    }

    /// Supervisor configuration: file, then environment, then flags.
    pub fn supervisor_config(&self) -> anyhow::Result<SupervisorConfig> {
        let base = match &self.config {
            Some(path) => SupervisorConfig::load_from_file(path)
                .with_context(|| format!("failed to load {}", path.display()))?,
            None => SupervisorConfig::default(),
        };
        let mut config = base.with_env_overrides()?;

        if let Some(workers) = self.workers {
            config.workers = workers;
        }
        if let Some(grace) = self.grace_period_ms {
            config.grace_period_ms = grace;
        }
        if let Some(policy) = self.advance_policy {
            config.advance_policy = policy;
        }
        if self.no_ready_token {
            config.readiness = Readiness::Spawned;
        } else if let Some(token) = &self.ready_token {
            config.readiness = Readiness::Stdout {
                token: token.clone(),
            };
        }
        if let Some((program, args)) = self.command.split_first() {
            config.command.program = program.clone();
            config.command.args = args.to_vec();
        }

        config.validate()?;
        Ok(config)
    }
}
