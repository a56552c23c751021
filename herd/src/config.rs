use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use nix::sys::signal::Signal;
use serde::{Deserialize, Serialize};

use crate::error::{HerdError, Result};

/// Default number of workers kept alive.
pub const DEFAULT_WORKERS: usize = 2;
/// Default time a draining worker is given before it is killed.
pub const DEFAULT_GRACE_PERIOD_MS: u64 = 60_000;
/// Default interval of the periodic capacity check.
pub const DEFAULT_CAPACITY_CHECK_INTERVAL_MS: u64 = 5_000;
/// Default line a worker prints on stdout once it accepts connections.
pub const DEFAULT_READY_TOKEN: &str = "READY";

/// The program run for every worker.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerCommand {
    /// Executable path or name resolved through `PATH`.
    pub program: String,
    /// Arguments passed to the program.
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra environment variables for the worker.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Working directory, defaults to the supervisor's.
    #[serde(default)]
    pub cwd: Option<PathBuf>,
}

impl WorkerCommand {
    /// Create a command for the given program with no arguments.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    /// Append an argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append several arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set an environment variable.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

/// How a worker announces that it accepts connections.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum Readiness {
    /// The worker prints `token` on a line of its own on stdout.
    Stdout { token: String },
    /// The worker counts as ready as soon as the process exists.
    Spawned,
}

impl Default for Readiness {
    fn default() -> Self {
        Self::Stdout {
            token: DEFAULT_READY_TOKEN.to_string(),
        }
    }
}

/// Which readiness notifications release the next drain of a rolling restart.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdvancePolicy {
    /// Any worker becoming ready advances the restart queue.
    #[default]
    AnyReady,
    /// Only the replacement of the drained worker advances the queue.
    ReplacementReady,
}

impl FromStr for AdvancePolicy {
    type Err = HerdError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "any_ready" | "any" => Ok(Self::AnyReady),
            "replacement_ready" | "replacement" => Ok(Self::ReplacementReady),
            _ => Err(HerdError::Config(format!(
                "unknown advance policy '{s}', expected any-ready or replacement-ready"
            ))),
        }
    }
}

/// Supervisor configuration.
///
/// Read once at startup; the supervisor never mutates it.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Number of workers kept Starting or Ready.
    pub workers: usize,
    /// Grace period for draining workers, in milliseconds.
    pub grace_period_ms: u64,
    /// Interval of the periodic capacity check, in milliseconds.
    pub capacity_check_interval_ms: u64,
    /// Readiness gating of rolling restarts.
    pub advance_policy: AdvancePolicy,
    /// Signal asking a worker to stop accepting work.
    pub drain_signal: String,
    /// Signal used once the grace period is exhausted.
    pub kill_signal: String,
    /// Worker readiness detection.
    pub readiness: Readiness,
    /// Worker program.
    pub command: WorkerCommand,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            grace_period_ms: DEFAULT_GRACE_PERIOD_MS,
            capacity_check_interval_ms: DEFAULT_CAPACITY_CHECK_INTERVAL_MS,
            advance_policy: AdvancePolicy::default(),
            drain_signal: "SIGTERM".to_string(),
            kill_signal: "SIGKILL".to_string(),
            readiness: Readiness::default(),
            command: WorkerCommand::default(),
        }
    }
}

impl SupervisorConfig {
    /// Create a configuration running `command` with default settings.
    pub fn new(command: WorkerCommand) -> Self {
        Self {
            command,
            ..Self::default()
        }
    }

    /// Load a configuration from a TOML file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Set the target worker count.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Set the grace period.
    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace_period_ms = whole_millis(grace);
        self
    }

    /// Set the capacity check interval.
    pub fn with_capacity_check_interval(mut self, interval: Duration) -> Self {
        self.capacity_check_interval_ms = whole_millis(interval);
        self
    }

    /// Set the rolling restart advance policy.
    pub fn with_advance_policy(mut self, policy: AdvancePolicy) -> Self {
        self.advance_policy = policy;
        self
    }

    /// Set the readiness detection.
    pub fn with_readiness(mut self, readiness: Readiness) -> Self {
        self.readiness = readiness;
        self
    }

    /// Set the worker command.
    pub fn with_command(mut self, command: WorkerCommand) -> Self {
        self.command = command;
        self
    }

    /// Set the drain and kill signals by name (e.g. `SIGQUIT`).
    pub fn with_signals(mut self, drain: impl Into<String>, kill: impl Into<String>) -> Self {
        self.drain_signal = drain.into();
        self.kill_signal = kill.into();
        self
    }

    /// Grace period as a [`Duration`].
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    /// Capacity check interval as a [`Duration`].
    pub fn capacity_check_interval(&self) -> Duration {
        Duration::from_millis(self.capacity_check_interval_ms)
    }

    /// Parsed drain signal.
    pub fn drain_signal(&self) -> Result<Signal> {
        parse_signal(&self.drain_signal)
    }

    /// Parsed kill signal.
    pub fn kill_signal(&self) -> Result<Signal> {
        parse_signal(&self.kill_signal)
    }

    /// Apply overrides from the process environment.
    ///
    /// Reads `HERD_WORKERS` (falling back to `WORKER_COUNT`),
    /// `HERD_GRACE_PERIOD_MS` and `HERD_ADVANCE_POLICY`.
    pub fn with_env_overrides(self) -> Result<Self> {
        self.with_overrides_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary variable lookup.
    pub fn with_overrides_from<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup("HERD_WORKERS").or_else(|| lookup("WORKER_COUNT")) {
            self.workers = raw.trim().parse().map_err(|_| {
                HerdError::Config(format!("worker count '{raw}' is not a non-negative integer"))
            })?;
        }

        if let Some(raw) = lookup("HERD_GRACE_PERIOD_MS") {
            self.grace_period_ms = raw.trim().parse().map_err(|_| {
                HerdError::Config(format!("grace period '{raw}' is not a number of milliseconds"))
            })?;
        }

        if let Some(raw) = lookup("HERD_ADVANCE_POLICY") {
            self.advance_policy = raw.parse()?;
        }

        Ok(self)
    }

    /// Check that the configuration can be used to start workers.
    pub fn validate(&self) -> Result<()> {
        if self.command.program.trim().is_empty() {
            return Err(HerdError::Config("worker program is empty".into()));
        }
        if self.capacity_check_interval_ms == 0 {
            return Err(HerdError::Config(
                "capacity check interval must be greater than zero".into(),
            ));
        }
        if let Readiness::Stdout { token } = &self.readiness {
            if token.trim().is_empty() {
                return Err(HerdError::Config("readiness token is empty".into()));
            }
        }
        self.drain_signal()?;
        self.kill_signal()?;
        Ok(())
    }
}

/// Milliseconds in `duration`, rounded up and saturating at `u64::MAX`.
///
/// A non-zero duration never becomes zero milliseconds.
fn whole_millis(duration: Duration) -> u64 {
    let millis = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
    if duration > Duration::from_millis(millis) {
        millis.saturating_add(1)
    } else {
        millis
    }
}

/// Parse a signal name, with or without the `SIG` prefix.
pub fn parse_signal(name: &str) -> Result<Signal> {
    let upper = name.trim().to_uppercase();
    let full = if upper.starts_with("SIG") {
        upper
    } else {
        format!("SIG{upper}")
    };
    Signal::from_str(&full).map_err(|_| HerdError::UnknownSignal(name.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = SupervisorConfig::default();
        assert_eq!(config.workers, 2);
        assert_eq!(config.grace_period(), Duration::from_secs(60));
        assert_eq!(config.advance_policy, AdvancePolicy::AnyReady);
        assert_eq!(
            config.readiness,
            Readiness::Stdout {
                token: "READY".to_string()
            }
        );
        assert_eq!(config.drain_signal().unwrap(), Signal::SIGTERM);
        assert_eq!(config.kill_signal().unwrap(), Signal::SIGKILL);
    }

    #[test]
    fn test_worker_count_env_fallback() {
        let config = SupervisorConfig::default()
            .with_overrides_from(lookup(&[("WORKER_COUNT", "4")]))
            .unwrap();
        assert_eq!(config.workers, 4);

        let config = SupervisorConfig::default()
            .with_overrides_from(lookup(&[("WORKER_COUNT", "4"), ("HERD_WORKERS", "7")]))
            .unwrap();
        assert_eq!(config.workers, 7);
    }

    #[test]
    fn test_invalid_env_override_is_rejected() {
        let err = SupervisorConfig::default()
            .with_overrides_from(lookup(&[("HERD_WORKERS", "-1")]))
            .unwrap_err();
        assert!(matches!(err, HerdError::Config(_)));

        let err = SupervisorConfig::default()
            .with_overrides_from(lookup(&[("HERD_ADVANCE_POLICY", "sometimes")]))
            .unwrap_err();
        assert!(err.to_string().contains("sometimes"));
    }

    #[test]
    fn test_grace_and_policy_env() {
        let config = SupervisorConfig::default()
            .with_overrides_from(lookup(&[
                ("HERD_GRACE_PERIOD_MS", "1500"),
                ("HERD_ADVANCE_POLICY", "replacement-ready"),
            ]))
            .unwrap();
        assert_eq!(config.grace_period(), Duration::from_millis(1500));
        assert_eq!(config.advance_policy, AdvancePolicy::ReplacementReady);
    }

    #[test]
    fn test_parse_signal_names() {
        assert_eq!(parse_signal("SIGQUIT").unwrap(), Signal::SIGQUIT);
        assert_eq!(parse_signal("term").unwrap(), Signal::SIGTERM);
        assert!(matches!(
            parse_signal("SIGNOPE"),
            Err(HerdError::UnknownSignal(_))
        ));
    }

    #[test]
    fn test_validate() {
        assert!(SupervisorConfig::default().validate().is_err());

        let config = SupervisorConfig::new(WorkerCommand::new("app"));
        assert!(config.validate().is_ok());

        let config = SupervisorConfig::new(WorkerCommand::new("app")).with_signals("SIGWAT", "KILL");
        assert!(config.validate().is_err());

        let config = SupervisorConfig::new(WorkerCommand::new("app")).with_readiness(Readiness::Stdout {
            token: " ".to_string(),
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(
            &mut file,
            br#"
workers = 3
grace_period_ms = 2500
advance_policy = "replacement_ready"
drain_signal = "SIGQUIT"

[readiness]
mode = "stdout"
token = "listening"

[command]
program = "node"
args = ["app.js"]

[command.env]
PORT = "8080"
"#,
        )
        .unwrap();

        let config = SupervisorConfig::load_from_file(file.path()).unwrap();
        assert_eq!(config.workers, 3);
        assert_eq!(config.grace_period_ms, 2500);
        assert_eq!(config.advance_policy, AdvancePolicy::ReplacementReady);
        assert_eq!(config.drain_signal().unwrap(), Signal::SIGQUIT);
        assert_eq!(config.kill_signal().unwrap(), Signal::SIGKILL);
        assert_eq!(
            config.readiness,
            Readiness::Stdout {
                token: "listening".to_string()
            }
        );
        assert_eq!(config.command.program, "node");
        assert_eq!(config.command.args, vec!["app.js".to_string()]);
        assert_eq!(config.command.env.get("PORT").map(String::as_str), Some("8080"));
        assert_eq!(
            config.capacity_check_interval_ms,
            DEFAULT_CAPACITY_CHECK_INTERVAL_MS
        );
    }

    #[test]
    fn test_spawned_readiness_from_toml() {
        let config: SupervisorConfig = toml::from_str(
            r#"
[readiness]
mode = "spawned"

[command]
program = "app"
"#,
        )
        .unwrap();
        assert_eq!(config.readiness, Readiness::Spawned);
        assert_eq!(config.workers, DEFAULT_WORKERS);
    }

    #[test]
    fn test_duration_setters_round_up_and_saturate() {
        let config = SupervisorConfig::default()
            .with_grace_period(Duration::from_micros(1500))
            .with_capacity_check_interval(Duration::from_nanos(1));
        assert_eq!(config.grace_period_ms, 2);
        assert_eq!(config.capacity_check_interval_ms, 1);

        let config = SupervisorConfig::default().with_grace_period(Duration::MAX);
        assert_eq!(config.grace_period_ms, u64::MAX);

        let config = SupervisorConfig::default().with_grace_period(Duration::from_secs(3));
        assert_eq!(config.grace_period(), Duration::from_secs(3));
    }
}
