//! Suite and per-handle configuration.
//!
//! A suite configuration is loaded from a YAML file and carries one
//! [`AttackConfig`] per handle plus global fields (credentials, execution
//! mode, degradation checks). Command-line flags override a fixed subset of
//! the per-handle fields; everything is validated before any request is
//! issued, and every problem is reported at once.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use clap::Parser;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;
use typed_builder::TypedBuilder;

#[derive(Debug, Error)]
pub enum ConfigError {
    /// Every detected problem, one line each.
    #[error("configuration is invalid:\n{}", .0.join("\n"))]
    Invalid(Vec<String>),
    #[error("unknown ramp-up strategy [{0}], expected one of {{linear, exp2}}")]
    UnknownStrategy(String),
    #[error("unable to read configuration: {0}")]
    Io(#[from] std::io::Error),
    #[error("unable to decode configuration: {0}")]
    Decode(#[from] serde_yaml::Error),
}

/// Policy that grows the attacker pool and the issued rate during warm-up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RampupStrategy {
    /// Grow pool size and rate proportionally to the elapsed ramp seconds.
    Linear,
    /// Start with one worker and double the pool while throughput lags.
    #[default]
    Exp2,
}

impl RampupStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Linear => "linear",
            Self::Exp2 => "exp2",
        }
    }
}

impl FromStr for RampupStrategy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            // An unset strategy selects the default.
            "" | "exp2" => Ok(Self::Exp2),
            "linear" => Ok(Self::Linear),
            other => Err(ConfigError::UnknownStrategy(other.to_string())),
        }
    }
}

impl std::fmt::Display for RampupStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for RampupStrategy {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for RampupStrategy {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// How the suite schedules its runners.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// All runners execute concurrently.
    #[default]
    Parallel,
    /// Runners execute one at a time, ordered by sequence number.
    Sequence,
}

/// Settings for one handle's runner.
#[derive(Debug, Clone, Serialize, Deserialize, TypedBuilder)]
pub struct AttackConfig {
    /// Identity used in reports, metrics labels and fixture-store keys.
    #[builder(setter(into))]
    pub name: String,
    /// Target requests per second during full attack.
    pub rps: u64,
    /// Total seconds of the run, inclusive of ramp-up.
    pub attack_time_sec: u64,
    /// Seconds during which rate and pool grow.
    pub ramp_up_sec: u64,
    #[serde(default)]
    #[builder(default)]
    pub ramp_up_strategy: RampupStrategy,
    /// Upper bound on concurrent workers.
    pub max_attackers: usize,
    /// Maximum wall time for one attacker invocation, seconds.
    pub do_timeout_sec: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[builder(default)]
    pub output_filename: Option<String>,
    #[serde(default)]
    #[builder(default)]
    pub verbose: bool,
    #[serde(default)]
    #[builder(default)]
    pub store_data: bool,
    /// Whether the read fixture yields its records cyclically.
    #[serde(default)]
    #[builder(default)]
    pub recycle_data: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[builder(default)]
    pub csv_read: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[builder(default)]
    pub csv_write: Option<String>,
    /// Position in sequence execution mode, ascending.
    #[serde(default)]
    #[builder(default)]
    pub sequence_num: i32,
    #[serde(default)]
    #[builder(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    #[builder(default)]
    pub handle_params: HashMap<String, String>,
}

impl AttackConfig {
    /// Check all settings; returns one message per problem.
    pub fn validate(&self) -> Vec<String> {
        let mut list = Vec::new();
        if self.name.is_empty() {
            list.push("please set a non-empty handle name".to_string());
        }
        if self.rps == 0 {
            list.push("please set the RPS to a positive number".to_string());
        }
        if self.attack_time_sec < 2 {
            list.push("please set the attack time to a number of seconds > 1".to_string());
        }
        if self.ramp_up_sec < 1 {
            list.push("please set the ramp up time to a number of seconds > 0".to_string());
        }
        if self.ramp_up_sec > self.attack_time_sec {
            list.push("the ramp up time must not exceed the attack time".to_string());
        }
        if self.max_attackers == 0 {
            list.push("please set a positive maximum number of attackers".to_string());
        }
        if self.do_timeout_sec == 0 {
            list.push("please set the Do() timeout to a positive number of seconds".to_string());
        }
        list
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.do_timeout_sec)
    }

    /// Read-fixture filename, with the empty string treated as unset.
    pub fn read_fixture(&self) -> Option<&str> {
        self.csv_read.as_deref().filter(|n| !n.is_empty())
    }

    /// Write-fixture filename, with the empty string treated as unset.
    pub fn write_fixture(&self) -> Option<&str> {
        self.csv_write.as_deref().filter(|n| !n.is_empty())
    }
}

/// Degradation-gate settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChecksConfig {
    /// Ratio of current p50 over baseline p50 at which a handle counts as
    /// degraded; 2.0 means twice as slow.
    #[serde(default = "default_handle_threshold")]
    pub handle_threshold: f64,
}

impl Default for ChecksConfig {
    fn default() -> Self {
        Self {
            handle_threshold: default_handle_threshold(),
        }
    }
}

fn default_handle_threshold() -> f64 {
    2.0
}

fn default_report_dir() -> PathBuf {
    PathBuf::from("load").join("reports")
}

/// Suite-wide configuration: global fields plus one entry per handle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuiteConfig {
    #[serde(default)]
    pub execution_mode: ExecutionMode,
    /// Path to root credentials handed to attacker setup, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_keys: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_ref: Option<String>,
    /// Default timeout for protocol clients that want one, seconds.
    #[serde(default)]
    pub http_timeout_sec: Option<u64>,
    #[serde(default = "default_report_dir")]
    pub report_dir: PathBuf,
    #[serde(default)]
    pub checks: ChecksConfig,
    pub handles: Vec<AttackConfig>,
}

impl SuiteConfig {
    /// Load and validate a suite configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let cfg: Self = serde_yaml::from_str(&raw)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Validate every handle and the cross-handle fixture wiring. All
    /// problems are collected before returning.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut problems = Vec::new();
        for handle in &self.handles {
            for problem in handle.validate() {
                problems.push(format!("[{}] {}", handle.name, problem));
            }
        }

        // Fixture files are owned by exactly one writer and one reader; two
        // handles pointing at the same side of a file would silently share
        // it.
        let mut write_names: HashMap<&str, &str> = HashMap::new();
        let mut read_names: HashMap<&str, &str> = HashMap::new();
        for handle in &self.handles {
            if let Some(name) = handle.write_fixture() {
                if let Some(prev) = write_names.insert(name, &handle.name) {
                    problems.push(format!(
                        "[{}] write fixture file {} already exists for handle [{}], \
                         please rename the csv_write file name",
                        handle.name, name, prev
                    ));
                }
            }
            if let Some(name) = handle.read_fixture() {
                if let Some(prev) = read_names.insert(name, &handle.name) {
                    problems.push(format!(
                        "[{}] read fixture file {} is already wired to handle [{}]",
                        handle.name, name, prev
                    ));
                }
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(problems))
        }
    }
}

/// Command-line surface. Only the documented subset of fields overrides the
/// file configuration; sample mode is CLI-only.
#[derive(Debug, Parser)]
#[command(name = "stampede", about = "Rate-controlled load generation suite")]
pub struct Cli {
    /// Suite configuration file
    #[arg(long, value_name = "PATH")]
    pub config: PathBuf,
    /// Override the target requests per second
    #[arg(long)]
    pub rps: Option<u64>,
    /// Override the attack duration, seconds
    #[arg(long)]
    pub attack: Option<u64>,
    /// Override the ramp-up duration, seconds
    #[arg(long)]
    pub ramp: Option<u64>,
    /// Override the maximum number of concurrent attackers
    #[arg(long)]
    pub max: Option<usize>,
    /// Override the per-call timeout, seconds
    #[arg(long)]
    pub timeout: Option<u64>,
    /// Override the report output filename
    #[arg(short, long)]
    pub output: Option<String>,
    /// Produce more verbose run logging
    #[arg(short, long)]
    pub verbose: bool,
    /// Ramp-up strategy for ad-hoc runs {linear, exp2}
    #[arg(short, long)]
    pub strategy: Option<RampupStrategy>,
    /// Probe the attacker with N unmetered sample calls, then exit
    #[arg(short = 't', long = "sample", value_name = "N")]
    pub sample: Option<usize>,
}

/// Replace the overridable fields of one handle config with any flag that
/// was set. The overridable set is fixed: rps, attack, ramp, max, timeout,
/// output filename and verbose.
pub fn apply_overrides(config: &mut AttackConfig, cli: &Cli) {
    if let Some(rps) = cli.rps {
        config.rps = rps;
    }
    if let Some(attack) = cli.attack {
        config.attack_time_sec = attack;
    }
    if let Some(ramp) = cli.ramp {
        config.ramp_up_sec = ramp;
    }
    if let Some(max) = cli.max {
        config.max_attackers = max;
    }
    if let Some(timeout) = cli.timeout {
        config.do_timeout_sec = timeout;
    }
    if let Some(ref output) = cli.output {
        config.output_filename = Some(output.clone());
    }
    if cli.verbose {
        config.verbose = true;
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Smallest valid handle configuration, for tests across the crate.
    pub(crate) fn minimal(name: &str) -> AttackConfig {
        AttackConfig::builder()
            .name(name)
            .rps(10)
            .attack_time_sec(2)
            .ramp_up_sec(1)
            .max_attackers(2)
            .do_timeout_sec(1)
            .build()
    }
}
