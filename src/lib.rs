//! Stampede — a rate-controlled, ramp-up-governed load generation engine.
//!
//! You plug in a service client (an [`Attack`], the unit that performs one
//! protocol request) and get back a measured, rate-limited attack against
//! that service. The engine drives one or more parallel *handles* (named
//! workloads), each with its own request rate, attacker pool and rolling
//! latency/error metrics, and produces per-handle run reports suitable for
//! regression comparison between runs.
//!
//! # Architecture
//!
//! The main building blocks are:
//!
//! - [`Attack`]: the consumer-facing extension point. Implementations
//!   perform one request per call, and may hook into the run lifecycle and
//!   the shared fixture store.
//! - [`Runner`]: the per-handle state machine. It grows an attacker pool
//!   during ramp-up, drives the target RPS through a token-pacing
//!   [`Limiter`], collects results into per-label [`Metrics`], and ends with
//!   a [`RunReport`].
//! - [`RampupStrategy`]: pluggable warm-up policy. `linear` grows the pool
//!   on a fixed schedule; `exp2` measures each warm-up second and doubles
//!   the pool only while throughput lags.
//! - [`LoadManager`]: shared state of one suite run: the report map, the
//!   CSV fixture store handed between scenarios, and the `failed` /
//!   `degradation` flags that drive the CI exit code.
//! - [`Suite`]: runs many handles in parallel or in sequence and performs
//!   the degradation check against each handle's last successful run.
//!
//! # Example
//!
//! A minimal attacker and a CI-gated suite run:
//!
//! ```rust,no_run
//! use std::process::ExitCode;
//! use std::sync::Arc;
//!
//! use async_trait::async_trait;
//! use stampede::{ci_run, Attack, AttackConfig, AttackError, DoResult, LoadManager};
//!
//! struct Ping;
//!
//! #[async_trait]
//! impl Attack for Ping {
//!     async fn setup(
//!         &mut self,
//!         _manager: Arc<LoadManager>,
//!         _config: &AttackConfig,
//!     ) -> Result<(), AttackError> {
//!         Ok(())
//!     }
//!
//!     async fn do_attack(&mut self) -> DoResult {
//!         // Perform one request here.
//!         DoResult::labeled("ping")
//!     }
//!
//!     async fn teardown(&mut self) -> Result<(), AttackError> {
//!         Ok(())
//!     }
//!
//!     fn clone_attack(&self) -> Box<dyn Attack> {
//!         Box::new(Ping)
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> ExitCode {
//!     ci_run(|_handle| Box::new(Ping) as Box<dyn Attack>).await
//! }
//! ```

/// The attacker contract and the per-worker dispatch loop.
pub mod attack;
/// Suite and per-handle configuration.
pub mod config;
/// CSV fixture store shared across handles.
pub mod fixture;
/// Token-pacing rate limiter.
pub mod limiter;
/// Shared suite state: reports, fixtures, degradation gate.
pub mod manager;
/// Per-label latency and error aggregation.
pub mod metrics;
pub(crate) mod rampup;
/// Per-handle run reports.
pub mod report;
/// The per-handle lifecycle.
pub mod runner;
/// Monitored attacker decorator and metrics sinks.
pub mod sink;
/// Suite orchestration and the CI entry.
pub mod suite;

pub use attack::{Attack, AttackError, AttackResult, DoResult, Phase};
pub use config::{
    apply_overrides, AttackConfig, ChecksConfig, Cli, ConfigError, ExecutionMode, RampupStrategy,
    SuiteConfig,
};
pub use fixture::{FixtureError, FixtureReader, FixtureWriter};
pub use limiter::Limiter;
pub use manager::{LoadManager, SuiteError};
pub use metrics::{LatencySummary, Metrics};
pub use report::RunReport;
pub use runner::Runner;
pub use sink::{MetricsSink, Monitored, TracingSink};
pub use suite::{ci_run, ci_run_with, AttackerFactory, Suite};
