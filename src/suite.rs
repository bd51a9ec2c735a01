//! Suite orchestration: build all runners from configuration, execute them
//! in parallel or in sequence, and drive the CI gate.
//!
//! The published convenience entry is [`ci_run`]: load the configuration
//! named on the command line, run the suite, check for errors and
//! degradation, persist the reports and exit non-zero when either check
//! fires.

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use futures::future::join_all;
use tracing::{error, info, warn};

use crate::attack::Attack;
use crate::config::{apply_overrides, Cli, ExecutionMode, SuiteConfig};
use crate::manager::{LoadManager, SuiteError};
use crate::runner::Runner;

/// Produces the attacker prototype for a handle name.
pub trait AttackerFactory: Fn(&str) -> Box<dyn Attack> {}
impl<F: Fn(&str) -> Box<dyn Attack>> AttackerFactory for F {}

/// All handles of one suite run, plus the manager they share.
pub struct Suite {
    manager: Arc<LoadManager>,
    runners: Vec<Runner>,
    mode: ExecutionMode,
}

impl Suite {
    /// Build one runner per configured handle. Configuration problems and
    /// fixture wiring collisions abort here, before any request.
    pub fn from_config<F>(config: SuiteConfig, factory: F) -> Result<Self, SuiteError>
    where
        F: AttackerFactory,
    {
        config.validate()?;
        let manager = Arc::new(LoadManager::from_suite_config(&config)?);
        let mode = config.execution_mode;
        let mut runners = Vec::with_capacity(config.handles.len());
        for handle in config.handles {
            let name = handle.name.clone();
            let attacker = factory(&name);
            runners.push(Runner::new(name, Arc::clone(&manager), attacker, handle)?);
        }
        Ok(Self {
            manager,
            runners,
            mode,
        })
    }

    pub fn manager(&self) -> Arc<LoadManager> {
        Arc::clone(&self.manager)
    }

    pub fn runners(&self) -> &[Runner] {
        &self.runners
    }

    /// Run every handle to completion in the configured execution mode.
    pub async fn run(&mut self) -> Result<(), SuiteError> {
        match self.mode {
            ExecutionMode::Parallel => self.run_parallel().await,
            ExecutionMode::Sequence => self.run_sequence().await,
        }
    }

    /// Run the suite racing the process exit signals. Fixture writers are
    /// flushed and closed on both paths.
    pub async fn run_with_signals(&mut self) -> Result<(), SuiteError> {
        let result = tokio::select! {
            res = self.run() => res,
            _ = shutdown_signal() => {
                warn!("exit signal received, exiting");
                Err(SuiteError::Interrupted)
            }
        };
        self.manager.shutdown();
        result
    }

    async fn run_parallel(&mut self) -> Result<(), SuiteError> {
        // Open every fixture before the first request is issued.
        for runner in &self.runners {
            self.manager.setup_handle_store(runner.config())?;
        }
        let tasks: Vec<_> = std::mem::take(&mut self.runners)
            .into_iter()
            .map(|mut runner| {
                tokio::spawn(async move {
                    let outcome = runner.run().await;
                    (runner, outcome)
                })
            })
            .collect();

        let mut first_error = None;
        for joined in join_all(tasks).await {
            match joined {
                Ok((runner, outcome)) => {
                    if let Err(err) = outcome {
                        if first_error.is_none() {
                            first_error = Some(err);
                        }
                    }
                    self.runners.push(runner);
                }
                Err(err) => {
                    error!(error = %err, "runner task panicked");
                }
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// One runner at a time, ascending by sequence number; used when one
    /// scenario's output feeds the next through the fixture store.
    async fn run_sequence(&mut self) -> Result<(), SuiteError> {
        self.runners.sort_by_key(Runner::sequence);
        for runner in &mut self.runners {
            self.manager.setup_handle_store(runner.config())?;
            runner.run().await?;
        }
        Ok(())
    }

    /// Probe every handle's attacker with `count` unmetered calls.
    pub async fn sample(&mut self, count: usize) {
        for runner in &mut self.runners {
            info!(handle = %runner.name(), count, "sampling attack implementation");
            runner.sample(count).await;
        }
    }
}

/// Resolves on SIGINT (Ctrl+C) or, on unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

/// Default CI run mode: parse the command line and delegate to
/// [`ci_run_with`].
pub async fn ci_run<F>(factory: F) -> ExitCode
where
    F: AttackerFactory,
{
    ExitCode::from(ci_run_with(Cli::parse(), factory).await)
}

/// Run suite → error check → degradation check → persist reports. Returns
/// the process exit code: 0 on success, 1 on any error or degradation.
pub async fn ci_run_with<F>(cli: Cli, factory: F) -> u8
where
    F: AttackerFactory,
{
    let mut config = match SuiteConfig::from_file(&cli.config) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("a configuration error was found: {err}");
            return 1;
        }
    };
    for handle in &mut config.handles {
        apply_overrides(handle, &cli);
    }

    let mut suite = match Suite::from_config(config, factory) {
        Ok(suite) => suite,
        Err(err) => {
            eprintln!("a configuration error was found: {err}");
            return 1;
        }
    };

    // Sample mode probes the implementation and exits without a run.
    if let Some(count) = cli.sample {
        suite.sample(count).await;
        return 0;
    }

    if let Err(err) = suite.run_with_signals().await {
        error!(error = %err, "suite run failed");
        return 1;
    }

    let manager = suite.manager();
    manager.check_errors();
    manager.check_degradation();
    if let Err(err) = manager.store_handle_reports() {
        error!(error = %err, "failed to store handle reports");
        return 1;
    }
    if manager.failed() || manager.degradation() {
        1
    } else {
        0
    }
}
