//! Monitored attacker: a decorator that reports per-call timings and error
//! counts to a pluggable metrics sink.
//!
//! The sink is a collaborator injected at construction; wrapping an attacker
//! changes nothing about its contract. What a sink does with the
//! measurements (export, aggregate, print) is its own concern, including any
//! per-label locking.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::attack::{Attack, AttackError, DoResult};
use crate::config::AttackConfig;
use crate::manager::LoadManager;
use crate::report::RunReport;

/// Destination for per-label request measurements.
pub trait MetricsSink: Send + Sync {
    fn record_timing(&self, label: &str, elapsed: Duration);
    fn record_error(&self, label: &str);
}

/// Default sink: emits one tracing event per measurement.
pub struct TracingSink;

impl MetricsSink for TracingSink {
    fn record_timing(&self, label: &str, elapsed: Duration) {
        debug!(label, ?elapsed, "request timing");
    }

    fn record_error(&self, label: &str) {
        debug!(label, "request error");
    }
}

/// Wraps an attacker and measures every `do_attack` call. A call counts as
/// an error when the attacker reported one or returned a status of 400 or
/// above.
pub struct Monitored {
    inner: Box<dyn Attack>,
    sink: Arc<dyn MetricsSink>,
}

impl Monitored {
    pub fn new(inner: Box<dyn Attack>, sink: Arc<dyn MetricsSink>) -> Self {
        Self { inner, sink }
    }
}

#[async_trait]
impl Attack for Monitored {
    async fn setup(
        &mut self,
        manager: Arc<LoadManager>,
        config: &AttackConfig,
    ) -> Result<(), AttackError> {
        self.inner.setup(manager, config).await
    }

    async fn do_attack(&mut self) -> DoResult {
        let before = tokio::time::Instant::now();
        let result = self.inner.do_attack().await;
        self.sink
            .record_timing(&result.request_label, before.elapsed());
        if result.is_error() {
            self.sink.record_error(&result.request_label);
        }
        result
    }

    async fn teardown(&mut self) -> Result<(), AttackError> {
        self.inner.teardown().await
    }

    fn clone_attack(&self) -> Box<dyn Attack> {
        Box::new(Self {
            inner: self.inner.clone_attack(),
            sink: Arc::clone(&self.sink),
        })
    }

    fn store_data(&self) -> bool {
        self.inner.store_data()
    }

    fn put_data(&self, record: &[String]) -> Result<(), AttackError> {
        self.inner.put_data(record)
    }

    fn get_data(&self) -> Result<Vec<String>, AttackError> {
        self.inner.get_data()
    }

    async fn before_run(&mut self, config: &AttackConfig) -> Result<(), AttackError> {
        self.inner.before_run(config).await
    }

    async fn after_run(&mut self, report: &mut RunReport) -> Result<(), AttackError> {
        self.inner.after_run(report).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        timings: Mutex<Vec<String>>,
        errors: Mutex<Vec<String>>,
    }

    impl MetricsSink for RecordingSink {
        fn record_timing(&self, label: &str, _elapsed: Duration) {
            self.timings.lock().unwrap().push(label.to_string());
        }

        fn record_error(&self, label: &str) {
            self.errors.lock().unwrap().push(label.to_string());
        }
    }

    struct StatusAttack {
        status: u16,
    }

    #[async_trait]
    impl Attack for StatusAttack {
        async fn setup(
            &mut self,
            _manager: Arc<LoadManager>,
            _config: &AttackConfig,
        ) -> Result<(), AttackError> {
            Ok(())
        }

        async fn do_attack(&mut self) -> DoResult {
            DoResult::labeled("s").with_status(self.status)
        }

        async fn teardown(&mut self) -> Result<(), AttackError> {
            Ok(())
        }

        fn clone_attack(&self) -> Box<dyn Attack> {
            Box::new(Self {
                status: self.status,
            })
        }
    }

    #[tokio::test]
    async fn records_timing_for_every_call() {
        let sink = Arc::new(RecordingSink::default());
        let mut monitored = Monitored::new(Box::new(StatusAttack { status: 200 }), sink.clone());
        monitored.do_attack().await;
        monitored.do_attack().await;
        assert_eq!(sink.timings.lock().unwrap().len(), 2);
        assert!(sink.errors.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn status_above_400_counts_as_error() {
        let sink = Arc::new(RecordingSink::default());
        let mut monitored = Monitored::new(Box::new(StatusAttack { status: 502 }), sink.clone());
        monitored.do_attack().await;
        assert_eq!(sink.errors.lock().unwrap().as_slice(), ["s"]);
    }

    #[tokio::test]
    async fn clones_share_the_sink() {
        let sink = Arc::new(RecordingSink::default());
        let monitored = Monitored::new(Box::new(StatusAttack { status: 200 }), sink.clone());
        let mut clone = monitored.clone_attack();
        clone.do_attack().await;
        assert_eq!(sink.timings.lock().unwrap().len(), 1);
    }
}
