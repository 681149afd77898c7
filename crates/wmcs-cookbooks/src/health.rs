//! Health gate: block until a cluster reports healthy or a deadline passes.

use std::collections::BTreeSet;
use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info};

use crate::poll::{poll_until, PollError, PollSchedule, Probe};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HealthCheckOptions {
    /// Treat "unhealthy only because maintenance flags are set" as healthy.
    pub consider_maintenance_healthy: bool,
    /// Health check names that never make the cluster unhealthy.
    pub ignored_checks: BTreeSet<String>,
}

/// A structured health summary as returned by a cluster.
pub trait HealthReport: Debug + Send + Sync {
    fn is_healthy(&self, options: &HealthCheckOptions) -> bool;

    /// One line describing the status, used in logs and timeout errors.
    fn summary(&self) -> String;
}

#[async_trait]
pub trait HealthSource: Send + Sync {
    type Report: HealthReport;
    type Error: std::error::Error + Send + Sync + 'static;

    async fn health(&self) -> Result<Self::Report, Self::Error>;
}

#[derive(Debug, Error)]
pub enum HealthGateError<E: std::error::Error + 'static> {
    #[error("cluster not healthy after {waited:?} ({polls} polls), last status: {last_status}")]
    ClusterUnhealthyTimeout {
        waited: Duration,
        polls: u32,
        last_status: String,
    },
    #[error("unable to fetch cluster health: {0}")]
    Source(#[source] E),
}

pub struct ClusterHealthGate<'a, S> {
    source: &'a S,
    ignored_checks: BTreeSet<String>,
}

impl<'a, S: HealthSource> ClusterHealthGate<'a, S> {
    pub fn new(source: &'a S) -> Self {
        Self {
            source,
            ignored_checks: BTreeSet::new(),
        }
    }

    pub fn ignore_checks<I, T>(mut self, checks: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.ignored_checks.extend(checks.into_iter().map(Into::into));
        self
    }

    /// Polls the source every `poll_interval` until it reports healthy.
    ///
    /// Returns the first healthy report. Errors from the source abort the
    /// wait immediately.
    pub async fn wait_for_healthy(
        &self,
        timeout: Duration,
        poll_interval: Duration,
        consider_maintenance_healthy: bool,
    ) -> Result<S::Report, HealthGateError<S::Error>> {
        let options = HealthCheckOptions {
            consider_maintenance_healthy,
            ignored_checks: self.ignored_checks.clone(),
        };
        let source = self.source;
        let options_ref = &options;

        info!(
            timeout_secs = timeout.as_secs(),
            consider_maintenance_healthy, "waiting for cluster to become healthy"
        );

        let result = poll_until(PollSchedule::new(timeout, poll_interval), move |attempt| async move {
            let report = match source.health().await {
                Ok(report) => report,
                Err(e) => return Err(e),
            };
            if report.is_healthy(options_ref) {
                Ok(Probe::Ready(report))
            } else {
                let summary = report.summary();
                debug!(attempt, status = %summary, "cluster not healthy yet");
                Ok(Probe::Pending(summary))
            }
        })
        .await;

        match result {
            Ok(report) => {
                info!("cluster is healthy: {}", report.summary());
                Ok(report)
            }
            Err(PollError::TimedOut {
                waited,
                attempts,
                last,
            }) => Err(HealthGateError::ClusterUnhealthyTimeout {
                waited,
                polls: attempts,
                last_status: last.unwrap_or_else(|| "never polled".to_string()),
            }),
            Err(PollError::Probe(e)) => Err(HealthGateError::Source(e)),
        }
    }
}
