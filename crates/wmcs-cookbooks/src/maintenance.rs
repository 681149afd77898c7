//! Maintenance mode: silence alerts (and, for Ceph, set the rebalance
//! flags) for the duration of an operation.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use thiserror::Error;
use tracing::{info, warn};

use crate::alerts::{silence_host, AlertError, SilenceId, SilenceManager};

#[derive(Debug, Error)]
pub enum MaintenanceError {
    #[error("Unable to manage silences: {0}")]
    Alert(#[from] AlertError),
}

#[async_trait]
pub trait MaintenanceMode: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Enters maintenance and returns the silences that must be released.
    async fn set_maintenance(&self, reason: &str) -> Result<Vec<SilenceId>, Self::Error>;

    /// Leaves maintenance. Calling it again with the same silences is a
    /// no-op.
    async fn unset_maintenance(&self, silences: &[SilenceId]) -> Result<(), Self::Error>;
}

/// Runs `body` inside maintenance mode.
///
/// Maintenance is released on every exit path of `body`, including a panic,
/// which is resumed after the release. When both the body and the release
/// fail, the body error is returned and the release error is logged.
pub async fn with_maintenance<M, T, E, F, Fut>(mode: &M, reason: &str, body: F) -> Result<T, E>
where
    M: MaintenanceMode + ?Sized,
    E: From<M::Error>,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let silences = mode.set_maintenance(reason).await?;
    info!(silences = silences.len(), "entered maintenance: {}", reason);

    let outcome = AssertUnwindSafe(body()).catch_unwind().await;
    let released = mode.unset_maintenance(&silences).await;

    match outcome {
        Err(panic) => {
            if let Err(e) = released {
                warn!("failed to leave maintenance after panic: {}", e);
            }
            std::panic::resume_unwind(panic)
        }
        Ok(Err(body_err)) => {
            if let Err(e) = released {
                warn!("failed to leave maintenance after error: {}", e);
            }
            Err(body_err)
        }
        Ok(Ok(value)) => {
            released?;
            info!("left maintenance: {}", reason);
            Ok(value)
        }
    }
}

/// Maintenance for a set of plain hosts: silences their alerts.
pub struct HostMaintenance {
    silences: Arc<dyn SilenceManager>,
    hosts: Vec<String>,
    duration: Duration,
    task_id: Option<String>,
}

impl HostMaintenance {
    pub fn new(silences: Arc<dyn SilenceManager>, hosts: Vec<String>, duration: Duration) -> Self {
        Self {
            silences,
            hosts,
            duration,
            task_id: None,
        }
    }

    pub fn with_task_id(mut self, task_id: Option<String>) -> Self {
        self.task_id = task_id;
        self
    }
}

#[async_trait]
impl MaintenanceMode for HostMaintenance {
    type Error = MaintenanceError;

    async fn set_maintenance(&self, reason: &str) -> Result<Vec<SilenceId>, MaintenanceError> {
        let mut created = Vec::with_capacity(self.hosts.len());
        for host in &self.hosts {
            match silence_host(
                self.silences.as_ref(),
                host,
                self.duration,
                reason,
                self.task_id.as_deref(),
            )
            .await
            {
                Ok(id) => created.push(id),
                Err(e) => {
                    // Partial acquisition is rolled back.
                    if let Err(cleanup) = self.unset_maintenance(&created).await {
                        warn!("unable to remove silences after failure: {}", cleanup);
                    }
                    return Err(e.into());
                }
            }
        }
        Ok(created)
    }

    async fn unset_maintenance(&self, silences: &[SilenceId]) -> Result<(), MaintenanceError> {
        for id in silences {
            self.silences.remove_silence(id).await?;
        }
        Ok(())
    }
}
