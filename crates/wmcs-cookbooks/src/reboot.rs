//! Host reboots over the remote executor.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::output::OutputError;
use crate::poll::{poll_until, PollError, PollSchedule, Probe};
use crate::remote::{RemoteCommand, RemoteError, RemoteExecutor};

#[derive(Debug, Error)]
pub enum RebootError {
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error("Host {host} did not come back within {waited:?}")]
    Timeout { host: String, waited: Duration },
    #[error(transparent)]
    Output(#[from] OutputError),
}

#[async_trait]
pub trait HostRebooter: Send + Sync {
    /// Issues the reboot and returns the time it was requested.
    async fn reboot(&self, host: &str) -> Result<DateTime<Utc>, RebootError>;

    /// Waits until `host` has booted after `since`.
    async fn wait_reboot_since(
        &self,
        host: &str,
        since: DateTime<Utc>,
        schedule: PollSchedule,
    ) -> Result<(), RebootError>;
}

/// Reboots hosts with `systemctl reboot` and detects the new boot from
/// `/proc/uptime`.
pub struct SshRebooter {
    executor: Arc<dyn RemoteExecutor>,
    dry_run: bool,
}

impl SshRebooter {
    pub fn new(executor: Arc<dyn RemoteExecutor>, dry_run: bool) -> Self {
        Self { executor, dry_run }
    }

    async fn uptime(&self, host: &str) -> Result<Duration, RebootError> {
        let raw = self
            .executor
            .run(host, &RemoteCommand::new(["cat", "/proc/uptime"]).safe())
            .await?;
        parse_uptime(&raw).ok_or_else(|| OutputError::malformed("uptime", "expected seconds", &raw).into())
    }
}

/// First field of `/proc/uptime`.
pub fn parse_uptime(raw: &str) -> Option<Duration> {
    let secs: f64 = raw.split_whitespace().next()?.parse().ok()?;
    if secs.is_finite() && secs >= 0.0 {
        Some(Duration::from_secs_f64(secs))
    } else {
        None
    }
}

#[async_trait]
impl HostRebooter for SshRebooter {
    async fn reboot(&self, host: &str) -> Result<DateTime<Utc>, RebootError> {
        let requested = Utc::now();
        info!(host = host, "rebooting");
        match self
            .executor
            .run(host, &RemoteCommand::new(["systemctl", "reboot"]))
            .await
        {
            Ok(_) => {}
            // The connection drops while the host goes down.
            Err(e @ (RemoteError::Failed { .. } | RemoteError::Timeout { .. })) => {
                debug!(host = host, "reboot command ended with: {}", e);
            }
            Err(e) => return Err(e.into()),
        }
        Ok(requested)
    }

    async fn wait_reboot_since(
        &self,
        host: &str,
        since: DateTime<Utc>,
        schedule: PollSchedule,
    ) -> Result<(), RebootError> {
        if self.dry_run {
            info!(host = host, "dry-run: not waiting for reboot");
            return Ok(());
        }

        let result = poll_until(schedule, move |attempt| async move {
            let elapsed = (Utc::now() - since).to_std().unwrap_or_default();
            match self.uptime(host).await {
                Ok(uptime) if uptime < elapsed => Ok(Probe::Ready(uptime)),
                Ok(uptime) => {
                    debug!(host = host, attempt, "still up for {:?}, not rebooted yet", uptime);
                    Ok(Probe::Pending(()))
                }
                Err(RebootError::Remote(e)) => {
                    debug!(host = host, attempt, "host unreachable: {}", e);
                    Ok(Probe::Pending(()))
                }
                Err(e) => Err(e),
            }
        })
        .await;

        match result {
            Ok(uptime) => {
                info!(host = host, "host is back, up for {:?}", uptime);
                Ok(())
            }
            Err(PollError::TimedOut { waited, .. }) => {
                warn!(host = host, "host did not come back after {:?}", waited);
                Err(RebootError::Timeout {
                    host: host.to_string(),
                    waited,
                })
            }
            Err(PollError::Probe(e)) => Err(e),
        }
    }
}
