//! Joining nodes to a kubeadm managed cluster.

use std::sync::Arc;

use thiserror::Error;
use tracing::{info, warn};

use super::controller::KubernetesController;
use super::lifecycle::{NodeLifecycle, NodeLifecycleState};
use super::KubernetesError;
use crate::poll::PollSchedule;
use crate::remote::{short_hostname, RemoteCommand, RemoteError, RemoteExecutor};

const DRY_RUN_TOKEN: &str = "dry-run.token";

#[derive(Debug, Error)]
pub enum KubeadmError {
    #[error("Error creating a new token, output: {0}")]
    CreateToken(String),
    #[error("Error deleting token {token}, output: {output}")]
    DeleteToken { token: String, output: String },
    #[error("Unable to compute the CA certificate hash, output: {0}")]
    CaCertHash(String),
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error(transparent)]
    Kubernetes(#[from] KubernetesError),
}

/// Runs `kubeadm` on a control node.
pub struct KubeadmController {
    executor: Arc<dyn RemoteExecutor>,
    controlling_node: String,
    dry_run: bool,
}

impl KubeadmController {
    pub fn new(executor: Arc<dyn RemoteExecutor>, controlling_node: impl Into<String>) -> Self {
        Self {
            executor,
            controlling_node: controlling_node.into(),
            dry_run: false,
        }
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    async fn run(&self, host: &str, command: &RemoteCommand) -> Result<String, KubeadmError> {
        Ok(self.executor.run(host, command).await?)
    }

    /// Creates a bootstrap token, printed on the last line.
    pub async fn create_token(&self) -> Result<String, KubeadmError> {
        let command = RemoteCommand::new(["kubeadm", "token", "create"]).last_line_only();
        let output = self.run(&self.controlling_node, &command).await?;
        let token = output.trim();
        if token.is_empty() {
            if self.dry_run {
                return Ok(DRY_RUN_TOKEN.to_string());
            }
            return Err(KubeadmError::CreateToken(output));
        }
        Ok(token.to_string())
    }

    pub async fn delete_token(&self, token: &str) -> Result<(), KubeadmError> {
        let command = RemoteCommand::new(["kubeadm", "token", "delete", token]);
        let output = self.run(&self.controlling_node, &command).await?;
        if self.dry_run || output.contains("deleted") {
            return Ok(());
        }
        Err(KubeadmError::DeleteToken {
            token: token.to_string(),
            output,
        })
    }

    /// SHA256 of the cluster CA public key, as `--discovery-token-ca-cert-hash`
    /// expects it (without the `sha256:` prefix).
    pub async fn ca_cert_hash(&self) -> Result<String, KubeadmError> {
        let command = RemoteCommand::new([
            "openssl x509 -pubkey -in /etc/kubernetes/pki/ca.crt",
            "| openssl rsa -pubin -outform der 2>/dev/null",
            "| openssl dgst -sha256 -hex",
            "| sed 's/^.* //'",
        ])
        .safe();
        let output = self.run(&self.controlling_node, &command).await?;
        let hash = output.trim();
        if hash.len() != 64 || !hash.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(KubeadmError::CaCertHash(output));
        }
        Ok(hash.to_string())
    }

    /// Joins `new_node` to the cluster `k8s` controls and, with a
    /// `ready_schedule`, waits for it to report ready. The bootstrap token
    /// is deleted whatever happens.
    pub async fn join(
        &self,
        new_node: &str,
        k8s: &KubernetesController,
        ready_schedule: Option<PollSchedule>,
    ) -> Result<(), KubeadmError> {
        let join_address = k8s.cluster_info().await?.join_address().to_string();
        let ca_cert_hash = self.ca_cert_hash().await?;
        let token = self.create_token().await?;

        let joined = self
            .join_with_token(new_node, k8s, &join_address, &token, &ca_cert_hash, ready_schedule)
            .await;
        let deleted = self.delete_token(&token).await;

        match (joined, deleted) {
            (Ok(()), deleted) => deleted,
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(cleanup)) => {
                warn!("unable to delete bootstrap token after a failed join: {}", cleanup);
                Err(e)
            }
        }
    }

    async fn join_with_token(
        &self,
        new_node: &str,
        k8s: &KubernetesController,
        join_address: &str,
        token: &str,
        ca_cert_hash: &str,
        ready_schedule: Option<PollSchedule>,
    ) -> Result<(), KubeadmError> {
        let mut lifecycle = NodeLifecycle::joining(short_hostname(new_node));
        let command = RemoteCommand::new(["kubeadm", "join", join_address, "--token", token])
            .arg("--discovery-token-ca-cert-hash")
            .arg(format!("sha256:{}", ca_cert_hash));
        info!(node = new_node, "joining the cluster at {}", join_address);
        self.run(new_node, &command).await?;

        let Some(schedule) = ready_schedule else {
            return Ok(());
        };
        k8s.wait_for_ready(lifecycle.node(), schedule).await?;
        lifecycle.transition(NodeLifecycleState::Ready)?;
        Ok(())
    }
}
