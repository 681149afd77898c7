//! Static pod handling on a single kubelet.
//!
//! A static pod is stopped by moving its manifest out of the static pod path
//! (kubelet ignores dotfiles) and started by moving it back.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use super::controller::KubernetesController;
use super::KubernetesError;
use crate::output::{parse, OutputError, OutputFormat};
use crate::remote::{short_hostname, RemoteCommand, RemoteError, RemoteExecutor};

pub const DEFAULT_KUBELET_CONFIG: &str = "/var/lib/kubelet/config.yaml";
const STOPPED_PREFIX: &str = ".cookbook-stopped-";
const API_SERVER: &str = "kube-apiserver";

#[derive(Debug, Error)]
pub enum KubeletError {
    #[error("Unexpected kubelet config: {0}")]
    UnexpectedConfig(String),
    #[error("Static pod {0} doesn't seem to be defined in this kubelet")]
    StaticPodNotFound(String),
    #[error("Path '{path}' contains cruft, fix by hand: {entry}")]
    UnexpectedStaticPodPath { path: String, entry: String },
    #[error("Failed to stop static pod {0}")]
    UnableToStop(String),
    #[error("Failed to start static pod {0}")]
    UnableToStart(String),
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error(transparent)]
    Output(#[from] OutputError),
    #[error(transparent)]
    Kubernetes(#[from] KubernetesError),
}

pub struct KubeletController<'a> {
    executor: Arc<dyn RemoteExecutor>,
    node_fqdn: String,
    k8s: &'a KubernetesController,
    config_path: String,
    config: OnceCell<serde_yaml::Value>,
}

impl<'a> KubeletController<'a> {
    pub fn new(executor: Arc<dyn RemoteExecutor>, node_fqdn: impl Into<String>, k8s: &'a KubernetesController) -> Self {
        Self {
            executor,
            node_fqdn: node_fqdn.into(),
            k8s,
            config_path: DEFAULT_KUBELET_CONFIG.to_string(),
            config: OnceCell::new(),
        }
    }

    pub fn with_config_path(mut self, path: impl Into<String>) -> Self {
        self.config_path = path.into();
        self
    }

    async fn run(&self, command: RemoteCommand) -> Result<String, KubeletError> {
        Ok(self.executor.run(&self.node_fqdn, &command).await?)
    }

    /// The kubelet YAML config, read once.
    pub async fn config(&self) -> Result<&serde_yaml::Value, KubeletError> {
        self.config
            .get_or_try_init(|| async {
                let raw = self
                    .run(RemoteCommand::new(["cat", self.config_path.as_str()]).safe())
                    .await?;
                Ok::<_, KubeletError>(parse("kubelet config", OutputFormat::Yaml, &raw)?)
            })
            .await
    }

    pub async fn config_parameter(&self, name: &str) -> Result<&serde_yaml::Value, KubeletError> {
        self.config()
            .await?
            .get(name)
            .ok_or_else(|| KubeletError::UnexpectedConfig(format!("couldn't find parameter {} in the kubelet config", name)))
    }

    /// How often kubelet rescans the static pod path.
    pub async fn file_check_frequency(&self) -> Result<Duration, KubeletError> {
        let raw = match self.config_parameter("fileCheckFrequency").await? {
            serde_yaml::Value::String(s) => s.clone(),
            other => format!("{:?}", other),
        };
        raw.strip_suffix('s')
            .and_then(|secs| secs.parse::<u64>().ok())
            .map(Duration::from_secs)
            .ok_or_else(|| KubeletError::UnexpectedConfig(format!("fileCheckFrequency {:?} is not in seconds", raw)))
    }

    pub async fn static_pod_path(&self) -> Result<String, KubeletError> {
        self.config_parameter("staticPodPath")
            .await?
            .as_str()
            .map(|s| s.trim_end_matches('/').to_string())
            .ok_or_else(|| KubeletError::UnexpectedConfig("staticPodPath is not a string".to_string()))
    }

    pub async fn static_pods_defined(&self) -> Result<Vec<String>, KubeletError> {
        let path = self.static_pod_path().await?;
        let raw = self
            .run(RemoteCommand::new(["ls"]).arg(format!("{}/*.yaml", path)).safe())
            .await?;
        let dir = format!("{}/", path);
        Ok(raw
            .lines()
            .map(|line| {
                let name = line.trim();
                let name = name.strip_prefix(&dir).unwrap_or(name);
                name.strip_suffix(".yaml").unwrap_or(name).to_string()
            })
            .filter(|name| !name.is_empty())
            .collect())
    }

    /// Fails if a previous run left stopped manifests behind.
    pub async fn assert_static_pod_path_clean(&self) -> Result<(), KubeletError> {
        let path = self.static_pod_path().await?;
        let command = RemoteCommand::new(["ls", "-ad"]).arg(format!("{}/.*", path)).safe();
        let raw = match self.run(command).await {
            Ok(raw) => raw,
            // Nothing matched the glob.
            Err(KubeletError::Remote(e)) if e.is_command_failure() => return Ok(()),
            Err(e) => return Err(e),
        };

        let allowed = [
            format!("{}/.", path),
            format!("{}/..", path),
            // left by package upgrades
            format!("{}/.kubelet-keep", path),
        ];
        match raw.lines().map(str::trim).find(|line| !line.is_empty() && !allowed.iter().any(|a| a == line)) {
            Some(entry) => Err(KubeletError::UnexpectedStaticPodPath {
                path,
                entry: entry.to_string(),
            }),
            None => Ok(()),
        }
    }

    async fn is_defined(&self, pod_name: &str) -> Result<bool, KubeletError> {
        Ok(self.static_pods_defined().await?.iter().any(|p| p == pod_name))
    }

    /// Name of the mirror pod the API server shows for a static pod.
    fn runtime_name(&self, pod_name: &str) -> String {
        format!("{}-{}", pod_name, short_hostname(&self.node_fqdn))
    }

    async fn move_manifest(&self, from: String, to: String) -> Result<(), KubeletError> {
        self.run(RemoteCommand::new(["mv"]).arg(from).arg(to)).await?;
        let wait = self.file_check_frequency().await?;
        debug!(node = %self.node_fqdn, "waiting {:?} for kubelet to notice", wait);
        tokio::time::sleep(wait).await;
        Ok(())
    }

    pub async fn stop_static_pod(&self, pod_name: &str, namespace: &str) -> Result<(), KubeletError> {
        if !self.is_defined(pod_name).await? {
            return Err(KubeletError::StaticPodNotFound(pod_name.to_string()));
        }

        let path = self.static_pod_path().await?;
        self.move_manifest(
            format!("{}/{}.yaml", path, pod_name),
            format!("{}/{}{}.yaml", path, STOPPED_PREFIX, pod_name),
        )
        .await?;

        // Resets the mirror pod creation timestamp; optional.
        if let Err(e) = self.k8s.delete_pod(&self.runtime_name(pod_name), namespace).await {
            debug!("unable to delete mirror pod for {}: {}", pod_name, e);
        }

        if self.is_defined(pod_name).await?
            && self.k8s.is_pod_running(&self.runtime_name(pod_name), namespace, true).await?
        {
            return Err(KubeletError::UnableToStop(pod_name.to_string()));
        }
        info!(node = %self.node_fqdn, "stopped static pod {}", pod_name);
        Ok(())
    }

    pub async fn start_static_pod(&self, pod_name: &str, namespace: &str) -> Result<(), KubeletError> {
        if self.is_defined(pod_name).await?
            && self.k8s.is_pod_running(&self.runtime_name(pod_name), namespace, true).await?
        {
            debug!("static pod {} already running", pod_name);
            return Ok(());
        }

        let path = self.static_pod_path().await?;
        self.move_manifest(
            format!("{}/{}{}.yaml", path, STOPPED_PREFIX, pod_name),
            format!("{}/{}.yaml", path, pod_name),
        )
        .await?;

        if !self.is_defined(pod_name).await?
            || !self.k8s.is_pod_running(&self.runtime_name(pod_name), namespace, true).await?
        {
            return Err(KubeletError::UnableToStart(pod_name.to_string()));
        }
        info!(node = %self.node_fqdn, "started static pod {}", pod_name);
        Ok(())
    }

    pub async fn restart_static_pod(&self, pod_name: &str, namespace: &str) -> Result<(), KubeletError> {
        self.stop_static_pod(pod_name, namespace).await?;
        self.start_static_pod(pod_name, namespace).await
    }

    /// Restarts every static pod, the API server first: the scheduler and
    /// controller manager misbehave if they come up before it.
    pub async fn restart_all_static_pods(&self, namespace: &str) -> Result<Vec<String>, KubeletError> {
        self.assert_static_pod_path_clean().await?;

        let mut pods = self.static_pods_defined().await?;
        if let Some(index) = pods.iter().position(|p| p == API_SERVER) {
            let api_server = pods.remove(index);
            pods.insert(0, api_server);
        }

        for pod in &pods {
            self.restart_static_pod(pod, namespace).await?;
        }
        Ok(pods)
    }
}
