use std::sync::Arc;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Node, Pod};
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use super::lifecycle::{NodeLifecycle, NodeLifecycleState, RebootPhase};
use super::objects::{deployment_replicas, ClusterInfo, NodeExt, ObjectList, PodExt};
use super::KubernetesError;
use crate::config::TimeoutsConfig;
use crate::output::parse_json;
use crate::poll::{poll_until, PollError, PollSchedule, Probe};
use crate::reboot::HostRebooter;
use crate::remote::{domain_of, RemoteCommand, RemoteExecutor};

/// Drives a cluster with `kubectl` on one of its control nodes.
pub struct KubernetesController {
    executor: Arc<dyn RemoteExecutor>,
    controlling_node: String,
    timeouts: TimeoutsConfig,
    dry_run: bool,
}

impl KubernetesController {
    pub fn new(executor: Arc<dyn RemoteExecutor>, controlling_node: impl Into<String>) -> Self {
        Self {
            executor,
            controlling_node: controlling_node.into(),
            timeouts: TimeoutsConfig::default(),
            dry_run: false,
        }
    }

    pub fn with_timeouts(mut self, timeouts: TimeoutsConfig) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// In dry-run mode nothing changes in the cluster, so waiting for it to
    /// change is skipped.
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn controlling_node(&self) -> &str {
        &self.controlling_node
    }

    pub fn timeouts(&self) -> &TimeoutsConfig {
        &self.timeouts
    }

    pub fn nodes_domain(&self) -> &str {
        domain_of(&self.controlling_node)
    }

    fn kubectl<I, S>(args: I) -> RemoteCommand
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        RemoteCommand::new(["kubectl"]).args(args)
    }

    async fn run(&self, command: &RemoteCommand) -> Result<String, KubernetesError> {
        Ok(self.executor.run(&self.controlling_node, command).await?)
    }

    async fn get_json<T: DeserializeOwned>(&self, command: RemoteCommand) -> Result<T, KubernetesError> {
        let raw = self.run(&command.safe()).await?;
        Ok(parse_json("kubectl", &raw)?)
    }

    pub async fn cluster_info(&self) -> Result<ClusterInfo, KubernetesError> {
        let raw = self.run(&Self::kubectl(["cluster-info"]).safe()).await?;
        ClusterInfo::parse(&raw)
    }

    /// A single object, `None` if it does not exist and `missing_ok`.
    pub async fn object<T: DeserializeOwned>(
        &self,
        kind: &str,
        name: &str,
        namespace: &str,
        missing_ok: bool,
    ) -> Result<Option<T>, KubernetesError> {
        let command = Self::kubectl(["get", kind, name])
            .arg(format!("--namespace={}", namespace))
            .arg("--output=json");
        match self.get_json(command).await {
            Ok(object) => Ok(Some(object)),
            Err(KubernetesError::Remote(e)) if missing_ok && e.is_command_failure() => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn nodes(&self, selector: Option<&str>) -> Result<Vec<Node>, KubernetesError> {
        let mut command = Self::kubectl(["get", "nodes", "--output=json"]);
        if let Some(selector) = selector {
            command = command.arg(format!("--selector={}", selector));
        }
        let list: ObjectList<Node> = self.get_json(command).await?;
        Ok(list.items)
    }

    pub async fn node_hostnames(&self, selector: Option<&str>) -> Result<Vec<String>, KubernetesError> {
        Ok(self
            .nodes(selector)
            .await?
            .into_iter()
            .filter_map(|node| node.metadata.name)
            .collect())
    }

    pub async fn node(&self, hostname: &str) -> Result<Option<Node>, KubernetesError> {
        let selector = format!("kubernetes.io/hostname={}", hostname);
        Ok(self.nodes(Some(&selector)).await?.into_iter().next())
    }

    async fn require_node(&self, hostname: &str) -> Result<Node, KubernetesError> {
        self.node(hostname)
            .await?
            .ok_or_else(|| KubernetesError::NodeNotFound(hostname.to_string()))
    }

    pub async fn node_info(&self, hostname: &str) -> Result<NodeInfo, KubernetesError> {
        let node = self.require_node(hostname).await?;
        Ok(NodeInfo {
            kubelet_version: node.kubelet_version().unwrap_or_default().to_string(),
        })
    }

    pub async fn pods(&self, namespace: Option<&str>, field_selector: Option<&str>) -> Result<Vec<Pod>, KubernetesError> {
        let mut command = Self::kubectl(["get", "pods"]);
        command = match namespace {
            Some(ns) => command.arg(format!("--namespace={}", ns)),
            None => command.arg("--all-namespaces"),
        };
        command = command.arg("--output=json");
        if let Some(selector) = field_selector {
            command = command.arg(format!("--field-selector={}", selector));
        }
        let list: ObjectList<Pod> = self.get_json(command).await?;
        Ok(list.items)
    }

    pub async fn pods_for_node(&self, hostname: &str, namespace: Option<&str>) -> Result<Vec<Pod>, KubernetesError> {
        self.pods(namespace, Some(&format!("spec.nodeName={}", hostname)))
            .await
    }

    /// Pods a drain would evict from the node.
    pub async fn evictable_pods_for_node(&self, hostname: &str) -> Result<Vec<Pod>, KubernetesError> {
        Ok(self
            .pods_for_node(hostname, None)
            .await?
            .into_iter()
            .filter(|pod| pod.is_evictable())
            .collect())
    }

    pub async fn cordon_node(&self, hostname: &str) -> Result<(), KubernetesError> {
        self.require_node(hostname).await?;
        self.run(&Self::kubectl(["cordon", hostname])).await?;
        Ok(())
    }

    /// Starts evicting the pods of the node (cordoning it first). Use
    /// [`Self::wait_for_drain`] to wait for them to be gone.
    pub async fn drain_node(&self, hostname: &str) -> Result<(), KubernetesError> {
        self.require_node(hostname).await?;
        let command = Self::kubectl([
            "drain",
            "--ignore-daemonsets",
            "--delete-emptydir-data",
            "--grace-period=1",
            "--skip-wait-for-delete-timeout=1",
        ])
        .arg(format!("--timeout={}s", self.timeouts.kubectl_drain().as_secs()))
        .arg("--force")
        .arg(hostname);
        self.run(&command).await?;
        Ok(())
    }

    pub async fn wait_for_drain(&self, hostname: &str, schedule: PollSchedule) -> Result<(), KubernetesError> {
        if self.dry_run {
            info!(node = hostname, "dry-run: not waiting for the node to drain");
            return Ok(());
        }

        let result = poll_until(schedule, move |_| async move {
            let pods = self.evictable_pods_for_node(hostname).await?;
            if pods.is_empty() {
                return Ok::<_, KubernetesError>(Probe::Ready(()));
            }
            debug!(
                node = hostname,
                "waiting for the node to stop all its pods, still {} running",
                pods.len()
            );
            Ok(Probe::Pending(pods.iter().map(Pod::qualified_name).collect::<Vec<_>>()))
        })
        .await;

        match result {
            Ok(()) => {
                info!(node = hostname, "node drained");
                Ok(())
            }
            Err(PollError::TimedOut { waited, last, .. }) => Err(KubernetesError::DrainTimeout {
                node: hostname.to_string(),
                waited,
                pods: last.unwrap_or_default(),
            }),
            Err(PollError::Probe(e)) => Err(e),
        }
    }

    /// Removes the node object. It does not drain the node first.
    pub async fn delete_node(&self, hostname: &str) -> Result<(), KubernetesError> {
        self.require_node(hostname).await?;
        self.run(&Self::kubectl(["delete", "node", hostname])).await?;
        Ok(())
    }

    pub async fn uncordon_node(&self, hostname: &str) -> Result<(), KubernetesError> {
        self.require_node(hostname).await?;
        self.run(&Self::kubectl(["uncordon", hostname])).await?;
        Ok(())
    }

    pub async fn is_node_ready(&self, hostname: &str) -> Result<bool, KubernetesError> {
        let node = self.require_node(hostname).await?;
        node.is_ready().ok_or_else(|| KubernetesError::NodeStatusError {
            node: hostname.to_string(),
            conditions: node.conditions_summary(),
        })
    }

    pub async fn wait_for_ready(&self, hostname: &str, schedule: PollSchedule) -> Result<(), KubernetesError> {
        if self.dry_run {
            info!(node = hostname, "dry-run: not waiting for the node to be ready");
            return Ok(());
        }

        let result = poll_until(schedule, move |attempt| async move {
            let node = self.node(hostname).await?;
            match node {
                Some(node) if node.is_ready() == Some(true) => Ok::<_, KubernetesError>(Probe::Ready(())),
                Some(node) => {
                    debug!(node = hostname, attempt, "node not ready yet");
                    Ok(Probe::Pending(node.conditions_summary()))
                }
                // A node that is joining may not be registered yet.
                None => Ok(Probe::Pending("not registered".to_string())),
            }
        })
        .await;

        match result {
            Ok(()) => {
                info!(node = hostname, "node is ready");
                Ok(())
            }
            Err(PollError::TimedOut { waited, last, .. }) => Err(KubernetesError::NotReadyTimeout {
                node: hostname.to_string(),
                waited,
                conditions: last.unwrap_or_default(),
            }),
            Err(PollError::Probe(e)) => Err(e),
        }
    }

    pub async fn add_node_labels(&self, hostname: &str, labels: &[String]) -> Result<(), KubernetesError> {
        self.run(&Self::kubectl(["label", "node", hostname]).args(labels.iter().cloned()))
            .await?;
        Ok(())
    }

    pub async fn add_node_taints(&self, hostname: &str, taints: &[String]) -> Result<(), KubernetesError> {
        self.run(&Self::kubectl(["taint", "node", hostname]).args(taints.iter().cloned()))
            .await?;
        Ok(())
    }

    pub async fn delete_pod(&self, pod_name: &str, namespace: &str) -> Result<(), KubernetesError> {
        self.run(&Self::kubectl(["delete", "--namespace", namespace, "pod", pod_name]))
            .await?;
        Ok(())
    }

    pub async fn is_pod_running(&self, pod_name: &str, namespace: &str, missing_ok: bool) -> Result<bool, KubernetesError> {
        let pod: Option<Pod> = self.object("pod", pod_name, namespace, missing_ok).await?;
        Ok(pod.is_some_and(|p| p.is_running()))
    }

    pub async fn deployment(&self, name: &str, namespace: &str) -> Result<Deployment, KubernetesError> {
        self.get_json(Self::kubectl(["-n", namespace, "get", "deployment", "-o", "json", name]))
            .await
    }

    pub async fn wait_for_deployment_replicas(
        &self,
        name: &str,
        namespace: &str,
        replicas: u32,
        schedule: PollSchedule,
    ) -> Result<(), KubernetesError> {
        if self.dry_run {
            return Ok(());
        }

        let result = poll_until(schedule, move |_| async move {
            let current = deployment_replicas(&self.deployment(name, namespace).await?);
            if current == replicas {
                return Ok::<_, KubernetesError>(Probe::Ready(()));
            }
            Ok(Probe::Pending(current))
        })
        .await;

        match result {
            Ok(()) => Ok(()),
            Err(PollError::TimedOut { waited, last, .. }) => Err(KubernetesError::DeploymentTimeout {
                deployment: name.to_string(),
                namespace: namespace.to_string(),
                waited,
                expected: replicas,
                current: last.unwrap_or_default(),
            }),
            Err(PollError::Probe(e)) => Err(e),
        }
    }

    pub async fn scale_deployment(&self, name: &str, replicas: u32, namespace: &str) -> Result<(), KubernetesError> {
        let command = Self::kubectl(["-n", namespace, "scale", "deployment", name])
            .arg(format!("--replicas={}", replicas));
        self.run(&command).await?;
        Ok(())
    }

    /// Cordons and drains the node, waiting until its evictable pods are
    /// gone.
    pub async fn drain_and_wait(&self, lifecycle: &mut NodeLifecycle) -> Result<(), KubernetesError> {
        let hostname = lifecycle.node().to_string();
        lifecycle.transition(NodeLifecycleState::Cordoned)?;
        self.cordon_node(&hostname).await?;
        lifecycle.transition(NodeLifecycleState::Draining)?;
        self.drain_node(&hostname).await?;
        self.wait_for_drain(&hostname, self.timeouts.node_drain()).await?;
        lifecycle.transition(NodeLifecycleState::Empty)
    }

    /// Uncordons a node that went through an external step and waits for it
    /// to report ready.
    pub async fn rejoin(&self, lifecycle: &mut NodeLifecycle) -> Result<(), KubernetesError> {
        let hostname = lifecycle.node().to_string();
        if lifecycle.state() != NodeLifecycleState::Rejoining {
            lifecycle.transition(NodeLifecycleState::Rejoining)?;
        }
        self.uncordon_node(&hostname).await?;
        self.wait_for_ready(&hostname, self.timeouts.node_ready()).await?;
        lifecycle.transition(NodeLifecycleState::Ready)
    }

    /// Drains, reboots and brings the node back, reporting each phase to
    /// `on_phase` as it starts.
    pub async fn reboot_node(
        &self,
        lifecycle: &mut NodeLifecycle,
        domain: &str,
        rebooter: &dyn HostRebooter,
        on_phase: &mut (dyn FnMut(&str, RebootPhase) + Send),
    ) -> Result<(), KubernetesError> {
        let hostname = lifecycle.node().to_string();

        on_phase(&hostname, RebootPhase::Drain);
        lifecycle.transition(NodeLifecycleState::Cordoned)?;
        self.cordon_node(&hostname).await?;
        lifecycle.transition(NodeLifecycleState::Draining)?;
        self.drain_node(&hostname).await?;

        on_phase(&hostname, RebootPhase::WaitDrain);
        self.wait_for_drain(&hostname, self.timeouts.node_drain()).await?;
        lifecycle.transition(NodeLifecycleState::Empty)?;

        on_phase(&hostname, RebootPhase::Reboot);
        let fqdn = format!("{}.{}", hostname, domain);
        let since = rebooter.reboot(&fqdn).await?;
        rebooter
            .wait_reboot_since(&fqdn, since, self.timeouts.reboot())
            .await?;
        lifecycle.transition(NodeLifecycleState::Rejoining)?;

        on_phase(&hostname, RebootPhase::Uncordon);
        self.uncordon_node(&hostname).await?;

        on_phase(&hostname, RebootPhase::WaitReady);
        self.wait_for_ready(&hostname, self.timeouts.node_ready()).await?;
        lifecycle.transition(NodeLifecycleState::Ready)?;

        on_phase(&hostname, RebootPhase::Done);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    pub kubelet_version: String,
}
