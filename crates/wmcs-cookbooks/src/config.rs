use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::inventory::{Cluster, InventoryError, Node};
use crate::poll::PollSchedule;
use crate::remote::SshConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Unable to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid TOML config: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Invalid JSON config: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Unsupported config file extension: {0}")]
    UnsupportedExtension(String),
    #[error(transparent)]
    Inventory(#[from] InventoryError),
}

/// Poll timeouts and intervals, in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutsConfig {
    pub poll_interval_secs: u64,
    /// Ceph averages health over 15 minutes, so this is long.
    pub cluster_healthy_secs: u64,
    pub rebalance_secs: u64,
    pub rebalance_start_secs: u64,
    pub in_progress_events_secs: u64,
    pub manager_standby_secs: u64,
    pub node_drain_secs: u64,
    pub node_ready_secs: u64,
    pub reboot_secs: u64,
    pub kubectl_drain_secs: u64,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 10,
            cluster_healthy_secs: 30 * 60,
            rebalance_secs: 5 * 60 * 60,
            rebalance_start_secs: 2 * 60,
            in_progress_events_secs: 10 * 60,
            manager_standby_secs: 10 * 60,
            node_drain_secs: 5 * 60,
            node_ready_secs: 10 * 60,
            reboot_secs: 30 * 60,
            kubectl_drain_secs: 60,
        }
    }
}

impl TimeoutsConfig {
    fn schedule(&self, timeout_secs: u64) -> PollSchedule {
        PollSchedule::from_secs(timeout_secs, self.poll_interval_secs)
    }

    pub fn cluster_healthy(&self) -> PollSchedule {
        self.schedule(self.cluster_healthy_secs)
    }

    pub fn rebalance(&self) -> PollSchedule {
        self.schedule(self.rebalance_secs)
    }

    pub fn rebalance_start(&self) -> PollSchedule {
        self.schedule(self.rebalance_start_secs)
    }

    pub fn in_progress_events(&self) -> PollSchedule {
        self.schedule(self.in_progress_events_secs)
    }

    pub fn manager_standby(&self) -> PollSchedule {
        self.schedule(self.manager_standby_secs)
    }

    pub fn node_drain(&self) -> PollSchedule {
        self.schedule(self.node_drain_secs)
    }

    pub fn node_ready(&self) -> PollSchedule {
        self.schedule(self.node_ready_secs)
    }

    pub fn reboot(&self) -> PollSchedule {
        self.schedule(self.reboot_secs)
    }

    pub fn kubectl_drain(&self) -> Duration {
        Duration::from_secs(self.kubectl_drain_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CephClusterConfig {
    pub name: String,
    #[serde(default = "default_osd_drives")]
    pub expected_osd_drives: usize,
    pub nodes: Vec<Node>,
}

fn default_osd_drives() -> usize {
    8
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct K8sClusterConfig {
    pub name: String,
    pub project: String,
    /// Domain of the cluster VMs, e.g. `tools.eqiad1.wikimedia.cloud`.
    pub domain: String,
    pub nodes: Vec<Node>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CookbookConfig {
    pub alertmanager_url: String,
    pub silence_duration_secs: u64,
    pub ssh: SshConfig,
    pub timeouts: TimeoutsConfig,
    pub ceph_clusters: Vec<CephClusterConfig>,
    pub k8s_clusters: Vec<K8sClusterConfig>,
}

impl Default for CookbookConfig {
    fn default() -> Self {
        Self {
            alertmanager_url: String::from("http://localhost:9093"),
            silence_duration_secs: 4 * 60 * 60,
            ssh: SshConfig::default(),
            timeouts: TimeoutsConfig::default(),
            ceph_clusters: Vec::new(),
            k8s_clusters: Vec::new(),
        }
    }
}

impl CookbookConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: CookbookConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents)?,
            "json" => serde_json::from_str(&contents)?,
            _ => return Err(ConfigError::UnsupportedExtension(ext.to_string())),
        };
        config.validate()?;
        Ok(config)
    }

    /// Checks the inventory invariants of every configured cluster.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for ceph in &self.ceph_clusters {
            Cluster::new(ceph.name.clone(), ceph.nodes.clone())?;
        }
        for k8s in &self.k8s_clusters {
            Cluster::new(k8s.name.clone(), k8s.nodes.clone())?;
        }
        Ok(())
    }

    pub fn silence_duration(&self) -> Duration {
        Duration::from_secs(self.silence_duration_secs)
    }

    pub fn ceph_cluster(&self, name: &str) -> Result<(Cluster, &CephClusterConfig), ConfigError> {
        let ceph = self
            .ceph_clusters
            .iter()
            .find(|c| c.name == name)
            .ok_or_else(|| InventoryError::UnknownCluster(name.to_string()))?;
        Ok((Cluster::new(ceph.name.clone(), ceph.nodes.clone())?, ceph))
    }

    pub fn k8s_cluster(&self, name: &str) -> Result<(Cluster, &K8sClusterConfig), ConfigError> {
        let k8s = self
            .k8s_clusters
            .iter()
            .find(|c| c.name == name)
            .ok_or_else(|| InventoryError::UnknownCluster(name.to_string()))?;
        Ok((Cluster::new(k8s.name.clone(), k8s.nodes.clone())?, k8s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::NodeRole;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_values() {
        let config = CookbookConfig::default();
        assert_eq!(config.alertmanager_url, "http://localhost:9093");
        assert_eq!(config.silence_duration(), Duration::from_secs(4 * 3600));
        assert_eq!(config.timeouts.poll_interval_secs, 10);
        assert_eq!(
            config.timeouts.cluster_healthy(),
            PollSchedule::from_secs(1800, 10)
        );
        assert!(config.ceph_clusters.is_empty());
        assert!(config.ssh.use_sudo);
    }

    #[test]
    fn test_from_file_toml() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(
            file,
            r#"
alertmanager_url = "http://alertmanager.example:9093"

[ssh]
user = "operator"

[timeouts]
poll_interval_secs = 5
node_drain_secs = 120

[[ceph_clusters]]
name = "eqiad1"
expected_osd_drives = 10
nodes = [
    {{ fqdn = "cloudcephmon1001.eqiad.wmnet", role = "ceph-mon" }},
    {{ fqdn = "cloudcephosd1001.eqiad.wmnet", role = "ceph-osd" }},
]

[[k8s_clusters]]
name = "tools"
project = "tools"
domain = "tools.eqiad1.wikimedia.cloud"
nodes = [
    {{ fqdn = "tools-k8s-control-1.tools.eqiad1.wikimedia.cloud", role = "k8s-control" }},
]
            "#
        )
        .unwrap();

        let config = CookbookConfig::from_file(file.path()).unwrap();
        assert_eq!(config.alertmanager_url, "http://alertmanager.example:9093");
        assert_eq!(config.ssh.user.as_deref(), Some("operator"));
        assert_eq!(config.ssh.binary, "ssh");
        assert_eq!(config.timeouts.node_drain(), PollSchedule::from_secs(120, 5));
        assert_eq!(config.timeouts.node_ready_secs, 600);

        let (cluster, ceph) = config.ceph_cluster("eqiad1").unwrap();
        assert_eq!(ceph.expected_osd_drives, 10);
        assert_eq!(cluster.nodes_by_role(NodeRole::CephMon).len(), 1);

        let (k8s, k8s_config) = config.k8s_cluster("tools").unwrap();
        assert_eq!(k8s_config.project, "tools");
        assert_eq!(k8s.nodes()[0].hostname(), "tools-k8s-control-1");
    }

    #[test]
    fn test_from_file_json() {
        let mut file = NamedTempFile::with_suffix(".json").unwrap();
        writeln!(
            file,
            r#"{{
                "alertmanager_url": "http://am:9093",
                "ceph_clusters": [
                    {{"name": "codfw1", "nodes": [{{"fqdn": "cloudcephmon2001.codfw.wmnet", "role": "ceph-mon"}}]}}
                ]
            }}"#
        )
        .unwrap();

        let config = CookbookConfig::from_file(file.path()).unwrap();
        let (_, ceph) = config.ceph_cluster("codfw1").unwrap();
        assert_eq!(ceph.expected_osd_drives, 8);
        assert!(config.ceph_cluster("eqiad1").is_err());
    }

    #[test]
    fn test_from_file_rejects_duplicate_nodes() {
        let mut file = NamedTempFile::with_suffix(".json").unwrap();
        writeln!(
            file,
            r#"{{"ceph_clusters": [{{"name": "eqiad1", "nodes": [
                {{"fqdn": "cloudcephmon1001.eqiad.wmnet", "role": "ceph-mon"}},
                {{"fqdn": "cloudcephmon1001.eqiad.wmnet", "role": "ceph-mon"}}
            ]}}]}}"#
        )
        .unwrap();

        let result = CookbookConfig::from_file(file.path());
        assert!(matches!(
            result,
            Err(ConfigError::Inventory(InventoryError::DuplicateNode { .. }))
        ));
    }

    #[test]
    fn test_from_file_unsupported_extension() {
        let file = NamedTempFile::with_suffix(".ini").unwrap();
        let result = CookbookConfig::from_file(file.path());
        assert!(matches!(result, Err(ConfigError::UnsupportedExtension(_))));
    }
}
