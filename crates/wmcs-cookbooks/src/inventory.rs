use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::remote::short_hostname;

#[derive(Debug, Error)]
pub enum InventoryError {
    #[error("Duplicate node {node} in cluster {cluster}")]
    DuplicateNode { cluster: String, node: String },
    #[error("Cluster {cluster} has no {role} nodes")]
    NoNodesForRole { cluster: String, role: NodeRole },
    #[error("Unknown cluster: {0}")]
    UnknownCluster(String),
    #[error("Unknown node role: {0}")]
    UnknownRole(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeRole {
    CephMon,
    CephOsd,
    K8sControl,
    K8sWorker,
    K8sWorkerNfs,
    K8sIngress,
    K8sEtcd,
    K8sHaproxy,
}

impl NodeRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeRole::CephMon => "ceph-mon",
            NodeRole::CephOsd => "ceph-osd",
            NodeRole::K8sControl => "k8s-control",
            NodeRole::K8sWorker => "k8s-worker",
            NodeRole::K8sWorkerNfs => "k8s-worker-nfs",
            NodeRole::K8sIngress => "k8s-ingress",
            NodeRole::K8sEtcd => "k8s-etcd",
            NodeRole::K8sHaproxy => "k8s-haproxy",
        }
    }

    /// Hostname prefix used for VMs of this role inside a project, e.g.
    /// `tools-k8s-worker-` for workers of the `tools` project.
    pub fn name_prefix(&self, project: &str) -> Option<String> {
        let suffix = match self {
            NodeRole::K8sControl => "k8s-control",
            NodeRole::K8sWorker => "k8s-worker",
            NodeRole::K8sWorkerNfs => "k8s-worker-nfs",
            NodeRole::K8sIngress => "k8s-ingress",
            NodeRole::K8sEtcd => "k8s-etcd",
            NodeRole::K8sHaproxy => "k8s-haproxy",
            NodeRole::CephMon | NodeRole::CephOsd => return None,
        };
        Some(format!("{}-{}-", project, suffix))
    }

    /// Whether nodes of this role are registered as Kubernetes `Node` objects.
    pub fn is_kubernetes_node(&self) -> bool {
        matches!(
            self,
            NodeRole::K8sControl | NodeRole::K8sWorker | NodeRole::K8sWorkerNfs | NodeRole::K8sIngress
        )
    }
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeRole {
    type Err = InventoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let role = match s {
            "ceph-mon" => NodeRole::CephMon,
            "ceph-osd" => NodeRole::CephOsd,
            "k8s-control" | "control" => NodeRole::K8sControl,
            "k8s-worker" | "worker" => NodeRole::K8sWorker,
            "k8s-worker-nfs" | "worker-nfs" => NodeRole::K8sWorkerNfs,
            "k8s-ingress" | "ingress" => NodeRole::K8sIngress,
            "k8s-etcd" | "etcd" => NodeRole::K8sEtcd,
            "k8s-haproxy" | "haproxy" => NodeRole::K8sHaproxy,
            other => return Err(InventoryError::UnknownRole(other.to_string())),
        };
        Ok(role)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub fqdn: String,
    pub role: NodeRole,
}

impl Node {
    pub fn new(fqdn: impl Into<String>, role: NodeRole) -> Self {
        Self { fqdn: fqdn.into(), role }
    }

    pub fn hostname(&self) -> &str {
        short_hostname(&self.fqdn)
    }
}

/// A named set of nodes. Node names are unique within a cluster.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Cluster {
    name: String,
    nodes: Vec<Node>,
}

impl Cluster {
    pub fn new(name: impl Into<String>, nodes: Vec<Node>) -> Result<Self, InventoryError> {
        let name = name.into();
        let mut seen = HashSet::new();
        for node in &nodes {
            // Nodes are looked up by short hostname too.
            if !seen.insert(node.hostname()) {
                return Err(InventoryError::DuplicateNode {
                    cluster: name,
                    node: node.fqdn.clone(),
                });
            }
        }
        Ok(Self { name, nodes })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn nodes_by_role(&self, role: NodeRole) -> Vec<&Node> {
        self.nodes.iter().filter(|n| n.role == role).collect()
    }

    pub fn fqdns_by_role(&self, role: NodeRole) -> Vec<String> {
        self.nodes_by_role(role).into_iter().map(|n| n.fqdn.clone()).collect()
    }

    pub fn first_of_role(&self, role: NodeRole) -> Result<&Node, InventoryError> {
        self.nodes
            .iter()
            .find(|n| n.role == role)
            .ok_or_else(|| InventoryError::NoNodesForRole {
                cluster: self.name.clone(),
                role,
            })
    }

    /// First node of `role` whose short hostname is not `skip_hostname`.
    pub fn pick_other(&self, role: NodeRole, skip_hostname: &str) -> Result<&Node, InventoryError> {
        self.nodes
            .iter()
            .find(|n| n.role == role && n.hostname() != skip_hostname)
            .ok_or_else(|| InventoryError::NoNodesForRole {
                cluster: self.name.clone(),
                role,
            })
    }

    pub fn find(&self, hostname_or_fqdn: &str) -> Option<&Node> {
        self.nodes
            .iter()
            .find(|n| n.fqdn == hostname_or_fqdn || n.hostname() == hostname_or_fqdn)
    }
}

/// Sort key that orders `worker-2` before `worker-10`.
pub fn natural_sort_key(name: &str) -> Vec<(String, u64)> {
    let mut key = Vec::new();
    let mut text = String::new();
    let mut digits = String::new();
    for c in name.chars() {
        if c.is_ascii_digit() {
            digits.push(c);
        } else {
            if !digits.is_empty() {
                key.push((std::mem::take(&mut text), digits.parse().unwrap_or(u64::MAX)));
                digits.clear();
            }
            text.push(c);
        }
    }
    key.push((text, digits.parse().unwrap_or(0)));
    key
}
