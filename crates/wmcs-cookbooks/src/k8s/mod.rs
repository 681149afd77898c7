//! Kubernetes node lifecycle through `kubectl`, `kubeadm` and the kubelet
//! files on the nodes.

pub mod controller;
pub mod kubeadm;
pub mod kubelet;
pub mod lifecycle;
pub mod objects;

use std::time::Duration;

use thiserror::Error;

use crate::inventory::InventoryError;
use crate::output::OutputError;
use crate::reboot::RebootError;
use crate::remote::RemoteError;

pub use controller::KubernetesController;
pub use kubeadm::{KubeadmController, KubeadmError};
pub use kubelet::{KubeletController, KubeletError};
pub use lifecycle::{NodeLifecycle, NodeLifecycleState, RebootPhase};
pub use objects::{deployment_replicas, ClusterInfo, NodeExt, ObjectList, PodExt};

#[derive(Debug, Error)]
pub enum KubernetesError {
    #[error("Unable to parse cluster info:\n{0}")]
    MalformedClusterInfo(String),
    #[error("Unable to find node {0} in the cluster")]
    NodeNotFound(String),
    #[error("Unable to get the 'Ready' condition of node {node}, got conditions: {conditions}")]
    NodeStatusError { node: String, conditions: String },
    #[error("Waited {waited:?} for node {node} to drain, but it never did. Still has {} pods running: {}", .pods.len(), .pods.join(", "))]
    DrainTimeout {
        node: String,
        waited: Duration,
        pods: Vec<String>,
    },
    #[error("Waited {waited:?} for node {node} to become ready, but it never did. Current conditions: {conditions}")]
    NotReadyTimeout {
        node: String,
        waited: Duration,
        conditions: String,
    },
    #[error("Waited {waited:?} for deployment {namespace}/{deployment} to have {expected} replicas, it has {current}")]
    DeploymentTimeout {
        deployment: String,
        namespace: String,
        waited: Duration,
        expected: u32,
        current: u32,
    },
    #[error("Node {node} can't go from {from} to {to}")]
    InvalidTransition {
        node: String,
        from: NodeLifecycleState,
        to: NodeLifecycleState,
    },
    #[error("Host name {hostname} does not start with prefix {prefix} as expected for {role} nodes")]
    UnexpectedPrefix {
        hostname: String,
        prefix: String,
        role: String,
    },
    #[error("No nodes with prefix {0}, nothing to remove")]
    NoNodesWithPrefix(String),
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error(transparent)]
    Output(#[from] OutputError),
    #[error(transparent)]
    Reboot(#[from] RebootError),
    #[error(transparent)]
    Inventory(#[from] InventoryError),
}
