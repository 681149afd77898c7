//! WMCS operational runbooks: Ceph maintenance and OSD drains, Kubernetes
//! node drain/reboot/removal/join, and the alert silences around them.

pub mod alerts;
pub mod batch;
pub mod ceph;
pub mod cli;
pub mod config;
pub mod confirm;
pub mod cookbooks;
pub mod health;
pub mod inventory;
pub mod k8s;
pub mod maintenance;
pub mod output;
pub mod poll;
pub mod reboot;
pub mod remote;

#[cfg(test)]
mod testing;

pub use alerts::{AlertmanagerClient, SilenceId, SilenceManager};
pub use batch::{BatchOperation, BatchPlan, BatchRunner, BatchSummary};
pub use ceph::{CephClusterController, CephError};
pub use config::CookbookConfig;
pub use cookbooks::{CookbookContext, CookbookError};
pub use health::ClusterHealthGate;
pub use inventory::{Cluster, Node, NodeRole};
pub use k8s::{KubernetesController, KubernetesError, NodeLifecycle};
pub use maintenance::{with_maintenance, HostMaintenance, MaintenanceMode};
pub use poll::PollSchedule;
pub use remote::{RemoteExecutor, SshExecutor};
