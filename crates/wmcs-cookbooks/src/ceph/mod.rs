//! Ceph cluster control through the `ceph` CLI on a mon node.

pub mod controller;
pub mod osd_node;
pub mod osd_tree;
pub mod status;

use std::time::Duration;

use thiserror::Error;

use crate::alerts::AlertError;
use crate::confirm::ConfirmError;
use crate::health::HealthGateError;
use crate::inventory::InventoryError;
use crate::output::OutputError;
use crate::remote::RemoteError;

pub use controller::CephClusterController;
pub use osd_node::{BlockDevice, CephOsdNodeController};
pub use osd_tree::{BucketType, OsdClass, OsdStatus, OsdTree, OsdTreeNode};
pub use status::{CephClusterStatus, HealthStatus, OsdFlag};

#[derive(Debug, Error)]
pub enum CephError {
    #[error("The cluster is currently in an unhealthy status: {0}")]
    ClusterUnhealthy(String),
    #[error("Cluster not healthy after {waited:?}, last status: {last_status}")]
    ClusterUnhealthyTimeout { waited: Duration, last_status: String },
    #[error("Timed out after {waited:?} waiting for {what}: {state}")]
    Timeout {
        what: String,
        waited: Duration,
        state: String,
    },
    #[error("Unable to change flag `{flag}`, got output: {output}")]
    FlagSetError { flag: String, output: String },
    #[error("Unable to find any other mon node to control the cluster, got: {0:?}")]
    NoControllerNode(Vec<String>),
    #[error("Unexpected output from `{command}`: {output}")]
    UnexpectedOutput { command: String, output: String },
    #[error("Refusing to {action}, it would put the cluster at risk:\n{}", .reasons.join("\n"))]
    Unsafe { action: String, reasons: Vec<String> },
    #[error("OSD host not found in the osd tree: {0}")]
    HostNotFound(String),
    #[error("Unable to guess the crush weight for the osds, pass one explicitly")]
    NoPooledWeight,
    #[error("Not all the osds {osds:?} are on host {host} (its osds are {assigned:?})")]
    OsdsNotOnHost {
        host: String,
        osds: Vec<u32>,
        assigned: Vec<u32>,
    },
    #[error("Refusing to {0} while the cluster has `noout` or `norebalance` set, unset them and retry")]
    MaintenanceFlagsSet(String),
    #[error("No devices found for osds {0:?}")]
    NoDevices(Vec<u32>),
    #[error("Node {host} is not ready to become an osd host:\n{}", .reasons.join("\n"))]
    NodeNotReady { host: String, reasons: Vec<String> },
    #[error("Osds {osds:?} of host {host} are still not ssd")]
    WrongOsdClass { host: String, osds: Vec<u32> },
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error(transparent)]
    Output(#[from] OutputError),
    #[error(transparent)]
    Alert(#[from] AlertError),
    #[error(transparent)]
    Confirm(#[from] ConfirmError),
    #[error(transparent)]
    Inventory(#[from] InventoryError),
}

impl From<HealthGateError<CephError>> for CephError {
    fn from(err: HealthGateError<CephError>) -> Self {
        match err {
            HealthGateError::ClusterUnhealthyTimeout {
                waited,
                last_status,
                ..
            } => CephError::ClusterUnhealthyTimeout { waited, last_status },
            HealthGateError::Source(e) => e,
        }
    }
}
