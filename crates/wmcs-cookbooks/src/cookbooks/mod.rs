//! Runbooks: sequences of controller calls with the confirmations, silences
//! and health gates around them.

pub mod ceph;
pub mod k8s;

use std::sync::Arc;

use thiserror::Error;

use crate::alerts::{AlertError, SilenceManager};
use crate::config::{ConfigError, CookbookConfig};
use crate::confirm::{ConfirmError, Confirmer};
use crate::inventory::InventoryError;
use crate::k8s::{KubeadmError, KubeletError, KubernetesError};
use crate::maintenance::MaintenanceError;
use crate::reboot::{HostRebooter, RebootError};
use crate::remote::RemoteExecutor;

#[derive(Debug, Error)]
pub enum CookbookError {
    #[error(transparent)]
    Ceph(#[from] crate::ceph::CephError),
    #[error(transparent)]
    Kubernetes(#[from] KubernetesError),
    #[error(transparent)]
    Kubeadm(#[from] KubeadmError),
    #[error(transparent)]
    Kubelet(#[from] KubeletError),
    #[error(transparent)]
    Maintenance(#[from] MaintenanceError),
    #[error(transparent)]
    Alert(#[from] AlertError),
    #[error(transparent)]
    Reboot(#[from] RebootError),
    #[error(transparent)]
    Confirm(#[from] ConfirmError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Inventory(#[from] InventoryError),
}

/// Everything a runbook talks to. Built once by the CLI; tests build it
/// from fakes.
pub struct CookbookContext {
    pub config: CookbookConfig,
    pub executor: Arc<dyn RemoteExecutor>,
    pub silences: Arc<dyn SilenceManager>,
    pub rebooter: Arc<dyn HostRebooter>,
    pub confirmer: Arc<dyn Confirmer>,
    pub dry_run: bool,
    pub task_id: Option<String>,
}

impl CookbookContext {
    pub fn task_id(&self) -> Option<&str> {
        self.task_id.as_deref()
    }
}
