//! Kubernetes node runbooks.

use tracing::{info, warn};

use super::{CookbookContext, CookbookError};
use crate::inventory::{Cluster, InventoryError, Node, NodeRole};
use crate::k8s::lifecycle::{pick_oldest_node, validate_node_prefix};
use crate::k8s::{
    KubeadmController, KubeletController, KubernetesController, KubernetesError, NodeLifecycle, NodeLifecycleState,
    RebootPhase,
};
use crate::remote::short_hostname;

const KUBE_SYSTEM: &str = "kube-system";

/// Which nodes a reboot goes through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RebootSelection {
    Hosts(Vec<String>),
    All,
    AllWorkers,
    AllNfsWorkers,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JoinOptions {
    pub labels: Vec<String>,
    pub taints: Vec<String>,
    pub wait_ready: bool,
}

fn kubectl_on(ctx: &CookbookContext, control_fqdn: &str) -> KubernetesController {
    KubernetesController::new(ctx.executor.clone(), control_fqdn)
        .with_timeouts(ctx.config.timeouts.clone())
        .with_dry_run(ctx.dry_run)
}

/// A control node to run `kubectl` on that is not `hostname`, if there is one.
fn control_node_for<'a>(cluster: &'a Cluster, hostname: &str) -> Result<&'a Node, InventoryError> {
    cluster
        .pick_other(NodeRole::K8sControl, hostname)
        .or_else(|_| cluster.first_of_role(NodeRole::K8sControl))
}

/// Cordons and drains a node, leaving it empty.
pub async fn drain(ctx: &CookbookContext, cluster_name: &str, hostname: &str) -> Result<(), CookbookError> {
    let (cluster, _) = ctx.config.k8s_cluster(cluster_name)?;
    let control = cluster.pick_other(NodeRole::K8sControl, hostname)?;
    info!("using control node {}", control.fqdn);

    let controller = kubectl_on(ctx, &control.fqdn);
    let mut lifecycle = NodeLifecycle::schedulable(hostname);
    controller.drain_and_wait(&mut lifecycle).await?;
    info!(node = hostname, "node drained");
    Ok(())
}

/// Reboots the selected nodes one by one. A node whose reboot fails gets a
/// second, unconditional reboot and is then brought back. Returns the
/// rebooted hostnames.
pub async fn reboot(
    ctx: &CookbookContext,
    cluster_name: &str,
    selection: RebootSelection,
) -> Result<Vec<String>, CookbookError> {
    let (cluster, k8s) = ctx.config.k8s_cluster(cluster_name)?;
    let mut control = cluster.first_of_role(NodeRole::K8sControl)?.clone();
    let mut controller = kubectl_on(ctx, &control.fqdn);
    info!("using control node {}", control.fqdn);

    let role_filter = match selection {
        RebootSelection::AllWorkers => Some(NodeRole::K8sWorker),
        RebootSelection::AllNfsWorkers => Some(NodeRole::K8sWorkerNfs),
        _ => None,
    };
    let hostnames = match selection {
        RebootSelection::Hosts(hosts) => hosts,
        _ => {
            // Reversed so the control nodes go last.
            let mut all = controller.node_hostnames(None).await?;
            all.reverse();
            match role_filter.and_then(|role| role.name_prefix(&k8s.project)) {
                Some(prefix) => all.into_iter().filter(|h| h.starts_with(&prefix)).collect(),
                None => all,
            }
        }
    };
    ctx.confirmer
        .confirm(&format!(
            "Reboot {} nodes of cluster {}: {}",
            hostnames.len(),
            cluster_name,
            hostnames.join(", ")
        ))
        .await?;

    for hostname in &hostnames {
        if control.hostname() == hostname {
            control = cluster.pick_other(NodeRole::K8sControl, hostname)?.clone();
            info!("swapping to control node {}", control.fqdn);
            controller = kubectl_on(ctx, &control.fqdn);
        }

        let mut lifecycle = NodeLifecycle::schedulable(hostname.clone());
        let rebooted = controller
            .reboot_node(
                &mut lifecycle,
                &k8s.domain,
                ctx.rebooter.as_ref(),
                &mut |node: &str, phase: RebootPhase| info!(node, "reboot phase: {}", phase),
            )
            .await;
        if let Err(e) = rebooted {
            warn!(
                node = %hostname,
                "reboot failed while {}, trying a hard reboot: {}",
                lifecycle.state(),
                e
            );
            let fqdn = format!("{}.{}", hostname, k8s.domain);
            let since = ctx.rebooter.reboot(&fqdn).await?;
            ctx.rebooter
                .wait_reboot_since(&fqdn, since, ctx.config.timeouts.reboot())
                .await?;
            lifecycle.force_rejoin();
            controller.rejoin(&mut lifecycle).await?;
        }
    }
    Ok(hostnames)
}

/// Drains and deletes a node of `role`, by default the oldest one. Roles
/// that are not Kubernetes nodes only get the name checks. Returns the
/// removed hostname; the VM itself is left for the operator to delete.
pub async fn remove_node(
    ctx: &CookbookContext,
    cluster_name: &str,
    role: NodeRole,
    hostname: Option<&str>,
) -> Result<String, CookbookError> {
    let (cluster, k8s) = ctx.config.k8s_cluster(cluster_name)?;
    let prefix = role
        .name_prefix(&k8s.project)
        .ok_or_else(|| InventoryError::UnknownRole(role.to_string()))?;

    let hostname = match hostname {
        Some(hostname) => {
            validate_node_prefix(hostname, role, &k8s.project)?;
            hostname.to_string()
        }
        None => {
            let candidates: Vec<String> = if role.is_kubernetes_node() {
                let control = cluster.first_of_role(NodeRole::K8sControl)?;
                kubectl_on(ctx, &control.fqdn).node_hostnames(None).await?
            } else {
                cluster
                    .nodes_by_role(role)
                    .into_iter()
                    .map(|n| n.hostname().to_string())
                    .collect()
            };
            pick_oldest_node(candidates.iter().map(String::as_str), &prefix)?.to_string()
        }
    };
    ctx.confirmer
        .confirm(&format!("Remove {} node {} from cluster {}", role, hostname, cluster_name))
        .await?;

    if role.is_kubernetes_node() {
        let control = cluster.pick_other(NodeRole::K8sControl, &hostname)?;
        let controller = kubectl_on(ctx, &control.fqdn);
        let mut lifecycle = NodeLifecycle::schedulable(hostname.clone());
        controller.drain_and_wait(&mut lifecycle).await?;
        match controller.delete_node(&hostname).await {
            Ok(()) => {}
            Err(KubernetesError::NodeNotFound(_)) => warn!(node = %hostname, "node already gone from the cluster"),
            Err(e) => return Err(e.into()),
        }
        lifecycle.transition(NodeLifecycleState::Removed)?;
    } else {
        info!("{} nodes are not kubernetes nodes, nothing to drain", role);
    }
    info!(node = %hostname, "removed from cluster {}, the VM can now be deleted", cluster_name);
    Ok(hostname)
}

/// Joins a new node with kubeadm, then labels and taints it.
pub async fn join(
    ctx: &CookbookContext,
    cluster_name: &str,
    new_node_fqdn: &str,
    options: &JoinOptions,
) -> Result<(), CookbookError> {
    let (cluster, _) = ctx.config.k8s_cluster(cluster_name)?;
    let control = cluster.first_of_role(NodeRole::K8sControl)?;
    let controller = kubectl_on(ctx, &control.fqdn);
    let kubeadm = KubeadmController::new(ctx.executor.clone(), control.fqdn.clone()).with_dry_run(ctx.dry_run);

    let ready_schedule = options.wait_ready.then(|| ctx.config.timeouts.node_ready());
    kubeadm.join(new_node_fqdn, &controller, ready_schedule).await?;

    let hostname = short_hostname(new_node_fqdn);
    if !options.labels.is_empty() {
        controller.add_node_labels(hostname, &options.labels).await?;
    }
    if !options.taints.is_empty() {
        controller.add_node_taints(hostname, &options.taints).await?;
    }
    info!(node = hostname, "joined cluster {}", cluster_name);
    Ok(())
}

/// Restarts every static pod of a node, the API server first.
pub async fn restart_static_pods(
    ctx: &CookbookContext,
    cluster_name: &str,
    hostname: &str,
) -> Result<Vec<String>, CookbookError> {
    let (cluster, k8s) = ctx.config.k8s_cluster(cluster_name)?;
    let control = control_node_for(&cluster, short_hostname(hostname))?;
    let controller = kubectl_on(ctx, &control.fqdn);
    let fqdn = format!("{}.{}", short_hostname(hostname), k8s.domain);

    let kubelet = KubeletController::new(ctx.executor.clone(), fqdn, &controller);
    let restarted = kubelet.restart_all_static_pods(KUBE_SYSTEM).await?;
    info!(node = hostname, "restarted static pods: {}", restarted.join(", "));
    Ok(restarted)
}
