//! Ceph runbooks.

use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use super::{CookbookContext, CookbookError};
use crate::alerts::SilenceId;
use crate::batch::{BatchError, BatchOperation, BatchPlan, BatchRunner, BatchSummary};
use crate::ceph::{CephClusterController, CephError, CephOsdNodeController, OsdClass, OsdFlag, OsdTree};
use crate::maintenance::{with_maintenance, HostMaintenance};
use crate::poll::PollSchedule;
use crate::remote::short_hostname;

/// A bit longer than draining a whole host usually takes.
const DRAIN_SILENCE: Duration = Duration::from_secs(6 * 60 * 60);

/// New OSDs take a few seconds to register in the osd tree.
const NEW_OSDS_SCHEDULE: PollSchedule = PollSchedule::from_secs(50, 5);

/// Controller for a configured cluster, with the context settings applied.
pub fn controller(ctx: &CookbookContext, cluster_name: &str) -> Result<CephClusterController, CookbookError> {
    let (cluster, ceph) = ctx.config.ceph_cluster(cluster_name)?;
    Ok(CephClusterController::new(
        ctx.executor.clone(),
        ctx.silences.clone(),
        &cluster,
        ceph.expected_osd_drives,
    )?
    .with_timeouts(ctx.config.timeouts.clone())
    .with_silence_duration(ctx.config.silence_duration())
    .with_task_id(ctx.task_id.clone())
    .with_dry_run(ctx.dry_run))
}

async fn wait_healthy_with_maintenance(controller: &CephClusterController) -> Result<(), CookbookError> {
    controller
        .wait_for_cluster_healthy(true, controller.timeouts().cluster_healthy(), &[])
        .await?;
    Ok(())
}

/// Sets `noout`/`norebalance` and silences the cluster alerts. The
/// returned silences are needed to leave maintenance.
pub async fn set_maintenance(
    ctx: &CookbookContext,
    cluster_name: &str,
    reason: &str,
    force: bool,
) -> Result<Vec<SilenceId>, CookbookError> {
    let controller = controller(ctx, cluster_name)?;
    let silences = controller.set_maintenance(reason, force).await?;
    info!(cluster = cluster_name, "cluster in maintenance, silences: {:?}", silences);
    Ok(silences)
}

pub async fn unset_maintenance(
    ctx: &CookbookContext,
    cluster_name: &str,
    silences: &[SilenceId],
    force: bool,
) -> Result<(), CookbookError> {
    let controller = controller(ctx, cluster_name)?;
    controller.unset_maintenance(silences, force).await?;
    info!(cluster = cluster_name, "cluster out of maintenance");
    Ok(())
}

pub async fn wait_healthy(
    ctx: &CookbookContext,
    cluster_name: &str,
    consider_maintenance_healthy: bool,
    ignored_checks: &[String],
) -> Result<(), CookbookError> {
    let controller = controller(ctx, cluster_name)?;
    controller
        .wait_for_cluster_healthy(
            consider_maintenance_healthy,
            ctx.config.timeouts.cluster_healthy(),
            ignored_checks,
        )
        .await?;
    info!(cluster = cluster_name, "cluster healthy");
    Ok(())
}

/// Returns whether there was a rebalance to wait for.
pub async fn wait_for_rebalance(ctx: &CookbookContext, cluster_name: &str) -> Result<bool, CookbookError> {
    let controller = controller(ctx, cluster_name)?;
    Ok(controller.wait_for_rebalance(ctx.config.timeouts.rebalance()).await?)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrainOptions {
    /// OSDs drained together, 0 for all of a host at once.
    pub batch_size: usize,
    /// Only these OSDs of the hosts; empty for all of them.
    pub osd_ids: Vec<u32>,
    /// Skip the health gates and the ok-to-stop checks.
    pub force: bool,
    /// Wait for the rebalance after every batch.
    pub wait: bool,
    /// Put the whole cluster in maintenance while draining.
    pub set_maintenance: bool,
}

impl Default for DrainOptions {
    fn default() -> Self {
        Self {
            batch_size: 2,
            osd_ids: Vec::new(),
            force: false,
            wait: true,
            set_maintenance: false,
        }
    }
}

/// Drains the OSDs of the given hosts, one host at a time.
pub async fn drain_nodes(
    ctx: &CookbookContext,
    cluster_name: &str,
    hosts: &[String],
    options: &DrainOptions,
) -> Result<(), CookbookError> {
    let controller = controller(ctx, cluster_name)?.with_force(options.force);
    let which = if options.osd_ids.is_empty() {
        "all the osds".to_string()
    } else {
        check_osds_on_hosts(&controller, hosts, &options.osd_ids).await?;
        format!("osds {:?}", options.osd_ids)
    };
    ctx.confirmer
        .confirm(&format!("Drain {} of {} in cluster {}", which, hosts.join(", "), cluster_name))
        .await?;

    if !options.force {
        wait_healthy_with_maintenance(&controller).await?;
    }

    let controller = &controller;
    if options.set_maintenance {
        let reason = format!("Draining node {}", hosts.join(", "));
        with_maintenance(controller, &reason, move || async move {
            drain_hosts(ctx, controller, hosts, options).await
        })
        .await?;
    } else {
        drain_hosts(ctx, controller, hosts, options).await?;
    }
    info!("finished draining nodes {}", hosts.join(", "));
    Ok(())
}

/// Every requested OSD must live on one of the hosts.
async fn check_osds_on_hosts(
    controller: &CephClusterController,
    hosts: &[String],
    osd_ids: &[u32],
) -> Result<(), CookbookError> {
    let tree = controller.osd_tree().await?;
    let assigned: Vec<u32> = hosts
        .iter()
        .filter_map(|host| tree.host(short_hostname(host)))
        .flat_map(|host| host.osd_ids())
        .collect();
    if osd_ids.iter().all(|id| assigned.contains(id)) {
        return Ok(());
    }
    Err(CephError::OsdsNotOnHost {
        host: hosts.join(", "),
        osds: osd_ids.to_vec(),
        assigned,
    }
    .into())
}

async fn drain_hosts(
    ctx: &CookbookContext,
    controller: &CephClusterController,
    hosts: &[String],
    options: &DrainOptions,
) -> Result<(), CookbookError> {
    for (index, host) in hosts.iter().enumerate() {
        let hostname = short_hostname(host);
        info!("[{}/{}] draining node {}", index + 1, hosts.len(), hostname);
        let maintenance = HostMaintenance::new(ctx.silences.clone(), vec![hostname.to_string()], DRAIN_SILENCE)
            .with_task_id(ctx.task_id.clone());
        with_maintenance(&maintenance, "Draining with wmcs-cookbook ceph drain-node", move || async move {
            controller
                .drain_osd_node(hostname, &options.osd_ids, options.force, options.wait, options.batch_size)
                .await?;
            if options.force {
                warn!("force passed, ignoring cluster health and continuing");
                return Ok(());
            }
            wait_healthy_with_maintenance(controller).await?;
            info!("[{}/{}] drained node {}, cluster healthy", index + 1, hosts.len(), hostname);
            Ok::<_, CookbookError>(())
        })
        .await?;
    }
    Ok(())
}

/// Gives the OSDs of the given hosts their weight back.
pub async fn undrain_nodes(
    ctx: &CookbookContext,
    cluster_name: &str,
    hosts: &[String],
    batch_size: usize,
    force: bool,
    wait: bool,
) -> Result<(), CookbookError> {
    let controller = controller(ctx, cluster_name)?;
    if !force {
        wait_healthy_with_maintenance(&controller).await?;
    }

    for (index, host) in hosts.iter().enumerate() {
        let hostname = short_hostname(host);
        info!("[{}/{}] undraining node {}", index + 1, hosts.len(), hostname);
        controller.undrain_osd_node(hostname, wait, batch_size).await?;
        if !force {
            wait_healthy_with_maintenance(&controller).await?;
        }
    }
    info!("finished undraining nodes {}", hosts.join(", "));
    Ok(())
}

/// Reboots a host inside its own silence and waits until it is back.
async fn reboot_host(ctx: &CookbookContext, fqdn: &str) -> Result<(), CookbookError> {
    let maintenance = HostMaintenance::new(ctx.silences.clone(), vec![fqdn.to_string()], ctx.config.silence_duration())
        .with_task_id(ctx.task_id.clone());
    with_maintenance(&maintenance, &format!("Rebooting {}", fqdn), move || async move {
        let since = ctx.rebooter.reboot(fqdn).await?;
        ctx.rebooter
            .wait_reboot_since(fqdn, since, ctx.config.timeouts.reboot())
            .await?;
        Ok::<_, CookbookError>(())
    })
    .await
}

/// Reboots one Ceph node and waits for the cluster to settle. Unless
/// `skip_maintenance`, the cluster is in maintenance meanwhile.
pub async fn reboot_node(
    ctx: &CookbookContext,
    cluster_name: &str,
    fqdn: &str,
    force: bool,
    skip_maintenance: bool,
) -> Result<(), CookbookError> {
    let controller = controller(ctx, cluster_name)?.with_force(force);
    if !force {
        wait_healthy_with_maintenance(&controller).await?;
    }

    let controller = &controller;
    let reboot = move || async move {
        reboot_host(ctx, fqdn).await?;
        info!("rebooted node {}, waiting for the cluster to stabilize", fqdn);
        wait_healthy_with_maintenance(controller).await
    };
    if skip_maintenance {
        reboot().await?;
    } else {
        with_maintenance(controller, &format!("Rebooting node {}", fqdn), reboot).await?;
    }
    info!("finished rebooting node {}", fqdn);
    Ok(())
}

struct RollReboot<'a> {
    ctx: &'a CookbookContext,
    controller: &'a CephClusterController,
}

#[async_trait]
impl BatchOperation<String> for RollReboot<'_> {
    type Error = CookbookError;

    async fn apply(&self, batch: &[String]) -> Result<bool, CookbookError> {
        for fqdn in batch {
            reboot_host(self.ctx, fqdn).await?;
        }
        Ok(true)
    }

    async fn stabilize(&self, batch: &[String], _changed: bool) -> Result<(), CookbookError> {
        info!("rebooted {}, waiting for the cluster to stabilize", batch.join(", "));
        wait_healthy_with_maintenance(self.controller).await?;
        info!("cluster stable, continuing");
        Ok(())
    }
}

/// Reboots every OSD host, `batch_size` at a time, with the cluster in
/// maintenance and a health gate between batches.
pub async fn roll_reboot_osds(
    ctx: &CookbookContext,
    cluster_name: &str,
    batch_size: usize,
    force: bool,
) -> Result<BatchSummary, CookbookError> {
    let controller = controller(ctx, cluster_name)?.with_force(force);
    let domain = controller.nodes_domain().to_string();
    let hosts: Vec<String> = controller
        .nodes()
        .await?
        .osd
        .keys()
        .map(|name| format!("{}.{}", name, domain))
        .collect();
    let plan = BatchPlan::with_batch_size(hosts, batch_size);
    ctx.confirmer
        .confirm(&format!(
            "Reboot {} osd nodes of cluster {} in {} batches",
            plan.sizes().iter().sum::<usize>(),
            cluster_name,
            plan.len()
        ))
        .await?;

    let (controller, plan) = (&controller, &plan);
    let summary = with_maintenance(controller, &format!("Rebooting the osd nodes of {}", cluster_name), move || async move {
        let operation = RollReboot { ctx, controller };
        BatchRunner::new("reboot osd nodes")
            .run(plan, &operation)
            .await
            .map_err(BatchError::into_inner)
    })
    .await?;
    info!("finished rebooting {} osd nodes", summary.targets);
    Ok(summary)
}

/// Reboots every mon node, one at a time, with the cluster in maintenance.
/// Commands move to another mon while the controlling one reboots.
pub async fn roll_reboot_mons(ctx: &CookbookContext, cluster_name: &str, force: bool) -> Result<usize, CookbookError> {
    let mut operator = controller(ctx, cluster_name)?;
    let controller = controller(ctx, cluster_name)?.with_force(force);
    let domain = controller.nodes_domain().to_string();
    let mons: Vec<String> = controller
        .nodes()
        .await?
        .mon
        .keys()
        .map(|name| format!("{}.{}", name, domain))
        .collect();
    ctx.confirmer
        .confirm(&format!("Reboot {} mon nodes of cluster {}", mons.len(), cluster_name))
        .await?;

    let (controller, mons_ref) = (&controller, &mons);
    with_maintenance(controller, &format!("Rebooting the mon nodes of {}", cluster_name), move || async move {
        for (index, fqdn) in mons_ref.iter().enumerate() {
            info!("[{}/{}] rebooting mon node {}", index + 1, mons_ref.len(), fqdn);
            if short_hostname(operator.controlling_node()) == short_hostname(fqdn) {
                operator.change_controlling_node().await?;
            }
            reboot_host(ctx, fqdn).await?;
            wait_healthy_with_maintenance(&operator).await?;
            operator
                .wait_for_one_manager_standby(operator.timeouts().manager_standby())
                .await?;
            info!("[{}/{}] rebooted mon node {}, cluster stable", index + 1, mons_ref.len(), fqdn);
        }
        Ok::<_, CookbookError>(())
    })
    .await?;
    info!("finished rebooting {} mon nodes", mons.len());
    Ok(mons.len())
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BootstrapOptions {
    /// The new hosts were rebooted already.
    pub skip_reboot: bool,
    /// Run the readiness checks and stop there.
    pub only_check: bool,
    pub wait_for_rebalance: bool,
    pub force: bool,
}

/// Turns the free drives of new hosts into OSDs.
///
/// `norebalance` is held while the OSDs are created so the data moves once,
/// and is always unset before returning.
pub async fn bootstrap_and_add(
    ctx: &CookbookContext,
    cluster_name: &str,
    fqdns: &[String],
    options: BootstrapOptions,
) -> Result<(), CookbookError> {
    let controller = controller(ctx, cluster_name)?.with_force(options.force);
    if !options.force {
        wait_healthy_with_maintenance(&controller).await?;
    }

    if options.only_check {
        return add_hosts(ctx, &controller, fqdns, options).await;
    }

    controller.set_osdmap_flag(&OsdFlag::NoRebalance).await?;
    let added = add_hosts(ctx, &controller, fqdns, options).await;
    let unset = controller.unset_osdmap_flag(&OsdFlag::NoRebalance).await;
    match (added, unset) {
        (Err(e), Err(cleanup)) => {
            warn!("unable to unset norebalance after failure: {}", cleanup);
            return Err(e);
        }
        (Err(e), Ok(())) => return Err(e),
        (Ok(()), unset) => unset?,
    }

    if options.wait_for_rebalance {
        let timeouts = controller.timeouts();
        controller.wait_for_in_progress_events(timeouts.rebalance()).await?;
        controller.wait_for_rebalance(timeouts.rebalance()).await?;
    }
    info!("finished adding osd hosts {}", fqdns.join(", "));
    Ok(())
}

async fn add_hosts(
    ctx: &CookbookContext,
    controller: &CephClusterController,
    fqdns: &[String],
    options: BootstrapOptions,
) -> Result<(), CookbookError> {
    for (index, fqdn) in fqdns.iter().enumerate() {
        let hostname = short_hostname(fqdn);
        info!("[{}/{}] bootstrapping osd host {}", index + 1, fqdns.len(), fqdn);
        if !options.skip_reboot {
            reboot_host(ctx, fqdn).await?;
        }

        let node = CephOsdNodeController::new(ctx.executor.clone(), fqdn.clone());
        let failures = controller.check_if_osd_ready_for_bootstrap(&node).await?;
        if !failures.is_empty() {
            return Err(CephError::NodeNotReady {
                host: fqdn.clone(),
                reasons: failures,
            }
            .into());
        }
        if options.only_check {
            info!("{} passed the checks, not adding it", fqdn);
            continue;
        }

        let devices = node.add_all_available_devices(Some(ctx.confirmer.as_ref())).await?;
        info!("created osds on {} for {:?}", fqdn, devices);
        controller.wait_for_osd_host(hostname, NEW_OSDS_SCHEDULE).await?;

        let misclassified = non_ssd_osds(&controller.osd_tree().await?, hostname);
        if !misclassified.is_empty() {
            info!("setting the ssd class on osds {:?}", misclassified);
            for osd_id in &misclassified {
                controller.set_osd_class(*osd_id, OsdClass::Ssd).await?;
            }
            let still = non_ssd_osds(&controller.osd_tree().await?, hostname);
            if !still.is_empty() && !ctx.dry_run {
                return Err(CephError::WrongOsdClass {
                    host: hostname.to_string(),
                    osds: still,
                }
                .into());
            }
        }
    }
    Ok(())
}

fn non_ssd_osds(tree: &OsdTree, hostname: &str) -> Vec<u32> {
    tree.host(hostname)
        .map(|host| {
            host.children
                .iter()
                .filter_map(|child| child.osd.as_ref())
                .filter(|osd| osd.device_class != OsdClass::Ssd)
                .map(|osd| osd.osd_id)
                .collect()
        })
        .unwrap_or_default()
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DestroyOptions {
    /// Only these OSDs of the host; empty for all of them.
    pub osd_ids: Vec<u32>,
    /// Run the checks without changing anything.
    pub only_check: bool,
    /// Depool everything at once and skip the rebalance wait.
    pub be_mean: bool,
    pub force: bool,
}

/// Depools, stops, purges and zaps OSDs of a host. Removes the host from
/// the CRUSH map once it has no OSDs left. Returns the destroyed OSDs.
pub async fn depool_and_destroy(
    ctx: &CookbookContext,
    cluster_name: &str,
    fqdn: &str,
    options: &DestroyOptions,
) -> Result<Vec<u32>, CookbookError> {
    let controller = controller(ctx, cluster_name)?.with_force(options.force);
    let hostname = short_hostname(fqdn);
    let osds = controller.host_osds_subset(hostname, &options.osd_ids).await?;
    ctx.confirmer
        .confirm(&format!(
            "Depool and destroy the osds {:?} of host {}, HA might be degraded until the rebalance is done",
            osds, hostname
        ))
        .await?;

    if !options.force {
        controller
            .cluster_status()
            .await?
            .check_healthy(false, Vec::<String>::new())?;
    }
    if controller.is_osdmap_flag_set(&OsdFlag::NoOut).await?
        || controller.is_osdmap_flag_set(&OsdFlag::NoRebalance).await?
    {
        return Err(CephError::MaintenanceFlagsSet("depool or destroy osds".to_string()).into());
    }
    let failures = controller.check_osds_ok_to_stop(&osds).await?;
    if !failures.is_empty() {
        return Err(CephError::Unsafe {
            action: format!("stop osds {:?}", osds),
            reasons: failures,
        }
        .into());
    }

    let node = CephOsdNodeController::new(ctx.executor.clone(), fqdn);
    if options.only_check {
        info!("skipping depooling the osds, the next check might fail");
    } else {
        depool_osds(&controller, &osds, options.be_mean).await?;
        node.stop_osds(&osds).await?;
    }

    let devices = controller.osd_devices(&osds).await?;
    let failures = controller.check_osds_safe_to_destroy(&osds).await?;
    if !failures.is_empty() {
        return Err(CephError::Unsafe {
            action: format!("destroy osds {:?}", osds),
            reasons: failures,
        }
        .into());
    }
    if options.only_check {
        info!("osds {:?} can be destroyed, devices {:?}", osds, devices);
        return Ok(osds);
    }

    for osd_id in &osds {
        controller.destroy_osd(*osd_id, true).await?;
    }
    if controller.host_osds(hostname).await?.is_empty() {
        info!("removing the empty host bucket {} from the crush map", hostname);
        controller.remove_crush_bucket(hostname).await?;
    }

    if devices.is_empty() {
        return Err(CephError::NoDevices(osds).into());
    }
    for device in &devices {
        node.zap_device(device).await?;
    }
    info!("depooled and destroyed osds {:?}, zapped {:?}", osds, devices);
    Ok(osds)
}

async fn depool_osds(controller: &CephClusterController, osds: &[u32], be_mean: bool) -> Result<(), CookbookError> {
    // ok-to-stop was checked for all of them together already.
    let batch_size = if be_mean { 0 } else { 2 };
    let changed = controller.drain_osds_in_chunks(osds, batch_size, true, false).await?;
    if be_mean {
        info!("not waiting for the rebalance");
        return Ok(());
    }
    if changed {
        let timeouts = controller.timeouts();
        controller.wait_for_in_progress_events(timeouts.rebalance()).await?;
        controller.wait_for_rebalance(timeouts.rebalance()).await?;
    }
    Ok(())
}
