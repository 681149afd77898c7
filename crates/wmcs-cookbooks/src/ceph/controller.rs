use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::osd_node::CephOsdNodeController;
use super::osd_tree::OsdTree;
use super::status::{CephClusterStatus, OsdFlag};
use super::CephError;
use crate::alerts::{silence_alert, Matcher, SilenceId, SilenceManager};
use crate::batch::{BatchError, BatchOperation, BatchPlan, BatchRunner};
use crate::config::TimeoutsConfig;
use crate::health::{ClusterHealthGate, HealthSource};
use crate::inventory::{Cluster, NodeRole};
use crate::maintenance::MaintenanceMode;
use crate::output::parse_json;
use crate::poll::{poll_until, PollError, PollSchedule, Probe};
use crate::remote::{domain_of, short_hostname, RemoteCommand, RemoteExecutor};

/// Drives in every OSD host reserved for the operating system.
pub const OSD_EXPECTED_OS_DRIVES: usize = 2;

const OK_TO_STOP_MESSAGE: &str = "are ok to stop without reducing availability or risking data";

/// Crush weights are printed with limited precision.
const WEIGHT_EPSILON: f64 = 1e-6;

/// Node names per daemon type, from `ceph node ls`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CephNodes {
    #[serde(default)]
    pub mon: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub osd: BTreeMap<String, Vec<u32>>,
    #[serde(default)]
    pub mgr: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct OsdDump {
    #[serde(default)]
    osds: Vec<OsdAddrs>,
}

#[derive(Debug, Deserialize)]
struct OsdAddrs {
    public_addr: String,
    cluster_addr: String,
}

#[derive(Debug, Deserialize)]
struct SafeToDestroy {
    #[serde(default)]
    safe_to_destroy: Vec<u32>,
    #[serde(default)]
    active: Vec<u32>,
    #[serde(default)]
    missing_stats: Vec<u32>,
}

#[derive(Debug, Deserialize)]
struct OsdMetadata {
    /// Comma separated kernel names, e.g. `sdc` or `nvme0n1,sdb`.
    #[serde(default)]
    devices: String,
}

fn addr_ip(addr: &str) -> &str {
    addr.split(':').next().unwrap_or(addr)
}

fn poll_failure<S: fmt::Display>(what: &str, err: PollError<S, CephError>) -> CephError {
    match err {
        PollError::TimedOut { waited, last, .. } => CephError::Timeout {
            what: what.to_string(),
            waited,
            state: last.map(|s| s.to_string()).unwrap_or_default(),
        },
        PollError::Probe(e) => e,
    }
}

/// Controls a Ceph cluster by running `ceph` on one of its mon nodes.
pub struct CephClusterController {
    executor: Arc<dyn RemoteExecutor>,
    silences: Arc<dyn SilenceManager>,
    cluster_name: String,
    controlling_node: String,
    expected_osd_drives_per_host: usize,
    timeouts: TimeoutsConfig,
    silence_duration: Duration,
    task_id: Option<String>,
    force: bool,
    dry_run: bool,
}

impl CephClusterController {
    pub fn new(
        executor: Arc<dyn RemoteExecutor>,
        silences: Arc<dyn SilenceManager>,
        cluster: &Cluster,
        expected_osd_drives_per_host: usize,
    ) -> Result<Self, CephError> {
        let controlling_node = cluster.first_of_role(NodeRole::CephMon)?.fqdn.clone();
        Ok(Self {
            executor,
            silences,
            cluster_name: cluster.name().to_string(),
            controlling_node,
            expected_osd_drives_per_host,
            timeouts: TimeoutsConfig::default(),
            silence_duration: Duration::from_secs(4 * 60 * 60),
            task_id: None,
            force: false,
            dry_run: false,
        })
    }

    pub fn with_timeouts(mut self, timeouts: TimeoutsConfig) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn with_silence_duration(mut self, duration: Duration) -> Self {
        self.silence_duration = duration;
        self
    }

    pub fn with_task_id(mut self, task_id: Option<String>) -> Self {
        self.task_id = task_id;
        self
    }

    /// Used by the [`MaintenanceMode`] implementation.
    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    /// In dry-run mode the output of mutating commands is not verified.
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn cluster_name(&self) -> &str {
        &self.cluster_name
    }

    pub fn controlling_node(&self) -> &str {
        &self.controlling_node
    }

    pub fn timeouts(&self) -> &TimeoutsConfig {
        &self.timeouts
    }

    fn ceph<I, S>(args: I) -> RemoteCommand
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        RemoteCommand::new(["ceph"]).args(args).merge_stderr()
    }

    async fn run(&self, command: &RemoteCommand) -> Result<String, CephError> {
        Ok(self.executor.run(&self.controlling_node, command).await?)
    }

    /// Runs a read-only ceph command with JSON output.
    async fn run_json<T: DeserializeOwned>(&self, args: &[&str], last_line_only: bool) -> Result<T, CephError> {
        let mut command = RemoteCommand::new(["ceph"]).args(args.iter().copied()).args(["-f", "json"]).safe();
        if last_line_only {
            command = command.last_line_only();
        }
        let raw = self.run(&command).await?;
        Ok(parse_json("ceph", &raw)?)
    }

    fn expect_output(&self, command: &RemoteCommand, output: &str, needle: &str) -> Result<(), CephError> {
        if self.dry_run || output.contains(needle) {
            return Ok(());
        }
        Err(CephError::UnexpectedOutput {
            command: command.command_line(),
            output: output.to_string(),
        })
    }

    pub async fn nodes(&self) -> Result<CephNodes, CephError> {
        // There are usually a couple of empty lines before the JSON.
        self.run_json(&["node", "ls"], true).await
    }

    pub fn nodes_domain(&self) -> &str {
        domain_of(&self.controlling_node)
    }

    /// Switches to another mon node to run commands on, e.g. before
    /// rebooting the current one.
    pub async fn change_controlling_node(&mut self) -> Result<(), CephError> {
        let current = short_hostname(&self.controlling_node).to_string();
        let nodes = self.nodes().await?;
        let other = nodes
            .mon
            .keys()
            .find(|name| **name != current)
            .ok_or_else(|| CephError::NoControllerNode(nodes.mon.keys().cloned().collect()))?;

        let domain = self.nodes_domain().to_string();
        self.controlling_node = if domain.is_empty() {
            other.clone()
        } else {
            format!("{}.{}", other, domain)
        };
        info!(cluster = %self.cluster_name, "now controlling the cluster from {}", self.controlling_node);
        Ok(())
    }

    pub async fn cluster_status(&self) -> Result<CephClusterStatus, CephError> {
        self.run_json(&["status"], false).await
    }

    pub async fn is_osdmap_flag_set(&self, flag: &OsdFlag) -> Result<bool, CephError> {
        Ok(self.cluster_status().await?.osdmap_flags().contains(flag))
    }

    async fn change_osdmap_flag(&self, flag: &OsdFlag, action: &str) -> Result<(), CephError> {
        let command = Self::ceph(["osd", action, flag.as_str()]);
        let output = self.run(&command).await?;
        let expected = format!("{} is {}", flag, action);
        if self.dry_run || output.lines().any(|l| l.trim_start().starts_with(&expected)) {
            info!(cluster = %self.cluster_name, "{}", expected);
            return Ok(());
        }
        Err(CephError::FlagSetError {
            flag: flag.to_string(),
            output,
        })
    }

    pub async fn set_osdmap_flag(&self, flag: &OsdFlag) -> Result<(), CephError> {
        self.change_osdmap_flag(flag, "set").await
    }

    pub async fn unset_osdmap_flag(&self, flag: &OsdFlag) -> Result<(), CephError> {
        self.change_osdmap_flag(flag, "unset").await
    }

    /// Changes an OSD device class, e.g. from hdd to ssd.
    pub async fn set_osd_class(&self, osd_id: u32, class: super::OsdClass) -> Result<(), CephError> {
        let id = osd_id.to_string();
        self.run(&Self::ceph(["osd", "crush", "rm-device-class", &id])).await?;
        self.run(&Self::ceph(["osd", "crush", "set-device-class", class.as_str(), &id]))
            .await?;
        Ok(())
    }

    /// Silences the cluster-wide alerts (the ones not tied to a host).
    pub async fn downtime_cluster_alerts(&self, reason: &str) -> Result<Vec<SilenceId>, CephError> {
        let id = silence_alert(
            self.silences.as_ref(),
            None,
            vec![Matcher::regex("service", ".*ceph.*")],
            self.silence_duration,
            &format!("Downtiming alert from cookbook - {}", reason),
            self.task_id.as_deref(),
        )
        .await?;
        Ok(vec![id])
    }

    pub async fn uptime_cluster_alerts(&self, silences: &[SilenceId]) -> Result<(), CephError> {
        for id in silences {
            self.silences.remove_silence(id).await?;
        }
        Ok(())
    }

    /// Silences cluster alerts and sets `noout` and `norebalance`.
    ///
    /// Refuses an unhealthy cluster unless `force` is set, since pausing
    /// data movement would stop recovery.
    pub async fn set_maintenance(&self, reason: &str, force: bool) -> Result<Vec<SilenceId>, CephError> {
        let silences = self.downtime_cluster_alerts(reason).await?;
        match self.enter_maintenance(force).await {
            Ok(()) => Ok(silences),
            Err(e) => {
                if let Err(cleanup) = self.uptime_cluster_alerts(&silences).await {
                    warn!("unable to remove silences after failure: {}", cleanup);
                }
                Err(e)
            }
        }
    }

    async fn enter_maintenance(&self, force: bool) -> Result<(), CephError> {
        let status = self.cluster_status().await?;
        if status.is_in_maintenance() {
            info!(cluster = %self.cluster_name, "cluster already in maintenance");
            return Ok(());
        }

        if let Err(e) = status.check_healthy(false, Vec::<String>::new()) {
            if !force {
                warn!(
                    "cluster is not healthy, putting it in maintenance might stop recovery; use --force to do it anyhow"
                );
                return Err(e);
            }
            warn!("cluster is not healthy, continuing as --force was given: {}", e);
        }

        let mut set = Vec::new();
        for flag in [OsdFlag::NoOut, OsdFlag::NoRebalance] {
            if let Err(e) = self.set_osdmap_flag(&flag).await {
                for flag in set.iter().rev() {
                    if let Err(cleanup) = self.unset_osdmap_flag(flag).await {
                        warn!("unable to unset {} after failure: {}", flag, cleanup);
                    }
                }
                return Err(e);
            }
            set.push(flag);
        }
        Ok(())
    }

    /// Unsets the maintenance flags and removes the silences. Calling it
    /// twice is harmless.
    pub async fn unset_maintenance(&self, silences: &[SilenceId], force: bool) -> Result<(), CephError> {
        let status = self.cluster_status().await?;
        if let Err(e) = status.check_healthy(true, Vec::<String>::new()) {
            if !force {
                warn!(
                    "cluster is not healthy, leaving maintenance might have undesirable effects; use --force to do it anyhow"
                );
                return Err(e);
            }
            warn!("cluster is not healthy, continuing as --force was given: {}", e);
        }

        self.unset_osdmap_flag(&OsdFlag::NoOut).await?;
        self.unset_osdmap_flag(&OsdFlag::NoRebalance).await?;
        self.uptime_cluster_alerts(silences).await
    }

    pub async fn wait_for_cluster_healthy(
        &self,
        consider_maintenance_healthy: bool,
        schedule: PollSchedule,
        ignored_checks: &[String],
    ) -> Result<(), CephError> {
        ClusterHealthGate::new(self)
            .ignore_checks(ignored_checks.iter().cloned())
            .wait_for_healthy(schedule.timeout, schedule.interval, consider_maintenance_healthy)
            .await?;
        Ok(())
    }

    /// Waits until there are no misplaced objects.
    ///
    /// Returns whether there was anything to wait for.
    pub async fn wait_for_rebalance(&self, schedule: PollSchedule) -> Result<bool, CephError> {
        let start = Instant::now();
        let max_misplaced = AtomicU64::new(0);
        let had_to_wait = AtomicBool::new(false);
        let (max_misplaced, had_to_wait) = (&max_misplaced, &had_to_wait);

        let result = poll_until(schedule, move |_| async move {
            let misplaced = self.cluster_status().await?.misplaced_objects();
            if misplaced == 0 {
                info!("no misplaced objects, took {:?} to stabilize", start.elapsed());
                return Ok::<_, CephError>(Probe::Ready(had_to_wait.load(Ordering::SeqCst)));
            }

            had_to_wait.store(true, Ordering::SeqCst);
            // The count can grow at first, until the cluster starts moving data.
            let max = max_misplaced.fetch_max(misplaced, Ordering::SeqCst).max(misplaced);
            let elapsed = start.elapsed().as_secs_f64();
            let speed = if elapsed > 0.0 {
                (max - misplaced) as f64 / elapsed
            } else {
                0.0
            };
            let eta = if speed > 0.0 {
                format!("{:?}", Duration::from_secs_f64(misplaced as f64 / speed))
            } else {
                "unknown".to_string()
            };
            info!(
                "cluster still has {} misplaced objects, at {:.0} obj/s should take {} to finish (timeout {:?}, elapsed {:?})",
                misplaced,
                speed,
                eta,
                schedule.timeout,
                start.elapsed()
            );
            Ok(Probe::Pending(format!("{} misplaced objects", misplaced)))
        })
        .await;

        result.map_err(|e| poll_failure("the cluster to finish rebalancing", e))
    }

    /// After changing weights, waits for data to start moving (bounded by
    /// the rebalance start timeout) and then for it to settle.
    pub async fn wait_for_rebalance_after_change(&self) -> Result<(), CephError> {
        let started = poll_until(self.timeouts.rebalance_start(), move |attempt| async move {
            let misplaced = self.cluster_status().await?.misplaced_objects();
            if misplaced > 0 {
                return Ok::<_, CephError>(Probe::Ready(()));
            }
            debug!(attempt, "rebalancing has not started yet");
            Ok(Probe::Pending(()))
        })
        .await;

        match started {
            Ok(()) => {}
            Err(PollError::TimedOut { waited, .. }) => {
                info!("no rebalancing started after {:?}, checking it is settled", waited);
            }
            Err(PollError::Probe(e)) => return Err(e),
        }
        self.wait_for_rebalance(self.timeouts.rebalance()).await?;
        Ok(())
    }

    /// Waits for the in-progress events to finish. Returns whether there
    /// were any.
    pub async fn wait_for_in_progress_events(&self, schedule: PollSchedule) -> Result<bool, CephError> {
        let had_to_wait = AtomicBool::new(false);
        let had_to_wait = &had_to_wait;

        let result = poll_until(schedule, move |_| async move {
            let status = self.cluster_status().await?;
            let events = status.in_progress_events();
            if events.is_empty() {
                info!("no in-progress events");
                return Ok::<_, CephError>(Probe::Ready(had_to_wait.load(Ordering::SeqCst)));
            }
            had_to_wait.store(true, Ordering::SeqCst);
            info!(
                "cluster still has {} in-progress events, {:.2}% done",
                events.len(),
                status.mean_progress()
            );
            Ok(Probe::Pending(format!("{} in-progress events", events.len())))
        })
        .await;

        result.map_err(|e| poll_failure("in-progress events to finish", e))
    }

    pub async fn wait_for_one_manager_standby(&self, schedule: PollSchedule) -> Result<(), CephError> {
        let result = poll_until(schedule, move |_| async move {
            let standbys = self.cluster_status().await?.mgrmap().num_standbys;
            if standbys > 0 {
                return Ok::<_, CephError>(Probe::Ready(()));
            }
            Ok(Probe::Pending("no standby managers"))
        })
        .await;

        result.map_err(|e| poll_failure("a standby manager", e))
    }

    pub async fn osd_tree(&self) -> Result<OsdTree, CephError> {
        let command = RemoteCommand::new(["ceph", "osd", "tree", "-f", "json"]).safe();
        let raw = self.run(&command).await?;
        Ok(OsdTree::parse(&raw)?)
    }

    /// Public and cluster addresses of every OSD, deduplicated.
    pub async fn all_osd_ips(&self) -> Result<BTreeSet<String>, CephError> {
        let dump: OsdDump = self.run_json(&["osd", "dump"], false).await?;
        let mut ips = BTreeSet::new();
        for osd in &dump.osds {
            ips.insert(addr_ip(&osd.public_addr).to_string());
            ips.insert(addr_ip(&osd.cluster_addr).to_string());
        }
        Ok(ips)
    }

    /// Sets the CRUSH weight of an OSD. Returns whether it changed.
    pub async fn crush_reweight_osd(&self, osd_id: u32, weight: f64) -> Result<bool, CephError> {
        let current = self.osd_tree().await?.osd_weight(osd_id);
        if current.is_some_and(|w| (w - weight).abs() < WEIGHT_EPSILON) {
            debug!(osd_id, "osd already has weight {}", weight);
            return Ok(false);
        }

        let command = Self::ceph(["osd", "crush", "reweight", &format!("osd.{}", osd_id), &weight.to_string()]);
        let output = self.run(&command).await?;
        self.expect_output(&command, &output, &format!("reweighted item id {}", osd_id))?;
        Ok(true)
    }

    async fn mark_osd(&self, osd_id: u32, state: &str) -> Result<bool, CephError> {
        let command = Self::ceph(["osd", state, &format!("osd.{}", osd_id)]);
        let output = self.run(&command).await?;
        if self.dry_run || output.contains(&format!("marked {}", state)) {
            return Ok(true);
        }
        if output.contains(&format!("already {}", state)) {
            return Ok(false);
        }
        Err(CephError::UnexpectedOutput {
            command: command.command_line(),
            output,
        })
    }

    /// Marks an OSD in. Returns false if it already was.
    pub async fn mark_osd_in(&self, osd_id: u32) -> Result<bool, CephError> {
        self.mark_osd(osd_id, "in").await
    }

    /// Marks an OSD out. Returns false if it already was.
    pub async fn mark_osd_out(&self, osd_id: u32) -> Result<bool, CephError> {
        self.mark_osd(osd_id, "out").await
    }

    /// Sets the OSDs weight to 0 and marks them out, all at once.
    ///
    /// Unless `be_unsafe`, first checks that stopping all of them together
    /// keeps the cluster available. Returns whether any weight changed.
    pub async fn drain_osds(&self, osd_ids: &[u32], be_unsafe: bool) -> Result<bool, CephError> {
        if !be_unsafe {
            let failures = self.check_osds_ok_to_stop(osd_ids).await?;
            if !failures.is_empty() {
                return Err(CephError::Unsafe {
                    action: format!("drain osds {:?}", osd_ids),
                    reasons: failures,
                });
            }
        }

        let mut changed = false;
        for osd_id in osd_ids {
            changed |= self.crush_reweight_osd(*osd_id, 0.0).await?;
        }
        for osd_id in osd_ids {
            self.mark_osd_out(*osd_id).await?;
        }
        Ok(changed)
    }

    /// Drains the OSDs in batches of `batch_size` (0 for all at once),
    /// optionally waiting for the rebalance after every batch that changed
    /// something. Returns whether anything changed.
    pub async fn drain_osds_in_chunks(
        &self,
        osd_ids: &[u32],
        batch_size: usize,
        be_unsafe: bool,
        wait: bool,
    ) -> Result<bool, CephError> {
        let plan = BatchPlan::with_batch_size(osd_ids.to_vec(), batch_size);
        info!("draining osds {:?} in {} batches", osd_ids, plan.len());
        let operation = DrainOsds {
            controller: self,
            be_unsafe,
            wait,
        };
        let summary = BatchRunner::new("drain osds")
            .run(&plan, &operation)
            .await
            .map_err(BatchError::into_inner)?;
        Ok(summary.changed_batches > 0)
    }

    pub async fn undrain_osds_in_chunks(&self, osd_ids: &[u32], batch_size: usize, wait: bool) -> Result<(), CephError> {
        let plan = BatchPlan::with_batch_size(osd_ids.to_vec(), batch_size);
        info!("undraining osds {:?} in {} batches", osd_ids, plan.len());
        let operation = UndrainOsds { controller: self, wait };
        BatchRunner::new("undrain osds")
            .run(&plan, &operation)
            .await
            .map_err(BatchError::into_inner)?;
        Ok(())
    }

    /// Gives the OSDs the weight of the pooled ones (or `fallback_weight`)
    /// and marks them in. Marking in last starts a single rebalance.
    pub async fn undrain_osds(&self, osd_ids: &[u32], fallback_weight: f64) -> Result<(), CephError> {
        let tree = self.osd_tree().await?;
        let pooled_weight = tree
            .osds()
            .iter()
            .map(|o| o.crush_weight)
            .find(|w| *w > 0.0)
            .unwrap_or(fallback_weight);
        if pooled_weight <= 0.0 {
            return Err(CephError::NoPooledWeight);
        }

        for osd_id in osd_ids {
            self.crush_reweight_osd(*osd_id, pooled_weight).await?;
        }
        for osd_id in osd_ids {
            self.mark_osd_in(*osd_id).await?;
        }
        Ok(())
    }

    /// Drains the OSDs of a host. With `osd_ids`, only those of them that
    /// live on the host.
    pub async fn drain_osd_node(
        &self,
        osd_host: &str,
        osd_ids: &[u32],
        be_unsafe: bool,
        wait: bool,
        batch_size: usize,
    ) -> Result<(), CephError> {
        let mut osds = self.host_osds(osd_host).await?;
        if !osd_ids.is_empty() {
            osds.retain(|id| osd_ids.contains(id));
        }
        if osds.is_empty() {
            info!("none of the osds {:?} are on host {}, skipping", osd_ids, osd_host);
            return Ok(());
        }
        info!("draining osds from host {}: {:?}", osd_host, osds);
        self.drain_osds_in_chunks(&osds, batch_size, be_unsafe, wait).await?;
        info!("all osds drained on host {}", osd_host);
        Ok(())
    }

    pub async fn undrain_osd_node(&self, osd_host: &str, wait: bool, batch_size: usize) -> Result<(), CephError> {
        let osds = self.host_osds(osd_host).await?;
        info!("undraining osds from host {}: {:?}", osd_host, osds);
        self.undrain_osds_in_chunks(&osds, batch_size, wait).await
    }

    /// Removes an empty CRUSH bucket (host, rack...).
    pub async fn remove_crush_bucket(&self, bucket_name: &str) -> Result<(), CephError> {
        let command = Self::ceph(["osd", "crush", "remove", bucket_name]);
        let output = self.run(&command).await?;
        self.expect_output(&command, &output, "removed item")
    }

    /// Purges an OSD from the cluster maps. The device itself is left as is.
    pub async fn destroy_osd(&self, osd_id: u32, be_unsafe: bool) -> Result<(), CephError> {
        if !be_unsafe {
            let failures = self.check_osds_safe_to_destroy(&[osd_id]).await?;
            if !failures.is_empty() {
                return Err(CephError::Unsafe {
                    action: format!("destroy osd {}", osd_id),
                    reasons: failures,
                });
            }
        }

        let command = Self::ceph(["osd", "purge", &osd_id.to_string(), "--yes-i-really-mean-it"]);
        let output = self.run(&command).await?;
        self.expect_output(&command, &output, &format!("purged osd.{}", osd_id))
    }

    pub async fn host_osds(&self, osd_host: &str) -> Result<Vec<u32>, CephError> {
        let tree = self.osd_tree().await?;
        tree.host(osd_host)
            .map(|host| host.osd_ids())
            .ok_or_else(|| CephError::HostNotFound(osd_host.to_string()))
    }

    /// The given OSDs, all of the host's when empty. Fails if any of them
    /// is not on the host.
    pub async fn host_osds_subset(&self, osd_host: &str, osd_ids: &[u32]) -> Result<Vec<u32>, CephError> {
        let assigned = self.host_osds(osd_host).await?;
        if osd_ids.is_empty() {
            return Ok(assigned);
        }
        if osd_ids.iter().all(|id| assigned.contains(id)) {
            return Ok(osd_ids.to_vec());
        }
        Err(CephError::OsdsNotOnHost {
            host: osd_host.to_string(),
            osds: osd_ids.to_vec(),
            assigned,
        })
    }

    /// Block devices backing the OSDs, e.g. `/dev/sdc`. Read them before
    /// purging, the metadata goes away with the OSD.
    pub async fn osd_devices(&self, osd_ids: &[u32]) -> Result<Vec<String>, CephError> {
        let mut devices = Vec::new();
        for osd_id in osd_ids {
            let id = osd_id.to_string();
            let metadata: OsdMetadata = self.run_json(&["osd", "metadata", &id], false).await?;
            for name in metadata.devices.split(',').map(str::trim).filter(|d| !d.is_empty()) {
                let path = format!("/dev/{}", name);
                if !devices.contains(&path) {
                    devices.push(path);
                }
            }
        }
        Ok(devices)
    }

    /// Waits until the host shows up in the osd tree with all its OSDs.
    pub async fn wait_for_osd_host(&self, hostname: &str, schedule: PollSchedule) -> Result<(), CephError> {
        if self.dry_run {
            return Ok(());
        }
        let result = poll_until(schedule, move |_| async move {
            let tree = self.osd_tree().await?;
            if self.is_osd_host_valid(&tree, hostname) {
                return Ok::<_, CephError>(Probe::Ready(()));
            }
            Ok(Probe::Pending(format!("{} incomplete in the osd tree", hostname)))
        })
        .await;

        result.map_err(|e| poll_failure(&format!("the osds of {} to show up", hostname), e))
    }

    /// Returns the reasons the OSDs can't be stopped together, if any.
    pub async fn check_osds_ok_to_stop(&self, osd_ids: &[u32]) -> Result<Vec<String>, CephError> {
        if osd_ids.is_empty() {
            return Ok(vec!["No osd ids passed".to_string()]);
        }
        let command = Self::ceph(["osd", "ok-to-stop"])
            .args(osd_ids.iter().map(u32::to_string))
            .safe()
            .capture_errors();
        let output = self.run(&command).await?;
        if output.contains(OK_TO_STOP_MESSAGE) {
            return Ok(Vec::new());
        }
        Ok(vec![output])
    }

    /// Returns the reasons the OSDs can't be destroyed, if any.
    pub async fn check_osds_safe_to_destroy(&self, osd_ids: &[u32]) -> Result<Vec<String>, CephError> {
        let ids: Vec<String> = osd_ids.iter().map(u32::to_string).collect();
        let mut args = vec!["osd", "safe-to-destroy"];
        args.extend(ids.iter().map(String::as_str));
        let result: SafeToDestroy = self.run_json(&args, false).await?;

        // OSDs down for long enough show up as missing stats instead.
        let destroyable: BTreeSet<u32> = result
            .safe_to_destroy
            .iter()
            .chain(result.missing_stats.iter())
            .copied()
            .collect();
        let requested: BTreeSet<u32> = osd_ids.iter().copied().collect();
        if destroyable == requested {
            return Ok(Vec::new());
        }
        Ok(vec![format!(
            "Some osds are not safe to destroy, retry with the safe ones only or depool/stop the active ones \
             (safe: {:?}, active: {:?}, missing stats: {:?})",
            result.safe_to_destroy, result.active, result.missing_stats
        )])
    }

    /// Checks a new host before turning its drives into OSDs: jumbo frames
    /// to every other OSD, the drive count, and the OS soft raid.
    pub async fn check_if_osd_ready_for_bootstrap(
        &self,
        node: &CephOsdNodeController,
    ) -> Result<Vec<String>, CephError> {
        let mut failures = Vec::new();

        let other_ips = self.all_osd_ips().await?;
        let total = other_ips.len();
        info!("checking jumbo frames to all other osd nodes ({} of them)", total);
        let (mut ok, mut failed) = (0usize, 0usize);
        for ip in &other_ips {
            if node.check_jumbo_frames_to(ip).await {
                ok += 1;
            } else {
                failed += 1;
                failures.push(format!(
                    "Unable to send jumbo frames to {} from node {}",
                    ip,
                    node.node_fqdn()
                ));
            }
            info!("  [{} ok/{} error/{} pending] {}", ok, failed, total - ok - failed, ip);
        }

        info!("checking the amount of drives in the host");
        let devices = node.lsblk().await?;
        let expected = OSD_EXPECTED_OS_DRIVES + self.expected_osd_drives_per_host;
        if devices.len() != expected {
            failures.push(format!(
                "The host has {} drives, expected {} ({} for osds and {} for the os)",
                devices.len(),
                expected,
                self.expected_osd_drives_per_host,
                OSD_EXPECTED_OS_DRIVES
            ));
        }

        let available = node.available_devices().await?;
        if available.len() > self.expected_osd_drives_per_host {
            failures.push(format!(
                "Expected {} drives reserved for the os, but some would be used for osds ({:?}), is the raid set up?",
                OSD_EXPECTED_OS_DRIVES, available
            ));
        }

        let raided: Vec<&str> = devices
            .iter()
            .filter(|d| d.has_soft_raid())
            .map(|d| d.name.as_str())
            .collect();
        if raided.len() != OSD_EXPECTED_OS_DRIVES {
            failures.push(format!(
                "Expected {} os drives in software raid, got {:?}",
                OSD_EXPECTED_OS_DRIVES, raided
            ));
        }

        Ok(failures)
    }

    /// The host must appear once in the tree with the expected OSD count.
    pub fn is_osd_host_valid(&self, tree: &OsdTree, hostname: &str) -> bool {
        let found: Vec<_> = tree.hosts().into_iter().filter(|h| h.name == hostname).collect();
        if found.len() != 1 {
            warn!("expected 1 node named {} in the osd tree, found {}", hostname, found.len());
            return false;
        }
        let osds = found[0].children.len();
        if osds != self.expected_osd_drives_per_host {
            warn!(
                "expected {} osds for host {} in the osd tree, found {}",
                self.expected_osd_drives_per_host, hostname, osds
            );
            return false;
        }
        true
    }
}

struct DrainOsds<'a> {
    controller: &'a CephClusterController,
    be_unsafe: bool,
    wait: bool,
}

#[async_trait]
impl BatchOperation<u32> for DrainOsds<'_> {
    type Error = CephError;

    async fn apply(&self, batch: &[u32]) -> Result<bool, CephError> {
        self.controller.drain_osds(batch, self.be_unsafe).await
    }

    async fn stabilize(&self, _batch: &[u32], changed: bool) -> Result<(), CephError> {
        if !changed {
            info!("no changes made to the cluster, moving on");
            return Ok(());
        }
        if self.wait {
            info!("waiting for the cluster to shift data around");
            self.controller.wait_for_rebalance_after_change().await?;
        }
        Ok(())
    }
}

struct UndrainOsds<'a> {
    controller: &'a CephClusterController,
    wait: bool,
}

#[async_trait]
impl BatchOperation<u32> for UndrainOsds<'_> {
    type Error = CephError;

    async fn apply(&self, batch: &[u32]) -> Result<bool, CephError> {
        self.controller.undrain_osds(batch, 0.0).await?;
        Ok(true)
    }

    async fn stabilize(&self, _batch: &[u32], _changed: bool) -> Result<(), CephError> {
        if self.wait {
            info!("waiting for the cluster to shift data around");
            self.controller.wait_for_rebalance_after_change().await?;
        }
        Ok(())
    }
}

#[async_trait]
impl HealthSource for CephClusterController {
    type Report = CephClusterStatus;
    type Error = CephError;

    async fn health(&self) -> Result<CephClusterStatus, CephError> {
        self.cluster_status().await
    }
}

#[async_trait]
impl MaintenanceMode for CephClusterController {
    type Error = CephError;

    async fn set_maintenance(&self, reason: &str) -> Result<Vec<SilenceId>, CephError> {
        CephClusterController::set_maintenance(self, reason, self.force).await
    }

    async fn unset_maintenance(&self, silences: &[SilenceId]) -> Result<(), CephError> {
        CephClusterController::unset_maintenance(self, silences, self.force).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ceph::osd_node::tests::lsblk_json;
    use crate::ceph::osd_tree::tests::sample_tree_json;
    use crate::inventory::Node;
    use crate::testing::{FakeSilences, ScriptedExecutor};
    use serde_json::json;

    const STATUS: &str = "ceph status -f json";

    fn ok_status() -> String {
        json!({"health": {"status": "HEALTH_OK", "checks": {}}}).to_string()
    }

    fn warn_status() -> String {
        json!({"health": {"status": "HEALTH_WARN", "checks": {
            "PG_DEGRADED": {"summary": {"message": "Degraded data redundancy"}}
        }}})
        .to_string()
    }

    fn maintenance_status() -> String {
        json!({"health": {"status": "HEALTH_WARN", "checks": {
            "OSDMAP_FLAGS": {"summary": {"message": "noout,norebalance flag(s) set"}}
        }}})
        .to_string()
    }

    fn misplaced_status(misplaced: u64) -> String {
        json!({"health": {"status": "HEALTH_WARN"}, "pgmap": {"misplaced_objects": misplaced}}).to_string()
    }

    fn cluster() -> Cluster {
        Cluster::new(
            "eqiad1",
            vec![
                Node::new("cloudcephmon1001.eqiad.wmnet", NodeRole::CephMon),
                Node::new("cloudcephmon1002.eqiad.wmnet", NodeRole::CephMon),
                Node::new("cloudcephosd1001.eqiad.wmnet", NodeRole::CephOsd),
            ],
        )
        .unwrap()
    }

    fn controller(executor: &Arc<ScriptedExecutor>, silences: &Arc<FakeSilences>) -> CephClusterController {
        CephClusterController::new(executor.clone(), silences.clone(), &cluster(), 2)
            .unwrap()
            .with_timeouts(TimeoutsConfig {
                rebalance_secs: 300,
                rebalance_start_secs: 30,
                ..TimeoutsConfig::default()
            })
            .with_task_id(Some("T123".to_string()))
    }

    fn setup() -> (Arc<ScriptedExecutor>, Arc<FakeSilences>, CephClusterController) {
        let executor = Arc::new(ScriptedExecutor::new());
        let silences = Arc::new(FakeSilences::default());
        let ctl = controller(&executor, &silences);
        executor
            .on("osd set noout", "noout is set")
            .on("osd set norebalance", "norebalance is set")
            .on("osd unset noout", "noout is unset")
            .on("osd unset norebalance", "norebalance is unset");
        (executor, silences, ctl)
    }

    #[test]
    fn test_controlling_node_is_first_mon() {
        let (_, _, ctl) = setup();
        assert_eq!(ctl.controlling_node(), "cloudcephmon1001.eqiad.wmnet");
        assert_eq!(ctl.nodes_domain(), "eqiad.wmnet");
    }

    #[tokio::test]
    async fn test_change_controlling_node() {
        let (executor, _, mut ctl) = setup();
        executor.on(
            "ceph node ls",
            "\n\n{\"mon\": {\"cloudcephmon1001\": [1], \"cloudcephmon1002\": [2]}, \"osd\": {\"cloudcephosd1001\": [0, 1]}}",
        );
        ctl.change_controlling_node().await.unwrap();
        assert_eq!(ctl.controlling_node(), "cloudcephmon1002.eqiad.wmnet");
    }

    #[tokio::test]
    async fn test_change_controlling_node_without_other_mon() {
        let (executor, _, mut ctl) = setup();
        executor.on("ceph node ls", "{\"mon\": {\"cloudcephmon1001\": [1]}}");
        assert!(matches!(
            ctl.change_controlling_node().await,
            Err(CephError::NoControllerNode(_))
        ));
    }

    #[tokio::test]
    async fn test_set_maintenance_on_healthy_cluster() {
        let (executor, silences, ctl) = setup();
        executor.on(STATUS, &ok_status());

        let ids = ctl.set_maintenance("reboot", false).await.unwrap();

        assert_eq!(ids.len(), 1);
        assert!(executor.ran("ceph osd set noout"));
        assert!(executor.ran("ceph osd set norebalance"));
        let created = silences.created();
        assert_eq!(created[0].1.matchers, vec![Matcher::regex("service", ".*ceph.*")]);
        assert_eq!(created[0].1.comment, "Downtiming alert from cookbook - reboot - T123");
    }

    #[tokio::test]
    async fn test_set_maintenance_when_already_in_maintenance_only_silences() {
        let (executor, silences, ctl) = setup();
        executor.on(STATUS, &maintenance_status());

        ctl.set_maintenance("reboot", false).await.unwrap();

        assert!(!executor.ran("osd set"));
        assert_eq!(silences.active_count(), 1);
    }

    #[tokio::test]
    async fn test_set_maintenance_refuses_unhealthy_cluster() {
        let (executor, silences, ctl) = setup();
        executor.on(STATUS, &warn_status());

        let err = ctl.set_maintenance("reboot", false).await.unwrap_err();

        assert!(matches!(err, CephError::ClusterUnhealthy(_)));
        assert!(!executor.ran("osd set"));
        assert_eq!(silences.active_count(), 0);
    }

    #[tokio::test]
    async fn test_set_maintenance_forced_on_unhealthy_cluster() {
        let (executor, _, ctl) = setup();
        executor.on(STATUS, &warn_status());

        ctl.set_maintenance("reboot", true).await.unwrap();
        assert!(executor.ran("ceph osd set noout"));
    }

    #[tokio::test]
    async fn test_flag_not_confirmed_is_an_error() {
        let executor = Arc::new(ScriptedExecutor::new());
        let ctl = controller(&executor, &Arc::new(FakeSilences::default()));
        executor.on("osd set noout", "Error EACCES: access denied");
        let err = ctl.set_osdmap_flag(&OsdFlag::NoOut).await.unwrap_err();
        assert!(matches!(err, CephError::FlagSetError { ref flag, .. } if flag == "noout"));
    }

    #[tokio::test]
    async fn test_failed_second_flag_rolls_back_the_first() {
        let executor = Arc::new(ScriptedExecutor::new());
        let silences = Arc::new(FakeSilences::default());
        let ctl = controller(&executor, &silences);
        executor
            .on(STATUS, &ok_status())
            .on("osd set noout", "noout is set")
            .on("osd set norebalance", "Error EACCES: access denied")
            .on("osd unset noout", "noout is unset");

        let err = ctl.set_maintenance("reboot", false).await.unwrap_err();

        assert!(matches!(err, CephError::FlagSetError { ref flag, .. } if flag == "norebalance"));
        assert!(executor.ran("ceph osd unset noout"));
        assert!(!executor.ran("ceph osd unset norebalance"));
        assert_eq!(silences.active_count(), 0);
    }

    #[tokio::test]
    async fn test_unset_maintenance_twice_is_not_an_error() {
        let (executor, silences, ctl) = setup();
        executor.on(STATUS, &ok_status());
        let ids = ctl.set_maintenance("reboot", false).await.unwrap();

        executor.on(STATUS, &maintenance_status());
        ctl.unset_maintenance(&ids, false).await.unwrap();
        ctl.unset_maintenance(&ids, false).await.unwrap();

        assert_eq!(executor.count("ceph osd unset noout"), 2);
        assert_eq!(silences.active_count(), 0);
    }

    #[tokio::test]
    async fn test_maintenance_bracket_through_trait() {
        let (executor, silences, ctl) = setup();
        executor.on(STATUS, &ok_status());

        let result: Result<(), CephError> =
            crate::maintenance::with_maintenance(&ctl, "reboot", || async { Err(CephError::NoPooledWeight) }).await;

        assert!(matches!(result, Err(CephError::NoPooledWeight)));
        assert!(executor.ran("ceph osd unset norebalance"));
        assert_eq!(silences.active_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_cluster_healthy_polls_until_healthy() {
        let (executor, _, ctl) = setup();
        executor
            .on(STATUS, &warn_status())
            .on(STATUS, &warn_status())
            .on(STATUS, &ok_status());

        ctl.wait_for_cluster_healthy(false, PollSchedule::from_secs(600, 10), &[])
            .await
            .unwrap();
        assert_eq!(executor.count(STATUS), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_cluster_healthy_times_out() {
        let (executor, _, ctl) = setup();
        executor.on(STATUS, &warn_status());

        let err = ctl
            .wait_for_cluster_healthy(false, PollSchedule::from_secs(60, 10), &[])
            .await
            .unwrap_err();
        match err {
            CephError::ClusterUnhealthyTimeout { waited, last_status } => {
                assert_eq!(waited, Duration::from_secs(60));
                assert!(last_status.contains("PG_DEGRADED"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_cluster_healthy_with_ignored_checks() {
        let (executor, _, ctl) = setup();
        executor.on(STATUS, &warn_status());

        ctl.wait_for_cluster_healthy(false, PollSchedule::from_secs(60, 10), &["PG_DEGRADED".to_string()])
            .await
            .unwrap();
        assert_eq!(executor.count(STATUS), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_rebalance() {
        let (executor, _, ctl) = setup();
        executor
            .on(STATUS, &misplaced_status(100))
            .on(STATUS, &misplaced_status(50))
            .on(STATUS, &misplaced_status(0));

        assert!(ctl.wait_for_rebalance(PollSchedule::from_secs(600, 10)).await.unwrap());
        assert!(!ctl.wait_for_rebalance(PollSchedule::from_secs(600, 10)).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_rebalance_timeout() {
        let (executor, _, ctl) = setup();
        executor.on(STATUS, &misplaced_status(100));

        let err = ctl.wait_for_rebalance(PollSchedule::from_secs(60, 10)).await.unwrap_err();
        assert!(matches!(err, CephError::Timeout { ref state, .. } if state == "100 misplaced objects"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_in_progress_events_and_standby() {
        let (executor, _, ctl) = setup();
        executor
            .on(
                STATUS,
                &json!({"health": {"status": "HEALTH_OK"}, "progress_events": {"x": {"message": "m", "progress": 0.5}}})
                    .to_string(),
            )
            .on(
                STATUS,
                &json!({"health": {"status": "HEALTH_OK"}, "mgrmap": {"available": true, "num_standbys": 1}})
                    .to_string(),
            );

        assert!(ctl
            .wait_for_in_progress_events(PollSchedule::from_secs(60, 10))
            .await
            .unwrap());
        ctl.wait_for_one_manager_standby(PollSchedule::from_secs(60, 10))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_crush_reweight() {
        let (executor, _, ctl) = setup();
        executor
            .on("osd tree", &sample_tree_json())
            .on("crush reweight osd.0 0", "reweighted item id 0 name 'osd.0' to 0 in crush map");

        assert!(!ctl.crush_reweight_osd(0, 1.746).await.unwrap());
        assert!(ctl.crush_reweight_osd(0, 0.0).await.unwrap());

        executor.on("crush reweight osd.1 0", "Error ENOENT");
        assert!(matches!(
            ctl.crush_reweight_osd(1, 0.0).await,
            Err(CephError::UnexpectedOutput { .. })
        ));
    }

    #[tokio::test]
    async fn test_mark_osd_in_and_out() {
        let (executor, _, ctl) = setup();
        executor
            .on("osd in osd.3", "marked in osd.3.")
            .on("osd in osd.4", "osd.4 is already in.")
            .on("osd out osd.3", "marked out osd.3.")
            .on("osd out osd.5", "Error EINVAL");

        assert!(ctl.mark_osd_in(3).await.unwrap());
        assert!(!ctl.mark_osd_in(4).await.unwrap());
        assert!(ctl.mark_osd_out(3).await.unwrap());
        assert!(ctl.mark_osd_out(5).await.is_err());
    }

    #[tokio::test]
    async fn test_drain_osds_refuses_when_not_ok_to_stop() {
        let (executor, _, ctl) = setup();
        executor.fail("osd ok-to-stop", 16, "Error EBUSY: unsafe to stop osd(s)");

        let err = ctl.drain_osds(&[0, 1], false).await.unwrap_err();

        assert!(matches!(err, CephError::Unsafe { .. }));
        assert!(!executor.ran("crush reweight"));
    }

    #[tokio::test]
    async fn test_drain_osd_node_in_chunks() {
        let (executor, _, ctl) = setup();
        executor
            .on("osd tree", &sample_tree_json())
            .on("osd ok-to-stop", "osd(s) 1 are ok to stop without reducing availability or risking data")
            .on("crush reweight osd.1 0", "reweighted item id 1 name 'osd.1' to 0 in crush map")
            .on("crush reweight osd.0 0", "reweighted item id 0 name 'osd.0' to 0 in crush map")
            .on("osd out", "marked out osd.");

        ctl.drain_osd_node("cloudcephosd1001", &[], false, false, 1).await.unwrap();

        let calls: Vec<String> = executor
            .calls()
            .into_iter()
            .filter(|c| c.contains("reweight") || c.contains("osd out") || c.contains("ok-to-stop"))
            .collect();
        assert_eq!(
            calls,
            vec![
                "cloudcephmon1001.eqiad.wmnet: ceph osd ok-to-stop 1",
                "cloudcephmon1001.eqiad.wmnet: ceph osd crush reweight osd.1 0",
                "cloudcephmon1001.eqiad.wmnet: ceph osd out osd.1",
                "cloudcephmon1001.eqiad.wmnet: ceph osd ok-to-stop 0",
                "cloudcephmon1001.eqiad.wmnet: ceph osd crush reweight osd.0 0",
                "cloudcephmon1001.eqiad.wmnet: ceph osd out osd.0",
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_in_chunks_waits_for_rebalance() {
        let (executor, _, ctl) = setup();
        executor
            .on("osd tree", &sample_tree_json())
            .on("osd ok-to-stop", "are ok to stop without reducing availability or risking data")
            .on("crush reweight osd.1 0", "reweighted item id 1")
            .on("crush reweight osd.0 0", "reweighted item id 0")
            .on("osd out", "marked out")
            .on(STATUS, &misplaced_status(5))
            .on(STATUS, &misplaced_status(0));

        let changed = ctl.drain_osds_in_chunks(&[1, 0], 1, false, true).await.unwrap();

        assert!(changed);
        // Batch 1: start seen, then settled. Batch 2: start never seen within
        // the grace period (30s / 10s), then settled.
        assert_eq!(executor.count(STATUS), 2 + 3 + 1);
    }

    #[tokio::test]
    async fn test_undrain_uses_pooled_weight() {
        let (executor, _, ctl) = setup();
        executor
            .on("osd tree", &sample_tree_json())
            .on("crush reweight osd.2 1.746", "reweighted item id 2")
            .on("osd in osd.2", "marked in osd.2");

        ctl.undrain_osds_in_chunks(&[2], 0, false).await.unwrap();

        assert!(executor.ran("ceph osd crush reweight osd.2 1.746"));
        assert!(executor.ran("ceph osd in osd.2"));
    }

    #[tokio::test]
    async fn test_undrain_without_pooled_weight() {
        let (executor, _, ctl) = setup();
        executor.on(
            "osd tree",
            &json!({"nodes": [
                {"id": -1, "name": "default", "type": "root", "children": [0]},
                {"id": 0, "name": "osd.0", "type": "osd", "crush_weight": 0.0}
            ]})
            .to_string(),
        );
        assert!(matches!(ctl.undrain_osds(&[0], 0.0).await, Err(CephError::NoPooledWeight)));
    }

    #[tokio::test]
    async fn test_destroy_osd() {
        let (executor, _, ctl) = setup();
        executor
            .on("safe-to-destroy 3", "{\"safe_to_destroy\": [], \"active\": [], \"missing_stats\": [3]}")
            .on("osd purge 3", "purged osd.3")
            .on("safe-to-destroy 4", "{\"safe_to_destroy\": [], \"active\": [4], \"missing_stats\": []}");

        ctl.destroy_osd(3, false).await.unwrap();
        assert!(executor.ran("ceph osd purge 3 --yes-i-really-mean-it"));

        assert!(matches!(ctl.destroy_osd(4, false).await, Err(CephError::Unsafe { .. })));
        assert!(!executor.ran("osd purge 4"));
    }

    #[tokio::test]
    async fn test_host_osds_and_validation() {
        let (executor, _, ctl) = setup();
        executor.on("osd tree", &sample_tree_json());

        assert_eq!(ctl.host_osds("cloudcephosd1001").await.unwrap(), vec![1, 0]);
        assert!(matches!(
            ctl.host_osds("cloudcephosd9999").await,
            Err(CephError::HostNotFound(_))
        ));

        let tree = ctl.osd_tree().await.unwrap();
        assert!(ctl.is_osd_host_valid(&tree, "cloudcephosd1001"));
        assert!(!ctl.is_osd_host_valid(&tree, "cloudcephosd1002"));
        assert!(!ctl.is_osd_host_valid(&tree, "cloudcephosd9999"));
    }

    #[tokio::test]
    async fn test_bootstrap_checks() {
        let (executor, _, ctl) = setup();
        executor
            .on(
                "osd dump",
                &json!({"osds": [
                    {"osd": 0, "public_addr": "10.0.0.1:6800/123", "cluster_addr": "192.168.4.1:6800/123"},
                    {"osd": 1, "public_addr": "10.0.0.1:6802/124", "cluster_addr": "192.168.4.1:6802/124"}
                ]})
                .to_string(),
            )
            .on("lsblk --json", &lsblk_json(2))
            .fail("-s 8972 192.168.4.1", 1, "Message too long");
        let node = CephOsdNodeController::new(executor.clone(), "cloudcephosd1003.eqiad.wmnet");

        let ips = ctl.all_osd_ips().await.unwrap();
        assert_eq!(ips.len(), 2);

        let failures = ctl.check_if_osd_ready_for_bootstrap(&node).await.unwrap();
        assert_eq!(failures.len(), 1);
        assert!(failures[0].contains("192.168.4.1"));
    }

    #[tokio::test]
    async fn test_bootstrap_checks_wrong_drive_count() {
        let (executor, _, ctl) = setup();
        executor.on("osd dump", "{\"osds\": []}").on("lsblk --json", &lsblk_json(3));
        let node = CephOsdNodeController::new(executor.clone(), "cloudcephosd1003.eqiad.wmnet");

        let failures = ctl.check_if_osd_ready_for_bootstrap(&node).await.unwrap();
        assert_eq!(failures.len(), 2);
    }

    #[tokio::test]
    async fn test_drain_only_some_osds_of_a_node() {
        let (executor, _, ctl) = setup();
        executor
            .on("osd tree", &sample_tree_json())
            .on("osd ok-to-stop", "osd(s) 0 are ok to stop without reducing availability or risking data")
            .on("crush reweight osd.0 0", "reweighted item id 0 name 'osd.0' to 0 in crush map")
            .on("osd out", "marked out osd.");

        ctl.drain_osd_node("cloudcephosd1001", &[0, 2], false, false, 2).await.unwrap();

        assert!(executor.ran("ceph osd out osd.0"));
        assert!(!executor.ran("osd.1"));
        assert!(!executor.ran("osd.2"));
    }

    #[tokio::test]
    async fn test_host_osds_subset() {
        let (executor, _, ctl) = setup();
        executor.on("osd tree", &sample_tree_json());

        assert_eq!(ctl.host_osds_subset("cloudcephosd1001", &[]).await.unwrap(), vec![1, 0]);
        assert_eq!(ctl.host_osds_subset("cloudcephosd1001", &[0]).await.unwrap(), vec![0]);
        let err = ctl.host_osds_subset("cloudcephosd1001", &[0, 2]).await.unwrap_err();
        assert!(matches!(err, CephError::OsdsNotOnHost { ref assigned, .. } if assigned == &vec![1, 0]));
    }

    #[tokio::test]
    async fn test_osd_devices() {
        let (executor, _, ctl) = setup();
        executor
            .on("osd metadata 0", "{\"devices\": \"sdc\", \"hostname\": \"cloudcephosd1001\"}")
            .on("osd metadata 1", "{\"devices\": \"sdd,sdc\"}");

        let devices = ctl.osd_devices(&[0, 1]).await.unwrap();

        assert_eq!(devices, vec!["/dev/sdc", "/dev/sdd"]);
        assert!(executor.ran("ceph osd metadata 0 -f json"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_osd_host() {
        let (executor, _, ctl) = setup();
        let partial = json!({"nodes": [
            {"id": -1, "name": "default", "type": "root", "children": [-5]},
            {"id": -5, "name": "cloudcephosd1001", "type": "host", "children": [0]},
            {"id": 0, "name": "osd.0", "type": "osd", "device_class": "ssd", "crush_weight": 1.746}
        ]})
        .to_string();
        executor.on("osd tree", &partial).on("osd tree", &sample_tree_json());

        ctl.wait_for_osd_host("cloudcephosd1001", PollSchedule::from_secs(50, 5))
            .await
            .unwrap();
        assert_eq!(executor.count("osd tree"), 2);

        let err = ctl
            .wait_for_osd_host("cloudcephosd1003", PollSchedule::from_secs(50, 5))
            .await
            .unwrap_err();
        assert!(matches!(err, CephError::Timeout { .. }));
    }
}
