use crate::alerts::{AlertmanagerClient, SilenceId};
use crate::config::CookbookConfig;
use crate::confirm::{AutoConfirm, Confirmer, TerminalConfirmer};
use crate::cookbooks::ceph::{self as ceph_cookbooks, BootstrapOptions, DestroyOptions, DrainOptions};
use crate::cookbooks::k8s::{self as k8s_cookbooks, JoinOptions, RebootSelection};
use crate::cookbooks::CookbookContext;
use crate::inventory::NodeRole;
use crate::reboot::SshRebooter;
use crate::remote::{RemoteExecutor, SshExecutor};
use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "wmcs-cookbook")]
#[command(about = "WMCS operational runbooks", long_about = None)]
pub struct Cli {
    #[arg(
        short,
        long,
        global = true,
        default_value = "/etc/wmcs-cookbooks/config.toml",
        env = "WMCS_COOKBOOKS_CONFIG"
    )]
    pub config: PathBuf,

    /// Only run read-only commands, log the rest.
    #[arg(long, global = true)]
    pub dry_run: bool,

    /// Do not ask for confirmations.
    #[arg(short, long, global = true)]
    pub yes: bool,

    /// Phabricator task to reference in silences and logs.
    #[arg(long, global = true, env = "WMCS_TASK_ID")]
    pub task_id: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    Ceph {
        #[arg(long, default_value = "eqiad1")]
        cluster: String,
        #[command(subcommand)]
        cmd: CephCmd,
    },
    K8s {
        #[arg(long, default_value = "tools")]
        cluster: String,
        #[command(subcommand)]
        cmd: K8sCmd,
    },
}

#[derive(Subcommand, Clone)]
pub enum CephCmd {
    SetMaintenance {
        #[arg(long, default_value = "No reason specified")]
        reason: String,
        #[arg(long)]
        force: bool,
    },
    UnsetMaintenance {
        #[arg(long = "silence-id")]
        silence_ids: Vec<String>,
        #[arg(long)]
        force: bool,
    },
    WaitHealthy {
        #[arg(long)]
        consider_maintenance_healthy: bool,
        #[arg(long = "ignore-check")]
        ignored_checks: Vec<String>,
    },
    WaitForRebalance,
    DrainNode {
        #[arg(required = true)]
        hosts: Vec<String>,
        /// Only drain these osds, all of the hosts' by default.
        #[arg(long = "osd-id")]
        osd_ids: Vec<u32>,
        #[arg(long, default_value = "2")]
        batch_size: usize,
        #[arg(long)]
        force: bool,
        #[arg(long)]
        no_wait: bool,
        #[arg(long)]
        set_maintenance: bool,
    },
    UndrainNode {
        #[arg(required = true)]
        hosts: Vec<String>,
        #[arg(long, default_value = "2")]
        batch_size: usize,
        #[arg(long)]
        force: bool,
        #[arg(long)]
        no_wait: bool,
    },
    RebootNode {
        fqdn: String,
        #[arg(long)]
        force: bool,
        #[arg(long)]
        skip_maintenance: bool,
    },
    RollRebootOsds {
        #[arg(long, default_value = "1")]
        batch_size: usize,
        #[arg(long)]
        force: bool,
    },
    RollRebootMons {
        #[arg(long)]
        force: bool,
    },
    /// Turn the free drives of new hosts into osds.
    BootstrapAndAdd {
        #[arg(required = true)]
        fqdns: Vec<String>,
        #[arg(long)]
        skip_reboot: bool,
        #[arg(long)]
        only_check: bool,
        #[arg(long)]
        wait_for_rebalance: bool,
        #[arg(long)]
        force: bool,
    },
    /// Depool, purge and zap osds of a host.
    DepoolAndDestroy {
        fqdn: String,
        #[arg(long = "osd-id", required_unless_present = "all_osds")]
        osd_ids: Vec<u32>,
        #[arg(long, conflicts_with = "osd_ids")]
        all_osds: bool,
        #[arg(long)]
        only_check: bool,
        /// Depool everything at once without waiting for the rebalance.
        #[arg(long)]
        be_mean_about_it: bool,
        #[arg(long)]
        force: bool,
    },
}

#[derive(Subcommand, Clone)]
pub enum K8sCmd {
    Drain {
        hostname: String,
    },
    Reboot {
        #[arg(required_unless_present_any = ["all", "all_workers", "all_nfs_workers"])]
        hostnames: Vec<String>,
        #[arg(long, conflicts_with_all = ["hostnames", "all_workers", "all_nfs_workers"])]
        all: bool,
        #[arg(long, conflicts_with_all = ["hostnames", "all_nfs_workers"])]
        all_workers: bool,
        #[arg(long, conflicts_with = "hostnames")]
        all_nfs_workers: bool,
    },
    RemoveNode {
        #[arg(long, default_value = "k8s-worker")]
        role: NodeRole,
        /// Defaults to the oldest node of the role.
        #[arg(long)]
        hostname: Option<String>,
    },
    Join {
        fqdn: String,
        #[arg(long = "label")]
        labels: Vec<String>,
        #[arg(long = "taint")]
        taints: Vec<String>,
        #[arg(long)]
        no_wait: bool,
    },
    RestartStaticPods {
        hostname: String,
    },
}

impl K8sCmd {
    fn reboot_selection(hostnames: &[String], all: bool, all_workers: bool, all_nfs_workers: bool) -> RebootSelection {
        if all {
            RebootSelection::All
        } else if all_workers {
            RebootSelection::AllWorkers
        } else if all_nfs_workers {
            RebootSelection::AllNfsWorkers
        } else {
            RebootSelection::Hosts(hostnames.to_vec())
        }
    }
}

impl Cli {
    pub async fn run(self) -> Result<()> {
        let ctx = self.context()?;
        match self.command {
            Command::Ceph { ref cluster, ref cmd } => Self::ceph(&ctx, cluster, cmd).await,
            Command::K8s { ref cluster, ref cmd } => Self::k8s(&ctx, cluster, cmd).await,
        }
    }

    fn load_config(&self) -> Result<CookbookConfig> {
        if self.config.exists() {
            return Ok(CookbookConfig::from_file(&self.config)?);
        }
        tracing::warn!("Config file not found, using defaults: {}", self.config.display());
        Ok(CookbookConfig::default())
    }

    fn context(&self) -> Result<CookbookContext> {
        let config = self.load_config()?;
        let executor: Arc<dyn RemoteExecutor> = Arc::new(SshExecutor::new(config.ssh.clone(), self.dry_run));
        let created_by = std::env::var("USER").unwrap_or_else(|_| "wmcs-cookbook".to_string());
        let silences = Arc::new(AlertmanagerClient::new(&config.alertmanager_url, &created_by).with_dry_run(self.dry_run));
        let rebooter = Arc::new(SshRebooter::new(executor.clone(), self.dry_run));
        let confirmer: Arc<dyn Confirmer> = if self.yes {
            Arc::new(AutoConfirm)
        } else {
            Arc::new(TerminalConfirmer)
        };

        Ok(CookbookContext {
            config,
            executor,
            silences,
            rebooter,
            confirmer,
            dry_run: self.dry_run,
            task_id: self.task_id.clone(),
        })
    }

    async fn ceph(ctx: &CookbookContext, cluster: &str, cmd: &CephCmd) -> Result<()> {
        match cmd {
            CephCmd::SetMaintenance { reason, force } => {
                let silences = ceph_cookbooks::set_maintenance(ctx, cluster, reason, *force).await?;
                println!("Cluster {} in maintenance. To leave it run:", cluster);
                let ids: Vec<String> = silences.iter().map(|id| format!("--silence-id {}", id)).collect();
                println!("  wmcs-cookbook ceph --cluster {} unset-maintenance {}", cluster, ids.join(" "));
            }
            CephCmd::UnsetMaintenance { silence_ids, force } => {
                let silences: Vec<SilenceId> = silence_ids.iter().map(SilenceId::new).collect();
                ceph_cookbooks::unset_maintenance(ctx, cluster, &silences, *force).await?;
            }
            CephCmd::WaitHealthy {
                consider_maintenance_healthy,
                ignored_checks,
            } => {
                ceph_cookbooks::wait_healthy(ctx, cluster, *consider_maintenance_healthy, ignored_checks).await?;
            }
            CephCmd::WaitForRebalance => {
                if ceph_cookbooks::wait_for_rebalance(ctx, cluster).await? {
                    println!("Cluster {} finished rebalancing", cluster);
                } else {
                    println!("Cluster {} was not rebalancing", cluster);
                }
            }
            CephCmd::DrainNode {
                hosts,
                osd_ids,
                batch_size,
                force,
                no_wait,
                set_maintenance,
            } => {
                let options = DrainOptions {
                    batch_size: *batch_size,
                    osd_ids: osd_ids.clone(),
                    force: *force,
                    wait: !*no_wait,
                    set_maintenance: *set_maintenance,
                };
                ceph_cookbooks::drain_nodes(ctx, cluster, hosts, &options).await?;
            }
            CephCmd::UndrainNode {
                hosts,
                batch_size,
                force,
                no_wait,
            } => {
                ceph_cookbooks::undrain_nodes(ctx, cluster, hosts, *batch_size, *force, !*no_wait).await?;
            }
            CephCmd::RebootNode {
                fqdn,
                force,
                skip_maintenance,
            } => {
                ceph_cookbooks::reboot_node(ctx, cluster, fqdn, *force, *skip_maintenance).await?;
            }
            CephCmd::RollRebootOsds { batch_size, force } => {
                let summary = ceph_cookbooks::roll_reboot_osds(ctx, cluster, *batch_size, *force).await?;
                println!("Rebooted {} osd nodes in {} batches", summary.targets, summary.batches);
            }
            CephCmd::RollRebootMons { force } => {
                let rebooted = ceph_cookbooks::roll_reboot_mons(ctx, cluster, *force).await?;
                println!("Rebooted {} mon nodes", rebooted);
            }
            CephCmd::BootstrapAndAdd {
                fqdns,
                skip_reboot,
                only_check,
                wait_for_rebalance,
                force,
            } => {
                let options = BootstrapOptions {
                    skip_reboot: *skip_reboot,
                    only_check: *only_check,
                    wait_for_rebalance: *wait_for_rebalance,
                    force: *force,
                };
                ceph_cookbooks::bootstrap_and_add(ctx, cluster, fqdns, options).await?;
            }
            CephCmd::DepoolAndDestroy {
                fqdn,
                osd_ids,
                all_osds: _,
                only_check,
                be_mean_about_it,
                force,
            } => {
                // No ids means all of the host's.
                let options = DestroyOptions {
                    osd_ids: osd_ids.clone(),
                    only_check: *only_check,
                    be_mean: *be_mean_about_it,
                    force: *force,
                };
                let destroyed = ceph_cookbooks::depool_and_destroy(ctx, cluster, fqdn, &options).await?;
                println!("Destroyed osds {:?} of {}", destroyed, fqdn);
            }
        }
        Ok(())
    }

    async fn k8s(ctx: &CookbookContext, cluster: &str, cmd: &K8sCmd) -> Result<()> {
        match cmd {
            K8sCmd::Drain { hostname } => k8s_cookbooks::drain(ctx, cluster, hostname).await?,
            K8sCmd::Reboot {
                hostnames,
                all,
                all_workers,
                all_nfs_workers,
            } => {
                let selection = K8sCmd::reboot_selection(hostnames, *all, *all_workers, *all_nfs_workers);
                let rebooted = k8s_cookbooks::reboot(ctx, cluster, selection).await?;
                println!("Rebooted {} nodes: {}", rebooted.len(), rebooted.join(", "));
            }
            K8sCmd::RemoveNode { role, hostname } => {
                let removed = k8s_cookbooks::remove_node(ctx, cluster, *role, hostname.as_deref()).await?;
                println!("Removed {} from cluster {}", removed, cluster);
            }
            K8sCmd::Join {
                fqdn,
                labels,
                taints,
                no_wait,
            } => {
                let options = JoinOptions {
                    labels: labels.clone(),
                    taints: taints.clone(),
                    wait_ready: !*no_wait,
                };
                k8s_cookbooks::join(ctx, cluster, fqdn, &options).await?;
            }
            K8sCmd::RestartStaticPods { hostname } => {
                let restarted = k8s_cookbooks::restart_static_pods(ctx, cluster, hostname).await?;
                println!("Restarted static pods on {}: {}", hostname, restarted.join(", "));
            }
        }
        Ok(())
    }
}
