use std::sync::Arc;

use serde::Deserialize;
use tracing::{info, warn};

use super::CephError;
use crate::confirm::Confirmer;
use crate::output::parse_json;
use crate::remote::{RemoteCommand, RemoteExecutor};

/// One entry of `lsblk --json`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct BlockDevice {
    pub name: String,
    #[serde(rename = "type", default)]
    pub device_type: Option<String>,
    #[serde(default)]
    pub mountpoint: Option<String>,
    #[serde(default)]
    pub children: Vec<BlockDevice>,
}

impl BlockDevice {
    /// A whole disk with no partitions and nothing mounted.
    pub fn is_available(&self) -> bool {
        self.device_type.as_deref() == Some("disk")
            && self.children.is_empty()
            && self.mountpoint.as_deref().map_or(true, str::is_empty)
    }

    /// True when one of the partitions holds the `md0` software raid.
    pub fn has_soft_raid(&self) -> bool {
        self.children
            .iter()
            .any(|part| part.children.first().is_some_and(|c| c.name == "md0"))
    }
}

#[derive(Debug, Deserialize)]
struct Lsblk {
    blockdevices: Vec<BlockDevice>,
}

/// Operations on a single OSD host.
pub struct CephOsdNodeController {
    executor: Arc<dyn RemoteExecutor>,
    node_fqdn: String,
}

impl CephOsdNodeController {
    pub fn new(executor: Arc<dyn RemoteExecutor>, node_fqdn: impl Into<String>) -> Self {
        Self {
            executor,
            node_fqdn: node_fqdn.into(),
        }
    }

    pub fn node_fqdn(&self) -> &str {
        &self.node_fqdn
    }

    async fn run(&self, command: RemoteCommand) -> Result<String, CephError> {
        Ok(self.executor.run(&self.node_fqdn, &command).await?)
    }

    pub async fn lsblk(&self) -> Result<Vec<BlockDevice>, CephError> {
        let raw = self.run(RemoteCommand::new(["lsblk", "--json"]).safe()).await?;
        let parsed: Lsblk = parse_json("lsblk", &raw)?;
        Ok(parsed.blockdevices)
    }

    pub async fn available_devices(&self) -> Result<Vec<String>, CephError> {
        Ok(self
            .lsblk()
            .await?
            .into_iter()
            .filter(BlockDevice::is_available)
            .map(|d| format!("/dev/{}", d.name))
            .collect())
    }

    /// Wipes the device. Everything on it is lost.
    pub async fn zap_device(&self, device_path: &str) -> Result<(), CephError> {
        self.run(RemoteCommand::new(["ceph-volume", "lvm", "zap", device_path]))
            .await?;
        Ok(())
    }

    pub async fn initialize_and_start_osd(&self, device_path: &str) -> Result<(), CephError> {
        self.run(RemoteCommand::new([
            "ceph-volume",
            "lvm",
            "create",
            "--bluestore",
            "--data",
            device_path,
        ]))
        .await?;
        Ok(())
    }

    /// Turns every available device into a new OSD. With a confirmer, each
    /// device must be approved first.
    pub async fn add_all_available_devices(&self, confirmer: Option<&dyn Confirmer>) -> Result<Vec<String>, CephError> {
        let devices = self.available_devices().await?;
        for device in &devices {
            if let Some(confirmer) = confirmer {
                confirmer
                    .confirm(&format!(
                        "I'm going to destroy and create a new OSD on {}:{}.",
                        self.node_fqdn, device
                    ))
                    .await?;
            }
            self.zap_device(device).await?;
            self.initialize_and_start_osd(device).await?;
            info!(node = %self.node_fqdn, "created osd on {}", device);
        }
        Ok(devices)
    }

    /// Pings `dst_ip` with unfragmented 9000 byte frames.
    pub async fn check_jumbo_frames_to(&self, dst_ip: &str) -> bool {
        // Two packets: the first one after a reboot can get lost while the
        // router resolves the address.
        let command = RemoteCommand::new([
            "ping", "-M", "do", "-4", "-c", "2", "-W", "1", "-s", "8972", dst_ip,
        ])
        .safe();
        match self.run(command).await {
            Ok(_) => true,
            Err(e) => {
                warn!(node = %self.node_fqdn, "failed to ping {} with a jumbo frame: {}", dst_ip, e);
                false
            }
        }
    }

    pub async fn stop_osd(&self, osd_id: u32) -> Result<String, CephError> {
        self.run(RemoteCommand::new(["systemctl", "stop"]).arg(format!("ceph-osd@{}", osd_id)))
            .await
    }

    pub async fn stop_osds(&self, osd_ids: &[u32]) -> Result<(), CephError> {
        for osd_id in osd_ids {
            self.stop_osd(*osd_id).await?;
        }
        Ok(())
    }
}
