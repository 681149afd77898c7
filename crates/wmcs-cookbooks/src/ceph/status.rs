//! `ceph status -f json` schema.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use serde::Deserialize;

use super::CephError;
use crate::health::{HealthCheckOptions, HealthReport};

/// Checks raised by every cluster upgraded from a release affected by
/// CVE-2021-20288; they never count against health.
const IGNORED_UPGRADE_CHECKS: [&str; 2] = [
    "AUTH_INSECURE_GLOBAL_ID_RECLAIM",
    "AUTH_INSECURE_GLOBAL_ID_RECLAIM_ALLOWED",
];

const OSDMAP_FLAGS_CHECK: &str = "OSDMAP_FLAGS";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum HealthStatus {
    #[serde(rename = "HEALTH_OK")]
    Ok,
    #[serde(rename = "HEALTH_WARN")]
    Warn,
    #[serde(rename = "HEALTH_ERR")]
    Err,
    #[serde(other)]
    Unknown,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HealthStatus::Ok => "HEALTH_OK",
            HealthStatus::Warn => "HEALTH_WARN",
            HealthStatus::Err => "HEALTH_ERR",
            HealthStatus::Unknown => "HEALTH_UNKNOWN",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct CheckSummary {
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct HealthCheck {
    #[serde(default)]
    pub severity: Option<String>,
    #[serde(default)]
    pub summary: CheckSummary,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ClusterHealth {
    #[serde(alias = "overall_status")]
    pub status: HealthStatus,
    #[serde(default)]
    pub checks: BTreeMap<String, HealthCheck>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct PgMap {
    #[serde(default)]
    pub misplaced_objects: u64,
    #[serde(default)]
    pub num_pgs: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ProgressEvent {
    #[serde(default)]
    pub message: String,
    /// Between 0 and 1.
    #[serde(default)]
    pub progress: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct MgrMap {
    #[serde(default)]
    pub available: bool,
    #[serde(default)]
    pub num_standbys: u32,
    #[serde(default)]
    pub modules: Vec<String>,
    #[serde(default)]
    pub services: BTreeMap<String, String>,
}

/// OSD map flags. Unknown flags are kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OsdFlag {
    Full,
    Pause,
    NoUp,
    NoDown,
    NoOut,
    NoIn,
    NoBackfill,
    NoRebalance,
    NoRecover,
    NoScrub,
    NoDeepScrub,
    NoTierAgent,
    NoSnapTrim,
    PgLogHardLimit,
    Other(String),
}

impl OsdFlag {
    pub fn as_str(&self) -> &str {
        match self {
            OsdFlag::Full => "full",
            OsdFlag::Pause => "pause",
            OsdFlag::NoUp => "noup",
            OsdFlag::NoDown => "nodown",
            OsdFlag::NoOut => "noout",
            OsdFlag::NoIn => "noin",
            OsdFlag::NoBackfill => "nobackfill",
            OsdFlag::NoRebalance => "norebalance",
            OsdFlag::NoRecover => "norecover",
            OsdFlag::NoScrub => "noscrub",
            OsdFlag::NoDeepScrub => "nodeep-scrub",
            OsdFlag::NoTierAgent => "notieragent",
            OsdFlag::NoSnapTrim => "nosnaptrim",
            OsdFlag::PgLogHardLimit => "pglog_hardlimit",
            OsdFlag::Other(other) => other,
        }
    }

    /// Flags that only pause data movement, set while in maintenance.
    pub fn is_maintenance_flag(&self) -> bool {
        matches!(self, OsdFlag::NoOut | OsdFlag::NoRebalance | OsdFlag::NoIn)
    }
}

impl FromStr for OsdFlag {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "full" => OsdFlag::Full,
            "pause" => OsdFlag::Pause,
            "noup" => OsdFlag::NoUp,
            "nodown" => OsdFlag::NoDown,
            "noout" => OsdFlag::NoOut,
            "noin" => OsdFlag::NoIn,
            "nobackfill" => OsdFlag::NoBackfill,
            "norebalance" => OsdFlag::NoRebalance,
            "norecover" => OsdFlag::NoRecover,
            "noscrub" => OsdFlag::NoScrub,
            "nodeep-scrub" => OsdFlag::NoDeepScrub,
            "notieragent" => OsdFlag::NoTierAgent,
            "nosnaptrim" => OsdFlag::NoSnapTrim,
            "pglog_hardlimit" => OsdFlag::PgLogHardLimit,
            other => OsdFlag::Other(other.to_string()),
        })
    }
}

impl fmt::Display for OsdFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CephClusterStatus {
    pub health: ClusterHealth,
    #[serde(default)]
    pub pgmap: PgMap,
    #[serde(default)]
    pub progress_events: BTreeMap<String, ProgressEvent>,
    #[serde(default)]
    pub mgrmap: MgrMap,
}

impl CephClusterStatus {
    /// Health checks, without the ones that are always ignored.
    pub fn checks(&self) -> BTreeMap<&str, &HealthCheck> {
        self.health
            .checks
            .iter()
            .filter(|(name, _)| !IGNORED_UPGRADE_CHECKS.contains(&name.as_str()))
            .map(|(name, check)| (name.as_str(), check))
            .collect()
    }

    /// Overall status once the ignored checks are discounted.
    pub fn status(&self) -> HealthStatus {
        if !self.health.checks.is_empty() && self.checks().is_empty() {
            return HealthStatus::Ok;
        }
        self.health.status
    }

    /// Flags listed in the `OSDMAP_FLAGS` check, e.g. from
    /// `"noout,norebalance flag(s) set"`.
    pub fn osdmap_flags(&self) -> BTreeSet<OsdFlag> {
        let Some(check) = self.health.checks.get(OSDMAP_FLAGS_CHECK) else {
            return BTreeSet::new();
        };
        let message = &check.summary.message;
        if !message.contains("flag(s) set") {
            return BTreeSet::new();
        }
        message
            .split(' ')
            .next()
            .unwrap_or_default()
            .split(',')
            .filter(|f| !f.is_empty())
            .filter_map(|f| f.parse().ok())
            .collect()
    }

    /// True when the cluster is only unhealthy because of the maintenance
    /// flags.
    pub fn is_in_maintenance(&self) -> bool {
        if self.status() == HealthStatus::Ok {
            return false;
        }
        self.only_maintenance_flags(&self.checks())
    }

    fn only_maintenance_flags(&self, checks: &BTreeMap<&str, &HealthCheck>) -> bool {
        if checks.len() != 1 || !checks.contains_key(OSDMAP_FLAGS_CHECK) {
            return false;
        }
        self.osdmap_flags().iter().all(OsdFlag::is_maintenance_flag)
    }

    pub fn check_healthy<I, S>(&self, consider_maintenance_healthy: bool, ignored_checks: I) -> Result<(), CephError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        if self.status() == HealthStatus::Ok {
            return Ok(());
        }

        let ignored: Vec<S> = ignored_checks.into_iter().collect();
        let mut remaining = self.checks();
        for name in &ignored {
            remaining.remove(name.as_ref());
        }
        if !ignored.is_empty() && remaining.is_empty() {
            return Ok(());
        }

        if consider_maintenance_healthy && self.only_maintenance_flags(&remaining) {
            return Ok(());
        }

        Err(CephError::ClusterUnhealthy(self.summary()))
    }

    pub fn misplaced_objects(&self) -> u64 {
        self.pgmap.misplaced_objects
    }

    pub fn in_progress_events(&self) -> &BTreeMap<String, ProgressEvent> {
        &self.progress_events
    }

    /// Mean progress of the in-progress events, in percent.
    pub fn mean_progress(&self) -> f64 {
        if self.progress_events.is_empty() {
            return 100.0;
        }
        let total: f64 = self.progress_events.values().map(|e| e.progress).sum();
        total * 100.0 / self.progress_events.len() as f64
    }

    pub fn mgrmap(&self) -> &MgrMap {
        &self.mgrmap
    }
}

impl HealthReport for CephClusterStatus {
    fn is_healthy(&self, options: &HealthCheckOptions) -> bool {
        self.check_healthy(options.consider_maintenance_healthy, &options.ignored_checks)
            .is_ok()
    }

    fn summary(&self) -> String {
        let checks = self.checks();
        if checks.is_empty() {
            return self.status().to_string();
        }
        let details: Vec<String> = checks
            .iter()
            .map(|(name, check)| format!("{} ({})", name, check.summary.message))
            .collect();
        format!("{}: {}", self.status(), details.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::parse_json;
    use serde_json::json;

    fn status(value: serde_json::Value) -> CephClusterStatus {
        parse_json("ceph", &value.to_string()).unwrap()
    }

    fn maintenance_status() -> CephClusterStatus {
        status(json!({
            "health": {
                "status": "HEALTH_WARN",
                "checks": {"OSDMAP_FLAGS": {"severity": "HEALTH_WARN", "summary": {"message": "noout,norebalance flag(s) set"}}}
            }
        }))
    }

    #[test]
    fn test_ok_status() {
        let s = status(json!({"health": {"status": "HEALTH_OK", "checks": {}}}));
        assert_eq!(s.status(), HealthStatus::Ok);
        assert!(s.check_healthy(false, Vec::<String>::new()).is_ok());
        assert!(!s.is_in_maintenance());
        assert_eq!(s.summary(), "HEALTH_OK");
    }

    #[test]
    fn test_legacy_overall_status_and_unknown_values() {
        let s = status(json!({"health": {"overall_status": "HEALTH_WHATEVER"}}));
        assert_eq!(s.status(), HealthStatus::Unknown);
        assert!(s.check_healthy(false, Vec::<String>::new()).is_err());
    }

    #[test]
    fn test_upgrade_warnings_are_ignored() {
        let s = status(json!({
            "health": {
                "status": "HEALTH_WARN",
                "checks": {
                    "AUTH_INSECURE_GLOBAL_ID_RECLAIM": {"summary": {"message": "clients reclaiming"}},
                    "AUTH_INSECURE_GLOBAL_ID_RECLAIM_ALLOWED": {"summary": {"message": "allowed"}}
                }
            }
        }));
        assert_eq!(s.status(), HealthStatus::Ok);
        assert!(s.check_healthy(false, Vec::<String>::new()).is_ok());
    }

    #[test]
    fn test_warn_without_checks_is_unhealthy() {
        let s = status(json!({"health": {"status": "HEALTH_WARN", "checks": {}}}));
        assert!(matches!(
            s.check_healthy(true, Vec::<String>::new()),
            Err(CephError::ClusterUnhealthy(_))
        ));
    }

    #[test]
    fn test_osdmap_flags() {
        let s = maintenance_status();
        let flags: Vec<OsdFlag> = s.osdmap_flags().into_iter().collect();
        assert_eq!(flags, vec![OsdFlag::NoOut, OsdFlag::NoRebalance]);
    }

    #[test]
    fn test_maintenance_detection() {
        let s = maintenance_status();
        assert!(s.is_in_maintenance());
        assert!(s.check_healthy(false, Vec::<String>::new()).is_err());
        assert!(s.check_healthy(true, Vec::<String>::new()).is_ok());
    }

    #[test]
    fn test_other_flags_are_not_maintenance() {
        let s = status(json!({
            "health": {
                "status": "HEALTH_WARN",
                "checks": {"OSDMAP_FLAGS": {"summary": {"message": "noout,noscrub flag(s) set"}}}
            }
        }));
        assert!(!s.is_in_maintenance());
        assert!(s.check_healthy(true, Vec::<String>::new()).is_err());
    }

    #[test]
    fn test_maintenance_with_extra_check_is_unhealthy() {
        let s = status(json!({
            "health": {
                "status": "HEALTH_WARN",
                "checks": {
                    "OSDMAP_FLAGS": {"summary": {"message": "noout flag(s) set"}},
                    "PG_DEGRADED": {"summary": {"message": "Degraded data redundancy"}}
                }
            }
        }));
        assert!(!s.is_in_maintenance());
        assert!(s.check_healthy(true, Vec::<String>::new()).is_err());
        assert!(s.check_healthy(true, ["PG_DEGRADED"]).is_ok());
        assert!(s.check_healthy(false, ["PG_DEGRADED", "OSDMAP_FLAGS"]).is_ok());
        assert_eq!(
            s.summary(),
            "HEALTH_WARN: OSDMAP_FLAGS (noout flag(s) set), PG_DEGRADED (Degraded data redundancy)"
        );
    }

    #[test]
    fn test_pgmap_progress_and_mgrmap() {
        let s = status(json!({
            "health": {"status": "HEALTH_OK"},
            "pgmap": {"misplaced_objects": 1200, "num_pgs": 4096},
            "progress_events": {
                "a": {"message": "Rebalancing", "progress": 0.25},
                "b": {"message": "Rebalancing", "progress": 0.75}
            },
            "mgrmap": {"available": true, "num_standbys": 1, "modules": ["iostat"]}
        }));
        assert_eq!(s.misplaced_objects(), 1200);
        assert_eq!(s.in_progress_events().len(), 2);
        assert!((s.mean_progress() - 50.0).abs() < f64::EPSILON);
        assert_eq!(s.mgrmap().num_standbys, 1);
    }

    #[test]
    fn test_health_report_options() {
        let s = maintenance_status();
        let mut options = HealthCheckOptions::default();
        assert!(!s.is_healthy(&options));
        options.consider_maintenance_healthy = true;
        assert!(s.is_healthy(&options));
    }
}
