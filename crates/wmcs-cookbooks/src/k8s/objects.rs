//! Helpers over the Kubernetes API objects read from
//! `kubectl ... --output=json`.

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Node, Pod};
use serde::Deserialize;

use super::KubernetesError;
use crate::output::strip_ansi;

/// The `items` of a `kubectl get` listing.
///
/// kubectl reports its listings as `kind: List`, which the typed
/// `k8s_openapi::List` (expecting e.g. `NodeList`) refuses.
#[derive(Debug, Clone, Deserialize)]
pub struct ObjectList<T> {
    #[serde(default = "Vec::new")]
    pub items: Vec<T>,
}

pub trait NodeExt {
    fn name(&self) -> &str;

    /// `None` when the node reports no `Ready` condition at all.
    fn is_ready(&self) -> Option<bool>;

    fn conditions_summary(&self) -> String;

    /// Kubelet version without the leading `v`.
    fn kubelet_version(&self) -> Option<&str>;
}

impl NodeExt for Node {
    fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or_default()
    }

    fn is_ready(&self) -> Option<bool> {
        self.status
            .as_ref()?
            .conditions
            .as_ref()?
            .iter()
            .find(|c| c.type_ == "Ready")
            .map(|c| c.status == "True")
    }

    fn conditions_summary(&self) -> String {
        let conditions = self.status.as_ref().and_then(|s| s.conditions.as_ref());
        conditions
            .into_iter()
            .flatten()
            .map(|c| match &c.reason {
                Some(reason) => format!("{}={} ({})", c.type_, c.status, reason),
                None => format!("{}={}", c.type_, c.status),
            })
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn kubelet_version(&self) -> Option<&str> {
        self.status
            .as_ref()?
            .node_info
            .as_ref()
            .map(|info| info.kubelet_version.trim_start_matches('v'))
    }
}

pub trait PodExt {
    /// `namespace/name`.
    fn qualified_name(&self) -> String;

    /// Pods owned by a DaemonSet run on every node, and static control plane
    /// pods are owned by their Node; a drain evicts everything else.
    fn is_evictable(&self) -> bool;

    fn is_running(&self) -> bool;
}

impl PodExt for Pod {
    fn qualified_name(&self) -> String {
        let name = self.metadata.name.as_deref().unwrap_or_default();
        match &self.metadata.namespace {
            Some(ns) => format!("{}/{}", ns, name),
            None => name.to_string(),
        }
    }

    fn is_evictable(&self) -> bool {
        !self
            .metadata
            .owner_references
            .iter()
            .flatten()
            .any(|owner| owner.kind == "DaemonSet" || owner.kind == "Node")
    }

    fn is_running(&self) -> bool {
        self.status.as_ref().and_then(|s| s.phase.as_deref()) == Some("Running")
    }
}

/// Current replicas of a deployment, 0 when it reports none.
pub fn deployment_replicas(deployment: &Deployment) -> u32 {
    deployment
        .status
        .as_ref()
        .and_then(|s| s.replicas)
        .and_then(|r| u32::try_from(r).ok())
        .unwrap_or(0)
}

/// Endpoints listed by `kubectl cluster-info`, which has no JSON output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterInfo {
    pub master_url: String,
    pub dns_url: String,
    pub metrics_url: String,
}

impl ClusterInfo {
    pub fn parse(raw: &str) -> Result<Self, KubernetesError> {
        let mut master_url = None;
        let mut dns_url = None;
        let mut metrics_url = None;

        for line in raw.lines() {
            let line = strip_ansi(line);
            let url = line.rsplit(' ').next().map(str::to_string);
            if line.starts_with("Kubernetes control plane") {
                master_url = url;
            } else if line.starts_with("CoreDNS") {
                dns_url = url;
            } else if line.starts_with("Metrics-server") {
                metrics_url = url;
            }
        }

        match (master_url, dns_url, metrics_url) {
            (Some(master_url), Some(dns_url), Some(metrics_url)) => Ok(Self {
                master_url,
                dns_url,
                metrics_url,
            }),
            _ => Err(KubernetesError::MalformedClusterInfo(raw.to_string())),
        }
    }

    /// API server address as kubeadm wants it, without the scheme.
    pub fn join_address(&self) -> &str {
        self.master_url
            .split_once("//")
            .map(|(_, address)| address)
            .unwrap_or(&self.master_url)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::output::parse_json;
    use serde_json::json;

    pub(crate) fn node_json(name: &str, ready: &str) -> serde_json::Value {
        json!({
            "apiVersion": "v1",
            "kind": "Node",
            "metadata": {"name": name, "labels": {"kubernetes.io/hostname": name}},
            "spec": {},
            "status": {
                "conditions": [
                    {"type": "MemoryPressure", "status": "False"},
                    {"type": "Ready", "status": ready, "reason": "KubeletReady"}
                ],
                "nodeInfo": {
                    "architecture": "amd64",
                    "bootID": "0b3b1a9e",
                    "containerRuntimeVersion": "containerd://1.6.20",
                    "kernelVersion": "5.10.0-26-amd64",
                    "kubeProxyVersion": "v1.24.17",
                    "kubeletVersion": "v1.24.17",
                    "machineID": "4c4c4544",
                    "operatingSystem": "linux",
                    "osImage": "Debian GNU/Linux 11 (bullseye)",
                    "systemUUID": "4c4c4544-0042"
                }
            }
        })
    }

    pub(crate) fn pod_json(namespace: &str, name: &str, owner_kind: Option<&str>) -> serde_json::Value {
        let owners = match owner_kind {
            Some(kind) => json!([{
                "apiVersion": "apps/v1",
                "kind": kind,
                "name": "owner",
                "uid": "9d1c2f0e",
                "controller": true
            }]),
            None => json!([]),
        };
        json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {"name": name, "namespace": namespace, "ownerReferences": owners},
            "spec": {"nodeName": "tools-k8s-worker-1", "containers": []},
            "status": {"phase": "Running"}
        })
    }

    pub(crate) fn list_json(items: Vec<serde_json::Value>) -> String {
        json!({"apiVersion": "v1", "kind": "List", "items": items}).to_string()
    }

    pub(crate) const CLUSTER_INFO: &str = "\x1b[0;32mKubernetes control plane\x1b[0m is running at \x1b[0;33mhttps://k8s.svc.tools.eqiad1.wikimedia.cloud:6443\x1b[0m\n\
\x1b[0;32mCoreDNS\x1b[0m is running at \x1b[0;33mhttps://k8s.svc.tools.eqiad1.wikimedia.cloud:6443/api/v1/namespaces/kube-system/services/kube-dns:dns/proxy\x1b[0m\n\
\x1b[0;32mMetrics-server\x1b[0m is running at \x1b[0;33mhttps://k8s.svc.tools.eqiad1.wikimedia.cloud:6443/api/v1/namespaces/kube-system/services/https:metrics-server:/proxy\x1b[0m\n\
\n\
To further debug and diagnose cluster problems, use 'kubectl cluster-info dump'.";

    #[test]
    fn test_cluster_info_with_colours() {
        let info = ClusterInfo::parse(CLUSTER_INFO).unwrap();
        assert_eq!(info.master_url, "https://k8s.svc.tools.eqiad1.wikimedia.cloud:6443");
        assert!(info.dns_url.ends_with("kube-dns:dns/proxy"));
        assert!(info.metrics_url.ends_with("metrics-server:/proxy"));
        assert_eq!(info.join_address(), "k8s.svc.tools.eqiad1.wikimedia.cloud:6443");
    }

    #[test]
    fn test_cluster_info_missing_endpoint() {
        let raw = "Kubernetes control plane is running at https://k8s:6443\n";
        assert!(matches!(
            ClusterInfo::parse(raw),
            Err(KubernetesError::MalformedClusterInfo(_))
        ));
    }

    #[test]
    fn test_node_readiness_and_version() {
        let node: Node = serde_json::from_value(node_json("tools-k8s-worker-1", "True")).unwrap();
        assert_eq!(node.is_ready(), Some(true));
        assert_eq!(node.kubelet_version(), Some("1.24.17"));
        assert_eq!(
            node.conditions_summary(),
            "MemoryPressure=False, Ready=True (KubeletReady)"
        );

        let bare: Node = serde_json::from_value(json!({"metadata": {"name": "x"}})).unwrap();
        assert_eq!(bare.name(), "x");
        assert_eq!(bare.is_ready(), None);
        assert_eq!(bare.conditions_summary(), "");
        assert_eq!(bare.kubelet_version(), None);
    }

    #[test]
    fn test_evictable_pods() {
        let list: ObjectList<Pod> = parse_json(
            "kubectl",
            &list_json(vec![
                pod_json("tool-a", "web-1", Some("ReplicaSet")),
                pod_json("kube-system", "calico-node-x", Some("DaemonSet")),
                pod_json("kube-system", "kube-apiserver-ctl", Some("Node")),
                pod_json("tool-b", "job-1", None),
            ]),
        )
        .unwrap();

        let evictable: Vec<String> = list
            .items
            .iter()
            .filter(|p| p.is_evictable())
            .map(Pod::qualified_name)
            .collect();
        assert_eq!(evictable, vec!["tool-a/web-1", "tool-b/job-1"]);
        assert!(list.items[0].is_running());
    }

    #[test]
    fn test_deployment_replicas() {
        let deployment: Deployment =
            serde_json::from_value(json!({"metadata": {"name": "registry-admission"}, "status": {"replicas": 2}}))
                .unwrap();
        assert_eq!(deployment_replicas(&deployment), 2);

        let fresh: Deployment = serde_json::from_value(json!({"metadata": {"name": "registry-admission"}})).unwrap();
        assert_eq!(deployment_replicas(&fresh), 0);
    }

    #[test]
    fn test_kubectl_list_is_accepted() {
        let raw = json!({
            "apiVersion": "v1",
            "kind": "List",
            "metadata": {"resourceVersion": ""},
            "items": [node_json("tools-k8s-worker-1", "True")]
        })
        .to_string();
        let list: ObjectList<Node> = parse_json("kubectl", &raw).unwrap();
        assert_eq!(list.items[0].name(), "tools-k8s-worker-1");

        let wrong_kind = json!({"metadata": {"name": "x"}, "kind": "Pod"});
        assert!(serde_json::from_value::<Node>(wrong_kind).is_err());
    }
}
