//! Node lifecycle state machine and the naming rules around node removal.
//!
//! A node goes `Schedulable -> Cordoned -> Draining -> Empty`, then something
//! outside the cluster happens to it (a reboot, or the VM is removed) and it
//! either comes back through `Rejoining -> Ready` or ends as `Removed`.
//! Nothing is rolled back on failure; callers pick the recovery path.

use std::fmt;

use tracing::{info, warn};

use super::KubernetesError;
use crate::inventory::{natural_sort_key, NodeRole};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeLifecycleState {
    Schedulable,
    Cordoned,
    Draining,
    Empty,
    Removed,
    Rejoining,
    Ready,
}

impl NodeLifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeLifecycleState::Schedulable => "schedulable",
            NodeLifecycleState::Cordoned => "cordoned",
            NodeLifecycleState::Draining => "draining",
            NodeLifecycleState::Empty => "empty",
            NodeLifecycleState::Removed => "removed",
            NodeLifecycleState::Rejoining => "rejoining",
            NodeLifecycleState::Ready => "ready",
        }
    }

    pub fn can_transition_to(&self, next: NodeLifecycleState) -> bool {
        use NodeLifecycleState::*;
        matches!(
            (self, next),
            (Schedulable, Cordoned)
                | (Ready, Cordoned)
                | (Cordoned, Draining)
                | (Draining, Empty)
                | (Empty, Rejoining)
                | (Empty, Removed)
                | (Rejoining, Ready)
        )
    }
}

impl fmt::Display for NodeLifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Steps of a node reboot, reported as they start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebootPhase {
    Drain,
    WaitDrain,
    Reboot,
    Uncordon,
    WaitReady,
    Done,
}

impl fmt::Display for RebootPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RebootPhase::Drain => "drain",
            RebootPhase::WaitDrain => "wait_drain",
            RebootPhase::Reboot => "reboot",
            RebootPhase::Uncordon => "uncordon",
            RebootPhase::WaitReady => "wait_ready",
            RebootPhase::Done => "done",
        };
        f.write_str(s)
    }
}

/// Tracks where a single node is in its lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeLifecycle {
    node: String,
    state: NodeLifecycleState,
}

impl NodeLifecycle {
    /// A node currently taking workloads.
    pub fn schedulable(node: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            state: NodeLifecycleState::Schedulable,
        }
    }

    /// A node being added to the cluster for the first time.
    pub fn joining(node: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            state: NodeLifecycleState::Rejoining,
        }
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    pub fn state(&self) -> NodeLifecycleState {
        self.state
    }

    pub fn transition(&mut self, next: NodeLifecycleState) -> Result<(), KubernetesError> {
        if !self.state.can_transition_to(next) {
            return Err(KubernetesError::InvalidTransition {
                node: self.node.clone(),
                from: self.state,
                to: next,
            });
        }
        info!(node = %self.node, "{} -> {}", self.state, next);
        self.state = next;
        Ok(())
    }

    /// After an out of band recovery (e.g. a hard reboot) the node is
    /// expected to rejoin, whatever state it was left in.
    pub fn force_rejoin(&mut self) {
        warn!(node = %self.node, "forcing {} -> rejoining", self.state);
        self.state = NodeLifecycleState::Rejoining;
    }
}

/// Checks `hostname` follows the naming of `role` nodes in `project`.
pub fn validate_node_prefix(hostname: &str, role: NodeRole, project: &str) -> Result<(), KubernetesError> {
    let Some(prefix) = role.name_prefix(project) else {
        return Ok(());
    };
    if hostname.starts_with(&prefix) {
        return Ok(());
    }
    Err(KubernetesError::UnexpectedPrefix {
        hostname: hostname.to_string(),
        prefix,
        role: role.to_string(),
    })
}

/// The oldest node (lowest index, naturally sorted) among those named with
/// `prefix`.
pub fn pick_oldest_node<'a, I>(hostnames: I, prefix: &str) -> Result<&'a str, KubernetesError>
where
    I: IntoIterator<Item = &'a str>,
{
    hostnames
        .into_iter()
        .filter(|name| name.starts_with(prefix))
        .min_by_key(|name| natural_sort_key(name))
        .ok_or_else(|| KubernetesError::NoNodesWithPrefix(prefix.to_string()))
}
