//! `ceph osd tree -f json`, rebuilt from the flat node list into a tree.

use std::collections::{HashMap, HashSet};
use std::fmt;

use serde::Deserialize;

use crate::output::{parse_json, OutputError};

const TOOL: &str = "ceph osd tree";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BucketType {
    Root,
    Datacenter,
    Rack,
    Host,
    Osd,
    Other(String),
}

impl From<&str> for BucketType {
    fn from(s: &str) -> Self {
        match s {
            "root" => BucketType::Root,
            "datacenter" => BucketType::Datacenter,
            "rack" => BucketType::Rack,
            "host" => BucketType::Host,
            "osd" => BucketType::Osd,
            other => BucketType::Other(other.to_string()),
        }
    }
}

impl fmt::Display for BucketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BucketType::Root => f.write_str("root"),
            BucketType::Datacenter => f.write_str("datacenter"),
            BucketType::Rack => f.write_str("rack"),
            BucketType::Host => f.write_str("host"),
            BucketType::Osd => f.write_str("osd"),
            BucketType::Other(other) => f.write_str(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OsdClass {
    Hdd,
    Ssd,
    Unknown,
}

impl OsdClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            OsdClass::Hdd => "hdd",
            OsdClass::Ssd => "ssd",
            OsdClass::Unknown => "unknown",
        }
    }
}

impl From<&str> for OsdClass {
    fn from(s: &str) -> Self {
        match s {
            "hdd" => OsdClass::Hdd,
            "ssd" => OsdClass::Ssd,
            _ => OsdClass::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OsdStatus {
    Up,
    Down,
    Unknown,
}

impl From<&str> for OsdStatus {
    fn from(s: &str) -> Self {
        match s {
            "up" => OsdStatus::Up,
            "down" => OsdStatus::Down,
            _ => OsdStatus::Unknown,
        }
    }
}

/// OSD specific attributes of a leaf node.
#[derive(Debug, Clone, PartialEq)]
pub struct OsdInfo {
    pub osd_id: u32,
    pub device_class: OsdClass,
    pub status: OsdStatus,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OsdTreeNode {
    pub id: i64,
    pub name: String,
    pub bucket_type: BucketType,
    pub crush_weight: f64,
    pub children: Vec<OsdTreeNode>,
    pub osd: Option<OsdInfo>,
}

impl OsdTreeNode {
    fn collect_by_type<'a>(&'a self, wanted: &BucketType, found: &mut Vec<&'a OsdTreeNode>) {
        if &self.bucket_type == wanted {
            found.push(self);
        }
        for child in &self.children {
            child.collect_by_type(wanted, found);
        }
    }

    /// Ids of the OSDs directly below this node.
    pub fn osd_ids(&self) -> Vec<u32> {
        self.children
            .iter()
            .filter_map(|c| c.osd.as_ref().map(|o| o.osd_id))
            .collect()
    }
}

#[derive(Debug, Clone, Deserialize)]
struct RawNode {
    id: i64,
    name: String,
    #[serde(rename = "type")]
    bucket_type: String,
    crush_weight: Option<f64>,
    children: Option<Vec<i64>>,
    device_class: Option<String>,
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawTree {
    nodes: Vec<RawNode>,
    #[serde(default)]
    stray: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OsdTree {
    pub root: OsdTreeNode,
    /// OSDs not placed in the CRUSH map, kept as returned.
    pub stray: Vec<serde_json::Value>,
}

struct TreeBuilder<'a> {
    by_id: HashMap<i64, &'a RawNode>,
    visiting: HashSet<i64>,
    raw: &'a str,
}

impl<'a> TreeBuilder<'a> {
    fn malformed(&self, reason: String) -> OutputError {
        OutputError::malformed(TOOL, reason, self.raw)
    }

    fn build(&mut self, node: &'a RawNode) -> Result<OsdTreeNode, OutputError> {
        if node.bucket_type == "osd" {
            let osd_id = u32::try_from(node.id)
                .map_err(|_| self.malformed(format!("osd {} has a negative id {}", node.name, node.id)))?;
            return Ok(OsdTreeNode {
                id: node.id,
                name: node.name.clone(),
                bucket_type: BucketType::Osd,
                crush_weight: node.crush_weight.unwrap_or(0.0),
                children: Vec::new(),
                osd: Some(OsdInfo {
                    osd_id,
                    device_class: node.device_class.as_deref().unwrap_or_default().into(),
                    status: node.status.as_deref().unwrap_or_default().into(),
                }),
            });
        }

        let Some(child_ids) = &node.children else {
            return Err(self.malformed(format!("leaf node {} is not an osd", node.name)));
        };
        if !self.visiting.insert(node.id) {
            return Err(self.malformed(format!("cycle through node {}", node.name)));
        }

        let mut children = Vec::with_capacity(child_ids.len());
        for child_id in child_ids {
            let child = *self
                .by_id
                .get(child_id)
                .ok_or_else(|| self.malformed(format!("node {} has unknown child {}", node.name, child_id)))?;
            children.push(self.build(child)?);
        }
        self.visiting.remove(&node.id);

        let crush_weight = node
            .crush_weight
            .unwrap_or_else(|| children.iter().map(|c| c.crush_weight).sum());
        Ok(OsdTreeNode {
            id: node.id,
            name: node.name.clone(),
            bucket_type: node.bucket_type.as_str().into(),
            crush_weight,
            children,
            osd: None,
        })
    }
}

impl OsdTree {
    pub fn parse(raw: &str) -> Result<Self, OutputError> {
        let tree: RawTree = parse_json(TOOL, raw)?;
        let root = tree
            .nodes
            .iter()
            .find(|n| n.bucket_type == "root")
            .ok_or_else(|| OutputError::malformed(TOOL, "no root node", raw))?;

        let mut builder = TreeBuilder {
            by_id: tree.nodes.iter().map(|n| (n.id, n)).collect(),
            visiting: HashSet::new(),
            raw,
        };
        let root = builder.build(root)?;
        Ok(Self {
            root,
            stray: tree.stray,
        })
    }

    /// All nodes of the given type, depth first.
    pub fn nodes_by_type(&self, wanted: &BucketType) -> Vec<&OsdTreeNode> {
        let mut found = Vec::new();
        self.root.collect_by_type(wanted, &mut found);
        found
    }

    pub fn osds(&self) -> Vec<&OsdTreeNode> {
        self.nodes_by_type(&BucketType::Osd)
    }

    pub fn hosts(&self) -> Vec<&OsdTreeNode> {
        self.nodes_by_type(&BucketType::Host)
    }

    pub fn host(&self, name: &str) -> Option<&OsdTreeNode> {
        self.hosts().into_iter().find(|h| h.name == name)
    }

    pub fn osd_weight(&self, osd_id: u32) -> Option<f64> {
        self.osds()
            .into_iter()
            .find(|o| o.osd.as_ref().is_some_and(|info| info.osd_id == osd_id))
            .map(|o| o.crush_weight)
    }
}
