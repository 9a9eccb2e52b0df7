//! The static cluster description.
//!
//! A topology file lists every node once:
//!
//! ```json
//! {"nodes": [
//!     {"nodeID": 0, "host": "127.0.0.1", "port": 5000},
//!     {"nodeID": 1, "host": "127.0.0.1", "port": 5001}
//! ]}
//! ```
//!
//! Node ids must be exactly `0..N`; the partitioner relies on it.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SortError};
use crate::NodeId;

/// One participant of the cluster.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDescriptor {
    #[serde(rename = "nodeID")]
    pub node_id: NodeId,
    pub host: String,
    pub port: u16,
}

impl NodeDescriptor {
    pub fn new(node_id: NodeId, host: impl ToString, port: u16) -> Self {
        NodeDescriptor {
            node_id,
            host: host.to_string(),
            port,
        }
    }

    /// `host:port`, the address the node listens on.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// The URI peers dial to reach this node.
    pub fn endpoint(&self) -> String {
        format!("http://{}", self.addr())
    }
}

#[derive(Serialize, Deserialize)]
struct TopologyFile {
    nodes: Vec<NodeDescriptor>,
}

/// Validated, id-ordered list of every node in the cluster.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Topology {
    nodes: Vec<NodeDescriptor>,
}

impl Topology {
    /// Validates `nodes` and orders them by id.
    pub fn new(mut nodes: Vec<NodeDescriptor>) -> Result<Self> {
        if nodes.is_empty() {
            return Err(SortError::Config("topology lists no nodes".into()));
        }
        nodes.sort_by_key(|node| node.node_id);
        for (expected, node) in nodes.iter().enumerate() {
            if node.node_id != expected {
                return Err(SortError::Config(format!(
                    "node ids must be contiguous from 0, found {} at position {}",
                    node.node_id, expected
                )));
            }
            if node.host.trim().is_empty() {
                return Err(SortError::Config(format!("node {} has an empty host", node.node_id)));
            }
            if node.port == 0 {
                return Err(SortError::Config(format!("node {} has port 0", node.node_id)));
            }
        }
        Ok(Topology { nodes })
    }

    /// Parses a topology from its JSON text.
    pub fn from_json(text: &str) -> Result<Self> {
        let file: TopologyFile = serde_json::from_str(text)
            .map_err(|err| SortError::Config(format!("invalid topology: {err}")))?;
        Topology::new(file.nodes)
    }

    /// Reads and parses a topology file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|err| {
            SortError::Config(format!("cannot read topology {}: {err}", path.display()))
        })?;
        Topology::from_json(&text)
    }

    /// Renders the topology in its file format.
    pub fn to_json(&self) -> Result<String> {
        let file = TopologyFile {
            nodes: self.nodes.clone(),
        };
        serde_json::to_string_pretty(&file)
            .map_err(|err| SortError::Config(format!("cannot encode topology: {err}")))
    }

    /// A topology of `count` nodes on one host with consecutive ports.
    pub fn local(count: usize, host: &str, base_port: u16) -> Result<Self> {
        let nodes = (0..count)
            .map(|id| {
                u16::try_from(id)
                    .ok()
                    .and_then(|offset| base_port.checked_add(offset))
                    .map(|port| NodeDescriptor::new(id, host, port))
                    .ok_or_else(|| SortError::Config(format!("no port left for node {id}")))
            })
            .collect::<Result<Vec<_>>>()?;
        Topology::new(nodes)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn nodes(&self) -> &[NodeDescriptor] {
        &self.nodes
    }

    /// Looks up a node, failing with a configuration error if it is absent.
    pub fn node(&self, id: NodeId) -> Result<&NodeDescriptor> {
        self.nodes.get(id).ok_or_else(|| {
            SortError::Config(format!(
                "node {} is not in the topology of {} nodes",
                id,
                self.nodes.len()
            ))
        })
    }

    /// Every node except `me`.
    pub fn peers(&self, me: NodeId) -> impl Iterator<Item = &NodeDescriptor> {
        self.nodes.iter().filter(move |node| node.node_id != me)
    }
}

#[cfg(test)]
mod test {
    use rstest::*;

    use super::*;

    #[rstest]
    fn test_parse_unordered_nodes() {
        let topology = Topology::from_json(
            r#"{"nodes": [
                {"nodeID": 1, "host": "10.0.0.2", "port": 5001},
                {"nodeID": 0, "host": "10.0.0.1", "port": 5000}
            ]}"#,
        )
        .unwrap();

        assert_eq!(topology.len(), 2);
        assert_eq!(topology.node(0).unwrap().addr(), "10.0.0.1:5000");
        assert_eq!(topology.node(1).unwrap().endpoint(), "http://10.0.0.2:5001");
        let peers: Vec<_> = topology.peers(0).map(|n| n.node_id).collect();
        assert_eq!(peers, vec![1]);
    }

    #[rstest]
    #[case::empty(r#"{"nodes": []}"#)]
    #[case::gap(r#"{"nodes": [{"nodeID": 0, "host": "a", "port": 1}, {"nodeID": 2, "host": "b", "port": 2}]}"#)]
    #[case::duplicate(r#"{"nodes": [{"nodeID": 0, "host": "a", "port": 1}, {"nodeID": 0, "host": "b", "port": 2}]}"#)]
    #[case::no_host(r#"{"nodes": [{"nodeID": 0, "host": " ", "port": 1}]}"#)]
    #[case::zero_port(r#"{"nodes": [{"nodeID": 0, "host": "a", "port": 0}]}"#)]
    #[case::bad_port(r#"{"nodes": [{"nodeID": 0, "host": "a", "port": 70000}]}"#)]
    #[case::not_json("nodes: []")]
    fn test_invalid_topology(#[case] text: &str) {
        assert!(matches!(Topology::from_json(text), Err(SortError::Config(_))));
    }

    #[rstest]
    fn test_missing_node_is_config_error() {
        let topology = Topology::local(2, "127.0.0.1", 6000).unwrap();
        assert!(matches!(topology.node(5), Err(SortError::Config(_))));
    }

    #[rstest]
    fn test_json_round_trip_through_file() {
        let topology = Topology::local(3, "localhost", 7000).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cluster.json");
        fs::write(&path, topology.to_json().unwrap()).unwrap();

        assert_eq!(Topology::load(&path).unwrap(), topology);
    }

    #[rstest]
    fn test_load_missing_file() {
        assert!(matches!(
            Topology::load("/definitely/not/here.json"),
            Err(SortError::Config(_))
        ));
    }
}
