//! A distributed external sort (globesort).
//!
//! A fixed cluster of nodes jointly sorts a keyed record set that is
//! pre-split across per-node input files. Every node routes its records to
//! the node owning the key range, waits until all peers have finished
//! sending, then sorts and writes its own partition. Concatenating the node
//! outputs in node id order yields the globally sorted data set.
//!
//! The pieces, leaves first:
//!
//! * [`codec`]: the length-prefixed binary record format.
//! * [`partition`]: maps a key to its owning node.
//! * [`topology`]: the static cluster description.
//! * [`barrier`]: the one-shot completion gate.
//! * [`exchange`]: per-destination buffers and the routing loop.
//! * [`transport`]: the gRPC surface, retrying senders and mesh bootstrap.
//! * [`sorter`]: sorting and writing the local partition.
//! * [`node`]: one participant's full run.

pub mod barrier;
pub mod cmd;
pub mod codec;
pub mod error;
pub mod exchange;
pub mod node;
pub mod partition;
pub mod sorter;
pub mod standalone;
pub mod tools;
pub mod topology;
pub mod transport;
pub mod utils;

/// Generated gRPC types for the node service.
#[allow(clippy::all)]
pub mod proto {
    tonic::include_proto!("globesort");
}

pub use codec::{Record, KEY_LEN};
pub use error::{Result, SortError};
pub use node::{Node, NodeOptions, RunSummary};
pub use partition::Partitioner;
pub use topology::{NodeDescriptor, Topology};

/// Identifier of a node within a [`Topology`]; always in `0..N`.
pub type NodeId = usize;
