//! Key-range partitioning.
//!
//! With `bits = bit_length(total_nodes) - 1`, a key belongs to the node whose
//! id equals the top `bits` bits of the key. The mapping is monotonic in the
//! key, so node `i` owns a key range entirely below node `i + 1`'s and the
//! node outputs concatenate into one sorted sequence.

use crate::NodeId;

/// Stateless key-to-node mapping for a fixed cluster size.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Partitioner {
    total_nodes: usize,
    bits: u32,
}

impl Partitioner {
    /// Creates a partitioner for `total_nodes` nodes. Zero is treated as one.
    pub fn new(total_nodes: usize) -> Self {
        let total_nodes = total_nodes.max(1);
        // bit length minus one, i.e. floor(log2(total_nodes))
        let bits = (usize::BITS - total_nodes.leading_zeros() - 1).min(u64::BITS);
        Partitioner { total_nodes, bits }
    }

    pub fn total_nodes(&self) -> usize {
        self.total_nodes
    }

    /// Number of leading key bits that select the owning node.
    pub fn bits(&self) -> u32 {
        self.bits
    }

    /// Number of nodes that own a non-empty key range, i.e. `2^bits`.
    pub fn owning_nodes(&self) -> usize {
        1usize << self.bits
    }

    /// Returns the node that owns `key`.
    pub fn target(&self, key: &[u8]) -> NodeId {
        if self.bits == 0 || key.is_empty() {
            return 0;
        }
        if self.bits <= 8 {
            return (key[0] >> (8 - self.bits)) as NodeId;
        }

        let mut prefix = [0u8; 8];
        let n = key.len().min(prefix.len());
        prefix[..n].copy_from_slice(&key[..n]);
        (u64::from_be_bytes(prefix) >> (u64::BITS - self.bits)) as NodeId
    }
}
