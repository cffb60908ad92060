use crate::Hash32;
use serde::{Deserialize, Serialize};

/// A trie node. Nodes are immutable; every mutation produces fresh nodes
/// along the path from the change to the root.
///
/// Paths are nibble sequences (values 0–15) taken from the blake3 digest of
/// the logical key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Node {
    /// Terminal node: remaining path plus the stored value.
    Leaf {
        path: Vec<u8>,
        #[serde(with = "serde_bytes")]
        value: Vec<u8>,
    },
    /// Shared-prefix shortcut pointing at a single child.
    Extension { path: Vec<u8>, child: Hash32 },
    /// Sixteen-way fan-out, plus a value for a key terminating here.
    Branch {
        children: [Option<Hash32>; 16],
        value: Option<Vec<u8>>,
    },
}
