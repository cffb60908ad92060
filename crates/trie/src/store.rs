use crate::{Hash32, TrieError};
use parking_lot::RwLock;
use std::collections::HashMap;

/// Content-addressed node storage. Nodes are keyed by their own hash, so
/// the store is append-only: a put can only ever write identical bytes for
/// an existing key.
pub trait NodeStore: Send + Sync {
    fn get(&self, hash: &Hash32) -> Result<Option<Vec<u8>>, TrieError>;
    fn put(&self, hash: Hash32, bytes: Vec<u8>) -> Result<(), TrieError>;
}

/// In-memory backend, shared freely between trie views.
#[derive(Default)]
pub struct MemoryNodeStore {
    nodes: RwLock<HashMap<Hash32, Vec<u8>>>,
}

impl MemoryNodeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.read().is_empty()
    }
}

impl NodeStore for MemoryNodeStore {
    fn get(&self, hash: &Hash32) -> Result<Option<Vec<u8>>, TrieError> {
        Ok(self.nodes.read().get(hash).cloned())
    }

    fn put(&self, hash: Hash32, bytes: Vec<u8>) -> Result<(), TrieError> {
        self.nodes.write().insert(hash, bytes);
        Ok(())
    }
}

/// Sled-backed node storage for a persistent chain database.
pub struct SledNodeStore {
    tree: sled::Tree,
}

impl SledNodeStore {
    pub fn new(tree: sled::Tree) -> Self {
        SledNodeStore { tree }
    }
}

impl NodeStore for SledNodeStore {
    fn get(&self, hash: &Hash32) -> Result<Option<Vec<u8>>, TrieError> {
        Ok(self.tree.get(hash)?.map(|v| v.to_vec()))
    }

    fn put(&self, hash: Hash32, bytes: Vec<u8>) -> Result<(), TrieError> {
        self.tree.insert(&hash[..], bytes)?;
        Ok(())
    }
}
