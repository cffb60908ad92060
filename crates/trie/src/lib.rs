//! Secure Merkle-Patricia trie over a content-addressed node store.
//!
//! Keys are blake3-hashed before path descent, so the root hash never
//! depends on raw key byte patterns or on the order updates are applied
//! within a batch. Nodes are immutable and stored under their own hash,
//! which makes snapshots free: a snapshot is a root hash plus a handle to
//! the shared store, and scratch tries simply append new nodes.

pub mod node;
pub mod store;

pub use node::Node;
pub use store::{MemoryNodeStore, NodeStore, SledNodeStore};

use std::sync::Arc;

/// 32-byte node/root digest.
pub type Hash32 = [u8; 32];

/// Root hash of the empty trie. Never stored; a sentinel.
pub const EMPTY_ROOT: Hash32 = [0u8; 32];

/// Trie errors.
#[derive(Debug, thiserror::Error)]
pub enum TrieError {
    #[error("missing trie node {0}")]
    MissingNode(String),
    #[error("node encoding error: {0}")]
    Encoding(#[from] bincode::Error),
    #[error("database error: {0}")]
    Database(#[from] sled::Error),
}

/// A Merkle-Patricia trie view rooted at a specific hash.
///
/// Cloning is cheap and yields an independent view over the same backing
/// store; mutating one view never disturbs another.
#[derive(Clone)]
pub struct SecureTrie {
    store: Arc<dyn NodeStore>,
    root: Hash32,
}

impl SecureTrie {
    /// An empty trie over the given store.
    pub fn new(store: Arc<dyn NodeStore>) -> Self {
        SecureTrie {
            store,
            root: EMPTY_ROOT,
        }
    }

    /// A trie view rooted at a previously committed root.
    pub fn at_root(store: Arc<dyn NodeStore>, root: Hash32) -> Self {
        SecureTrie { store, root }
    }

    pub fn root_hash(&self) -> Hash32 {
        self.root
    }

    pub fn store(&self) -> Arc<dyn NodeStore> {
        Arc::clone(&self.store)
    }

    /// Look up the value stored under `key`.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, TrieError> {
        if self.root == EMPTY_ROOT {
            return Ok(None);
        }
        let path = secure_path(key);
        let mut offset = 0;
        let mut node = self.load(&self.root)?;
        loop {
            match node {
                Node::Leaf {
                    path: leaf_path,
                    value,
                } => {
                    return Ok(if leaf_path[..] == path[offset..] {
                        Some(value)
                    } else {
                        None
                    });
                }
                Node::Extension {
                    path: ext_path,
                    child,
                } => {
                    if path.len() - offset < ext_path.len()
                        || path[offset..offset + ext_path.len()] != ext_path[..]
                    {
                        return Ok(None);
                    }
                    offset += ext_path.len();
                    node = self.load(&child)?;
                }
                Node::Branch { children, value } => {
                    if offset == path.len() {
                        return Ok(value);
                    }
                    match children[path[offset] as usize] {
                        Some(child) => {
                            offset += 1;
                            node = self.load(&child)?;
                        }
                        None => return Ok(None),
                    }
                }
            }
        }
    }

    /// Insert or overwrite the value under `key`.
    pub fn update(&mut self, key: &[u8], value: Vec<u8>) -> Result<(), TrieError> {
        let path = secure_path(key);
        let new_root = if self.root == EMPTY_ROOT {
            self.store_node(&Node::Leaf { path, value })?
        } else {
            let root_node = self.load(&self.root)?;
            let inserted = self.insert(root_node, &path, value)?;
            self.store_node(&inserted)?
        };
        self.root = new_root;
        Ok(())
    }

    /// Remove `key`. Deleting an absent key is a no-op.
    pub fn delete(&mut self, key: &[u8]) -> Result<(), TrieError> {
        if self.root == EMPTY_ROOT {
            return Ok(());
        }
        let path = secure_path(key);
        let root_node = self.load(&self.root)?;
        self.root = match self.remove(root_node, &path)? {
            Some(node) => self.store_node(&node)?,
            None => EMPTY_ROOT,
        };
        Ok(())
    }

    /// Collect every value stored in the trie. Order follows the hashed key
    /// space and is therefore deterministic for a given root.
    pub fn values(&self) -> Result<Vec<Vec<u8>>, TrieError> {
        let mut out = Vec::new();
        if self.root != EMPTY_ROOT {
            self.collect_values(&self.root, &mut out)?;
        }
        Ok(out)
    }

    fn collect_values(&self, hash: &Hash32, out: &mut Vec<Vec<u8>>) -> Result<(), TrieError> {
        match self.load(hash)? {
            Node::Leaf { value, .. } => out.push(value),
            Node::Extension { child, .. } => self.collect_values(&child, out)?,
            Node::Branch { children, value } => {
                if let Some(value) = value {
                    out.push(value);
                }
                for child in children.iter().flatten() {
                    self.collect_values(child, out)?;
                }
            }
        }
        Ok(())
    }

    fn load(&self, hash: &Hash32) -> Result<Node, TrieError> {
        let bytes = self
            .store
            .get(hash)?
            .ok_or_else(|| TrieError::MissingNode(hex::encode(hash)))?;
        Ok(bincode::deserialize(&bytes)?)
    }

    fn store_node(&self, node: &Node) -> Result<Hash32, TrieError> {
        let bytes = bincode::serialize(node)?;
        let hash = *blake3::hash(&bytes).as_bytes();
        self.store.put(hash, bytes)?;
        Ok(hash)
    }

    fn insert(&self, node: Node, path: &[u8], value: Vec<u8>) -> Result<Node, TrieError> {
        match node {
            Node::Leaf {
                path: leaf_path,
                value: leaf_value,
            } => {
                if leaf_path == path {
                    return Ok(Node::Leaf {
                        path: leaf_path,
                        value,
                    });
                }
                let common = common_prefix(&leaf_path, path);
                let branch = self.two_leaf_branch(
                    &leaf_path[common..],
                    leaf_value,
                    &path[common..],
                    value,
                )?;
                self.wrap_extension(&path[..common], branch)
            }
            Node::Extension {
                path: ext_path,
                child,
            } => {
                let common = common_prefix(&ext_path, path);
                if common == ext_path.len() {
                    let child_node = self.load(&child)?;
                    let new_child = self.insert(child_node, &path[common..], value)?;
                    let child_hash = self.store_node(&new_child)?;
                    return Ok(Node::Extension {
                        path: ext_path,
                        child: child_hash,
                    });
                }
                // Split the extension at the divergence point.
                let mut children: [Option<Hash32>; 16] = Default::default();
                let ext_nibble = ext_path[common] as usize;
                let remainder = &ext_path[common + 1..];
                children[ext_nibble] = Some(if remainder.is_empty() {
                    child
                } else {
                    self.store_node(&Node::Extension {
                        path: remainder.to_vec(),
                        child,
                    })?
                });
                let mut branch_value = None;
                if path.len() == common {
                    branch_value = Some(value);
                } else {
                    let new_nibble = path[common] as usize;
                    let leaf = Node::Leaf {
                        path: path[common + 1..].to_vec(),
                        value,
                    };
                    children[new_nibble] = Some(self.store_node(&leaf)?);
                }
                let branch = Node::Branch {
                    children,
                    value: branch_value,
                };
                self.wrap_extension(&path[..common], branch)
            }
            Node::Branch {
                mut children,
                value: branch_value,
            } => {
                if path.is_empty() {
                    return Ok(Node::Branch {
                        children,
                        value: Some(value),
                    });
                }
                let nibble = path[0] as usize;
                let new_child = match children[nibble] {
                    Some(child_hash) => {
                        let child = self.load(&child_hash)?;
                        self.insert(child, &path[1..], value)?
                    }
                    None => Node::Leaf {
                        path: path[1..].to_vec(),
                        value,
                    },
                };
                children[nibble] = Some(self.store_node(&new_child)?);
                Ok(Node::Branch {
                    children,
                    value: branch_value,
                })
            }
        }
    }

    /// Build a branch holding two divergent suffixes.
    fn two_leaf_branch(
        &self,
        a_path: &[u8],
        a_value: Vec<u8>,
        b_path: &[u8],
        b_value: Vec<u8>,
    ) -> Result<Node, TrieError> {
        let mut children: [Option<Hash32>; 16] = Default::default();
        let mut value = None;
        if a_path.is_empty() {
            value = Some(a_value);
        } else {
            let leaf = Node::Leaf {
                path: a_path[1..].to_vec(),
                value: a_value,
            };
            children[a_path[0] as usize] = Some(self.store_node(&leaf)?);
        }
        if b_path.is_empty() {
            value = Some(b_value);
        } else {
            let leaf = Node::Leaf {
                path: b_path[1..].to_vec(),
                value: b_value,
            };
            children[b_path[0] as usize] = Some(self.store_node(&leaf)?);
        }
        Ok(Node::Branch { children, value })
    }

    fn wrap_extension(&self, prefix: &[u8], node: Node) -> Result<Node, TrieError> {
        if prefix.is_empty() {
            return Ok(node);
        }
        let child = self.store_node(&node)?;
        Ok(Node::Extension {
            path: prefix.to_vec(),
            child,
        })
    }

    /// Remove `path` from the subtree rooted at `node`, returning the
    /// replacement node (or `None` when the subtree becomes empty). The
    /// result is re-canonicalized so a deletion leaves the same structure
    /// as never having inserted the key.
    fn remove(&self, node: Node, path: &[u8]) -> Result<Option<Node>, TrieError> {
        match node {
            Node::Leaf {
                path: leaf_path,
                value,
            } => {
                if leaf_path == path {
                    Ok(None)
                } else {
                    Ok(Some(Node::Leaf {
                        path: leaf_path,
                        value,
                    }))
                }
            }
            Node::Extension {
                path: ext_path,
                child,
            } => {
                if path.len() < ext_path.len() || path[..ext_path.len()] != ext_path[..] {
                    return Ok(Some(Node::Extension {
                        path: ext_path,
                        child,
                    }));
                }
                let child_node = self.load(&child)?;
                match self.remove(child_node, &path[ext_path.len()..])? {
                    None => Ok(None),
                    Some(Node::Leaf {
                        path: mut rest,
                        value,
                    }) => {
                        let mut merged = ext_path;
                        merged.append(&mut rest);
                        Ok(Some(Node::Leaf {
                            path: merged,
                            value,
                        }))
                    }
                    Some(Node::Extension {
                        path: mut rest,
                        child,
                    }) => {
                        let mut merged = ext_path;
                        merged.append(&mut rest);
                        Ok(Some(Node::Extension {
                            path: merged,
                            child,
                        }))
                    }
                    Some(branch) => {
                        let child = self.store_node(&branch)?;
                        Ok(Some(Node::Extension {
                            path: ext_path,
                            child,
                        }))
                    }
                }
            }
            Node::Branch {
                mut children,
                mut value,
            } => {
                if path.is_empty() {
                    value = None;
                } else {
                    let nibble = path[0] as usize;
                    if let Some(child_hash) = children[nibble] {
                        let child = self.load(&child_hash)?;
                        children[nibble] = match self.remove(child, &path[1..])? {
                            Some(replacement) => Some(self.store_node(&replacement)?),
                            None => None,
                        };
                    }
                    // absent key: nothing to do
                }
                self.collapse_branch(children, value)
            }
        }
    }

    /// Re-canonicalize a branch after a deletion underneath it.
    fn collapse_branch(
        &self,
        children: [Option<Hash32>; 16],
        value: Option<Vec<u8>>,
    ) -> Result<Option<Node>, TrieError> {
        let occupied: Vec<usize> = children
            .iter()
            .enumerate()
            .filter_map(|(i, c)| c.map(|_| i))
            .collect();
        match (occupied.len(), value) {
            (0, None) => Ok(None),
            (0, Some(value)) => Ok(Some(Node::Leaf {
                path: Vec::new(),
                value,
            })),
            (1, None) => {
                let nibble = occupied[0];
                let child_hash = children[nibble].expect("occupied slot");
                match self.load(&child_hash)? {
                    Node::Leaf { path, value } => {
                        let mut merged = vec![nibble as u8];
                        merged.extend(path);
                        Ok(Some(Node::Leaf {
                            path: merged,
                            value,
                        }))
                    }
                    Node::Extension { path, child } => {
                        let mut merged = vec![nibble as u8];
                        merged.extend(path);
                        Ok(Some(Node::Extension {
                            path: merged,
                            child,
                        }))
                    }
                    Node::Branch { .. } => Ok(Some(Node::Extension {
                        path: vec![nibble as u8],
                        child: child_hash,
                    })),
                }
            }
            (_, value) => Ok(Some(Node::Branch { children, value })),
        }
    }
}

/// Hash the logical key and expand the digest into a 64-nibble path.
fn secure_path(key: &[u8]) -> Vec<u8> {
    let digest = blake3::hash(key);
    let mut nibbles = Vec::with_capacity(64);
    for byte in digest.as_bytes() {
        nibbles.push(byte >> 4);
        nibbles.push(byte & 0x0F);
    }
    nibbles
}

fn common_prefix(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count()
}
