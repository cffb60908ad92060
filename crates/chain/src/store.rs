use crate::ChainError;
use lipchain_types::{Block, Hash32};
use parking_lot::RwLock;
use std::collections::HashMap;

/// Persistence boundary for committed blocks: bodies by hash, a height
/// index, a transaction-to-block index, and the head pointer. No other
/// schema is assumed.
pub trait ChainStore: Send + Sync {
    fn store_block(&self, block: &Block) -> Result<(), ChainError>;
    fn block_by_hash(&self, hash: &Hash32) -> Result<Option<Block>, ChainError>;
    fn block_by_number(&self, number: u64) -> Result<Option<Block>, ChainError>;
    /// The block hash a transaction was committed in, if any.
    fn block_of_transaction(&self, tx_hash: &Hash32) -> Result<Option<Hash32>, ChainError>;
    fn head_hash(&self) -> Result<Option<Hash32>, ChainError>;
    fn set_head(&self, hash: Hash32) -> Result<(), ChainError>;
}

/// Sled-backed chain store.
pub struct SledChainStore {
    blocks: sled::Tree,
    heights: sled::Tree,
    tx_index: sled::Tree,
    metadata: sled::Tree,
}

impl SledChainStore {
    pub fn open(db: &sled::Db) -> Result<Self, ChainError> {
        Ok(SledChainStore {
            blocks: db.open_tree("blocks")?,
            heights: db.open_tree("heights")?,
            tx_index: db.open_tree("tx_index")?,
            metadata: db.open_tree("metadata")?,
        })
    }
}

/// A stored value that should be a block or transaction hash. Anything but
/// exactly 32 bytes means the tree is corrupt.
fn stored_hash(value: &[u8]) -> Result<Hash32, ChainError> {
    value
        .try_into()
        .map_err(|_| ChainError::CorruptHash(value.len()))
}

impl ChainStore for SledChainStore {
    fn store_block(&self, block: &Block) -> Result<(), ChainError> {
        let hash = block.hash();
        self.blocks.insert(&hash[..], serde_json::to_vec(block)?)?;
        self.heights
            .insert(block.number().to_be_bytes(), &hash[..])?;
        for tx in &block.transactions {
            self.tx_index.insert(&tx.hash()[..], &hash[..])?;
        }
        Ok(())
    }

    fn block_by_hash(&self, hash: &Hash32) -> Result<Option<Block>, ChainError> {
        self.blocks
            .get(&hash[..])?
            .map(|v| serde_json::from_slice(&v))
            .transpose()
            .map_err(Into::into)
    }

    fn block_by_number(&self, number: u64) -> Result<Option<Block>, ChainError> {
        match self.heights.get(number.to_be_bytes())? {
            Some(hash) => self.block_by_hash(&stored_hash(&hash)?),
            None => Ok(None),
        }
    }

    fn block_of_transaction(&self, tx_hash: &Hash32) -> Result<Option<Hash32>, ChainError> {
        match self.tx_index.get(&tx_hash[..])? {
            Some(value) => Ok(Some(stored_hash(&value)?)),
            None => Ok(None),
        }
    }

    fn head_hash(&self) -> Result<Option<Hash32>, ChainError> {
        match self.metadata.get(b"head")? {
            Some(value) => Ok(Some(stored_hash(&value)?)),
            None => Ok(None),
        }
    }

    fn set_head(&self, hash: Hash32) -> Result<(), ChainError> {
        self.metadata.insert(b"head", &hash[..])?;
        Ok(())
    }
}

/// In-memory chain store for tests and ephemeral nodes.
#[derive(Default)]
pub struct MemoryChainStore {
    blocks: RwLock<HashMap<Hash32, Block>>,
    heights: RwLock<HashMap<u64, Hash32>>,
    tx_index: RwLock<HashMap<Hash32, Hash32>>,
    head: RwLock<Option<Hash32>>,
}

impl MemoryChainStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ChainStore for MemoryChainStore {
    fn store_block(&self, block: &Block) -> Result<(), ChainError> {
        let hash = block.hash();
        self.heights.write().insert(block.number(), hash);
        let mut tx_index = self.tx_index.write();
        for tx in &block.transactions {
            tx_index.insert(tx.hash(), hash);
        }
        drop(tx_index);
        self.blocks.write().insert(hash, block.clone());
        Ok(())
    }

    fn block_by_hash(&self, hash: &Hash32) -> Result<Option<Block>, ChainError> {
        Ok(self.blocks.read().get(hash).cloned())
    }

    fn block_by_number(&self, number: u64) -> Result<Option<Block>, ChainError> {
        match self.heights.read().get(&number) {
            Some(hash) => self.block_by_hash(hash),
            None => Ok(None),
        }
    }

    fn block_of_transaction(&self, tx_hash: &Hash32) -> Result<Option<Hash32>, ChainError> {
        Ok(self.tx_index.read().get(tx_hash).copied())
    }

    fn head_hash(&self) -> Result<Option<Hash32>, ChainError> {
        Ok(*self.head.read())
    }

    fn set_head(&self, hash: Hash32) -> Result<(), ChainError> {
        *self.head.write() = Some(hash);
        Ok(())
    }
}
