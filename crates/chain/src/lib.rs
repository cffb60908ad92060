//! The append-only ledger: canonical head tracking, block validation by
//! replay, genesis construction, and the time-delayed transaction queue.
//!
//! There is no fork choice and no orphan buffering: a block either extends
//! the current head exactly or it is rejected.

pub mod genesis;
pub mod service;
pub mod store;

pub use genesis::GenesisAlloc;
pub use service::{ChainService, LocatorRecord, PendingOutcome};
pub use store::{ChainStore, MemoryChainStore, SledChainStore};

use lipchain_state::{apply_transaction, ApplyError, State, StateError};
use lipchain_trie::{MemoryNodeStore, NodeStore, SecureTrie, TrieError};
use lipchain_types::{Address, Block, BlockHeader, ChainConfig, Hash32, Transaction};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::info;

/// Ledger errors.
#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    #[error("block parent {got} does not extend head {expected}")]
    ParentMismatch { expected: String, got: String },
    #[error("block number {got}, expected {expected}")]
    NumberMismatch { expected: u64, got: u64 },
    #[error("block timestamp {block} precedes parent timestamp {parent}")]
    TimestampRegression { parent: u64, block: u64 },
    #[error("transaction root does not match the block's transaction list")]
    TxRootMismatch,
    #[error("state root does not match replay of the block's transactions")]
    StateRootMismatch,
    #[error("transaction already pending or committed")]
    DuplicateTransaction,
    #[error("block not found")]
    BlockNotFound,
    #[error("stored hash has {0} bytes, expected 32")]
    CorruptHash(usize),
    #[error(transparent)]
    InvalidTransaction(#[from] ApplyError),
    #[error(transparent)]
    State(#[from] StateError),
    #[error(transparent)]
    Trie(#[from] TrieError),
    #[error("encoding error: {0}")]
    Encoding(#[from] bincode::Error),
    #[error("database error: {0}")]
    Database(#[from] sled::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Compute the transaction root: an ephemeral trie keyed by transaction
/// index. Bit-reproducible for a given ordered list.
pub fn transaction_root(transactions: &[Transaction]) -> Result<Hash32, ChainError> {
    let mut trie = SecureTrie::new(Arc::new(MemoryNodeStore::new()));
    for (index, tx) in transactions.iter().enumerate() {
        let key = (index as u64).to_be_bytes();
        trie.update(&key, bincode::serialize(tx)?)?;
    }
    Ok(trie.root_hash())
}

/// The canonical chain: committed blocks, the head pointer, the canonical
/// state, and the deferred-transaction queue.
pub struct Chain {
    store: Arc<dyn ChainStore>,
    nodes: Arc<dyn NodeStore>,
    state: State,
    head: Block,
    config: ChainConfig,
    /// Transactions whose effective time has not yet arrived, keyed by
    /// (effective time, hash) so promotion order is deterministic.
    time_queue: BTreeMap<(u64, Hash32), Transaction>,
    queued: HashSet<Hash32>,
}

impl Chain {
    /// Open the chain, constructing genesis from the seed allocations when
    /// the store is empty, or reopening at the persisted head otherwise.
    pub fn new(
        store: Arc<dyn ChainStore>,
        nodes: Arc<dyn NodeStore>,
        config: ChainConfig,
        genesis: &[GenesisAlloc],
    ) -> Result<Self, ChainError> {
        let (head, state) = match store.head_hash()? {
            Some(head_hash) => {
                let head = store
                    .block_by_hash(&head_hash)?
                    .ok_or(ChainError::BlockNotFound)?;
                let state = State::at_root(
                    Arc::clone(&nodes),
                    head.header.state_root,
                    config.clone(),
                );
                (head, state)
            }
            None => {
                let (head, state) =
                    Self::build_genesis(&*store, Arc::clone(&nodes), &config, genesis)?;
                (head, state)
            }
        };

        Ok(Chain {
            store,
            nodes,
            state,
            head,
            config,
            time_queue: BTreeMap::new(),
            queued: HashSet::new(),
        })
    }

    fn build_genesis(
        store: &dyn ChainStore,
        nodes: Arc<dyn NodeStore>,
        config: &ChainConfig,
        genesis: &[GenesisAlloc],
    ) -> Result<(Block, State), ChainError> {
        let mut state = State::new(Arc::clone(&nodes), config.clone());
        for alloc in genesis {
            let mut balance = state.get_balance(alloc.address)?;
            for range in &alloc.ranges {
                balance.add_own(*range);
            }
            balance.map_server = alloc.map_server;
            balance.locator = alloc.locator;
            state.set_balance(alloc.address, balance)?;
        }
        let state_root = state.commit()?;

        let header = BlockHeader {
            prevhash: [0u8; 32],
            number: 0,
            timestamp: config.genesis_timestamp,
            coinbase: Address::NULL,
            tx_root: transaction_root(&[])?,
            state_root,
            signature: Vec::new(),
        };
        let block = Block::new(header, Vec::new());
        store.store_block(&block)?;
        store.set_head(block.hash())?;
        info!(hash = %hex::encode(block.hash()), "genesis block created");
        Ok((block, state))
    }

    pub fn head(&self) -> &Block {
        &self.head
    }

    pub fn head_hash(&self) -> Hash32 {
        self.head.hash()
    }

    pub fn config(&self) -> &ChainConfig {
        &self.config
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut State {
        &mut self.state
    }

    pub fn node_store(&self) -> Arc<dyn NodeStore> {
        Arc::clone(&self.nodes)
    }

    /// Validate and append a block extending the current head.
    ///
    /// The block's transaction list is replayed against the head's
    /// committed state; both roots in the header must reproduce exactly.
    /// On any failure the block is rejected and the head is unchanged —
    /// invalid-parent blocks are not buffered.
    pub fn add_block(&mut self, block: &Block) -> Result<(), ChainError> {
        let head_hash = self.head.hash();
        if block.header.prevhash != head_hash {
            return Err(ChainError::ParentMismatch {
                expected: hex::encode(head_hash),
                got: hex::encode(block.header.prevhash),
            });
        }
        if block.header.number != self.head.number() + 1 {
            return Err(ChainError::NumberMismatch {
                expected: self.head.number() + 1,
                got: block.header.number,
            });
        }
        if block.header.timestamp < self.head.header.timestamp {
            return Err(ChainError::TimestampRegression {
                parent: self.head.header.timestamp,
                block: block.header.timestamp,
            });
        }
        if transaction_root(&block.transactions)? != block.header.tx_root {
            return Err(ChainError::TxRootMismatch);
        }

        let mut scratch = self.state.scratch();
        for tx in &block.transactions {
            apply_transaction(&mut scratch, tx)?;
        }
        let new_root = scratch.commit()?;
        if new_root != block.header.state_root {
            return Err(ChainError::StateRootMismatch);
        }

        self.store.store_block(block)?;
        self.store.set_head(block.hash())?;
        self.state = State::at_root(Arc::clone(&self.nodes), new_root, self.config.clone());
        self.head = block.clone();
        info!(
            number = block.number(),
            hash = %hex::encode(block.hash()),
            txs = block.transactions.len(),
            "block accepted"
        );
        Ok(())
    }

    pub fn get_block(&self, hash: &Hash32) -> Result<Option<Block>, ChainError> {
        self.store.block_by_hash(hash)
    }

    pub fn get_block_by_number(&self, number: u64) -> Result<Option<Block>, ChainError> {
        self.store.block_by_number(number)
    }

    /// Look up a committed transaction by hash.
    pub fn get_transaction(&self, tx_hash: &Hash32) -> Result<Option<Transaction>, ChainError> {
        let Some(block_hash) = self.store.block_of_transaction(tx_hash)? else {
            return Ok(None);
        };
        let Some(block) = self.store.block_by_hash(&block_hash)? else {
            return Ok(None);
        };
        Ok(block
            .transactions
            .into_iter()
            .find(|tx| tx.hash() == *tx_hash))
    }

    pub fn transaction_committed(&self, tx_hash: &Hash32) -> Result<bool, ChainError> {
        Ok(self.store.block_of_transaction(tx_hash)?.is_some())
    }

    /// Park a transaction until its effective time arrives. Queuing the
    /// same transaction twice is a no-op.
    pub fn defer_transaction(&mut self, tx: Transaction) {
        let hash = tx.hash();
        if self.queued.insert(hash) {
            self.time_queue.insert((tx.timestamp, hash), tx);
        }
    }

    /// Promote every deferred transaction whose effective time has
    /// arrived. Each transaction is promoted exactly once; calling this
    /// repeatedly is safe.
    pub fn process_time_queue(&mut self, now: u64) -> Vec<Transaction> {
        let still_deferred = self.time_queue.split_off(&(now + 1, [0u8; 32]));
        let matured = std::mem::replace(&mut self.time_queue, still_deferred);
        matured
            .into_values()
            .inspect(|tx| {
                self.queued.remove(&tx.hash());
            })
            .collect()
    }

    pub fn deferred_len(&self) -> usize {
        self.time_queue.len()
    }
}
