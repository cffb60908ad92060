//! Orchestration of the ledger and the state machine: pending-pool
//! management, candidate block construction, and IP-ownership queries.

use crate::{transaction_root, Chain, ChainError};
use lipchain_state::apply_transaction;
use lipchain_types::{Address, Block, BlockHeader, Hash32, IpRange, Transaction};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::Ipv4Addr;
use tracing::debug;

/// What happened to a submitted transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingOutcome {
    /// Validated and waiting for inclusion in a block.
    Queued,
    /// Stamped with a future effective time; parked in the time queue.
    Deferred,
}

/// Answer to a locator query: who owns the covering range and where their
/// LISP map-server and locator live.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocatorRecord {
    pub owner: Address,
    pub range: IpRange,
    pub map_server: Option<Ipv4Addr>,
    pub locator: Option<Ipv4Addr>,
}

/// Manages the chain and requests to it.
pub struct ChainService {
    chain: Chain,
    pending: Vec<Transaction>,
    pending_hashes: HashSet<Hash32>,
}

impl ChainService {
    pub fn new(chain: Chain) -> Self {
        ChainService {
            chain,
            pending: Vec::new(),
            pending_hashes: HashSet::new(),
        }
    }

    pub fn chain(&self) -> &Chain {
        &self.chain
    }

    pub fn head(&self) -> &Block {
        self.chain.head()
    }

    /// Validate and queue a transaction for inclusion.
    ///
    /// Validation runs the applier against a throwaway scratch state that
    /// has the current pending list replayed on top of the head, so a
    /// sender can queue consecutive nonces. Canonical state is never
    /// touched. Duplicates of pending or committed transactions are
    /// rejected; future-dated transactions are parked in the time queue.
    pub fn add_pending_transaction(
        &mut self,
        tx: Transaction,
        now: u64,
    ) -> Result<PendingOutcome, ChainError> {
        let hash = tx.hash();
        if self.pending_hashes.contains(&hash) || self.chain.transaction_committed(&hash)? {
            return Err(ChainError::DuplicateTransaction);
        }

        if tx.timestamp > now {
            self.chain.defer_transaction(tx);
            return Ok(PendingOutcome::Deferred);
        }

        let mut scratch = self.chain.state().scratch();
        for queued in &self.pending {
            // first-valid-wins ordering: failures here are not this
            // transaction's problem
            let _ = apply_transaction(&mut scratch, queued);
        }
        apply_transaction(&mut scratch, &tx)?;

        self.pending_hashes.insert(hash);
        self.pending.push(tx);
        Ok(PendingOutcome::Queued)
    }

    /// Promote matured deferred transactions into the pending pool.
    pub fn process_time_queue(&mut self, now: u64) {
        for tx in self.chain.process_time_queue(now) {
            let hash = tx.hash();
            match self.add_pending_transaction(tx, now) {
                Ok(_) => debug!(hash = %hex::encode(hash), "deferred transaction promoted"),
                Err(err) => {
                    debug!(hash = %hex::encode(hash), error = %err, "deferred transaction dropped")
                }
            }
        }
    }

    /// Build a candidate block from the pending pool.
    ///
    /// The pending list is replayed in arrival order against a scratch
    /// state branched from the head; transactions that fail to apply are
    /// dropped from the candidate, not retried. The pending pool itself is
    /// left intact — it is only pruned once a block is accepted, so an
    /// unsigned or rejected candidate loses nothing.
    pub fn create_block(&mut self, coinbase: Address, timestamp: u64) -> Result<Block, ChainError> {
        self.process_time_queue(timestamp);

        let mut scratch = self.chain.state().scratch();
        let mut included = Vec::with_capacity(self.pending.len());
        for tx in &self.pending {
            match apply_transaction(&mut scratch, tx) {
                Ok(()) => included.push(tx.clone()),
                Err(err) => {
                    debug!(hash = %hex::encode(tx.hash()), error = %err, "transaction excluded from candidate")
                }
            }
        }
        let state_root = scratch.commit()?;
        let tx_root = transaction_root(&included)?;

        let header = BlockHeader {
            prevhash: self.chain.head_hash(),
            number: self.chain.head().number() + 1,
            timestamp: timestamp.max(self.chain.head().header.timestamp),
            coinbase,
            tx_root,
            state_root,
            signature: Vec::new(),
        };
        Ok(Block::new(header, included))
    }

    /// Append an accepted block and prune its transactions from the
    /// pending pool.
    pub fn add_block(&mut self, block: &Block) -> Result<(), ChainError> {
        self.chain.add_block(block)?;
        for tx in &block.transactions {
            let hash = tx.hash();
            if self.pending_hashes.remove(&hash) {
                self.pending.retain(|pending| pending.hash() != hash);
            }
        }
        Ok(())
    }

    pub fn get_pending_transactions(&self) -> &[Transaction] {
        &self.pending
    }

    pub fn get_transaction(&self, hash: &Hash32) -> Result<Option<Transaction>, ChainError> {
        self.chain.get_transaction(hash)
    }

    pub fn get_block(&self, hash: &Hash32) -> Result<Option<Block>, ChainError> {
        self.chain.get_block(hash)
    }

    pub fn get_block_by_number(&self, number: u64) -> Result<Option<Block>, ChainError> {
        self.chain.get_block_by_number(number)
    }

    pub fn get_own_ips(&mut self, address: Address) -> Result<Vec<IpRange>, ChainError> {
        Ok(self.chain.state_mut().get_balance(address)?.own_ips)
    }

    pub fn get_delegated_ips(&mut self, address: Address) -> Result<Vec<IpRange>, ChainError> {
        Ok(self.chain.state_mut().get_balance(address)?.delegated_ips)
    }

    pub fn get_received_ips(&mut self, address: Address) -> Result<Vec<IpRange>, ChainError> {
        Ok(self.chain.state_mut().get_balance(address)?.received_ips)
    }

    pub fn get_map_server(&mut self, address: Address) -> Result<Option<Ipv4Addr>, ChainError> {
        Ok(self.chain.state_mut().get_balance(address)?.map_server)
    }

    pub fn get_locator(&mut self, address: Address) -> Result<Option<Ipv4Addr>, ChainError> {
        Ok(self.chain.state_mut().get_balance(address)?.locator)
    }

    /// The committed IP-ownership distribution: every account holding at
    /// least one owned address, with its weight. Input to signer rotation.
    pub fn ip_owners(&self) -> Result<Vec<(Address, u64)>, ChainError> {
        let mut owners = Vec::new();
        for account in self.chain.state().all_accounts()? {
            let weight = account.balance.owned_count();
            if weight > 0 {
                owners.push((account.address, weight));
            }
        }
        Ok(owners)
    }

    /// Answer a LISP-style locator query: find the committed owner of the
    /// covering range for `eid` and return its locator record.
    pub fn query_locator(&self, eid: Ipv4Addr) -> Result<Option<LocatorRecord>, ChainError> {
        let addr = u32::from(eid);
        for account in self.chain.state().all_accounts()? {
            if let Some(range) = account.balance.covering_own(addr) {
                return Ok(Some(LocatorRecord {
                    owner: account.address,
                    range: *range,
                    map_server: account.balance.map_server,
                    locator: account.balance.locator,
                }));
            }
        }
        Ok(None)
    }
}
