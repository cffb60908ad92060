//! The mutable working view of all accounts at a point in the chain.
//!
//! `State` wraps the secure trie with a dirty-account cache and an undo
//! journal. Reads before commit see the cache overlay; the trie root only
//! ever advances through [`State::commit`]. Any prefix of mutations can be
//! discarded by replaying the journal in reverse, which is what makes
//! rejected transactions side-effect-free.

pub mod apply;

pub use apply::{apply_transaction, validate_transaction, ApplyError};

use lipchain_trie::{NodeStore, SecureTrie, TrieError};
use lipchain_types::{Account, Address, ChainConfig, Hash32, IpBalance};
use std::collections::HashMap;
use std::sync::Arc;

/// State errors.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("trie error: {0}")]
    Trie(#[from] TrieError),
    #[error("account encoding error: {0}")]
    Encoding(#[from] bincode::Error),
}

/// One undo record: the previous value of a single account field.
///
/// An explicit log rather than closures, so entries can be inspected and
/// replayed in reverse without capturing live references.
#[derive(Debug, Clone)]
pub enum JournalEntry {
    Nonce { address: Address, prev: u64 },
    Balance { address: Address, prev: IpBalance },
    Code { address: Address, prev: Vec<u8> },
    Touched { address: Address, prev: bool },
    Deleted { address: Address, prev: bool },
}

/// Opaque marker for a point in the canonical state's history: the trie
/// root at the last commit. Everything needed to branch a scratch state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateSnapshot {
    pub root: Hash32,
}

/// The working view over the account trie.
pub struct State {
    trie: SecureTrie,
    cache: HashMap<Address, Account>,
    journal: Vec<JournalEntry>,
    config: ChainConfig,
}

impl State {
    /// A state over an empty trie.
    pub fn new(store: Arc<dyn NodeStore>, config: ChainConfig) -> Self {
        State {
            trie: SecureTrie::new(store),
            cache: HashMap::new(),
            journal: Vec::new(),
            config,
        }
    }

    /// Reopen a state at a committed root.
    pub fn at_root(store: Arc<dyn NodeStore>, root: Hash32, config: ChainConfig) -> Self {
        State {
            trie: SecureTrie::at_root(store, root),
            cache: HashMap::new(),
            journal: Vec::new(),
            config,
        }
    }

    /// The committed trie root. Unaffected by uncommitted cache mutations.
    pub fn root(&self) -> Hash32 {
        self.trie.root_hash()
    }

    pub fn config(&self) -> &ChainConfig {
        &self.config
    }

    /// Capture the committed root for branching a scratch state.
    pub fn to_snapshot(&self) -> StateSnapshot {
        StateSnapshot { root: self.root() }
    }

    /// Branch a disposable copy-on-write state from a snapshot. The scratch
    /// state shares the node store; its writes never disturb the canonical
    /// roots.
    pub fn from_snapshot(snapshot: StateSnapshot, store: Arc<dyn NodeStore>, config: ChainConfig) -> Self {
        State::at_root(store, snapshot.root, config)
    }

    /// Branch a scratch state sharing this state's store, rooted at the
    /// last committed root.
    pub fn scratch(&self) -> Self {
        State::at_root(self.trie.store(), self.root(), self.config.clone())
    }

    /// Materialize an account into the cache, lazily reading the trie on
    /// first access per state instance.
    fn ensure_cached(&mut self, address: Address) -> Result<(), StateError> {
        if self.cache.contains_key(&address) {
            return Ok(());
        }
        let account = match self.trie.get(address.as_bytes())? {
            Some(bytes) => Account::decode(address, &bytes)?,
            None => Account::blank(address, self.config.initial_nonce),
        };
        self.cache.insert(address, account);
        Ok(())
    }

    /// A copy of the account record as currently visible (cache overlay
    /// over the trie).
    pub fn get_account(&mut self, address: Address) -> Result<Account, StateError> {
        self.ensure_cached(address)?;
        Ok(self.cache[&address].clone())
    }

    pub fn get_nonce(&mut self, address: Address) -> Result<u64, StateError> {
        self.ensure_cached(address)?;
        Ok(self.cache[&address].nonce)
    }

    pub fn get_balance(&mut self, address: Address) -> Result<IpBalance, StateError> {
        self.ensure_cached(address)?;
        Ok(self.cache[&address].balance.clone())
    }

    pub fn get_code(&mut self, address: Address) -> Result<Vec<u8>, StateError> {
        self.ensure_cached(address)?;
        Ok(self.cache[&address].code.clone())
    }

    /// Whether the account exists from the ledger's point of view: deleted
    /// accounts are gone unless re-touched; untouched accounts exist only
    /// if they were present in the trie at first access.
    pub fn account_exists(&mut self, address: Address) -> Result<bool, StateError> {
        self.ensure_cached(address)?;
        let account = &self.cache[&address];
        if account.deleted && !account.touched {
            return Ok(false);
        }
        if account.touched {
            return Ok(true);
        }
        Ok(account.existent_at_start)
    }

    pub fn set_nonce(&mut self, address: Address, nonce: u64) -> Result<(), StateError> {
        self.ensure_cached(address)?;
        let account = self.cache.get_mut(&address).expect("just cached");
        self.journal.push(JournalEntry::Nonce {
            address,
            prev: account.nonce,
        });
        account.nonce = nonce;
        Self::mark_touched(&mut self.journal, account, address);
        Ok(())
    }

    pub fn increment_nonce(&mut self, address: Address) -> Result<(), StateError> {
        let nonce = self.get_nonce(address)?;
        self.set_nonce(address, nonce + 1)
    }

    pub fn set_balance(&mut self, address: Address, balance: IpBalance) -> Result<(), StateError> {
        self.ensure_cached(address)?;
        let account = self.cache.get_mut(&address).expect("just cached");
        self.journal.push(JournalEntry::Balance {
            address,
            prev: account.balance.clone(),
        });
        account.balance = balance;
        Self::mark_touched(&mut self.journal, account, address);
        Ok(())
    }

    pub fn set_code(&mut self, address: Address, code: Vec<u8>) -> Result<(), StateError> {
        self.ensure_cached(address)?;
        let account = self.cache.get_mut(&address).expect("just cached");
        self.journal.push(JournalEntry::Code {
            address,
            prev: std::mem::take(&mut account.code),
        });
        account.code = code;
        Self::mark_touched(&mut self.journal, account, address);
        Ok(())
    }

    /// Mark an account for removal at the next commit.
    pub fn delete_account(&mut self, address: Address) -> Result<(), StateError> {
        self.ensure_cached(address)?;
        let account = self.cache.get_mut(&address).expect("just cached");
        self.journal.push(JournalEntry::Deleted {
            address,
            prev: account.deleted,
        });
        account.deleted = true;
        Ok(())
    }

    fn mark_touched(journal: &mut Vec<JournalEntry>, account: &mut Account, address: Address) {
        journal.push(JournalEntry::Touched {
            address,
            prev: account.touched,
        });
        account.touched = true;
    }

    /// A position in the journal, for later rollback.
    pub fn checkpoint(&self) -> usize {
        self.journal.len()
    }

    /// Undo every mutation made after `checkpoint` by replaying the journal
    /// in reverse. Never touches the trie.
    pub fn revert_to(&mut self, checkpoint: usize) {
        while self.journal.len() > checkpoint {
            let entry = self.journal.pop().expect("length checked");
            match entry {
                JournalEntry::Nonce { address, prev } => {
                    if let Some(account) = self.cache.get_mut(&address) {
                        account.nonce = prev;
                    }
                }
                JournalEntry::Balance { address, prev } => {
                    if let Some(account) = self.cache.get_mut(&address) {
                        account.balance = prev;
                    }
                }
                JournalEntry::Code { address, prev } => {
                    if let Some(account) = self.cache.get_mut(&address) {
                        account.code = prev;
                    }
                }
                JournalEntry::Touched { address, prev } => {
                    if let Some(account) = self.cache.get_mut(&address) {
                        account.touched = prev;
                    }
                }
                JournalEntry::Deleted { address, prev } => {
                    if let Some(account) = self.cache.get_mut(&address) {
                        account.deleted = prev;
                    }
                }
            }
        }
    }

    /// Write every touched-or-deleted account into the trie, advance the
    /// root, and drop the cache and journal.
    ///
    /// Accounts that were only read are never rewritten, so committing
    /// twice without intervening mutation yields the same root.
    pub fn commit(&mut self) -> Result<Hash32, StateError> {
        let mut dirty: Vec<Address> = self
            .cache
            .iter()
            .filter(|(_, account)| account.touched || account.deleted)
            .map(|(address, _)| *address)
            .collect();
        dirty.sort();

        for address in dirty {
            let exists = self.account_exists(address)?;
            let account = &self.cache[&address];
            if exists {
                let encoded = account.encode();
                self.trie.update(address.as_bytes(), encoded)?;
            } else {
                self.trie.delete(address.as_bytes())?;
            }
        }

        self.cache.clear();
        self.journal.clear();
        Ok(self.root())
    }

    /// Decode every account currently committed in the trie. Used to derive
    /// the IP-ownership distribution for signer rotation.
    pub fn all_accounts(&self) -> Result<Vec<Account>, StateError> {
        let mut accounts = Vec::new();
        for bytes in self.trie.values()? {
            let account: Account = bincode::deserialize(&bytes)?;
            accounts.push(account);
        }
        accounts.sort_by_key(|a| a.address);
        Ok(accounts)
    }
}
