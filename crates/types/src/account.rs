use crate::{Address, Hash32, IpBalance};
use serde::{Deserialize, Serialize};

/// Per-address ledger record: the leaf data unit committed into the state
/// trie.
///
/// The `touched`/`deleted`/`existent_at_start` flags are bookkeeping for a
/// single commit cycle and are excluded from the canonical encoding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub address: Address,
    pub nonce: u64,
    pub balance: IpBalance,
    pub storage_root: Hash32,
    #[serde(with = "serde_bytes")]
    pub code: Vec<u8>,

    #[serde(skip)]
    pub touched: bool,
    #[serde(skip)]
    pub deleted: bool,
    #[serde(skip)]
    pub existent_at_start: bool,
}

impl Account {
    /// A fresh account that has never been written to the trie.
    pub fn blank(address: Address, initial_nonce: u64) -> Self {
        Account {
            address,
            nonce: initial_nonce,
            balance: IpBalance::default(),
            storage_root: [0u8; 32],
            code: Vec::new(),
            touched: false,
            deleted: false,
            existent_at_start: false,
        }
    }

    /// Canonical byte encoding written into the state trie.
    pub fn encode(&self) -> Vec<u8> {
        bincode::serialize(self).expect("account encoding cannot fail")
    }

    /// Decode a trie value back into an account.
    pub fn decode(address: Address, bytes: &[u8]) -> Result<Self, bincode::Error> {
        let mut account: Account = bincode::deserialize(bytes)?;
        account.address = address;
        account.existent_at_start = true;
        Ok(account)
    }

    /// An account with no holdings, no code, and the initial nonce encodes
    /// to nothing worth keeping in the trie.
    pub fn is_blank(&self, initial_nonce: u64) -> bool {
        self.nonce == initial_nonce && self.balance.is_empty() && self.code.is_empty()
    }
}
