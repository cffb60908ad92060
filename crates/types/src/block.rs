use crate::{Address, Hash32, Transaction};
use serde::{Deserialize, Serialize};

/// Block header committing to the parent, the transaction list, and the
/// post-state of replaying that list against the parent's state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub prevhash: Hash32,
    pub number: u64,
    pub timestamp: u64,
    /// Address credited as the block's signer.
    pub coinbase: Address,
    pub tx_root: Hash32,
    pub state_root: Hash32,
    /// BLS signature over [`BlockHeader::signing_bytes`]; empty until the
    /// designated signer seals the block.
    #[serde(with = "serde_bytes")]
    pub signature: Vec<u8>,
}

impl BlockHeader {
    /// The canonical bytes covered by the block signature: every header
    /// field except the signature itself.
    pub fn signing_bytes(&self) -> Vec<u8> {
        bincode::serialize(&(
            &self.prevhash,
            self.number,
            self.timestamp,
            self.coinbase,
            &self.tx_root,
            &self.state_root,
        ))
        .expect("header signing encoding cannot fail")
    }

    /// Hash of the full header, signature included. Identifies the block.
    pub fn hash(&self) -> Hash32 {
        let encoded = bincode::serialize(self).expect("header encoding cannot fail");
        crate::hash_bytes(&encoded)
    }
}

/// An ordered transaction list sealed under a header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn new(header: BlockHeader, transactions: Vec<Transaction>) -> Self {
        Block {
            header,
            transactions,
        }
    }

    pub fn hash(&self) -> Hash32 {
        self.header.hash()
    }

    pub fn number(&self) -> u64 {
        self.header.number
    }
}
