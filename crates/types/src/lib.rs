//! Core data types for the lipchain ledger: addresses, IP-range balances,
//! accounts, transactions, blocks, and the consensus share payloads relayed
//! by the transport layer.

pub mod account;
pub mod address;
pub mod block;
pub mod config;
pub mod ip;
pub mod share;
pub mod transaction;

pub use account::Account;
pub use address::{Address, AddressError, ADDRESS_BYTES};
pub use block::{Block, BlockHeader};
pub use config::ChainConfig;
pub use ip::{IpBalance, IpRange, IpRangeError};
pub use share::{DkgShare, SignatureShareMsg, ValidatorKeyMsg};
pub use transaction::{Transaction, TxIntent};

/// 32-byte blake3 digest used for block hashes, transaction hashes, and
/// trie roots.
pub type Hash32 = [u8; 32];

/// Hash arbitrary bytes into a [`Hash32`].
pub fn hash_bytes(data: &[u8]) -> Hash32 {
    *blake3::hash(data).as_bytes()
}
