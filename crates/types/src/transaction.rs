use crate::{Address, Hash32, IpRange};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

/// What a transaction asks the ledger to do with an IP range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxIntent {
    /// Move ownership of `range` from the sender to the recipient.
    Transfer { range: IpRange },
    /// Lend `range` to the recipient; the sender keeps ownership.
    Delegate { range: IpRange },
    /// Claim `range` and register the sender's map-server and locator.
    Register {
        range: IpRange,
        map_server: Ipv4Addr,
        locator: Ipv4Addr,
    },
}

impl TxIntent {
    pub fn range(&self) -> &IpRange {
        match self {
            TxIntent::Transfer { range }
            | TxIntent::Delegate { range }
            | TxIntent::Register { range, .. } => range,
        }
    }
}

/// A signed ledger transaction.
///
/// The sender is never carried explicitly: it is derived from the embedded
/// verifying key, and only trusted once the signature over the canonical
/// signing bytes checks out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub nonce: u64,
    pub intent: TxIntent,
    pub to: Address,
    /// Effective time: the chain defers transactions stamped in the future.
    pub timestamp: u64,
    #[serde(with = "serde_bytes")]
    pub pubkey: [u8; 32],
    #[serde(with = "serde_bytes")]
    pub signature: [u8; 64],
}

impl Transaction {
    pub fn new(nonce: u64, intent: TxIntent, to: Address, timestamp: u64) -> Self {
        Transaction {
            nonce,
            intent,
            to,
            timestamp,
            pubkey: [0u8; 32],
            signature: [0u8; 64],
        }
    }

    /// The canonical bytes covered by the signature.
    pub fn signing_bytes(&self) -> Vec<u8> {
        bincode::serialize(&(self.nonce, &self.intent, self.to, self.timestamp))
            .expect("transaction signing encoding cannot fail")
    }

    /// Sign with an ed25519 key, filling in `pubkey` and `signature`.
    pub fn sign(&mut self, key: &SigningKey) {
        self.pubkey = key.verifying_key().to_bytes();
        let sig = key.sign(&self.signing_bytes());
        self.signature = sig.to_bytes();
    }

    /// Recover the sender address. Returns `None` for an unsigned
    /// transaction or one whose signature does not verify.
    pub fn sender(&self) -> Option<Address> {
        let key = VerifyingKey::from_bytes(&self.pubkey).ok()?;
        let sig = Signature::from_bytes(&self.signature);
        key.verify(&self.signing_bytes(), &sig).ok()?;
        let address = Address::from_pubkey(&self.pubkey);
        if address.is_null() {
            return None;
        }
        Some(address)
    }

    /// Content hash identifying this transaction in pools and blocks.
    pub fn hash(&self) -> Hash32 {
        let encoded = bincode::serialize(self).expect("transaction encoding cannot fail");
        crate::hash_bytes(&encoded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signing_key(seed: u8) -> SigningKey {
        SigningKey::from_bytes(&[seed; 32])
    }

    fn transfer_tx(nonce: u64) -> Transaction {
        Transaction::new(
            nonce,
            TxIntent::Transfer {
                range: IpRange::from_cidr("10.0.0.0/24").unwrap(),
            },
            Address([9u8; 20]),
            1_700_000_000,
        )
    }

    #[test]
    fn signed_transaction_recovers_sender() {
        let key = signing_key(3);
        let mut tx = transfer_tx(0);
        tx.sign(&key);

        let sender = tx.sender().expect("sender should recover");
        assert_eq!(sender, Address::from_pubkey(&key.verifying_key().to_bytes()));
    }

    #[test]
    fn unsigned_transaction_has_no_sender() {
        let tx = transfer_tx(0);
        assert!(tx.sender().is_none());
    }

    #[test]
    fn tampering_invalidates_sender() {
        let key = signing_key(4);
        let mut tx = transfer_tx(0);
        tx.sign(&key);
        tx.nonce = 1;
        assert!(tx.sender().is_none());
    }

    #[test]
    fn hash_changes_with_content() {
        let key = signing_key(5);
        let mut a = transfer_tx(0);
        a.sign(&key);
        let mut b = transfer_tx(1);
        b.sign(&key);
        assert_ne!(a.hash(), b.hash());
    }
}
