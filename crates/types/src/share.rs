use crate::Address;
use serde::{Deserialize, Serialize};

/// A partial threshold signature over a block header, broadcast so that any
/// `k` validators can jointly reconstruct the group signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureShareMsg {
    /// DKG index of the validator that produced this share.
    pub validator_id: u64,
    /// Block height the share refers to.
    pub height: u64,
    /// Serialized `threshold_crypto` signature share.
    #[serde(with = "serde_bytes")]
    pub share: Vec<u8>,
}

/// One dealer-to-recipient secret share produced during a DKG round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DkgShare {
    /// DKG index of the dealing validator.
    pub dealer: u64,
    /// DKG index of the validator this share is destined for.
    pub recipient: u64,
    /// Serialized secret key share.
    #[serde(with = "serde_bytes")]
    pub secret_share: Vec<u8>,
    /// Serialized public key share, distributable to everyone.
    #[serde(with = "serde_bytes")]
    pub public_share: Vec<u8>,
    /// Serialized group public key set, needed to combine partials.
    #[serde(with = "serde_bytes")]
    pub public_set: Vec<u8>,
}

/// A validator announcing the BLS public key it seals blocks with. Peers
/// cannot verify a sealed header before they have seen this.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorKeyMsg {
    /// Ledger address of the announcing validator.
    pub address: Address,
    /// Serialized `threshold_crypto` public key.
    #[serde(with = "serde_bytes")]
    pub public_key: Vec<u8>,
}
