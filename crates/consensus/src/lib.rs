//! Round-based consensus: IP-ownership-weighted signer rotation, threshold
//! BLS signing and verification, and DKG share distribution.

pub mod bls;
pub mod engine;
pub mod signer;

pub use bls::{BlsSigner, CryptoError, Deal, DealtShare, ThresholdSigner};
pub use engine::{ConsensusEngine, DkgRound, Phase};
pub use signer::{calculate_next_signer, SignerRotation};

use lipchain_types::Address;

/// Consensus-layer errors.
#[derive(Debug, thiserror::Error)]
pub enum ConsensusError {
    #[error("next signer has not been computed yet")]
    SignerUnassigned,
    #[error("no height assignment for block {0}")]
    UnassignedHeight(u64),
    #[error("no registered IP owners to rotate through")]
    NoOwners,
    #[error("block signed by {got}, height assigned to {expected}")]
    WrongSigner { expected: Address, got: Address },
    #[error("no registered public key for validator {0}")]
    UnknownValidator(Address),
    #[error("block signature does not verify against the assigned signer")]
    InvalidSignature,
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error("encoding error: {0}")]
    Encoding(#[from] bincode::Error),
}
