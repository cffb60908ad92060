//! Threshold BLS signing behind a capability trait, so the engine is
//! indifferent to the backing implementation.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use threshold_crypto::serde_impl::SerdeSecret;
use threshold_crypto::{
    PublicKey, PublicKeySet, PublicKeyShare, SecretKey, SecretKeySet, SecretKeyShare, Signature,
    SignatureShare,
};

/// Failures from the cryptographic backend. Surfaced to the caller as a
/// result; nothing here retries internally.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("signer is not initialized")]
    Uninitialized,
    #[error("threshold {threshold} is not satisfiable by {participants} participants")]
    BadThreshold { threshold: usize, participants: usize },
    #[error("dealt {got} shares for {expected} participants")]
    ShareCount { expected: usize, got: usize },
    #[error("not enough signature shares: have {got}, need {need}")]
    InsufficientShares { need: usize, got: usize },
    #[error("share combination failed: {0}")]
    Recovery(String),
    #[error("encoding error: {0}")]
    Encoding(#[from] bincode::Error),
}

/// One participant's slice of a dealt secret.
#[derive(Clone, Serialize, Deserialize)]
pub struct DealtShare {
    pub id: u64,
    pub secret: SerdeSecret<SecretKeyShare>,
    pub public: PublicKeyShare,
}

/// Output of a DKG deal: the group public key set plus one share per
/// requested participant id, in request order.
#[derive(Clone, Serialize, Deserialize)]
pub struct Deal {
    pub threshold: usize,
    pub public_set: PublicKeySet,
    pub shares: Vec<DealtShare>,
}

/// The threshold-signature capability consumed by the consensus engine.
pub trait ThresholdSigner: Send + Sync {
    /// Establish this validator's key pair. Idempotent.
    fn initialize(&self) -> Result<(), CryptoError>;

    fn public_key(&self) -> Result<PublicKey, CryptoError>;

    /// Sign with the validator's own key.
    fn sign(&self, message: &[u8]) -> Result<Signature, CryptoError>;

    /// Sign with a dealt secret share instead of the validator key.
    fn sign_with_share(&self, share: &SecretKeyShare, message: &[u8]) -> SignatureShare {
        share.sign(message)
    }

    /// Pure signature check; never errors.
    fn verify(&self, message: &[u8], signature: &Signature, public_key: &PublicKey) -> bool {
        public_key.verify(signature, message)
    }

    /// Deal secret shares such that any `threshold` of the named
    /// participants can jointly produce a group signature.
    fn share(&self, threshold: usize, ids: &[u64]) -> Result<Deal, CryptoError>;

    /// Combine at least `threshold` partial signatures into the group
    /// signature, checked against the group public key.
    fn recover(
        &self,
        deal_public: &PublicKeySet,
        threshold: usize,
        partials: &[(u64, SignatureShare)],
        message: &[u8],
    ) -> Result<Signature, CryptoError>;
}

/// In-process BLS backend.
#[derive(Default)]
pub struct BlsSigner {
    key: RwLock<Option<SecretKey>>,
}

impl BlsSigner {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ThresholdSigner for BlsSigner {
    fn initialize(&self) -> Result<(), CryptoError> {
        let mut key = self.key.write();
        if key.is_none() {
            *key = Some(SecretKey::random());
        }
        Ok(())
    }

    fn public_key(&self) -> Result<PublicKey, CryptoError> {
        self.key
            .read()
            .as_ref()
            .map(SecretKey::public_key)
            .ok_or(CryptoError::Uninitialized)
    }

    fn sign(&self, message: &[u8]) -> Result<Signature, CryptoError> {
        self.key
            .read()
            .as_ref()
            .map(|key| key.sign(message))
            .ok_or(CryptoError::Uninitialized)
    }

    fn share(&self, threshold: usize, ids: &[u64]) -> Result<Deal, CryptoError> {
        if threshold == 0 || threshold > ids.len() {
            return Err(CryptoError::BadThreshold {
                threshold,
                participants: ids.len(),
            });
        }
        // the crate wants the polynomial degree, one less than the number
        // of shares needed to reconstruct
        let sk_set = SecretKeySet::random(threshold - 1, &mut rand::thread_rng());
        let public_set = sk_set.public_keys();

        let shares: Vec<DealtShare> = ids
            .iter()
            .map(|&id| DealtShare {
                id,
                secret: SerdeSecret(sk_set.secret_key_share(id as usize)),
                public: public_set.public_key_share(id as usize),
            })
            .collect();
        if shares.len() != ids.len() {
            return Err(CryptoError::ShareCount {
                expected: ids.len(),
                got: shares.len(),
            });
        }
        Ok(Deal {
            threshold,
            public_set,
            shares,
        })
    }

    fn recover(
        &self,
        deal_public: &PublicKeySet,
        threshold: usize,
        partials: &[(u64, SignatureShare)],
        message: &[u8],
    ) -> Result<Signature, CryptoError> {
        if partials.len() < threshold {
            return Err(CryptoError::InsufficientShares {
                need: threshold,
                got: partials.len(),
            });
        }
        let mut shares = BTreeMap::new();
        for (id, share) in partials {
            shares.insert(*id as usize, share.clone());
        }
        let signature = deal_public
            .combine_signatures(&shares)
            .map_err(|err| CryptoError::Recovery(err.to_string()))?;
        if !deal_public.public_key().verify(&signature, message) {
            return Err(CryptoError::Recovery(
                "combined signature does not verify against the group key".to_string(),
            ));
        }
        Ok(signature)
    }
}
