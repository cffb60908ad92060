//! The per-height consensus state machine: bind a signer to each pending
//! height, verify incoming blocks against that binding, and advance the
//! rotation once a block is accepted.

use crate::bls::{Deal, ThresholdSigner};
use crate::signer::SignerRotation;
use crate::ConsensusError;
use lipchain_types::{Address, Block, SignatureShareMsg};
use std::collections::BTreeMap;
use std::sync::Arc;
use threshold_crypto::{PublicKey, PublicKeySet, SecretKeyShare, Signature, SignatureShare};
use tracing::{debug, warn};

/// Where the engine stands for the height currently being decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// No signer bound for the next height yet.
    WaitingAssignment,
    /// Signer bound; incoming blocks for the height are checked against it.
    Verifying,
}

/// Bookkeeping for one DKG round among the validator set.
///
/// A round collects exactly one secret share per dealer; a validator that
/// never responds leaves the round incomplete, and the caller abandons it
/// after a deadline and deals again. The round itself never retries.
pub struct DkgRound {
    threshold: usize,
    participants: Vec<u64>,
    received: BTreeMap<u64, SecretKeyShare>,
    started_at: u64,
}

impl DkgRound {
    pub fn new(threshold: usize, participants: Vec<u64>, now: u64) -> Self {
        DkgRound {
            threshold,
            participants,
            received: BTreeMap::new(),
            started_at: now,
        }
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Record a dealer's share. Unknown dealers and duplicates are ignored.
    pub fn accept(&mut self, dealer: u64, share: SecretKeyShare) -> bool {
        if !self.participants.contains(&dealer) || self.received.contains_key(&dealer) {
            return false;
        }
        self.received.insert(dealer, share);
        true
    }

    pub fn is_complete(&self) -> bool {
        self.received.len() == self.participants.len()
    }

    pub fn expired(&self, now: u64, timeout: u64) -> bool {
        !self.is_complete() && now.saturating_sub(self.started_at) >= timeout
    }
}

/// Consensus engine for one node.
pub struct ConsensusEngine {
    backend: Arc<dyn ThresholdSigner>,
    rotation: SignerRotation,
    /// Signer bound to each height while that height is pending. The
    /// binding is made when the height goes pending, so a block arriving
    /// late is still judged against the signer it was assigned.
    assignments: BTreeMap<u64, Address>,
    /// Validator BLS public keys by ledger address.
    validators: BTreeMap<Address, PublicKey>,
    /// Group keys from the last completed DKG, if any.
    group: Option<(PublicKeySet, u64, SecretKeyShare)>,
    /// Partial header signatures collected per height.
    partials: BTreeMap<u64, BTreeMap<u64, SignatureShare>>,
    phase: Phase,
}

impl ConsensusEngine {
    pub fn new(backend: Arc<dyn ThresholdSigner>) -> Self {
        ConsensusEngine {
            backend,
            rotation: SignerRotation::new(),
            assignments: BTreeMap::new(),
            validators: BTreeMap::new(),
            group: None,
            partials: BTreeMap::new(),
            phase: Phase::WaitingAssignment,
        }
    }

    pub fn backend(&self) -> &Arc<dyn ThresholdSigner> {
        &self.backend
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn register_validator(&mut self, address: Address, key: PublicKey) {
        self.validators.insert(address, key);
    }

    pub fn known_validator(&self, address: Address) -> bool {
        self.validators.contains_key(&address)
    }

    /// Bind the signer for `height` from the committed ownership
    /// distribution and the previous block's timestamp.
    pub fn assign_signer(
        &mut self,
        height: u64,
        owners: &[(Address, u64)],
        last_block_timestamp: u64,
    ) -> Result<Address, ConsensusError> {
        let signer = self.rotation.recompute(owners, last_block_timestamp)?;
        self.assignments.insert(height, signer);
        self.phase = Phase::Verifying;
        debug!(height, signer = %signer, "signer assigned");
        Ok(signer)
    }

    /// The signer most recently computed by [`assign_signer`].
    pub fn next_signer(&self) -> Result<Address, ConsensusError> {
        self.rotation.next_signer()
    }

    pub fn am_i_signer(&self, local: Address) -> Result<(bool, Address), ConsensusError> {
        self.rotation.am_i_signer(local)
    }

    pub fn signer_for(&self, height: u64) -> Option<Address> {
        self.assignments.get(&height).copied()
    }

    /// Check an incoming block against the signer bound to its height.
    ///
    /// The coinbase must be that signer, and the header signature must
    /// verify against the signer's registered BLS key over the canonical
    /// header bytes.
    pub fn verify_block(&self, block: &Block) -> Result<(), ConsensusError> {
        let height = block.number();
        let expected = self
            .signer_for(height)
            .ok_or(ConsensusError::UnassignedHeight(height))?;
        if block.header.coinbase != expected {
            return Err(ConsensusError::WrongSigner {
                expected,
                got: block.header.coinbase,
            });
        }
        let key = self
            .validators
            .get(&expected)
            .ok_or(ConsensusError::UnknownValidator(expected))?;
        let signature: Signature = bincode::deserialize(&block.header.signature)
            .map_err(|_| ConsensusError::InvalidSignature)?;
        if !self
            .backend
            .verify(&block.header.signing_bytes(), &signature, key)
        {
            return Err(ConsensusError::InvalidSignature);
        }
        Ok(())
    }

    /// Seal a candidate block with this node's own key.
    pub fn seal_block(&self, block: &mut Block) -> Result<(), ConsensusError> {
        let signature = self.backend.sign(&block.header.signing_bytes())?;
        block.header.signature = bincode::serialize(&signature)?;
        Ok(())
    }

    /// A block at `height` was accepted: drop its binding and any collected
    /// partials, and return to waiting for the next assignment.
    pub fn accept_block(&mut self, height: u64) {
        self.assignments.remove(&height);
        self.partials.remove(&height);
        self.phase = Phase::WaitingAssignment;
    }

    /// A block at `height` was rejected: the binding stays, another block
    /// for the same height can still arrive from the assigned signer. A
    /// rejection for a height that was never assigned leaves the phase
    /// alone.
    pub fn reject_block(&mut self, height: u64) {
        if self.assignments.contains_key(&height) {
            warn!(height, "block rejected, keeping signer binding");
            self.phase = Phase::Verifying;
        } else {
            warn!(height, "block rejected for unassigned height");
        }
    }

    /// Deal a fresh group secret to the given validator set. Each call
    /// starts a new deal; abandoning an incomplete round and dealing again
    /// is how a timed-out DKG is retried.
    pub fn deal_shares(
        &self,
        threshold: usize,
        ids: &[u64],
    ) -> Result<Deal, ConsensusError> {
        Ok(self.backend.share(threshold, ids)?)
    }

    /// Adopt the group keys this node ends a DKG round with.
    pub fn install_group(&mut self, public_set: PublicKeySet, id: u64, secret: SecretKeyShare) {
        self.group = Some((public_set, id, secret));
    }

    pub fn has_group(&self) -> bool {
        self.group.is_some()
    }

    /// Produce this node's partial signature over a header for `height`.
    pub fn sign_share(
        &self,
        height: u64,
        header_bytes: &[u8],
    ) -> Result<SignatureShareMsg, ConsensusError> {
        let (_, id, secret) = self
            .group
            .as_ref()
            .ok_or(crate::bls::CryptoError::Uninitialized)?;
        let share = self.backend.sign_with_share(secret, header_bytes);
        Ok(SignatureShareMsg {
            validator_id: *id,
            height,
            share: bincode::serialize(&share)?,
        })
    }

    /// Collect a partial signature from a peer. Malformed shares are
    /// dropped with a log line; duplicates are ignored.
    pub fn add_signature_share(&mut self, msg: &SignatureShareMsg) {
        let share: SignatureShare = match bincode::deserialize(&msg.share) {
            Ok(share) => share,
            Err(err) => {
                warn!(validator = msg.validator_id, height = msg.height, error = %err,
                      "dropping undecodable signature share");
                return;
            }
        };
        self.partials
            .entry(msg.height)
            .or_default()
            .entry(msg.validator_id)
            .or_insert(share);
    }

    pub fn shares_for(&self, height: u64) -> usize {
        self.partials.get(&height).map_or(0, BTreeMap::len)
    }

    /// Try to combine the collected partials for `height` into the group
    /// signature. Failure leaves the partials in place for a retry with
    /// more shares on a later cycle.
    pub fn try_recover(
        &self,
        height: u64,
        header_bytes: &[u8],
    ) -> Result<Signature, ConsensusError> {
        let (public_set, _, _) = self
            .group
            .as_ref()
            .ok_or(crate::bls::CryptoError::Uninitialized)?;
        let partials: Vec<(u64, SignatureShare)> = self
            .partials
            .get(&height)
            .map(|m| m.iter().map(|(id, s)| (*id, s.clone())).collect())
            .unwrap_or_default();
        let threshold = public_set.threshold() + 1;
        Ok(self
            .backend
            .recover(public_set, threshold, &partials, header_bytes)?)
    }
}
