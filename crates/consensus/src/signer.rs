//! Deterministic signer rotation, weighted by committed IP ownership.
//!
//! Every node runs the same pure computation over the same committed
//! ownership distribution and the previous block's timestamp, so all nodes
//! agree on the designated signer without a voting round.

use crate::ConsensusError;
use lipchain_types::Address;

/// Pick the next signer from the committed ownership distribution.
///
/// The seed hashes the previous block's timestamp together with the
/// canonically sorted (address, weight) list, then indexes into the
/// cumulative weight space: an account owning twice the addresses is
/// selected twice as often. Pure function of its inputs.
pub fn calculate_next_signer(
    owners: &[(Address, u64)],
    last_block_timestamp: u64,
) -> Result<Address, ConsensusError> {
    let mut owners: Vec<(Address, u64)> = owners
        .iter()
        .filter(|(_, weight)| *weight > 0)
        .copied()
        .collect();
    if owners.is_empty() {
        return Err(ConsensusError::NoOwners);
    }
    owners.sort();

    let mut hasher = blake3::Hasher::new();
    hasher.update(&last_block_timestamp.to_be_bytes());
    for (address, weight) in &owners {
        hasher.update(&address.0);
        hasher.update(&weight.to_be_bytes());
    }
    let seed = hasher.finalize();
    let mut head = [0u8; 8];
    head.copy_from_slice(&seed.as_bytes()[..8]);

    let total: u64 = owners.iter().map(|(_, weight)| weight).sum();
    let mut index = u64::from_be_bytes(head) % total;
    for (address, weight) in &owners {
        if index < *weight {
            return Ok(*address);
        }
        index -= weight;
    }
    unreachable!("index is reduced modulo the total weight")
}

/// Holds the most recently computed next-signer value.
#[derive(Debug, Default)]
pub struct SignerRotation {
    next: Option<Address>,
}

impl SignerRotation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Recompute after a block is accepted. Runs once per accepted block.
    pub fn recompute(
        &mut self,
        owners: &[(Address, u64)],
        last_block_timestamp: u64,
    ) -> Result<Address, ConsensusError> {
        let signer = calculate_next_signer(owners, last_block_timestamp)?;
        self.next = Some(signer);
        Ok(signer)
    }

    /// The last computed signer. Asking before any computation is an error.
    pub fn next_signer(&self) -> Result<Address, ConsensusError> {
        self.next.ok_or(ConsensusError::SignerUnassigned)
    }

    /// Whether `local` is the designated signer, plus the signer address.
    pub fn am_i_signer(&self, local: Address) -> Result<(bool, Address), ConsensusError> {
        let signer = self.next_signer()?;
        Ok((signer == local, signer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owner(seed: u8, weight: u64) -> (Address, u64) {
        (Address([seed; 20]), weight)
    }

    #[test]
    fn identical_inputs_yield_identical_signer() {
        let owners = vec![owner(1, 256), owner(2, 128), owner(3, 64)];
        let a = calculate_next_signer(&owners, 1_700_000_000).unwrap();
        let b = calculate_next_signer(&owners, 1_700_000_000).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn input_order_does_not_matter() {
        let forward = vec![owner(1, 256), owner(2, 128)];
        let reverse = vec![owner(2, 128), owner(1, 256)];
        assert_eq!(
            calculate_next_signer(&forward, 42).unwrap(),
            calculate_next_signer(&reverse, 42).unwrap()
        );
    }

    #[test]
    fn timestamp_rotates_the_choice() {
        let owners = vec![owner(1, 1), owner(2, 1), owner(3, 1), owner(4, 1)];
        let picks: std::collections::HashSet<Address> = (0u64..64)
            .map(|ts| calculate_next_signer(&owners, ts).unwrap())
            .collect();
        assert!(picks.len() > 1, "rotation never moved off one signer");
    }

    #[test]
    fn sole_owner_always_signs() {
        let owners = vec![owner(7, 512)];
        for ts in 0..16 {
            assert_eq!(
                calculate_next_signer(&owners, ts).unwrap(),
                Address([7u8; 20])
            );
        }
    }

    #[test]
    fn zero_weight_owners_are_ignored() {
        let owners = vec![owner(1, 0), owner(2, 4)];
        assert_eq!(
            calculate_next_signer(&owners, 9).unwrap(),
            Address([2u8; 20])
        );
        assert!(matches!(
            calculate_next_signer(&[owner(1, 0)], 9),
            Err(ConsensusError::NoOwners)
        ));
    }

    #[test]
    fn rotation_requires_a_computation_first() {
        let rotation = SignerRotation::new();
        assert!(matches!(
            rotation.next_signer(),
            Err(ConsensusError::SignerUnassigned)
        ));

        let mut rotation = SignerRotation::new();
        let signer = rotation.recompute(&[owner(1, 10)], 5).unwrap();
        assert_eq!(rotation.next_signer().unwrap(), signer);
        let (me, who) = rotation.am_i_signer(signer).unwrap();
        assert!(me);
        assert_eq!(who, signer);
    }
}
