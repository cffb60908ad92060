//! The single point enforcing ledger consistency: applying one transaction
//! to a state, or rejecting it with no side effects.

use crate::{State, StateError};
use lipchain_types::{Address, Transaction, TxIntent};
use tracing::debug;

/// Reasons a transaction is rejected. Always local and non-fatal.
#[derive(Debug, thiserror::Error)]
pub enum ApplyError {
    #[error("transaction carries no valid signature")]
    UnsignedTransaction,
    #[error("nonce mismatch: account at {expected}, transaction carries {got}")]
    InvalidNonce { expected: u64, got: u64 },
    #[error("sender does not hold the requested IP range")]
    InsufficientIpHoldings,
    #[error("range conflicts with the sender's existing registrations")]
    ConflictingRegistration,
    #[error(transparent)]
    State(#[from] StateError),
}

/// Run the applier's checks without mutating anything. Returns the
/// recovered sender on success.
pub fn validate_transaction(state: &mut State, tx: &Transaction) -> Result<Address, ApplyError> {
    let sender = tx.sender().ok_or(ApplyError::UnsignedTransaction)?;

    let expected = state.get_nonce(sender)?;
    if tx.nonce != expected {
        return Err(ApplyError::InvalidNonce {
            expected,
            got: tx.nonce,
        });
    }

    let balance = state.get_balance(sender)?;
    match &tx.intent {
        TxIntent::Transfer { range } | TxIntent::Delegate { range } => {
            if !balance.holds_own(range) {
                return Err(ApplyError::InsufficientIpHoldings);
            }
        }
        TxIntent::Register { range, .. } => {
            if balance.own_ips.iter().any(|r| r.overlaps(range)) {
                return Err(ApplyError::ConflictingRegistration);
            }
        }
    }

    Ok(sender)
}

/// Apply `tx` to `state`. On any failure the state is left exactly as it
/// was entering this call: all partial mutations are rolled back through
/// the journal.
pub fn apply_transaction(state: &mut State, tx: &Transaction) -> Result<(), ApplyError> {
    let checkpoint = state.checkpoint();
    match execute(state, tx) {
        Ok(()) => Ok(()),
        Err(err) => {
            state.revert_to(checkpoint);
            debug!(error = %err, "transaction rejected");
            Err(err)
        }
    }
}

fn execute(state: &mut State, tx: &Transaction) -> Result<(), ApplyError> {
    let sender = validate_transaction(state, tx)?;

    match &tx.intent {
        TxIntent::Transfer { range } => {
            let mut from_balance = state.get_balance(sender)?;
            if !from_balance.remove_own(range) {
                return Err(ApplyError::InsufficientIpHoldings);
            }
            state.set_balance(sender, from_balance)?;

            let mut to_balance = state.get_balance(tx.to)?;
            to_balance.add_own(*range);
            state.set_balance(tx.to, to_balance)?;
        }
        TxIntent::Delegate { range } => {
            let mut from_balance = state.get_balance(sender)?;
            from_balance.add_delegated(*range);
            state.set_balance(sender, from_balance)?;

            let mut to_balance = state.get_balance(tx.to)?;
            to_balance.add_received(*range);
            state.set_balance(tx.to, to_balance)?;
        }
        TxIntent::Register {
            range,
            map_server,
            locator,
        } => {
            let mut balance = state.get_balance(sender)?;
            balance.add_own(*range);
            balance.map_server = Some(*map_server);
            balance.locator = Some(*locator);
            state.set_balance(sender, balance)?;
        }
    }

    state.increment_nonce(sender)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::State;
    use ed25519_dalek::SigningKey;
    use lipchain_trie::MemoryNodeStore;
    use lipchain_types::{ChainConfig, IpRange};
    use std::sync::Arc;

    fn fresh_state() -> State {
        State::new(Arc::new(MemoryNodeStore::new()), ChainConfig::default())
    }

    fn key(seed: u8) -> SigningKey {
        SigningKey::from_bytes(&[seed; 32])
    }

    fn addr(key: &SigningKey) -> Address {
        Address::from_pubkey(&key.verifying_key().to_bytes())
    }

    fn cidr(s: &str) -> IpRange {
        IpRange::from_cidr(s).unwrap()
    }

    fn signed_transfer(key: &SigningKey, nonce: u64, to: Address, range: IpRange) -> Transaction {
        let mut tx = Transaction::new(nonce, TxIntent::Transfer { range }, to, 0);
        tx.sign(key);
        tx
    }

    fn seed_owner(state: &mut State, owner: Address, range: IpRange) {
        let mut balance = state.get_balance(owner).unwrap();
        balance.add_own(range);
        state.set_balance(owner, balance).unwrap();
        state.commit().unwrap();
    }

    #[test]
    fn transfer_moves_ownership() {
        let mut state = fresh_state();
        let sender_key = key(1);
        let sender = addr(&sender_key);
        let recipient = Address([9u8; 20]);
        let range = cidr("10.0.0.0/24");
        seed_owner(&mut state, sender, range);

        let tx = signed_transfer(&sender_key, 0, recipient, range);
        apply_transaction(&mut state, &tx).unwrap();

        assert!(!state.get_balance(sender).unwrap().holds_own(&range));
        assert!(state.get_balance(recipient).unwrap().holds_own(&range));
        assert_eq!(state.get_nonce(sender).unwrap(), 1);
    }

    #[test]
    fn unsigned_transaction_rejected() {
        let mut state = fresh_state();
        let tx = Transaction::new(
            0,
            TxIntent::Transfer {
                range: cidr("10.0.0.0/24"),
            },
            Address([9u8; 20]),
            0,
        );
        assert!(matches!(
            apply_transaction(&mut state, &tx),
            Err(ApplyError::UnsignedTransaction)
        ));
    }

    #[test]
    fn wrong_nonce_leaves_state_untouched() {
        let mut state = fresh_state();
        let sender_key = key(2);
        let sender = addr(&sender_key);
        let range = cidr("10.1.0.0/16");
        seed_owner(&mut state, sender, range);

        let balance_before = state.get_balance(sender).unwrap();
        let nonce_before = state.get_nonce(sender).unwrap();
        let root_before = state.root();

        let tx = signed_transfer(&sender_key, 5, Address([9u8; 20]), range);
        assert!(matches!(
            apply_transaction(&mut state, &tx),
            Err(ApplyError::InvalidNonce {
                expected: 0,
                got: 5
            })
        ));

        assert_eq!(state.get_balance(sender).unwrap(), balance_before);
        assert_eq!(state.get_nonce(sender).unwrap(), nonce_before);
        assert_eq!(state.root(), root_before);
    }

    #[test]
    fn transfer_without_holdings_rejected() {
        let mut state = fresh_state();
        let sender_key = key(3);
        let tx = signed_transfer(&sender_key, 0, Address([9u8; 20]), cidr("10.0.0.0/24"));
        assert!(matches!(
            apply_transaction(&mut state, &tx),
            Err(ApplyError::InsufficientIpHoldings)
        ));
    }

    #[test]
    fn partial_transfer_splits_range() {
        let mut state = fresh_state();
        let sender_key = key(4);
        let sender = addr(&sender_key);
        seed_owner(&mut state, sender, cidr("10.0.0.0/24"));

        let tx = signed_transfer(&sender_key, 0, Address([9u8; 20]), cidr("10.0.0.0/25"));
        apply_transaction(&mut state, &tx).unwrap();

        let balance = state.get_balance(sender).unwrap();
        assert!(!balance.holds_own(&cidr("10.0.0.0/25")));
        assert!(balance.holds_own(&cidr("10.0.0.128/25")));
    }

    #[test]
    fn delegation_keeps_ownership() {
        let mut state = fresh_state();
        let sender_key = key(5);
        let sender = addr(&sender_key);
        let recipient = Address([8u8; 20]);
        let range = cidr("172.16.0.0/20");
        seed_owner(&mut state, sender, range);

        let mut tx = Transaction::new(0, TxIntent::Delegate { range }, recipient, 0);
        tx.sign(&sender_key);
        apply_transaction(&mut state, &tx).unwrap();

        let sender_balance = state.get_balance(sender).unwrap();
        assert!(sender_balance.holds_own(&range));
        assert_eq!(sender_balance.delegated_ips, vec![range]);
        assert_eq!(
            state.get_balance(recipient).unwrap().received_ips,
            vec![range]
        );
    }

    #[test]
    fn registration_claims_range_and_metadata() {
        let mut state = fresh_state();
        let sender_key = key(6);
        let sender = addr(&sender_key);

        let mut tx = Transaction::new(
            0,
            TxIntent::Register {
                range: cidr("192.168.0.0/24"),
                map_server: "2.2.2.2".parse().unwrap(),
                locator: "1.1.1.1".parse().unwrap(),
            },
            sender,
            0,
        );
        tx.sign(&sender_key);
        apply_transaction(&mut state, &tx).unwrap();

        let balance = state.get_balance(sender).unwrap();
        assert!(balance.holds_own(&cidr("192.168.0.0/24")));
        assert_eq!(balance.map_server, Some("2.2.2.2".parse().unwrap()));
        assert_eq!(balance.locator, Some("1.1.1.1".parse().unwrap()));

        // double registration of an overlapping range is rejected
        let mut again = Transaction::new(
            1,
            TxIntent::Register {
                range: cidr("192.168.0.0/25"),
                map_server: "2.2.2.2".parse().unwrap(),
                locator: "1.1.1.1".parse().unwrap(),
            },
            sender,
            0,
        );
        again.sign(&sender_key);
        assert!(matches!(
            apply_transaction(&mut state, &again),
            Err(ApplyError::ConflictingRegistration)
        ));
    }
}
