//! End-to-end ledger flow: seed genesis ownership, move a range through a
//! signed transaction in a block at height 1, and read the result back.

use ed25519_dalek::SigningKey;
use lipchain_chain::{Chain, ChainError, ChainService, GenesisAlloc, MemoryChainStore, PendingOutcome};
use lipchain_trie::MemoryNodeStore;
use lipchain_types::{Address, ChainConfig, IpRange, Transaction, TxIntent};
use std::sync::Arc;

fn signing_key(seed: u8) -> SigningKey {
    SigningKey::from_bytes(&[seed; 32])
}

fn address_of(key: &SigningKey) -> Address {
    Address::from_pubkey(&key.verifying_key().to_bytes())
}

fn service_with_owner(key: &SigningKey, cidr: &str) -> ChainService {
    let chain = Chain::new(
        Arc::new(MemoryChainStore::new()),
        Arc::new(MemoryNodeStore::new()),
        ChainConfig::default(),
        &[GenesisAlloc::new(
            address_of(key),
            vec![IpRange::from_cidr(cidr).unwrap()],
        )],
    )
    .unwrap();
    ChainService::new(chain)
}

fn signed_transfer(key: &SigningKey, nonce: u64, cidr: &str, to: Address, ts: u64) -> Transaction {
    let mut tx = Transaction::new(
        nonce,
        TxIntent::Transfer {
            range: IpRange::from_cidr(cidr).unwrap(),
        },
        to,
        ts,
    );
    tx.sign(key);
    tx
}

#[test]
fn transfer_moves_ownership_through_a_block() {
    let alice = signing_key(1);
    let bob = signing_key(2);
    let mut service = service_with_owner(&alice, "10.0.0.0/24");

    let tx = signed_transfer(&alice, 0, "10.0.0.0/25", address_of(&bob), 50);
    assert_eq!(
        service.add_pending_transaction(tx.clone(), 100).unwrap(),
        PendingOutcome::Queued
    );

    let block = service.create_block(address_of(&alice), 100).unwrap();
    assert_eq!(block.number(), 1);
    assert_eq!(block.transactions.len(), 1);
    // pending survives until the block is actually accepted
    assert_eq!(service.get_pending_transactions().len(), 1);

    service.add_block(&block).unwrap();
    assert!(service.get_pending_transactions().is_empty());
    assert_eq!(service.head().number(), 1);

    let alice_ips = service.get_own_ips(address_of(&alice)).unwrap();
    assert_eq!(alice_ips, vec![IpRange::from_cidr("10.0.0.128/25").unwrap()]);
    let bob_ips = service.get_own_ips(address_of(&bob)).unwrap();
    assert_eq!(bob_ips, vec![IpRange::from_cidr("10.0.0.0/25").unwrap()]);

    assert!(service.get_transaction(&tx.hash()).unwrap().is_some());
}

#[test]
fn duplicate_submission_is_rejected() {
    let alice = signing_key(3);
    let mut service = service_with_owner(&alice, "10.0.0.0/24");

    let tx = signed_transfer(&alice, 0, "10.0.0.0/24", Address([7u8; 20]), 50);
    service.add_pending_transaction(tx.clone(), 100).unwrap();
    assert!(matches!(
        service.add_pending_transaction(tx.clone(), 100).unwrap_err(),
        ChainError::DuplicateTransaction
    ));

    // still rejected once committed
    let block = service.create_block(address_of(&alice), 100).unwrap();
    service.add_block(&block).unwrap();
    assert!(matches!(
        service.add_pending_transaction(tx, 100).unwrap_err(),
        ChainError::DuplicateTransaction
    ));
}

#[test]
fn overspending_transaction_never_reaches_a_block() {
    let alice = signing_key(4);
    let mut service = service_with_owner(&alice, "10.0.0.0/25");

    let tx = signed_transfer(&alice, 0, "10.0.0.0/24", Address([7u8; 20]), 50);
    assert!(service.add_pending_transaction(tx, 100).is_err());
    let block = service.create_block(address_of(&alice), 100).unwrap();
    assert!(block.transactions.is_empty());
}

#[test]
fn future_dated_transaction_waits_for_its_time() {
    let alice = signing_key(5);
    let bob = signing_key(6);
    let mut service = service_with_owner(&alice, "10.0.0.0/24");

    let tx = signed_transfer(&alice, 0, "10.0.0.0/24", address_of(&bob), 500);
    assert_eq!(
        service.add_pending_transaction(tx, 100).unwrap(),
        PendingOutcome::Deferred
    );
    assert!(service.get_pending_transactions().is_empty());

    // too early: the candidate stays empty
    let early = service.create_block(address_of(&alice), 200).unwrap();
    assert!(early.transactions.is_empty());

    // once the effective time arrives the transaction is promoted
    let ripe = service.create_block(address_of(&alice), 500).unwrap();
    assert_eq!(ripe.transactions.len(), 1);
    service.add_block(&ripe).unwrap();
    assert_eq!(
        service.get_own_ips(address_of(&bob)).unwrap(),
        vec![IpRange::from_cidr("10.0.0.0/24").unwrap()]
    );
}

#[test]
fn consecutive_nonces_queue_against_pending_state() {
    let alice = signing_key(7);
    let mut service = service_with_owner(&alice, "10.0.0.0/24");

    let first = signed_transfer(&alice, 0, "10.0.0.0/25", Address([8u8; 20]), 50);
    let second = signed_transfer(&alice, 1, "10.0.0.128/25", Address([8u8; 20]), 50);
    service.add_pending_transaction(first, 100).unwrap();
    // nonce 1 only validates because nonce 0 is replayed first
    service.add_pending_transaction(second, 100).unwrap();

    let block = service.create_block(address_of(&alice), 100).unwrap();
    assert_eq!(block.transactions.len(), 2);
    service.add_block(&block).unwrap();
    assert!(service.get_own_ips(address_of(&alice)).unwrap().is_empty());
    assert_eq!(
        service
            .get_own_ips(Address([8u8; 20]))
            .unwrap()
            .first()
            .copied(),
        Some(IpRange::from_cidr("10.0.0.0/24").unwrap())
    );
}

#[test]
fn locator_query_finds_the_covering_owner() {
    let alice = signing_key(8);
    let mut service = service_with_owner(&alice, "10.0.0.0/24");

    let mut tx = Transaction::new(
        0,
        TxIntent::Register {
            range: IpRange::from_cidr("192.168.1.0/24").unwrap(),
            map_server: "10.9.9.9".parse().unwrap(),
            locator: "10.9.9.10".parse().unwrap(),
        },
        Address::NULL,
        50,
    );
    tx.sign(&alice);
    service.add_pending_transaction(tx, 100).unwrap();
    let block = service.create_block(address_of(&alice), 100).unwrap();
    service.add_block(&block).unwrap();

    let record = service
        .query_locator("192.168.1.77".parse().unwrap())
        .unwrap()
        .expect("covering range exists");
    assert_eq!(record.owner, address_of(&alice));
    assert_eq!(record.map_server, Some("10.9.9.9".parse().unwrap()));
    assert_eq!(record.locator, Some("10.9.9.10".parse().unwrap()));

    assert!(service
        .query_locator("172.16.0.1".parse().unwrap())
        .unwrap()
        .is_none());
}
