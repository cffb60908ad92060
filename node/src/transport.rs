//! The non-blocking transport boundary.
//!
//! Every receive returns immediately: `None` (or `false`) means nothing is
//! waiting. The core never learns "no data" through an error.

use lipchain_types::{Block, DkgShare, SignatureShareMsg, Transaction, ValidatorKeyMsg};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;

/// Wire messages, decoded once at the transport boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum NetMessage {
    Block(Block),
    Tx(Transaction),
    /// Heights a peer is missing.
    BlockQuery(Vec<u64>),
    BlockAnswer(Vec<Block>),
    TxPoolQuery,
    TxPoolAnswer(Vec<Transaction>),
    Share(SignatureShareMsg),
    Dkg(DkgShare),
    ValidatorKey(ValidatorKeyMsg),
}

/// Gossip-layer capability consumed by the node loop. All receives are
/// non-blocking.
pub trait Transport: Send + Sync {
    fn get_block(&self) -> Option<Block>;
    fn broadcast_block(&self, block: Block);

    fn get_transaction(&self) -> Option<Transaction>;
    fn broadcast_transaction(&self, tx: Transaction);

    /// Heights peers have asked for, if any.
    fn get_block_queries(&self) -> Option<Vec<u64>>;
    fn answer_block_queries(&self, blocks: Vec<Block>);

    /// True when a peer wants the pending pool.
    fn tx_pool_query(&self) -> bool;
    fn answer_tx_pool_query(&self, txs: Vec<Transaction>);

    fn get_share(&self) -> Option<SignatureShareMsg>;
    fn broadcast_share(&self, share: SignatureShareMsg);

    fn get_dkg_share(&self) -> Option<DkgShare>;
    fn send_dkg_share(&self, recipient: u64, share: DkgShare);

    fn get_validator_key(&self) -> Option<ValidatorKeyMsg>;
    fn announce_validator_key(&self, msg: ValidatorKeyMsg);
}

/// Queue-backed transport: peers (or tests) push into the inbox; outbound
/// traffic accumulates in the outbox for the wire layer to drain.
#[derive(Default)]
pub struct ChannelTransport {
    inbox: Mutex<VecDeque<NetMessage>>,
    outbox: Mutex<VecDeque<NetMessage>>,
}

impl ChannelTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push(&self, msg: NetMessage) {
        self.inbox.lock().push_back(msg);
    }

    pub fn drain_outbox(&self) -> Vec<NetMessage> {
        self.outbox.lock().drain(..).collect()
    }

    fn take_inbox<T>(&self, mut select: impl FnMut(&NetMessage) -> Option<T>) -> Option<T>
    where
        T: Clone,
    {
        let mut inbox = self.inbox.lock();
        let pos = inbox.iter().position(|msg| select(msg).is_some())?;
        let msg = inbox.remove(pos)?;
        select(&msg)
    }

    fn send(&self, msg: NetMessage) {
        self.outbox.lock().push_back(msg);
    }
}

impl Transport for ChannelTransport {
    fn get_block(&self) -> Option<Block> {
        self.take_inbox(|msg| match msg {
            NetMessage::Block(block) => Some(block.clone()),
            _ => None,
        })
    }

    fn broadcast_block(&self, block: Block) {
        self.send(NetMessage::Block(block));
    }

    fn get_transaction(&self) -> Option<Transaction> {
        self.take_inbox(|msg| match msg {
            NetMessage::Tx(tx) => Some(tx.clone()),
            _ => None,
        })
    }

    fn broadcast_transaction(&self, tx: Transaction) {
        self.send(NetMessage::Tx(tx));
    }

    fn get_block_queries(&self) -> Option<Vec<u64>> {
        self.take_inbox(|msg| match msg {
            NetMessage::BlockQuery(heights) => Some(heights.clone()),
            _ => None,
        })
    }

    fn answer_block_queries(&self, blocks: Vec<Block>) {
        self.send(NetMessage::BlockAnswer(blocks));
    }

    fn tx_pool_query(&self) -> bool {
        self.take_inbox(|msg| match msg {
            NetMessage::TxPoolQuery => Some(()),
            _ => None,
        })
        .is_some()
    }

    fn answer_tx_pool_query(&self, txs: Vec<Transaction>) {
        self.send(NetMessage::TxPoolAnswer(txs));
    }

    fn get_share(&self) -> Option<SignatureShareMsg> {
        self.take_inbox(|msg| match msg {
            NetMessage::Share(share) => Some(share.clone()),
            _ => None,
        })
    }

    fn broadcast_share(&self, share: SignatureShareMsg) {
        self.send(NetMessage::Share(share));
    }

    fn get_dkg_share(&self) -> Option<DkgShare> {
        self.take_inbox(|msg| match msg {
            NetMessage::Dkg(share) => Some(share.clone()),
            _ => None,
        })
    }

    fn send_dkg_share(&self, _recipient: u64, share: DkgShare) {
        self.send(NetMessage::Dkg(share));
    }

    fn get_validator_key(&self) -> Option<ValidatorKeyMsg> {
        self.take_inbox(|msg| match msg {
            NetMessage::ValidatorKey(msg) => Some(msg.clone()),
            _ => None,
        })
    }

    fn announce_validator_key(&self, msg: ValidatorKeyMsg) {
        self.send(NetMessage::ValidatorKey(msg));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lipchain_types::{Address, IpRange, TxIntent};

    fn tx(nonce: u64) -> Transaction {
        Transaction::new(
            nonce,
            TxIntent::Transfer {
                range: IpRange::from_cidr("10.0.0.0/24").unwrap(),
            },
            Address([1u8; 20]),
            0,
        )
    }

    #[test]
    fn empty_inbox_returns_none_not_blocks() {
        let transport = ChannelTransport::new();
        assert!(transport.get_block().is_none());
        assert!(transport.get_transaction().is_none());
        assert!(!transport.tx_pool_query());
    }

    #[test]
    fn selective_receive_leaves_other_messages() {
        let transport = ChannelTransport::new();
        transport.push(NetMessage::Tx(tx(0)));
        transport.push(NetMessage::TxPoolQuery);
        transport.push(NetMessage::Tx(tx(1)));

        assert!(transport.tx_pool_query());
        assert_eq!(transport.get_transaction().map(|t| t.nonce), Some(0));
        assert_eq!(transport.get_transaction().map(|t| t.nonce), Some(1));
        assert!(transport.get_transaction().is_none());
    }

    #[test]
    fn broadcasts_land_in_the_outbox() {
        let transport = ChannelTransport::new();
        transport.broadcast_transaction(tx(0));
        transport.answer_tx_pool_query(vec![tx(1)]);
        let out = transport.drain_outbox();
        assert_eq!(out.len(), 2);
        assert!(matches!(out[0], NetMessage::Tx(_)));
        assert!(matches!(out[1], NetMessage::TxPoolAnswer(_)));
    }
}
