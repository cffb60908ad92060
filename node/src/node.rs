//! The node's processing loop: a fixed set of independent stages runs per
//! cycle, and a failing stage is logged without stopping the others.

use crate::config::ConsensusSection;
use crate::keystore::Identity;
use crate::transport::Transport;
use anyhow::{Context, Result};
use lipchain_chain::{ChainService, PendingOutcome};
use lipchain_consensus::{ConsensusEngine, DkgRound};
use lipchain_types::{Block, DkgShare, ValidatorKeyMsg};
use std::collections::BTreeMap;
use std::sync::Arc;
use threshold_crypto::serde_impl::SerdeSecret;
use threshold_crypto::{PublicKey, PublicKeySet, SecretKeyShare, Signature};
use tracing::{debug, info, warn};

pub struct Node {
    identity: Identity,
    consensus_cfg: ConsensusSection,
    service: ChainService,
    engine: ConsensusEngine,
    transport: Arc<dyn Transport>,
    dkg_round: Option<DkgRound>,
    /// Last time the deferred-transaction queue was drained.
    last_time_queue: Option<u64>,
    /// Group signatures recovered from collected partials, by height.
    group_seals: BTreeMap<u64, Signature>,
}

impl Node {
    pub fn new(
        identity: Identity,
        consensus_cfg: ConsensusSection,
        service: ChainService,
        engine: ConsensusEngine,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Node {
            identity,
            consensus_cfg,
            service,
            engine,
            transport,
            dkg_round: None,
            last_time_queue: None,
            group_seals: BTreeMap::new(),
        }
    }

    pub fn service(&self) -> &ChainService {
        &self.service
    }

    pub fn engine(&self) -> &ConsensusEngine {
        &self.engine
    }

    /// The validator that deals the group secret: lowest DKG index.
    fn dealer_id(&self) -> Option<u64> {
        self.consensus_cfg.validator_ids.iter().min().copied()
    }

    /// Initialize keys, register the local validator, announce its key to
    /// peers, compute the first signer assignment, and open the initial
    /// DKG round.
    pub fn bootstrap(&mut self, now: u64) -> Result<()> {
        self.engine.backend().initialize()?;
        let key = self.engine.backend().public_key()?;
        self.engine.register_validator(self.identity.address, key);
        self.announce_own_key()?;
        self.assign_next_signer()?;

        if let Some(dealer) = self.dealer_id() {
            self.dkg_round = Some(DkgRound::new(
                self.consensus_cfg.threshold,
                vec![dealer],
                now,
            ));
            if dealer == self.consensus_cfg.validator_id {
                self.deal_group_secret(dealer)?;
            }
        }
        info!(address = %self.identity.address, "node bootstrapped");
        Ok(())
    }

    /// One pass over all stages. A stage failure is logged and the
    /// remaining stages still run.
    pub fn run_cycle(&mut self, now: u64) {
        if let Err(err) = self.process_validator_announcements() {
            warn!(stage = "validator_keys", error = %err, "stage failed");
        }
        if let Err(err) = self.process_incoming_blocks() {
            warn!(stage = "blocks", error = %err, "stage failed");
        }
        if let Err(err) = self.drain_time_queue(now) {
            warn!(stage = "time_queue", error = %err, "stage failed");
        }
        if let Err(err) = self.process_incoming_transactions(now) {
            warn!(stage = "transactions", error = %err, "stage failed");
        }
        if let Err(err) = self.answer_block_queries() {
            warn!(stage = "block_queries", error = %err, "stage failed");
        }
        if let Err(err) = self.answer_pool_queries() {
            warn!(stage = "pool_queries", error = %err, "stage failed");
        }
        if let Err(err) = self.process_shares(now) {
            warn!(stage = "shares", error = %err, "stage failed");
        }
        if let Err(err) = self.produce_block(now) {
            warn!(stage = "signing", error = %err, "stage failed");
        }
    }

    fn assign_next_signer(&mut self) -> Result<()> {
        let owners = self.service.ip_owners()?;
        let head = self.service.head().clone();
        self.engine
            .assign_signer(head.number() + 1, &owners, head.header.timestamp)?;
        Ok(())
    }

    fn announce_own_key(&self) -> Result<()> {
        let key = self.engine.backend().public_key()?;
        self.transport.announce_validator_key(ValidatorKeyMsg {
            address: self.identity.address,
            public_key: bincode::serialize(&key)?,
        });
        Ok(())
    }

    /// Register peer sealing keys as they are announced. A newly learned
    /// peer gets our own key announced back, so two nodes that started in
    /// either order end up knowing each other.
    fn process_validator_announcements(&mut self) -> Result<()> {
        while let Some(msg) = self.transport.get_validator_key() {
            if msg.address == self.identity.address || self.engine.known_validator(msg.address) {
                continue;
            }
            let key: PublicKey = match bincode::deserialize(&msg.public_key) {
                Ok(key) => key,
                Err(err) => {
                    warn!(address = %msg.address, error = %err, "dropping undecodable validator key");
                    continue;
                }
            };
            self.engine.register_validator(msg.address, key);
            info!(address = %msg.address, "validator key registered");
            self.announce_own_key()?;
        }
        Ok(())
    }

    fn process_incoming_blocks(&mut self) -> Result<()> {
        while let Some(block) = self.transport.get_block() {
            let height = block.number();
            if let Err(err) = self.engine.verify_block(&block) {
                warn!(height, error = %err, "rejecting block: bad signer or signature");
                self.engine.reject_block(height);
                continue;
            }
            if let Err(err) = self.service.add_block(&block) {
                warn!(height, error = %err, "rejecting block: ledger validation failed");
                self.engine.reject_block(height);
                continue;
            }
            self.engine.accept_block(height);
            if let Err(err) = self.co_sign_block(&block) {
                debug!(height, error = %err, "could not co-sign accepted block");
            }
            self.assign_next_signer()?;
        }
        Ok(())
    }

    /// Drain the deferred-transaction queue on the configured interval so
    /// matured transactions reach the pool on every node, signer or not.
    fn drain_time_queue(&mut self, now: u64) -> Result<()> {
        let interval = self.service.chain().config().time_queue_interval_secs;
        let due = self
            .last_time_queue
            .map_or(true, |last| now.saturating_sub(last) >= interval);
        if due {
            self.service.process_time_queue(now);
            self.last_time_queue = Some(now);
        }
        Ok(())
    }

    fn process_incoming_transactions(&mut self, now: u64) -> Result<()> {
        while let Some(tx) = self.transport.get_transaction() {
            let hash = tx.hash();
            match self.service.add_pending_transaction(tx.clone(), now) {
                Ok(PendingOutcome::Queued) => {
                    self.transport.broadcast_transaction(tx);
                }
                Ok(PendingOutcome::Deferred) => {
                    debug!(hash = %hex::encode(hash), "transaction deferred");
                }
                Err(err) => {
                    debug!(hash = %hex::encode(hash), error = %err, "transaction dropped");
                }
            }
        }
        Ok(())
    }

    fn answer_block_queries(&mut self) -> Result<()> {
        while let Some(heights) = self.transport.get_block_queries() {
            let mut blocks = Vec::with_capacity(heights.len());
            for height in heights {
                if let Some(block) = self.service.get_block_by_number(height)? {
                    blocks.push(block);
                }
            }
            self.transport.answer_block_queries(blocks);
        }
        Ok(())
    }

    fn answer_pool_queries(&mut self) -> Result<()> {
        while self.transport.tx_pool_query() {
            self.transport
                .answer_tx_pool_query(self.service.get_pending_transactions().to_vec());
        }
        Ok(())
    }

    fn process_shares(&mut self, now: u64) -> Result<()> {
        while let Some(msg) = self.transport.get_share() {
            let height = msg.height;
            self.engine.add_signature_share(&msg);
            if let Some(block) = self.service.get_block_by_number(height)? {
                self.try_group_seal(height, &block.header.signing_bytes());
            }
        }
        while let Some(share) = self.transport.get_dkg_share() {
            if share.recipient != self.consensus_cfg.validator_id {
                continue;
            }
            self.install_dkg_share(&share)?;
        }

        // an unanswered round is abandoned; the dealer deals again
        let timeout = self.consensus_cfg.dkg_timeout_secs;
        let expired = self
            .dkg_round
            .as_ref()
            .is_some_and(|round| round.expired(now, timeout));
        if expired {
            warn!("DKG round timed out, restarting");
            if let Some(dealer) = self.dealer_id() {
                self.dkg_round = Some(DkgRound::new(
                    self.consensus_cfg.threshold,
                    vec![dealer],
                    now,
                ));
                if dealer == self.consensus_cfg.validator_id {
                    self.deal_group_secret(dealer)?;
                }
            }
        }
        Ok(())
    }

    fn install_dkg_share(&mut self, share: &DkgShare) -> Result<()> {
        let secret: SerdeSecret<SecretKeyShare> =
            bincode::deserialize(&share.secret_share).context("decoding DKG secret share")?;
        let public_set: PublicKeySet =
            bincode::deserialize(&share.public_set).context("decoding DKG public key set")?;
        let accepted = self
            .dkg_round
            .as_mut()
            .map(|round| round.accept(share.dealer, secret.0.clone()))
            .unwrap_or(false);
        if accepted {
            self.engine
                .install_group(public_set, self.consensus_cfg.validator_id, secret.0);
            info!(dealer = share.dealer, "DKG share installed");
        }
        Ok(())
    }

    /// Deal a fresh group secret to the validator set; the dealer keeps its
    /// own share and sends the rest over the wire.
    fn deal_group_secret(&mut self, dealer: u64) -> Result<()> {
        let ids = self.consensus_cfg.validator_ids.clone();
        let deal = self
            .engine
            .deal_shares(self.consensus_cfg.threshold, &ids)?;
        let public_set = bincode::serialize(&deal.public_set)?;
        for dealt in &deal.shares {
            if dealt.id == self.consensus_cfg.validator_id {
                if let Some(round) = self.dkg_round.as_mut() {
                    round.accept(dealer, dealt.secret.0.clone());
                }
                self.engine.install_group(
                    deal.public_set.clone(),
                    dealt.id,
                    dealt.secret.0.clone(),
                );
                continue;
            }
            self.transport.send_dkg_share(
                dealt.id,
                DkgShare {
                    dealer,
                    recipient: dealt.id,
                    secret_share: bincode::serialize(&dealt.secret)?,
                    public_share: bincode::serialize(&dealt.public)?,
                    public_set: public_set.clone(),
                },
            );
        }
        info!(participants = deal.shares.len(), "group secret dealt");
        Ok(())
    }

    /// Contribute this node's partial signature over an accepted block's
    /// header and attempt group recovery from what has been collected.
    fn co_sign_block(&mut self, block: &Block) -> Result<()> {
        if !self.engine.has_group() {
            return Ok(());
        }
        let height = block.number();
        let header_bytes = block.header.signing_bytes();
        let msg = self.engine.sign_share(height, &header_bytes)?;
        self.engine.add_signature_share(&msg);
        self.transport.broadcast_share(msg);
        self.try_group_seal(height, &header_bytes);
        Ok(())
    }

    fn try_group_seal(&mut self, height: u64, header_bytes: &[u8]) {
        if self.group_seals.contains_key(&height) {
            return;
        }
        match self.engine.try_recover(height, header_bytes) {
            Ok(signature) => {
                info!(height, "group signature recovered");
                self.group_seals.insert(height, signature);
            }
            Err(err) => debug!(height, error = %err, "group signature not yet recoverable"),
        }
    }

    /// The recovered group signature for a committed height, if enough
    /// partials have arrived.
    pub fn group_signature(&self, height: u64) -> Option<&Signature> {
        self.group_seals.get(&height)
    }

    /// If this node is the designated signer, build, seal, accept, and
    /// broadcast a block for the next height.
    fn produce_block(&mut self, now: u64) -> Result<()> {
        let (mine, signer) = self.engine.am_i_signer(self.identity.address)?;
        if !mine {
            debug!(signer = %signer, "not the designated signer");
            return Ok(());
        }

        let mut block = self.service.create_block(self.identity.address, now)?;
        if block.transactions.is_empty() {
            return Ok(());
        }
        self.engine.seal_block(&mut block)?;
        let height = block.number();
        self.engine.verify_block(&block)?;
        self.service.add_block(&block)?;
        self.engine.accept_block(height);
        if let Err(err) = self.co_sign_block(&block) {
            debug!(height, error = %err, "could not co-sign own block");
        }
        self.transport.broadcast_block(block);
        self.assign_next_signer()?;
        info!(height, "sealed and broadcast block");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{ChannelTransport, NetMessage};
    use ed25519_dalek::SigningKey;
    use lipchain_chain::{Chain, GenesisAlloc, MemoryChainStore};
    use lipchain_consensus::BlsSigner;
    use lipchain_trie::MemoryNodeStore;
    use lipchain_types::{Address, ChainConfig, IpRange, Transaction, TxIntent};

    fn identity(seed: u8) -> Identity {
        let signing_key = SigningKey::from_bytes(&[seed; 32]);
        let address = Address::from_pubkey(&signing_key.verifying_key().to_bytes());
        Identity {
            address,
            signing_key,
        }
    }

    fn build_node(
        seed: u8,
        allocs: &[GenesisAlloc],
        config: ChainConfig,
        transport: Arc<ChannelTransport>,
    ) -> Node {
        let identity = identity(seed);
        let chain = Chain::new(
            Arc::new(MemoryChainStore::new()),
            Arc::new(MemoryNodeStore::new()),
            config,
            allocs,
        )
        .unwrap();
        let service = ChainService::new(chain);
        let engine = ConsensusEngine::new(Arc::new(BlsSigner::new()));
        let cfg = ConsensusSection {
            validator_id: 1,
            threshold: 1,
            validator_ids: vec![1],
            dkg_timeout_secs: 60,
        };
        Node::new(identity, cfg, service, engine, transport)
    }

    fn node_with_owner(seed: u8, transport: Arc<ChannelTransport>) -> Node {
        let allocs = [GenesisAlloc::new(
            identity(seed).address,
            vec![IpRange::from_cidr("10.0.0.0/24").unwrap()],
        )];
        build_node(seed, &allocs, ChainConfig::default(), transport)
    }

    #[test]
    fn sole_owner_seals_a_block_from_gossip() {
        let transport = ChannelTransport::new();
        let mut node = node_with_owner(1, Arc::clone(&transport));
        node.bootstrap(100).unwrap();

        let mut tx = Transaction::new(
            0,
            TxIntent::Transfer {
                range: IpRange::from_cidr("10.0.0.0/25").unwrap(),
            },
            Address([9u8; 20]),
            50,
        );
        tx.sign(&node.identity.signing_key);
        transport.push(NetMessage::Tx(tx));

        node.run_cycle(100);

        assert_eq!(node.service().head().number(), 1);
        let out = transport.drain_outbox();
        assert!(out
            .iter()
            .any(|msg| matches!(msg, NetMessage::Block(block) if block.number() == 1)));
        // the accepted transaction was re-gossiped before sealing
        assert!(out.iter().any(|msg| matches!(msg, NetMessage::Tx(_))));
    }

    #[test]
    fn invalid_transaction_does_not_stop_the_cycle() {
        let transport = ChannelTransport::new();
        let mut node = node_with_owner(2, Arc::clone(&transport));
        node.bootstrap(100).unwrap();

        // unsigned: dropped at validation
        transport.push(NetMessage::Tx(Transaction::new(
            0,
            TxIntent::Transfer {
                range: IpRange::from_cidr("10.0.0.0/24").unwrap(),
            },
            Address([9u8; 20]),
            50,
        )));
        transport.push(NetMessage::TxPoolQuery);

        node.run_cycle(100);

        // later stage still answered the pool query
        let out = transport.drain_outbox();
        assert!(out
            .iter()
            .any(|msg| matches!(msg, NetMessage::TxPoolAnswer(txs) if txs.is_empty())));
        assert_eq!(node.service().head().number(), 0);
    }

    #[test]
    fn answers_block_queries_for_known_heights() {
        let transport = ChannelTransport::new();
        let mut node = node_with_owner(3, Arc::clone(&transport));
        node.bootstrap(100).unwrap();

        transport.push(NetMessage::BlockQuery(vec![0, 7]));
        node.run_cycle(100);

        let out = transport.drain_outbox();
        let answer = out
            .iter()
            .find_map(|msg| match msg {
                NetMessage::BlockAnswer(blocks) => Some(blocks),
                _ => None,
            })
            .expect("block answer sent");
        // height 7 does not exist yet, only genesis comes back
        assert_eq!(answer.len(), 1);
        assert_eq!(answer[0].number(), 0);
    }

    #[test]
    fn foreign_block_with_unknown_signer_is_rejected() {
        let transport = ChannelTransport::new();
        let mut node = node_with_owner(4, Arc::clone(&transport));
        node.bootstrap(100).unwrap();
        let head_before = node.service().head().hash();

        // a block claiming a coinbase that was never assigned
        let mut other = node_with_owner(5, ChannelTransport::new());
        other.bootstrap(100).unwrap();
        let foreign = other.service.create_block(other.identity.address, 100).unwrap();
        transport.push(NetMessage::Block(foreign));

        node.run_cycle(100);
        assert_eq!(node.service().head().hash(), head_before);
    }

    #[test]
    fn dealer_installs_its_own_group_share() {
        let transport = ChannelTransport::new();
        let mut node = node_with_owner(6, Arc::clone(&transport));
        node.bootstrap(100).unwrap();
        assert!(node.engine().has_group());
    }

    #[test]
    fn announced_peer_key_verifies_foreign_block() {
        let t_producer = ChannelTransport::new();
        let t_observer = ChannelTransport::new();
        // both nodes share a genesis where the producer owns the range
        let owner = identity(7);
        let allocs = [GenesisAlloc::new(
            owner.address,
            vec![IpRange::from_cidr("10.0.0.0/24").unwrap()],
        )];
        let mut producer = build_node(7, &allocs, ChainConfig::default(), Arc::clone(&t_producer));
        let mut observer = build_node(8, &allocs, ChainConfig::default(), Arc::clone(&t_observer));
        producer.bootstrap(100).unwrap();
        observer.bootstrap(100).unwrap();

        // carry the producer's key announcement over to the observer
        for msg in t_producer.drain_outbox() {
            if matches!(msg, NetMessage::ValidatorKey(_)) {
                t_observer.push(msg);
            }
        }
        observer.run_cycle(100);
        assert!(observer.engine().known_validator(owner.address));
        t_observer.drain_outbox();

        let mut tx = Transaction::new(
            0,
            TxIntent::Transfer {
                range: IpRange::from_cidr("10.0.0.0/25").unwrap(),
            },
            Address([9u8; 20]),
            50,
        );
        tx.sign(&owner.signing_key);
        t_producer.push(NetMessage::Tx(tx));
        producer.run_cycle(100);
        assert_eq!(producer.service().head().number(), 1);

        // the observer accepts the sealed foreign block
        for msg in t_producer.drain_outbox() {
            if matches!(msg, NetMessage::Block(_)) {
                t_observer.push(msg);
            }
        }
        observer.run_cycle(100);
        assert_eq!(observer.service().head().number(), 1);
    }

    #[test]
    fn matured_deferred_transaction_reaches_the_pool_without_sealing() {
        let transport = ChannelTransport::new();
        // the range owner is not this node, so it never becomes the signer
        let owner = identity(9);
        let allocs = [GenesisAlloc::new(
            owner.address,
            vec![IpRange::from_cidr("10.0.0.0/24").unwrap()],
        )];
        let config = ChainConfig {
            time_queue_interval_secs: 30,
            ..ChainConfig::default()
        };
        let mut node = build_node(10, &allocs, config, Arc::clone(&transport));
        node.bootstrap(100).unwrap();

        let mut tx = Transaction::new(
            0,
            TxIntent::Transfer {
                range: IpRange::from_cidr("10.0.0.0/25").unwrap(),
            },
            Address([9u8; 20]),
            150,
        );
        tx.sign(&owner.signing_key);
        transport.push(NetMessage::Tx(tx));

        node.run_cycle(100);
        assert!(node.service().get_pending_transactions().is_empty());
        assert_eq!(node.service().chain().deferred_len(), 1);

        node.run_cycle(200);
        assert_eq!(node.service().get_pending_transactions().len(), 1);
        assert_eq!(node.service().chain().deferred_len(), 0);
        assert_eq!(node.service().head().number(), 0);
    }

    #[test]
    fn accepted_block_is_co_signed_and_group_sealed() {
        let transport = ChannelTransport::new();
        let mut node = node_with_owner(11, Arc::clone(&transport));
        node.bootstrap(100).unwrap();
        assert!(node.engine().has_group());

        let mut tx = Transaction::new(
            0,
            TxIntent::Transfer {
                range: IpRange::from_cidr("10.0.0.0/25").unwrap(),
            },
            Address([9u8; 20]),
            50,
        );
        tx.sign(&node.identity.signing_key);
        transport.push(NetMessage::Tx(tx));
        node.run_cycle(100);

        assert_eq!(node.service().head().number(), 1);
        // sole validator with threshold 1: its own partial completes the
        // group signature and the partial went out over the wire
        assert!(node.group_signature(1).is_some());
        let out = transport.drain_outbox();
        assert!(out
            .iter()
            .any(|msg| matches!(msg, NetMessage::Share(share) if share.height == 1)));
    }
}
