//! Node runtime: mempool, identity, dedup bookkeeping, and the wiring
//! between the ledger, the network transport, and a consensus engine.
//! See `original_source/blockchain_sim/core/node.py`.

pub mod adversarial;

use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, OnceLock};

use serde_json::Value;
use tokio::sync::Mutex;

use crate::config::MaliciousBehaviorConfig;
use crate::crypto::Keypair;
use crate::identity::{IdentityRegistry, NodeId};
use crate::ledger::{Block, Ledger, Sender as TxSender, Transaction};
use crate::monitoring::MonitoringSink;
use crate::network::{MessageSink, Network, PeerInfo};
use crate::time::now_secs;

const REPLAY_QUEUE_CAPACITY: usize = 50;

/// A consensus engine this node can hand `*_message` envelopes to. Kept
/// dyn-compatible (hand-rolled boxed futures, matching the pattern the
/// ecosystem used before native async-fn-in-trait supported `dyn`) so
/// `Node` stays agnostic to which algorithm (PBFT/PoA/PoS) is attached.
pub trait ConsensusEngine: Send + Sync {
    fn receive_message<'a>(
        &'a self,
        payload: Value,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>>;
}

/// Mutable node state guarded by a single lock: the ledger, the mempool,
/// dedup sets, and the withheld-block slot. One lock for all of it closes
/// the concurrency hazard the source leaves open, where interleaved
/// `add_block`/mempool writes from different connection threads could
/// race (see the design note this resolves).
struct NodeState {
    ledger: Ledger,
    mempool: Vec<Transaction>,
    seen_transaction_hashes: HashSet<String>,
    seen_block_hashes: HashSet<String>,
    withheld_block: Option<Block>,
    replay_queue: VecDeque<Transaction>,
}

impl NodeState {
    fn new() -> Self {
        Self {
            ledger: Ledger::new(),
            mempool: Vec::new(),
            seen_transaction_hashes: HashSet::new(),
            seen_block_hashes: HashSet::new(),
            withheld_block: None,
            replay_queue: VecDeque::new(),
        }
    }
}

/// A simulated participant: identity, ledger, mempool, and the network
/// and consensus handles wired in after construction.
pub struct Node {
    pub node_id: NodeId,
    state: Mutex<NodeState>,
    keypair: Keypair,
    identities: IdentityRegistry,
    peers: Vec<PeerInfo>,
    listen_ip: String,
    listen_port: u16,
    monitoring: Arc<dyn MonitoringSink>,
    network: OnceLock<Network<Arc<Node>>>,
    consensus: OnceLock<Arc<dyn ConsensusEngine>>,
    behavior: MaliciousBehaviorConfig,
}

impl Node {
    /// Builds a node, generating a fresh keypair and registering its own
    /// public key under its own id, matching `Node.__init__`.
    pub fn new(
        node_id: NodeId,
        listen_ip: String,
        listen_port: u16,
        peers: Vec<PeerInfo>,
        monitoring: Arc<dyn MonitoringSink>,
        behavior: MaliciousBehaviorConfig,
    ) -> Arc<Self> {
        let keypair = Keypair::generate();
        let identities = IdentityRegistry::new();
        identities.register(node_id, keypair.public_key_pem());

        Arc::new(Self {
            node_id,
            state: Mutex::new(NodeState::new()),
            keypair,
            identities,
            peers,
            listen_ip,
            listen_port,
            monitoring,
            network: OnceLock::new(),
            consensus: OnceLock::new(),
            behavior,
        })
    }

    pub fn public_key_pem(&self) -> String {
        self.keypair.public_key_pem()
    }

    pub fn keypair(&self) -> &Keypair {
        &self.keypair
    }

    /// Records a peer's public key, learned out-of-band before consensus
    /// begins (mirrors the simulation driver's pubkey exchange pass).
    /// Backed by [`IdentityRegistry`], the system's actual pubkey registry.
    pub fn learn_public_key(&self, node_id: NodeId, pem: String) {
        self.identities.register(node_id, pem);
    }

    pub fn public_key_of(&self, node_id: NodeId) -> Option<String> {
        self.identities.get_public_key(node_id)
    }

    /// Current chain tip index, used by consensus engines to detect
    /// gaps and forks without reaching into the ledger directly.
    pub async fn current_tip_index(&self) -> u64 {
        self.state.lock().await.ledger.tip().index
    }

    pub async fn tip_hash(&self) -> String {
        self.state.lock().await.ledger.tip().hash.clone()
    }

    /// Starts the TCP transport for this node. Must be called on an
    /// `Arc<Node>` since the network holds a clone of it to dispatch
    /// inbound messages back.
    pub async fn start_network(
        self: &Arc<Self>,
        attack_config: crate::config::AttackConfig,
        socket_timeout: std::time::Duration,
    ) -> Result<(), crate::error::CoreError> {
        let network = Network::new(
            self.node_id,
            self.clone(),
            self.peers.clone(),
            self.listen_ip.clone(),
            self.listen_port,
            attack_config,
            socket_timeout,
        )
        .with_monitoring(self.monitoring.clone());
        network.start().await?;
        let _ = self.network.set(network);
        Ok(())
    }

    pub fn attach_consensus(&self, consensus: Arc<dyn ConsensusEngine>) {
        let _ = self.consensus.set(consensus);
    }

    pub fn network(&self) -> Option<&Network<Arc<Self>>> {
        self.network.get()
    }

    pub async fn update_network_config(&self, update: crate::config::NetworkConfig) {
        if let Some(network) = self.network.get() {
            network.update_network_config(update).await;
        }
    }

    /// Creates a transaction from this node, broadcasting it to peers if
    /// the network is attached. Returns `None` if a colliding hash is
    /// already known (two transactions built in the same instant with
    /// identical fields hash identically).
    pub async fn create_transaction(&self, receiver: NodeId, amount: u64) -> Option<Transaction> {
        let tx = Transaction::new(TxSender::Node(self.node_id), receiver, amount, now_secs());
        {
            let mut state = self.state.lock().await;
            if state.seen_transaction_hashes.contains(&tx.tx_hash) {
                return None;
            }
            state.seen_transaction_hashes.insert(tx.tx_hash.clone());
            state.mempool.push(tx.clone());
        }

        self.monitoring
            .record_message(self.node_id, "transaction", 1, 0, 0, 0);

        if let Some(network) = self.network.get() {
            let payload = serde_json::to_value(&tx).expect("Transaction always serializes");
            network.broadcast_transaction(payload).await;
        }
        Some(tx)
    }

    /// Core transaction-intake path, shared by honest and adversarial
    /// nodes (adversarial replay happens before this, in
    /// [`adversarial::maybe_replay_transaction`]).
    async fn ingest_transaction(&self, tx: Transaction) {
        let mut state = self.state.lock().await;
        if state.seen_transaction_hashes.contains(&tx.tx_hash) {
            self.monitoring
                .record_message(self.node_id, "transaction", 0, 0, 1, 0);
            tracing::debug!(node_id = self.node_id, tx_hash = %tx.tx_hash, "ignored replayed transaction");
            self.monitoring.record_trade_failure(self.node_id, 1);
            return;
        }

        state.seen_transaction_hashes.insert(tx.tx_hash.clone());
        if !state.mempool.iter().any(|t| t.tx_hash == tx.tx_hash) {
            state.mempool.push(tx.clone());
            drop(state);
            self.monitoring
                .record_message(self.node_id, "transaction", 0, 1, 0, 0);
            tracing::debug!(node_id = self.node_id, "transaction received and added to mempool");
            self.monitoring.record_trade_success(self.node_id, 1);
        }

        if self.behavior.replay_attack {
            let mut state = self.state.lock().await;
            if state.replay_queue.len() >= REPLAY_QUEUE_CAPACITY {
                state.replay_queue.pop_front();
            }
            state.replay_queue.push_back(tx);
        }
    }

    async fn receive_transaction_inner(&self, payload: Value) {
        let tx: Transaction = match serde_json::from_value(payload) {
            Ok(tx) => tx,
            Err(e) => {
                tracing::warn!(node_id = self.node_id, error = %e, "malformed transaction payload");
                return;
            }
        };

        if self.behavior.replay_attack {
            adversarial::maybe_replay_transaction(self).await;
        }

        self.ingest_transaction(tx).await;
    }

    /// Mines a block from the current mempool. `withhold` mirrors the
    /// source's same-named flag: when set, the block is built but not
    /// admitted to the ledger, for later release via
    /// [`Node::release_withheld_block`]. If this node's behavior flags
    /// request conflicting blocks, `withhold` is ignored in favor of
    /// [`Node::create_conflicting_blocks`].
    pub async fn create_block(&self, nonce: u64, withhold: bool) -> Option<Block> {
        if self.behavior.send_conflicting_blocks {
            return self.create_conflicting_blocks(nonce).await;
        }

        let start = now_secs();
        let mut state = self.state.lock().await;
        if state.mempool.is_empty() {
            return None;
        }

        let pending = state.mempool.clone();
        state.ledger.set_pending_transactions(pending);
        let block = state.ledger.mine_pending(self.node_id, nonce, !withhold, now_secs());

        if withhold {
            state.withheld_block = Some(block.clone());
            tracing::info!(node_id = self.node_id, "withholding newly mined block");
            return Some(block);
        }

        state.withheld_block = None;
        drop(state);

        self.monitoring.record_block_produced(self.node_id, block.index);
        self.monitoring.record_latency(self.node_id, now_secs() - start);
        Some(block)
    }

    /// Mines one block, fabricates a conflicting sibling for it, and
    /// broadcasts both directly (bypassing the normal
    /// mine-then-let-the-caller-broadcast flow), clearing the mempool
    /// unconditionally afterward. Matches `MaliciousNode.create_block`'s
    /// `send_conflicting_blocks` branch.
    async fn create_conflicting_blocks(&self, nonce: u64) -> Option<Block> {
        let mut state = self.state.lock().await;
        if state.mempool.is_empty() {
            return None;
        }
        let pending = state.mempool.clone();
        state.ledger.set_pending_transactions(pending);
        let original = state.ledger.mine_pending(self.node_id, nonce, true, now_secs());
        let conflicting = adversarial::generate_conflicting_block(&original);
        state.mempool.clear();
        drop(state);

        if let Some(network) = self.network.get() {
            let original_payload = serde_json::to_value(&original).expect("Block always serializes");
            let conflicting_payload = serde_json::to_value(&conflicting).expect("Block always serializes");
            network.broadcast_block(original_payload).await;
            network.broadcast_block(conflicting_payload).await;
        }
        tracing::warn!(node_id = self.node_id, block_index = original.index, "broadcast conflicting blocks");
        self.monitoring.record_block_produced(self.node_id, original.index);
        Some(original)
    }

    /// Broadcasts a previously withheld block, if any, then forgets it.
    pub async fn release_withheld_block(&self) {
        let block = {
            let mut state = self.state.lock().await;
            state.withheld_block.take()
        };
        if let Some(block) = block {
            if let Some(network) = self.network.get() {
                let payload = serde_json::to_value(&block).expect("Block always serializes");
                network.broadcast_block(payload).await;
                tracing::info!(node_id = self.node_id, block_index = block.index, "released withheld block");
            }
        }
    }

    /// Admits a block delivered by consensus (as opposed to the raw
    /// `"block"` wire message), returning whether it was accepted. Used
    /// by `PbftConsensus::receive_message`'s COMMIT-quorum path, which
    /// needs to know whether to finish its round timer as a success.
    pub async fn receive_block_from_consensus(&self, payload: Value) -> bool {
        self.receive_block_inner(payload).await
    }

    async fn receive_block_inner(&self, payload: Value) -> bool {
        if self.behavior.ignore_consensus_messages {
            tracing::debug!(node_id = self.node_id, "ignored incoming block for attack");
            return false;
        }

        #[derive(serde::Deserialize)]
        struct WireBlock {
            index: u64,
            previous_hash: String,
            transactions: Vec<Transaction>,
            timestamp: f64,
            nonce: u64,
            hash: String,
        }
        let wire: WireBlock = match serde_json::from_value(payload) {
            Ok(w) => w,
            Err(e) => {
                tracing::warn!(node_id = self.node_id, error = %e, "malformed block payload");
                return false;
            }
        };

        let mut state = self.state.lock().await;
        if state.seen_block_hashes.contains(&wire.hash) {
            self.monitoring
                .record_message(self.node_id, "block", 0, 0, 1, 0);
            tracing::debug!(node_id = self.node_id, hash = %wire.hash, "ignored replayed block");
            return false;
        }
        state.seen_block_hashes.insert(wire.hash.clone());

        let block = Block::from_wire(
            wire.index,
            wire.previous_hash,
            wire.transactions,
            wire.timestamp,
            wire.nonce,
            wire.hash,
        );

        if !state.ledger.add_block(block.clone()) {
            tracing::warn!(node_id = self.node_id, block_index = block.index, "add_block failed validation");
            return false;
        }

        let tx_hashes: HashSet<String> = block.transactions.iter().map(|t| t.tx_hash.clone()).collect();
        state.mempool.retain(|t| !tx_hashes.contains(&t.tx_hash));
        drop(state);

        self.monitoring.record_message(self.node_id, "block", 0, 1, 0, 0);
        self.monitoring.record_block_committed(self.node_id, block.index);
        tracing::info!(
            node_id = self.node_id,
            block_index = block.index,
            tx_count = block.transactions.len(),
            "block added to blockchain"
        );

        let confirmation_time = now_secs();
        for tx_hash in &tx_hashes {
            self.monitoring
                .record_trade_confirmation(self.node_id, tx_hash, confirmation_time);
        }
        true
    }

    async fn handle_sync_request_inner(&self, payload: Value, requester_id: NodeId) {
        let start = payload.get("start").and_then(Value::as_u64);
        let end = payload.get("end").and_then(Value::as_u64);
        let (Some(start), Some(end)) = (start, end) else {
            return;
        };

        let blocks_to_send: Vec<Block> = {
            let state = self.state.lock().await;
            let chain = state.ledger.chain();
            (start..=end)
                .map_while(|i| chain.get(i as usize).cloned())
                .collect()
        };

        if !blocks_to_send.is_empty() {
            if let Some(network) = self.network.get() {
                self.monitoring.record_sync_event(
                    self.node_id,
                    &format!("Sending {} blocks to Node {}", blocks_to_send.len(), requester_id),
                );
                let payload = serde_json::to_value(&blocks_to_send).expect("blocks always serialize");
                network.send_sync_response(requester_id, payload).await;
            }
        }
    }

    async fn handle_sync_response_inner(&self, payload: Value) {
        let blocks: Vec<Value> = match serde_json::from_value(payload) {
            Ok(blocks) => blocks,
            Err(_) => return,
        };
        self.monitoring
            .record_sync_event(self.node_id, &format!("Received sync response with {} blocks", blocks.len()));

        for block_value in blocks {
            let current_height = {
                let state = self.state.lock().await;
                state.ledger.tip().index
            };
            let Some(index) = block_value.get("index").and_then(Value::as_u64) else {
                continue;
            };
            if index == current_height + 1 {
                self.receive_block_inner(block_value).await;
            }
            // index <= current_height: already have it, skip.
            // index > current_height + 1: gap, deferred rather than buffered.
        }
    }

}

impl MessageSink for Arc<Node> {
    async fn receive_transaction(&self, payload: Value) {
        Node::receive_transaction_inner(self, payload).await;
    }

    async fn receive_block(&self, payload: Value) {
        Node::receive_block_inner(self, payload).await;
    }

    async fn handle_sync_request(&self, payload: Value, sender_id: NodeId) {
        Node::handle_sync_request_inner(self, payload, sender_id).await;
    }

    async fn handle_sync_response(&self, payload: Value) {
        Node::handle_sync_response_inner(self, payload).await;
    }

    async fn receive_consensus_message(&self, _kind: &str, payload: Value) {
        if let Some(consensus) = self.consensus.get() {
            consensus.receive_message(payload).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitoring::{AlertSeverity, Direction, TracingMonitor};
    use std::sync::atomic::{AtomicU64, Ordering};

    fn test_node(node_id: NodeId) -> Arc<Node> {
        Node::new(
            node_id,
            "127.0.0.1".to_string(),
            0,
            Vec::new(),
            Arc::new(TracingMonitor::new()),
            MaliciousBehaviorConfig::default(),
        )
    }

    #[derive(Default)]
    struct CountingMonitor {
        trade_success: AtomicU64,
        trade_failure: AtomicU64,
        trade_confirmations: AtomicU64,
    }

    impl MonitoringSink for CountingMonitor {
        fn record_block_committed(&self, _node_id: NodeId, _block_index: u64) {}
        fn record_block_produced(&self, _node_id: NodeId, _block_index: u64) {}
        fn record_pbft_prepare(&self, _node_id: NodeId, _block_index: u64, _quorum: bool) {}
        fn record_pbft_commit(&self, _node_id: NodeId, _block_index: u64, _quorum: bool) {}
        fn record_sync_event(&self, _node_id: NodeId, _event_info: &str) {}
        fn record_p2p_event(&self, _node_id: NodeId, _peer_id: NodeId, _msg_type: &str, _direction: Direction) {}
        fn record_message(&self, _node_id: NodeId, _msg_type: &str, _sent: u64, _recv: u64, _dropped: u64, _bytes_count: u64) {}
        fn record_latency(&self, _node_id: NodeId, _latency_seconds: f64) {}
        fn record_trade_success(&self, _node_id: NodeId, count: u64) {
            self.trade_success.fetch_add(count, Ordering::SeqCst);
        }
        fn record_trade_failure(&self, _node_id: NodeId, count: u64) {
            self.trade_failure.fetch_add(count, Ordering::SeqCst);
        }
        fn record_trade_confirmation(&self, _node_id: NodeId, _tx_hash: &str, _confirmation_time: f64) {
            self.trade_confirmations.fetch_add(1, Ordering::SeqCst);
        }
        fn record_fork_event(&self, _node_id: NodeId, _fork_info: &str) {}
        fn raise_alert(&self, _node_id: NodeId, _message: &str, _severity: AlertSeverity) {}
    }

    fn counting_node(node_id: NodeId) -> (Arc<Node>, Arc<CountingMonitor>) {
        let monitoring = Arc::new(CountingMonitor::default());
        let node = Node::new(
            node_id,
            "127.0.0.1".to_string(),
            0,
            Vec::new(),
            monitoring.clone(),
            MaliciousBehaviorConfig::default(),
        );
        (node, monitoring)
    }

    #[tokio::test]
    async fn create_transaction_adds_to_mempool() {
        let node = test_node(0);
        let tx = node.create_transaction(1, 10).await.unwrap();
        let state = node.state.lock().await;
        assert_eq!(state.mempool.len(), 1);
        assert_eq!(state.mempool[0].tx_hash, tx.tx_hash);
    }

    #[tokio::test]
    async fn receive_transaction_dedupes_by_hash() {
        let node = test_node(0);
        let tx = Transaction::new(TxSender::Node(1), 2, 5, 100.0);
        let payload = serde_json::to_value(&tx).unwrap();
        node.receive_transaction_inner(payload.clone()).await;
        node.receive_transaction_inner(payload).await;
        let state = node.state.lock().await;
        assert_eq!(state.mempool.len(), 1);
    }

    #[tokio::test]
    async fn ingest_transaction_reports_success_then_failure_on_replay() {
        let (node, monitoring) = counting_node(0);
        let tx = Transaction::new(TxSender::Node(1), 2, 5, 100.0);
        let payload = serde_json::to_value(&tx).unwrap();
        node.receive_transaction_inner(payload.clone()).await;
        node.receive_transaction_inner(payload).await;
        assert_eq!(monitoring.trade_success.load(Ordering::SeqCst), 1);
        assert_eq!(monitoring.trade_failure.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn create_block_returns_none_on_empty_mempool() {
        let node = test_node(0);
        assert!(node.create_block(0, false).await.is_none());
    }

    #[tokio::test]
    async fn create_block_mines_from_mempool_and_admits() {
        let node = test_node(0);
        node.create_transaction(1, 10).await;
        let block = node.create_block(0, false).await.unwrap();
        let state = node.state.lock().await;
        assert_eq!(state.ledger.tip().index, block.index);
    }

    #[tokio::test]
    async fn withheld_block_is_not_admitted_until_released() {
        let node = test_node(0);
        node.create_transaction(1, 10).await;
        let block = node.create_block(0, true).await.unwrap();
        {
            let state = node.state.lock().await;
            assert_eq!(state.ledger.tip().index, 0);
            assert_eq!(state.withheld_block.as_ref().unwrap().index, block.index);
        }
        node.release_withheld_block().await;
        let state = node.state.lock().await;
        assert!(state.withheld_block.is_none());
    }

    #[tokio::test]
    async fn receive_block_prunes_mempool_of_included_transactions() {
        let node = test_node(0);
        let tx = node.create_transaction(1, 10).await.unwrap();
        let block = node.create_block(0, false).await.unwrap();
        let payload = serde_json::to_value(&block).unwrap();
        // Re-register a fresh node to simulate receiving this block remotely.
        let receiver = test_node(1);
        receiver.ingest_transaction(tx).await;
        receiver.receive_block_inner(payload).await;
        let state = receiver.state.lock().await;
        assert!(state.mempool.is_empty());
        assert_eq!(state.ledger.tip().index, block.index);
    }

    #[tokio::test]
    async fn receive_block_confirms_one_trade_per_included_transaction() {
        let node = test_node(0);
        let tx = node.create_transaction(1, 10).await.unwrap();
        let block = node.create_block(0, false).await.unwrap();
        let payload = serde_json::to_value(&block).unwrap();
        let (receiver, monitoring) = counting_node(1);
        receiver.ingest_transaction(tx).await;
        receiver.receive_block_inner(payload).await;
        // One confirmation for the reward transaction, one for the user's.
        assert_eq!(monitoring.trade_confirmations.load(Ordering::SeqCst), block.transactions.len() as u64);
    }

    #[tokio::test]
    async fn malicious_ignore_consensus_messages_ignores_blocks() {
        let mut behavior = MaliciousBehaviorConfig::default();
        behavior.ignore_consensus_messages = true;
        let node = Node::new(
            0,
            "127.0.0.1".to_string(),
            0,
            Vec::new(),
            Arc::new(TracingMonitor::new()),
            behavior,
        );
        let block = Block::genesis();
        let payload = serde_json::to_value(&block).unwrap();
        node.receive_block_inner(payload).await;
        let state = node.state.lock().await;
        assert_eq!(state.ledger.chain().len(), 1);
    }
}
