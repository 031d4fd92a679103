//! Three-phase PBFT: PRE_PREPARE, PREPARE, COMMIT, REPLY. See
//! `original_source/blockchain_sim/core/consensus/pbft.py`.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::identity::NodeId;
use crate::monitoring::{AlertSeverity, MonitoringSink};
use crate::node::{ConsensusEngine, Node};

use super::{
    block_index, block_previous_hash, record_malicious_once, sign_block_message,
    verify_block_message,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PbftPhase {
    PrePrepare,
    Prepare,
    Commit,
    Reply,
}

impl PbftPhase {
    fn label(self) -> &'static str {
        match self {
            PbftPhase::PrePrepare => "PRE_PREPARE",
            PbftPhase::Prepare => "PREPARE",
            PbftPhase::Commit => "COMMIT",
            PbftPhase::Reply => "REPLY",
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct PbftMessage {
    #[serde(rename = "type")]
    phase: PbftPhase,
    view: u64,
    seq: u64,
    node_id: NodeId,
    block: Value,
    signature: String,
}

/// `Q = 2*(N/3) + 1` using integer division, exactly as the source
/// computes it. For N=7 this gives Q=5 (the textbook BFT quorum for
/// N=3f+1, f=2 is also 5, so it matches there), but the formula is not
/// the textbook `ceil((2N+1)/3)` in general. This crate reproduces the
/// source's formula as-is rather than "fixing" it.
fn quorum(total_nodes: usize) -> usize {
    2 * (total_nodes / 3) + 1
}

struct RoundState {
    current_view: u64,
    sequence_number: u64,
    prepared: HashMap<u64, HashSet<NodeId>>,
    committed: HashMap<u64, HashSet<NodeId>>,
    received_messages: HashSet<(NodeId, PbftPhase, u64)>,
    malicious_nodes: HashSet<NodeId>,
    round_start: Option<Instant>,
    last_proposed_index: i64,
}

impl RoundState {
    fn new() -> Self {
        Self {
            current_view: 0,
            sequence_number: 0,
            prepared: HashMap::new(),
            committed: HashMap::new(),
            received_messages: HashSet::new(),
            malicious_nodes: HashSet::new(),
            round_start: None,
            last_proposed_index: -1,
        }
    }
}

/// One node's view of a PBFT run. `total_nodes` is fixed for the life of
/// a simulation; view changes (and therefore primary rotation on
/// failure) are not implemented, matching the source.
pub struct PbftConsensus {
    node: Arc<Node>,
    total_nodes: usize,
    monitoring: Arc<dyn MonitoringSink>,
    state: Mutex<RoundState>,
}

impl PbftConsensus {
    pub fn new(node: Arc<Node>, total_nodes: usize, monitoring: Arc<dyn MonitoringSink>) -> Arc<Self> {
        Arc::new(Self {
            node,
            total_nodes,
            monitoring,
            state: Mutex::new(RoundState::new()),
        })
    }

    pub async fn primary(&self) -> NodeId {
        let view = self.state.lock().await.current_view;
        view % self.total_nodes as u64
    }

    fn primary_locked(&self, state: &RoundState) -> NodeId {
        state.current_view % self.total_nodes as u64
    }

    /// Broadcasts a signed PBFT message. Takes `view` explicitly (rather
    /// than re-locking `self.state`) since every call site already holds
    /// or has just released that lock — re-locking here would deadlock
    /// against the caller's held guard during `receive_message`.
    async fn broadcast(&self, phase: PbftPhase, view: u64, seq: u64, block: Value, signature: String) {
        let msg = PbftMessage {
            phase,
            view,
            seq,
            node_id: self.node.node_id,
            block: block.clone(),
            signature,
        };
        let block_size = serde_json::to_string(&block).map(|s| s.len()).unwrap_or(0) as u64;
        self.monitoring
            .record_message(self.node.node_id, phase.label(), 1, 0, 0, block_size);

        if let Some(network) = self.node.network() {
            let payload = serde_json::to_value(&msg).expect("PbftMessage always serializes");
            network.broadcast_pbft_message(payload).await;
        }
    }

    fn header(&self, phase: PbftPhase, view: u64, seq: u64, node_id: NodeId) -> String {
        format!("{}:{}:{}:{}", phase.label(), view, seq, node_id)
    }

    /// Proposes `block` if this node is the current primary and the
    /// block's index hasn't already been proposed (guards against a
    /// double-propose from the same mempool-became-nonempty tick).
    pub async fn propose_block(&self, block: Value) {
        let mut state = self.state.lock().await;
        let index = block_index(&block);
        if (index as i64) <= state.last_proposed_index {
            tracing::debug!(node_id = self.node.node_id, index, "skipping duplicate proposal");
            return;
        }

        if self.node.node_id != self.primary_locked(&state) {
            return;
        }

        state.sequence_number += 1;
        state.last_proposed_index = index as i64;
        let seq = state.sequence_number;
        let view = state.current_view;
        state.prepared.entry(seq).or_default().insert(self.node.node_id);
        state.round_start = Some(Instant::now());
        drop(state);

        let header = self.header(PbftPhase::PrePrepare, view, seq, self.node.node_id);
        let signature = sign_block_message(self.node.keypair(), &header, &block);
        self.broadcast(PbftPhase::PrePrepare, view, seq, block, signature).await;
    }

    fn cleanup_rounds(state: &mut RoundState, current_seq: u64) {
        const THRESHOLD: u64 = 5;
        let to_delete: Vec<u64> = state
            .prepared
            .keys()
            .copied()
            .filter(|s| *s + THRESHOLD < current_seq)
            .collect();
        for seq in to_delete {
            state.prepared.remove(&seq);
            state.committed.remove(&seq);
            state.received_messages.retain(|(_, _, s)| *s != seq);
        }
    }

    async fn reject(&self, sender_id: NodeId, reason: &str) {
        tracing::warn!(node_id = self.node.node_id, sender_id, reason, "pbft message rejected");
        {
            let mut state = self.state.lock().await;
            record_malicious_once(&mut state.malicious_nodes, sender_id, "pbft");
        }
        self.monitoring
            .raise_alert(sender_id, &format!("Message rejected: {reason}"), AlertSeverity::Warning);
    }

    async fn trigger_sync(&self, start_index: u64, end_index: u64) {
        if let Some(network) = self.node.network() {
            self.monitoring.record_sync_event(
                self.node.node_id,
                &format!("Triggered sync for blocks {start_index}-{end_index}"),
            );
            network.broadcast_sync_request(start_index, end_index).await;
        }
    }

    async fn handle(&self, msg: PbftMessage) {
        let sender_id = msg.node_id;
        let Some(sender_pubkey) = self.node.public_key_of(sender_id) else {
            self.reject(sender_id, "Unknown sender").await;
            return;
        };

        let header = self.header(msg.phase, msg.view, msg.seq, sender_id);
        if !verify_block_message(&sender_pubkey, &header, &msg.block, &msg.signature) {
            self.reject(sender_id, "Invalid signature").await;
            return;
        }

        let msg_bytes = serde_json::to_string(&msg).map(|s| s.len()).unwrap_or(0) as u64;
        self.monitoring
            .record_message(self.node.node_id, msg.phase.label(), 0, 1, 0, msg_bytes);

        // Held for the whole dispatch body, covering the entire
        // receive_message path rather than just the msg_type read.
        let mut state = self.state.lock().await;
        if !state.received_messages.insert((sender_id, msg.phase, msg.seq)) {
            return;
        }

        match msg.phase {
            PbftPhase::PrePrepare => self.handle_pre_prepare(&mut state, msg).await,
            PbftPhase::Prepare => self.handle_prepare(&mut state, msg).await,
            PbftPhase::Commit => self.handle_commit(&mut state, msg).await,
            PbftPhase::Reply => {}
        }
    }

    async fn handle_pre_prepare(&self, state: &mut RoundState, msg: PbftMessage) {
        let current_height = self.node.current_tip_index().await;
        let index = block_index(&msg.block);
        if index > current_height + 1 {
            self.trigger_sync(current_height + 1, index).await;
            return;
        }

        let tip_hash = self.node.tip_hash().await;
        if block_previous_hash(&msg.block) != tip_hash {
            self.monitoring
                .record_fork_event(self.node.node_id, &format!("Fork overlap at Block {index}"));
            return;
        }

        let view = state.current_view;
        let seq = msg.seq;
        let primary = self.primary_locked(state);
        if self.node.node_id != primary {
            state.prepared.entry(seq).or_default().insert(primary);
            self.monitoring.record_pbft_prepare(self.node.node_id, index, false);
            let header = self.header(PbftPhase::Prepare, view, seq, self.node.node_id);
            let signature = sign_block_message(self.node.keypair(), &header, &msg.block);
            self.broadcast(PbftPhase::Prepare, view, seq, msg.block.clone(), signature).await;
        }
        state.round_start = Some(Instant::now());
    }

    async fn handle_prepare(&self, state: &mut RoundState, msg: PbftMessage) {
        let current_height = self.node.current_tip_index().await;
        let index = block_index(&msg.block);
        if index > current_height + 1 {
            return;
        }

        let seq = msg.seq;
        state.prepared.entry(seq).or_default().insert(msg.node_id);
        let count = state.prepared.get(&seq).map(HashSet::len).unwrap_or(0);
        if count >= quorum(self.total_nodes) {
            self.monitoring.record_pbft_prepare(self.node.node_id, index, true);
            let view = state.current_view;
            let header = self.header(PbftPhase::Commit, view, seq, self.node.node_id);
            let signature = sign_block_message(self.node.keypair(), &header, &msg.block);
            self.broadcast(PbftPhase::Commit, view, seq, msg.block.clone(), signature).await;
            state.committed.entry(seq).or_default().insert(self.node.node_id);
        }
    }

    async fn handle_commit(&self, state: &mut RoundState, msg: PbftMessage) {
        let seq = msg.seq;
        state.committed.entry(seq).or_default().insert(msg.node_id);
        let count = state.committed.get(&seq).map(HashSet::len).unwrap_or(0);
        if count < quorum(self.total_nodes) {
            return;
        }

        let index = block_index(&msg.block);
        let current_height = self.node.current_tip_index().await;
        if index <= current_height {
            return;
        }
        if index > current_height + 1 {
            self.trigger_sync(current_height + 1, index).await;
            return;
        }
        let tip_hash = self.node.tip_hash().await;
        if block_previous_hash(&msg.block) != tip_hash {
            return;
        }

        let added = self.node.receive_block_from_consensus(msg.block.clone()).await;
        if added {
            if let Some(start) = state.round_start.take() {
                self.monitoring
                    .record_latency(self.node.node_id, start.elapsed().as_secs_f64());
            }
            if seq > state.sequence_number {
                state.sequence_number = seq;
            }
            Self::cleanup_rounds(state, seq);
        }

        self.monitoring.record_pbft_commit(self.node.node_id, index, true);
        let view = state.current_view;
        let header = self.header(PbftPhase::Reply, view, seq, self.node.node_id);
        let signature = sign_block_message(self.node.keypair(), &header, &msg.block);
        self.broadcast(PbftPhase::Reply, view, seq, msg.block.clone(), signature).await;
    }
}

impl ConsensusEngine for PbftConsensus {
    fn receive_message<'a>(&'a self, payload: Value) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            match serde_json::from_value::<PbftMessage>(payload) {
                Ok(msg) => self.handle(msg).await,
                Err(e) => tracing::warn!(node_id = self.node.node_id, error = %e, "malformed pbft message"),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MaliciousBehaviorConfig;
    use crate::monitoring::TracingMonitor;

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

    #[test]
    fn quorum_matches_source_formula() {
        assert_eq!(quorum(4), 3);
        assert_eq!(quorum(7), 5);
        assert_eq!(quorum(10), 7);
    }

    #[tokio::test]
    async fn primary_is_view_mod_n() {
        let node = test_node(2);
        let pbft = PbftConsensus::new(node, 4, Arc::new(TracingMonitor::new()));
        assert_eq!(pbft.primary().await, 0);
    }

    #[tokio::test]
    async fn propose_block_noop_for_non_primary() {
        let node = test_node(1);
        let pbft = PbftConsensus::new(node, 4, Arc::new(TracingMonitor::new()));
        let block = serde_json::json!({"index": 1, "previous_hash": "0", "transactions": [], "timestamp": "0", "nonce": 0, "hash": "abc"});
        pbft.propose_block(block).await;
        let state = pbft.state.lock().await;
        assert_eq!(state.last_proposed_index, -1);
    }

    #[tokio::test]
    async fn propose_block_sets_last_proposed_index_for_primary() {
        let node = test_node(0);
        let pbft = PbftConsensus::new(node, 4, Arc::new(TracingMonitor::new()));
        let block = serde_json::json!({"index": 1, "previous_hash": "0", "transactions": [], "timestamp": "0", "nonce": 0, "hash": "abc"});
        pbft.propose_block(block).await;
        let state = pbft.state.lock().await;
        assert_eq!(state.last_proposed_index, 1);
        assert_eq!(state.sequence_number, 1);
    }

    #[tokio::test]
    async fn handle_rejects_unknown_sender() {
        let node = test_node(0);
        let pbft = PbftConsensus::new(node, 4, Arc::new(TracingMonitor::new()));
        let msg = PbftMessage {
            phase: PbftPhase::PrePrepare,
            view: 0,
            seq: 1,
            node_id: 9,
            block: serde_json::json!({"index": 1}),
            signature: "deadbeef".to_string(),
        };
        pbft.handle(msg).await;
        let state = pbft.state.lock().await;
        assert!(state.malicious_nodes.contains(&9));
    }

    #[tokio::test]
    async fn handle_pre_prepare_across_gap_triggers_sync_not_prepare() {
        let node = test_node(1);
        let pbft = PbftConsensus::new(node.clone(), 4, Arc::new(TracingMonitor::new()));
        node.learn_public_key(0, node.public_key_pem());
        let block = serde_json::json!({
            "index": 3, "previous_hash": "x", "transactions": [], "timestamp": "0", "nonce": 0, "hash": "y"
        });
        let header = pbft.header(PbftPhase::PrePrepare, 0, 1, 0);
        let signature = sign_block_message(node.keypair(), &header, &block);
        let msg = PbftMessage {
            phase: PbftPhase::PrePrepare,
            view: 0,
            seq: 1,
            node_id: 0,
            block,
            signature,
        };
        pbft.handle(msg).await;
        let state = pbft.state.lock().await;
        assert!(state.prepared.get(&1).is_none());
    }
}
