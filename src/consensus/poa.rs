//! Proof-of-Authority: a fixed validator set takes turns proposing,
//! round-robin, no faster than once every `block_time`. See
//! `original_source/blockchain_sim/core/consensus/poa.py`.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::crypto::canonical_json;
use crate::identity::NodeId;
use crate::monitoring::{AlertSeverity, MonitoringSink};
use crate::node::{ConsensusEngine, Node};

use super::{block_hash, block_previous_hash, record_malicious_once};

const DEFAULT_BLOCK_TIME: Duration = Duration::from_secs(5);

#[derive(Clone, Debug, Serialize, Deserialize)]
struct PoaMessage {
    block: Value,
    signature: String,
    sender_id: NodeId,
}

struct PoaState {
    current_leader_index: usize,
    last_block_time: Option<Instant>,
    malicious_nodes: std::collections::HashSet<NodeId>,
    received_blocks: std::collections::HashSet<String>,
}

/// One node's view of a PoA run. `validators` is fixed for the life of a
/// simulation; there is no validator-set reconfiguration protocol.
pub struct PoaConsensus {
    node: Arc<Node>,
    validators: Vec<NodeId>,
    block_time: Duration,
    monitoring: Arc<dyn MonitoringSink>,
    state: Mutex<PoaState>,
}

impl PoaConsensus {
    pub fn new(node: Arc<Node>, validators: Vec<NodeId>, monitoring: Arc<dyn MonitoringSink>) -> Arc<Self> {
        Self::with_block_time(node, validators, DEFAULT_BLOCK_TIME, monitoring)
    }

    /// Same as [`PoaConsensus::new`] but with an explicit `block_time`,
    /// used when a run configures a non-default proposal cadence.
    pub fn with_block_time(
        node: Arc<Node>,
        validators: Vec<NodeId>,
        block_time: Duration,
        monitoring: Arc<dyn MonitoringSink>,
    ) -> Arc<Self> {
        Arc::new(Self {
            node,
            validators,
            block_time,
            monitoring,
            state: Mutex::new(PoaState {
                current_leader_index: 0,
                last_block_time: None,
                malicious_nodes: std::collections::HashSet::new(),
                received_blocks: std::collections::HashSet::new(),
            }),
        })
    }

    pub async fn current_leader(&self) -> NodeId {
        let state = self.state.lock().await;
        self.validators[state.current_leader_index]
    }

    async fn rotate_leader(&self) {
        let mut state = self.state.lock().await;
        state.current_leader_index = (state.current_leader_index + 1) % self.validators.len();
    }

    async fn can_propose(&self) -> bool {
        let state = self.state.lock().await;
        if self.validators.is_empty() || self.validators[state.current_leader_index] != self.node.node_id {
            return false;
        }
        match state.last_block_time {
            None => true,
            Some(last) => last.elapsed() >= self.block_time,
        }
    }

    /// Mines and broadcasts a block if this node is the current leader
    /// and its `block_time` window has elapsed; otherwise a no-op.
    pub async fn propose_block(&self) -> Option<Value> {
        if !self.can_propose().await {
            return None;
        }

        let start = Instant::now();
        let block = self.node.create_block(0, false).await?;
        let block_value = serde_json::to_value(&block).expect("Block always serializes");

        // The source signs `str(block)`, an unstable dict repr; this
        // crate signs canonical JSON of the block instead, a deliberate,
        // spec-sanctioned divergence recorded in the design ledger.
        let signature = self.node.keypair().sign(&canonical_json(&block_value));
        let bytes = serde_json::to_string(&block_value).map(|s| s.len()).unwrap_or(0) as u64;
        self.monitoring
            .record_message(self.node.node_id, "poa_message", 1, 0, 0, bytes);

        if let Some(network) = self.node.network() {
            let msg = PoaMessage {
                block: block_value.clone(),
                signature,
                sender_id: self.node.node_id,
            };
            let payload = serde_json::to_value(&msg).expect("PoaMessage always serializes");
            network.broadcast_poa_message(payload).await;
        }

        {
            let mut state = self.state.lock().await;
            state.last_block_time = Some(Instant::now());
        }
        self.rotate_leader().await;

        self.monitoring.record_block_produced(self.node.node_id, block.index);
        self.monitoring
            .record_latency(self.node.node_id, start.elapsed().as_secs_f64());
        Some(block_value)
    }

    async fn handle(&self, msg: PoaMessage) {
        if !self.validators.contains(&msg.sender_id) {
            tracing::warn!(node_id = self.node.node_id, sender_id = msg.sender_id, "poa message from non-validator");
            let mut state = self.state.lock().await;
            record_malicious_once(&mut state.malicious_nodes, msg.sender_id, "poa");
            drop(state);
            self.monitoring.raise_alert(
                msg.sender_id,
                "Message from non-validator rejected",
                AlertSeverity::Warning,
            );
            return;
        }

        let bytes = serde_json::to_string(&msg).map(|s| s.len()).unwrap_or(0) as u64;
        self.monitoring
            .record_message(self.node.node_id, "poa_message", 0, 1, 0, bytes);

        let Some(sender_pubkey) = self.node.public_key_of(msg.sender_id) else {
            tracing::warn!(node_id = self.node.node_id, sender_id = msg.sender_id, "unknown poa sender pubkey");
            return;
        };

        let block_str = canonical_json(&msg.block);
        if !crate::crypto::verify(&sender_pubkey, &block_str, &msg.signature) {
            tracing::warn!(node_id = self.node.node_id, sender_id = msg.sender_id, "invalid poa signature");
            let mut state = self.state.lock().await;
            record_malicious_once(&mut state.malicious_nodes, msg.sender_id, "poa");
            drop(state);
            self.monitoring
                .raise_alert(msg.sender_id, "Invalid signature in PoA message", AlertSeverity::Warning);
            return;
        }

        let hash = block_hash(&msg.block);
        {
            let mut state = self.state.lock().await;
            if !state.received_blocks.insert(hash.clone()) {
                tracing::debug!(node_id = self.node.node_id, hash = %hash, "duplicate poa block ignored");
                return;
            }
        }

        let tip_hash = self.node.tip_hash().await;
        if block_previous_hash(&msg.block) == tip_hash {
            if self.node.receive_block_from_consensus(msg.block.clone()).await {
                self.monitoring.record_block_committed(self.node.node_id, super::block_index(&msg.block));
            }
        } else {
            self.monitoring
                .record_fork_event(self.node.node_id, "conflict detected");
        }
    }
}

impl ConsensusEngine for PoaConsensus {
    fn receive_message<'a>(&'a self, payload: Value) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            match serde_json::from_value::<PoaMessage>(payload) {
                Ok(msg) => self.handle(msg).await,
                Err(e) => tracing::warn!(node_id = self.node.node_id, error = %e, "malformed poa message"),
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

    #[tokio::test]
    async fn leader_rotates_round_robin() {
        let node = test_node(0);
        let poa = PoaConsensus::new(node, vec![0, 1, 2], Arc::new(TracingMonitor::new()));
        assert_eq!(poa.current_leader().await, 0);
        poa.rotate_leader().await;
        assert_eq!(poa.current_leader().await, 1);
        poa.rotate_leader().await;
        poa.rotate_leader().await;
        assert_eq!(poa.current_leader().await, 0);
    }

    #[tokio::test]
    async fn non_leader_cannot_propose() {
        let node = test_node(1);
        let poa = PoaConsensus::new(node, vec![0, 1, 2], Arc::new(TracingMonitor::new()));
        assert!(!poa.can_propose().await);
    }

    #[tokio::test]
    async fn leader_with_empty_mempool_produces_nothing() {
        let node = test_node(0);
        let poa = PoaConsensus::new(node, vec![0, 1, 2], Arc::new(TracingMonitor::new()));
        assert!(poa.propose_block().await.is_none());
    }

    #[tokio::test]
    async fn non_validator_sender_is_marked_malicious() {
        let node = test_node(0);
        let poa = PoaConsensus::new(node, vec![0, 1], Arc::new(TracingMonitor::new()));
        let msg = PoaMessage {
            block: serde_json::json!({"index": 1, "previous_hash": "0", "hash": "abc"}),
            signature: "deadbeef".to_string(),
            sender_id: 9,
        };
        poa.handle(msg).await;
        let state = poa.state.lock().await;
        assert!(state.malicious_nodes.contains(&9));
    }
}
