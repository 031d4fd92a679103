//! Proof-of-Stake: stake-weighted random leader selection per slot. See
//! `original_source/blockchain_sim/core/consensus/pos.py`.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::crypto::canonical_json;
use crate::identity::NodeId;
use crate::monitoring::{AlertSeverity, MonitoringSink};
use crate::node::{ConsensusEngine, Node};

use super::{block_hash, block_index, block_previous_hash, record_malicious_once};

#[derive(Clone, Debug, Serialize, Deserialize)]
struct PosMessage {
    block: Value,
    signature: String,
    sender_id: NodeId,
}

struct PosState {
    current_validator: Option<NodeId>,
    malicious_nodes: std::collections::HashSet<NodeId>,
    received_blocks: std::collections::HashSet<String>,
}

/// One node's view of a PoS run. The validator set and stake balances
/// are fixed for the life of a simulation; there is no staking/slashing
/// protocol, only leader selection weighted by a static balance map.
pub struct PosConsensus {
    node: Arc<Node>,
    validator_set: Vec<NodeId>,
    balances: HashMap<NodeId, u64>,
    total_staked: u64,
    monitoring: Arc<dyn MonitoringSink>,
    state: Mutex<PosState>,
}

impl PosConsensus {
    pub fn new(
        node: Arc<Node>,
        validator_set: Vec<NodeId>,
        balances: HashMap<NodeId, u64>,
        monitoring: Arc<dyn MonitoringSink>,
    ) -> Arc<Self> {
        let total_staked = balances.values().sum();
        Arc::new(Self {
            node,
            validator_set,
            balances,
            total_staked,
            monitoring,
            state: Mutex::new(PosState {
                current_validator: None,
                malicious_nodes: std::collections::HashSet::new(),
                received_blocks: std::collections::HashSet::new(),
            }),
        })
    }

    /// Draws a stake-weighted leader: `r ~ uniform[0, total_staked)`,
    /// then walks `validator_set` accumulating stake until the running
    /// sum reaches `r`. With `total_staked == 0` no one can ever win.
    pub async fn select_validator(&self) -> Option<NodeId> {
        if self.total_staked == 0 {
            return None;
        }
        let r: f64 = rand::thread_rng().gen_range(0.0..self.total_staked as f64);
        let mut cumulative = 0u64;
        let mut picked = None;
        for &node_id in &self.validator_set {
            cumulative += self.balances.get(&node_id).copied().unwrap_or(0);
            if r <= cumulative as f64 {
                picked = Some(node_id);
                break;
            }
        }
        self.state.lock().await.current_validator = picked;
        picked
    }

    async fn can_propose(&self) -> bool {
        self.select_validator().await == Some(self.node.node_id)
    }

    /// Mines and broadcasts a block if this draw selected this node as
    /// the slot's validator; otherwise a no-op.
    pub async fn propose_block(&self) -> Option<Value> {
        if !self.can_propose().await {
            return None;
        }

        let start = Instant::now();
        let block = self.node.create_block(0, false).await?;
        let block_value = serde_json::to_value(&block).expect("Block always serializes");

        // Signs canonical JSON of the block rather than `str(block)`,
        // same deliberate divergence as PoA — see the design ledger.
        let signature = self.node.keypair().sign(&canonical_json(&block_value));
        let bytes = serde_json::to_string(&block_value).map(|s| s.len()).unwrap_or(0) as u64;
        self.monitoring
            .record_message(self.node.node_id, "pos_message", 1, 0, 0, bytes);

        if let Some(network) = self.node.network() {
            let msg = PosMessage {
                block: block_value.clone(),
                signature,
                sender_id: self.node.node_id,
            };
            let payload = serde_json::to_value(&msg).expect("PosMessage always serializes");
            network.broadcast_pos_message(payload).await;
        }

        self.monitoring.record_block_produced(self.node.node_id, block.index);
        self.monitoring
            .record_latency(self.node.node_id, start.elapsed().as_secs_f64());
        Some(block_value)
    }

    async fn handle(&self, msg: PosMessage) {
        if !self.validator_set.contains(&msg.sender_id) {
            tracing::warn!(node_id = self.node.node_id, sender_id = msg.sender_id, "pos message from non-validator");
            let mut state = self.state.lock().await;
            record_malicious_once(&mut state.malicious_nodes, msg.sender_id, "pos");
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
            .record_message(self.node.node_id, "pos_message", 0, 1, 0, bytes);

        let Some(sender_pubkey) = self.node.public_key_of(msg.sender_id) else {
            tracing::warn!(node_id = self.node.node_id, sender_id = msg.sender_id, "unknown pos sender pubkey");
            return;
        };

        let block_str = canonical_json(&msg.block);
        if !crate::crypto::verify(&sender_pubkey, &block_str, &msg.signature) {
            tracing::warn!(node_id = self.node.node_id, sender_id = msg.sender_id, "invalid pos signature");
            let mut state = self.state.lock().await;
            record_malicious_once(&mut state.malicious_nodes, msg.sender_id, "pos");
            drop(state);
            self.monitoring
                .raise_alert(msg.sender_id, "Invalid signature in PoS message", AlertSeverity::Warning);
            return;
        }

        let hash = block_hash(&msg.block);
        {
            let mut state = self.state.lock().await;
            if !state.received_blocks.insert(hash.clone()) {
                tracing::debug!(node_id = self.node.node_id, hash = %hash, "duplicate pos block ignored");
                return;
            }
        }

        let tip_hash = self.node.tip_hash().await;
        if block_previous_hash(&msg.block) == tip_hash {
            if self.node.receive_block_from_consensus(msg.block.clone()).await {
                self.monitoring
                    .record_block_committed(self.node.node_id, block_index(&msg.block));
            }
        } else {
            self.monitoring
                .record_fork_event(self.node.node_id, "conflict detected");
        }
    }
}

impl ConsensusEngine for PosConsensus {
    fn receive_message<'a>(&'a self, payload: Value) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            match serde_json::from_value::<PosMessage>(payload) {
                Ok(msg) => self.handle(msg).await,
                Err(e) => tracing::warn!(node_id = self.node.node_id, error = %e, "malformed pos message"),
            }
        })
    }
}
