//! Simulation driver: wires N nodes together, exchanges public keys,
//! generates random transactions at a configured rate, and drives
//! proposal for whichever consensus engine the run selected. See
//! `original_source/blockchain_sim/core/simulation_engine.py`'s
//! `SimulationEngine`, with the Django-model persistence (`NodeModel`,
//! `Block`/`Transaction`/`NetworkEvent`/`MetricLog` rows) left out — this
//! crate only owns the engine, not its dashboard projection.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::seq::SliceRandom;
use rand::Rng;
use tokio::task::JoinHandle;

use crate::config::{ConsensusAlgorithm, SimulationConfig};
use crate::consensus::pbft::PbftConsensus;
use crate::consensus::poa::PoaConsensus;
use crate::consensus::pos::PosConsensus;
use crate::error::CoreError;
use crate::monitoring::MonitoringSink;
use crate::network::PeerInfo;
use crate::node::Node;

/// The attached engine, one variant per [`ConsensusAlgorithm`]. Kept as
/// an enum of concrete per-node handles (rather than a `Vec<Arc<dyn
/// ConsensusEngine>>`) since driving a PBFT primary's `propose_block`
/// needs `primary()`, which isn't part of the dyn-compatible wire-level
/// `ConsensusEngine` trait `Node` dispatches through.
enum ConsensusHandles {
    Pbft(Vec<Arc<PbftConsensus>>),
    Poa(Vec<Arc<PoaConsensus>>),
    Pos(Vec<Arc<PosConsensus>>),
}

/// Owns a whole simulation run: the node set, their attached consensus
/// engines, and the background task that paces transaction generation
/// and proposal attempts. Mirrors `SimulationEngine`, recast as an
/// explicit owned value instead of a process-wide mutable singleton.
pub struct SimulationDriver {
    config: SimulationConfig,
    nodes: Vec<Arc<Node>>,
    consensus: ConsensusHandles,
    running: Arc<AtomicBool>,
    loop_handle: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl SimulationDriver {
    /// Builds every node, exchanges public keys out-of-band (mirroring
    /// the source's post-construction `all_pub_keys` pass), starts each
    /// node's transport, and attaches the configured consensus engine.
    pub async fn setup(
        config: SimulationConfig,
        monitoring: Arc<dyn MonitoringSink>,
    ) -> Result<Self, CoreError> {
        config.validate()?;

        let peers_for = |self_id: u64| -> Vec<PeerInfo> {
            config
                .nodes
                .iter()
                .filter(|n| n.node_id != self_id)
                .map(|n| PeerInfo {
                    node_id: n.node_id,
                    ip: n.ip.clone(),
                    port: n.port,
                })
                .collect()
        };

        let mut nodes = Vec::with_capacity(config.nodes.len());
        for endpoint in &config.nodes {
            let behavior = config
                .malicious_nodes
                .get(&endpoint.node_id)
                .cloned()
                .unwrap_or_default();
            let node = Node::new(
                endpoint.node_id,
                endpoint.ip.clone(),
                endpoint.port,
                peers_for(endpoint.node_id),
                monitoring.clone(),
                behavior,
            );
            nodes.push(node);
        }

        let all_pub_keys: Vec<(u64, String)> =
            nodes.iter().map(|n| (n.node_id, n.public_key_pem())).collect();
        for node in &nodes {
            for (id, pem) in &all_pub_keys {
                node.learn_public_key(*id, pem.clone());
            }
        }

        let socket_timeout = Duration::from_secs(config.network.socket_timeout_secs);
        for node in &nodes {
            node.start_network(config.attack_config.clone(), socket_timeout).await?;
        }

        let total_nodes = nodes.len();
        let consensus = match config.consensus_algorithm {
            ConsensusAlgorithm::Pbft => {
                let handles: Vec<Arc<PbftConsensus>> = nodes
                    .iter()
                    .map(|n| PbftConsensus::new(n.clone(), total_nodes, monitoring.clone()))
                    .collect();
                for (node, pbft) in nodes.iter().zip(handles.iter()) {
                    node.attach_consensus(pbft.clone());
                }
                ConsensusHandles::Pbft(handles)
            }
            ConsensusAlgorithm::Poa => {
                let block_time = Duration::from_secs(config.poa_block_time_secs);
                let handles: Vec<Arc<PoaConsensus>> = nodes
                    .iter()
                    .map(|n| {
                        PoaConsensus::with_block_time(
                            n.clone(),
                            config.validators_poa.clone(),
                            block_time,
                            monitoring.clone(),
                        )
                    })
                    .collect();
                for (node, poa) in nodes.iter().zip(handles.iter()) {
                    node.attach_consensus(poa.clone());
                }
                ConsensusHandles::Poa(handles)
            }
            ConsensusAlgorithm::Pos => {
                let handles: Vec<Arc<PosConsensus>> = nodes
                    .iter()
                    .map(|n| {
                        PosConsensus::new(
                            n.clone(),
                            config.nodes.iter().map(|e| e.node_id).collect(),
                            config.staking_balances.clone(),
                            monitoring.clone(),
                        )
                    })
                    .collect();
                for (node, pos) in nodes.iter().zip(handles.iter()) {
                    node.attach_consensus(pos.clone());
                }
                ConsensusHandles::Pos(handles)
            }
        };

        tracing::info!(
            nodes = nodes.len(),
            consensus = ?config.consensus_algorithm,
            "simulation network wired"
        );

        Ok(Self {
            config,
            nodes,
            consensus,
            running: Arc::new(AtomicBool::new(false)),
            loop_handle: tokio::sync::Mutex::new(None),
        })
    }

    pub fn nodes(&self) -> &[Arc<Node>] {
        &self.nodes
    }

    /// Starts the background driver tick (transaction generation plus
    /// consensus proposal attempts), matching `SimulationEngine._run_loop`'s
    /// once-per-second cadence.
    pub async fn start(self: &Arc<Self>) {
        self.running.store(true, Ordering::SeqCst);
        let driver = self.clone();
        let handle = tokio::spawn(async move {
            driver.run_loop().await;
        });
        *self.loop_handle.lock().await = Some(handle);
    }

    async fn run_loop(&self) {
        let tx_rate = self.config.transaction_rate as usize;
        let total_tx_per_tick = self.nodes.len() * tx_rate;

        while self.running.load(Ordering::SeqCst) {
            self.generate_random_transactions(total_tx_per_tick).await;
            self.drive_proposals().await;
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }

    async fn generate_random_transactions(&self, count: usize) {
        if self.nodes.len() < 2 {
            return;
        }
        let mut rng = rand::thread_rng();
        for _ in 0..count {
            let sender = self.nodes.choose(&mut rng).expect("node set non-empty");
            let receiver = self.nodes.choose(&mut rng).expect("node set non-empty");
            if sender.node_id == receiver.node_id {
                continue;
            }
            let amount = rng.gen_range(1..=10);
            sender.create_transaction(receiver.node_id, amount).await;
        }
    }

    async fn drive_proposals(&self) {
        match &self.consensus {
            ConsensusHandles::Pbft(handles) => {
                for (node, pbft) in self.nodes.iter().zip(handles.iter()) {
                    if node.node_id == pbft.primary().await {
                        if let Some(block) = node.create_block(0, false).await {
                            let payload = serde_json::to_value(&block).expect("Block always serializes");
                            pbft.propose_block(payload).await;
                        }
                    }
                }
            }
            ConsensusHandles::Poa(handles) => {
                for poa in handles {
                    poa.propose_block().await;
                }
            }
            ConsensusHandles::Pos(handles) => {
                for pos in handles {
                    pos.propose_block().await;
                }
            }
        }
    }

    /// Stops the driver tick and waits up to 3 seconds for it to exit,
    /// matching `SimulationEngine.stop`'s join timeout. Each node's
    /// transport is left running; callers that want a full teardown
    /// should drop the nodes after this returns.
    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let handle = self.loop_handle.lock().await.take();
        if let Some(handle) = handle {
            if tokio::time::timeout(Duration::from_secs(3), handle).await.is_err() {
                tracing::warn!("simulation driver task did not stop within 3s timeout");
            }
        }
        for node in &self.nodes {
            if let Some(network) = node.network() {
                network.stop();
            }
        }
    }
}
