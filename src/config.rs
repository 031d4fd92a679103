//! Simulation configuration: node topology, consensus selection, and the
//! network/attack tuning knobs. Mirrors the shape of
//! `original_source/blockchain_sim/core/config.py`'s `CONFIG` dict, split
//! into typed sub-configs instead of one nested literal.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::identity::NodeId;

/// Static address of a simulated node.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeEndpoint {
    pub node_id: NodeId,
    pub ip: String,
    pub port: u16,
}

/// Which consensus engine a run uses. Custom algorithms (the source
/// leaves a comment for them but never implements one) are out of scope.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsensusAlgorithm {
    Pbft,
    Poa,
    Pos,
}

/// Base network timing, independent of any attack scenario.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NetworkTuning {
    /// Base simulated delay applied to every message, in seconds.
    pub propagation_delay: f64,
    /// TCP connect timeout when sending, in seconds.
    pub socket_timeout_secs: u64,
    pub max_retries: u32,
}

impl Default for NetworkTuning {
    fn default() -> Self {
        Self {
            propagation_delay: 0.1,
            socket_timeout_secs: 2,
            max_retries: 3,
        }
    }
}

/// Adversarial network conditions layered on top of [`NetworkTuning`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AttackConfig {
    pub enabled: bool,
    /// Probability in `[0, 1]` that an inbound message is silently dropped.
    pub drop_rate: f64,
    /// Min/max random delay applied before processing a message, seconds.
    /// Used as a fallback when `NetworkConfig::delay_range` is unset.
    pub delay_range: (f64, f64),
    /// Node ids isolated from the rest of the network: messages to or
    /// from any of these ids are dropped outright.
    pub partition_nodes: Vec<NodeId>,
    /// Whether dropped/delayed messages are also cached for later replay.
    pub replay_enabled: bool,
}

impl Default for AttackConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            drop_rate: 0.0,
            delay_range: (0.0, 0.0),
            partition_nodes: Vec::new(),
            replay_enabled: false,
        }
    }
}

/// Per-node behavior flags for adversarial nodes (see [`crate::node::adversarial`]).
///
/// Flag names follow what `MaliciousNode` in
/// `original_source/blockchain_sim/core/node.py` actually reads
/// (`withhold_blocks`, `replay_attack`, `send_conflicting_blocks`,
/// `ignore_consensus_messages`) rather than the source's example
/// `CONFIG` dict, which names an unrelated, never-read
/// `drop_incoming_messages` key for node 3 — a dead key in the source,
/// not reproduced here.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MaliciousBehaviorConfig {
    #[serde(default)]
    pub ignore_consensus_messages: bool,
    #[serde(default)]
    pub send_conflicting_blocks: bool,
    #[serde(default)]
    pub withhold_blocks: bool,
    #[serde(default)]
    pub replay_attack: bool,
}

/// Runtime-mutable network override, distinct from [`AttackConfig`] so a
/// simulation can be re-tuned mid-run (see `Network::update_config` and
/// `original_source/blockchain_sim/core/network.py`'s `update_config`).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Overrides `AttackConfig::delay_range` when its max is nonzero.
    pub delay_range: Option<(f64, f64)>,
}

/// Top-level configuration for one simulation run.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SimulationConfig {
    pub nodes: Vec<NodeEndpoint>,
    pub consensus_algorithm: ConsensusAlgorithm,
    pub simulation_duration_secs: u64,
    pub block_size: usize,
    pub transaction_rate: u32,
    pub network: NetworkTuning,
    pub staking_balances: HashMap<NodeId, u64>,
    pub validators_poa: Vec<NodeId>,
    /// Minimum spacing between a PoA leader's successive proposals, seconds.
    pub poa_block_time_secs: u64,
    pub attack_config: AttackConfig,
    pub malicious_nodes: HashMap<NodeId, MaliciousBehaviorConfig>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        let nodes: Vec<NodeEndpoint> = (0..10)
            .map(|i| NodeEndpoint {
                node_id: i,
                ip: "127.0.0.1".to_string(),
                port: 5000 + i as u16,
            })
            .collect();
        let staking_balances = (0..10).map(|i| (i, 10)).collect();

        Self {
            nodes,
            consensus_algorithm: ConsensusAlgorithm::Pbft,
            simulation_duration_secs: 120,
            block_size: 5,
            transaction_rate: 2,
            network: NetworkTuning::default(),
            staking_balances,
            validators_poa: vec![0, 1, 2],
            poa_block_time_secs: 5,
            attack_config: AttackConfig::default(),
            malicious_nodes: HashMap::new(),
        }
    }
}

impl SimulationConfig {
    /// Basic structural validation: non-empty node set, unique ids,
    /// PoA validators and PoS stakers drawn from the node set.
    pub fn validate(&self) -> Result<(), crate::error::CoreError> {
        if self.nodes.is_empty() {
            return Err(crate::error::CoreError::InvalidConfig(
                "node list is empty".to_string(),
            ));
        }
        let mut ids: Vec<NodeId> = self.nodes.iter().map(|n| n.node_id).collect();
        ids.sort_unstable();
        ids.dedup();
        if ids.len() != self.nodes.len() {
            return Err(crate::error::CoreError::InvalidConfig(
                "duplicate node_id in node list".to_string(),
            ));
        }
        if self.consensus_algorithm == ConsensusAlgorithm::Poa && self.validators_poa.is_empty() {
            return Err(crate::error::CoreError::InvalidConfig(
                "poa consensus requires at least one validator".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(SimulationConfig::default().validate().is_ok());
    }

    #[test]
    fn empty_node_list_is_invalid() {
        let mut cfg = SimulationConfig::default();
        cfg.nodes.clear();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn duplicate_node_ids_are_invalid() {
        let mut cfg = SimulationConfig::default();
        cfg.nodes.push(cfg.nodes[0].clone());
        assert!(cfg.validate().is_err());
    }
}
