//! Byzantine behaviors layered onto [`super::Node`] via
//! [`crate::config::MaliciousBehaviorConfig`] flags rather than a
//! subclass, since composition is the idiomatic stand-in for the
//! source's `MaliciousNode(Node)` inheritance. See the `MaliciousNode`
//! class in `original_source/blockchain_sim/core/node.py`.

use rand::Rng;

use crate::ledger::Block;

use super::Node;

/// With probability 0.2, rebroadcasts a random transaction from this
/// node's replay queue. Called before a newly-received transaction is
/// ingested, matching the source's ordering in `MaliciousNode.receive_transaction`.
pub(super) async fn maybe_replay_transaction(node: &Node) {
    let should_replay = rand::thread_rng().gen_bool(0.2);
    if !should_replay {
        return;
    }

    let candidate = {
        let state = node.state.lock().await;
        if state.replay_queue.is_empty() {
            None
        } else {
            let idx = rand::thread_rng().gen_range(0..state.replay_queue.len());
            state.replay_queue.get(idx).cloned()
        }
    };

    let Some(tx) = candidate else { return };
    if let Some(network) = node.network() {
        let payload = serde_json::to_value(&tx).expect("Transaction always serializes");
        network.broadcast_transaction(payload).await;
        tracing::info!(node_id = node.node_id, tx_hash = %tx.tx_hash, "replaying cached transaction");
    }
}

/// Builds a conflicting sibling for `original`: same index, a
/// `"conflict_"`-prefixed `previous_hash`, its first transaction
/// duplicated (if any), and a freshly-recomputed hash. Broadcasting
/// both `original` and this conflicting block forces receivers to pick
/// one deterministically at admission (by link+hash match) and reject
/// the other as a fork, rather than letting a fork-resolution rule
/// decide — matching `MaliciousNode._generate_conflicting_block`.
pub fn generate_conflicting_block(original: &Block) -> Block {
    let mut transactions = original.transactions.clone();
    if let Some(first) = transactions.first().cloned() {
        transactions.push(first);
    }

    Block::new(
        original.index,
        format!("conflict_{}", original.previous_hash),
        transactions,
        original.timestamp,
        original.nonce,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{Sender, Transaction};

    #[test]
    fn conflicting_block_prefixes_previous_hash() {
        let tx = Transaction::new(Sender::Node(0), 1, 5, 1.0);
        let original = Block::new(1, "abc".into(), vec![tx], 2.0, 0);
        let conflicting = generate_conflicting_block(&original);
        assert_eq!(conflicting.previous_hash, "conflict_abc");
        assert_eq!(conflicting.transactions.len(), 2);
        assert_ne!(conflicting.hash, original.hash);
    }

    #[test]
    fn conflicting_block_with_no_transactions_stays_empty() {
        let original = Block::new(1, "abc".into(), Vec::new(), 2.0, 0);
        let conflicting = generate_conflicting_block(&original);
        assert!(conflicting.transactions.is_empty());
    }
}
