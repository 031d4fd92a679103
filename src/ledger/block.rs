//! Block record, genesis construction, and content hashing.

use serde::{Deserialize, Serialize};

use super::transaction::Transaction;
use crate::crypto::{python_float_str, sha256_hex_value};

/// A block of committed transactions, linked to its predecessor by hash.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Block {
    pub index: u64,
    pub previous_hash: String,
    pub transactions: Vec<Transaction>,
    pub timestamp: f64,
    pub nonce: u64,
    pub hash: String,
}

impl Block {
    /// Constructs a block and computes its hash, mirroring `Block.__init__`.
    pub fn new(
        index: u64,
        previous_hash: String,
        transactions: Vec<Transaction>,
        timestamp: f64,
        nonce: u64,
    ) -> Self {
        let mut block = Self {
            index,
            previous_hash,
            transactions,
            timestamp,
            nonce,
            hash: String::new(),
        };
        block.hash = block.compute_hash();
        block
    }

    /// Reconstructs a block from wire fields, trusting the supplied hash
    /// rather than recomputing it. Used by [`crate::node::Node::receive_block`],
    /// which must preserve the sender's claimed hash so that admission
    /// (`hash == recompute(block)`) can actually detect a mismatch.
    pub fn from_wire(
        index: u64,
        previous_hash: String,
        transactions: Vec<Transaction>,
        timestamp: f64,
        nonce: u64,
        hash: String,
    ) -> Self {
        Self {
            index,
            previous_hash,
            transactions,
            timestamp,
            nonce,
            hash,
        }
    }

    /// The fixed-shape, unpinned-hash genesis block.
    pub fn genesis() -> Self {
        Self::new(0, "0".to_string(), Vec::new(), 0.0, 0)
    }

    /// Recomputes the SHA-256 content hash over every field except `hash`
    /// itself. Timestamps (block-level and per-transaction) are stringified
    /// first, matching `original_source/blockchain_sim/core/block.py`'s
    /// `compute_hash` exactly so hashes stay comparable across languages.
    pub fn compute_hash(&self) -> String {
        let txs: Vec<serde_json::Value> = self
            .transactions
            .iter()
            .map(|tx| {
                serde_json::json!({
                    "sender": tx.sender,
                    "receiver": tx.receiver,
                    "amount": tx.amount,
                    "timestamp": python_float_str(tx.timestamp),
                    "tx_hash": tx.tx_hash,
                })
            })
            .collect();

        let value = serde_json::json!({
            "index": self.index,
            "previous_hash": self.previous_hash,
            "transactions": txs,
            "timestamp": python_float_str(self.timestamp),
            "nonce": self.nonce,
        });
        sha256_hex_value(&value)
    }
}
