//! The append-only ledger: genesis-initialized chain of blocks with
//! structural-only admission. See `original_source/blockchain_sim/core/blockchain.py`.

pub mod block;
pub mod transaction;

pub use block::Block;
pub use transaction::{Sender, Transaction};

/// Ordered chain of blocks plus the pending-transaction buffer used by
/// [`Ledger::mine_pending`].
///
/// The ledger holds no opinion about consensus: admission is purely
/// structural (link + hash check). This lets PBFT, PoA, and PoS share a
/// single tamper-evident log. Callers (the node runtime) are responsible
/// for serializing access — see `Node`'s per-node mutex, which closes a
/// hazard the source leaves open (concurrent handlers could otherwise
/// interleave `add_block` calls).
#[derive(Debug)]
pub struct Ledger {
    chain: Vec<Block>,
    pending_transactions: Vec<Transaction>,
}

impl Ledger {
    /// Creates a new ledger seeded with the genesis block.
    pub fn new() -> Self {
        Self {
            chain: vec![Block::genesis()],
            pending_transactions: Vec::new(),
        }
    }

    /// The last block in the chain.
    pub fn tip(&self) -> &Block {
        self.chain.last().expect("chain always has at least genesis")
    }

    /// Full chain, oldest first.
    pub fn chain(&self) -> &[Block] {
        &self.chain
    }

    /// Adds a transaction to the pending buffer ahead of mining.
    pub fn add_pending_transaction(&mut self, tx: Transaction) {
        self.pending_transactions.push(tx);
    }

    /// Replaces the pending-transaction buffer outright (used when the
    /// node copies its whole mempool in before mining).
    pub fn set_pending_transactions(&mut self, txs: Vec<Transaction>) {
        self.pending_transactions = txs;
    }

    /// Attempts to append `block`. Returns `false` (and logs why) if the
    /// block doesn't link to the current tip or its hash doesn't
    /// recompute. On success, clears this ledger's own pending-transaction
    /// snapshot — NOT the node's mempool, which `Node::receive_block`
    /// prunes separately by transaction hash. The split is kept
    /// deliberately rather than unified into one call.
    pub fn add_block(&mut self, block: Block) -> bool {
        let tip = self.tip();
        if block.previous_hash != tip.hash {
            tracing::warn!(
                block_index = block.index,
                block_prev = %block.previous_hash,
                tip_hash = %tip.hash,
                "block rejected: previous_hash does not match tip"
            );
            return false;
        }

        let recomputed = block.compute_hash();
        if block.hash != recomputed {
            tracing::warn!(
                block_index = block.index,
                claimed = %block.hash,
                recomputed = %recomputed,
                "block rejected: hash mismatch"
            );
            return false;
        }

        self.chain.push(block);
        self.pending_transactions.clear();
        true
    }

    /// Mines a new block from the pending-transaction buffer, first
    /// appending a `Network -> miner_id, amount=1` reward transaction.
    /// If `add` is true, the block is immediately admitted via
    /// [`Ledger::add_block`].
    pub fn mine_pending(&mut self, miner_id: u64, nonce: u64, add: bool, now: f64) -> Block {
        let reward = Transaction::new(Sender::Network, miner_id, 1, now);
        self.pending_transactions.push(reward);

        let tip = self.tip();
        let block = Block::new(
            tip.index + 1,
            tip.hash.clone(),
            self.pending_transactions.clone(),
            now,
            nonce,
        );

        if add {
            self.add_block(block.clone());
        }
        block
    }

    /// Scans from index 1, checking link and hash equality for every block.
    pub fn is_valid(&self) -> bool {
        for i in 1..self.chain.len() {
            let current = &self.chain[i];
            let previous = &self.chain[i - 1];
            if current.previous_hash != previous.hash {
                return false;
            }
            if current.hash != current.compute_hash() {
                return false;
            }
        }
        true
    }
}

impl Default for Ledger {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn genesis_only_ledger_is_valid() {
        let ledger = Ledger::new();
        assert!(ledger.is_valid());
        assert_eq!(ledger.tip().index, 0);
    }

    #[test]
    fn add_block_rejects_bad_previous_hash() {
        let mut ledger = Ledger::new();
        let bad = Block::new(1, "not-the-tip".into(), Vec::new(), 1.0, 0);
        assert!(!ledger.add_block(bad));
        assert_eq!(ledger.chain().len(), 1);
    }

    #[test]
    fn add_block_rejects_hash_mismatch() {
        let mut ledger = Ledger::new();
        let tip_hash = ledger.tip().hash.clone();
        let mut tampered = Block::new(1, tip_hash, Vec::new(), 1.0, 0);
        tampered.hash = "wrong".into();
        assert!(!ledger.add_block(tampered));
        assert_eq!(ledger.chain().len(), 1);
    }

    #[test]
    fn mine_pending_appends_reward_and_admits() {
        let mut ledger = Ledger::new();
        let block = ledger.mine_pending(7, 0, true, 100.0);
        assert_eq!(block.index, 1);
        assert_eq!(ledger.chain().len(), 2);
        assert_eq!(block.transactions.len(), 1);
        assert_eq!(block.transactions[0].receiver, 7);
    }

    #[test]
    fn mine_pending_without_add_does_not_extend_chain() {
        let mut ledger = Ledger::new();
        let block = ledger.mine_pending(7, 0, false, 100.0);
        assert_eq!(block.index, 1);
        assert_eq!(ledger.chain().len(), 1);
    }

    #[test]
    fn is_valid_detects_tampering() {
        let mut ledger = Ledger::new();
        ledger.mine_pending(1, 0, true, 1.0);
        assert!(ledger.is_valid());
        // Directly corrupt an already-admitted block's hash.
        let bad_hash = "00".repeat(32);
        let block_mut = &mut ledger.chain[1];
        block_mut.hash = bad_hash;
        assert!(!ledger.is_valid());
    }
}
