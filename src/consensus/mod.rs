//! Consensus engines: PBFT, Proof-of-Authority, and Proof-of-Stake, each
//! implementing [`crate::node::ConsensusEngine`] so a [`crate::node::Node`]
//! can dispatch `*_message` envelopes to whichever one is attached.
//!
//! Grounded on `original_source/blockchain_sim/core/consensus/{pbft,poa,pos}.py`.

pub mod pbft;
pub mod poa;
pub mod pos;

use serde_json::Value;

use crate::identity::NodeId;

/// Extracts the `index` field of a block JSON value, defaulting to 0 if
/// absent or malformed (consensus messages with an unreadable block are
/// rejected earlier, so this only applies to already-trusted blocks).
pub(crate) fn block_index(block: &Value) -> u64 {
    block.get("index").and_then(Value::as_u64).unwrap_or(0)
}

pub(crate) fn block_previous_hash(block: &Value) -> String {
    block
        .get("previous_hash")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

pub(crate) fn block_hash(block: &Value) -> String {
    block
        .get("hash")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

/// Signs `block` (as canonical JSON) alongside a message-type/view/seq/
/// sender header, matching the `f"{type}:{view}:{seq}:{node_id}:{block_str}"`
/// signing convention shared by all three engines in the source. Unlike
/// the source, which signs `str(block)` (Python's unstable dict repr),
/// this signs the canonical (sorted-key) JSON encoding so signatures are
/// reproducible across processes and languages — a deliberate deviation
/// documented alongside the rest of the signing scope decisions.
pub(crate) fn sign_block_message(
    keypair: &crate::crypto::Keypair,
    header: &str,
    block: &Value,
) -> String {
    let block_str = crate::crypto::canonical_json(block);
    let message_data = format!("{header}:{block_str}");
    keypair.sign(&message_data)
}

pub(crate) fn verify_block_message(
    public_key_pem: &str,
    header: &str,
    block: &Value,
    signature_hex: &str,
) -> bool {
    let block_str = crate::crypto::canonical_json(block);
    let message_data = format!("{header}:{block_str}");
    crate::crypto::verify(public_key_pem, &message_data, signature_hex)
}

/// Records a node id as malicious the first time it's seen, logging
/// only on the transition (matching every engine's `_record_malicious`).
pub(crate) fn record_malicious_once(set: &mut std::collections::HashSet<NodeId>, node_id: NodeId, engine: &str) {
    if set.insert(node_id) {
        tracing::warn!(node_id, engine, "node recorded as malicious");
    }
}
