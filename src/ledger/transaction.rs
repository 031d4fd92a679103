//! Transaction record and its content hash.

use serde::de::{self, Deserializer, Visitor};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};

use crate::crypto::sha256_hex_value;

/// Sender of a transaction: either a node id, or the literal `"Network"`
/// used for mining-reward transactions (see [`crate::ledger::Ledger::mine_pending`]).
///
/// On the wire this is a plain integer for node senders and the string
/// `"Network"` for mining rewards, matching the source's untyped
/// `sender` field. `serde(untagged)` can't express a bare-string variant
/// next to a bare-number one, so (de)serialization is hand-rolled.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Sender {
    Node(u64),
    Network,
}

impl std::fmt::Display for Sender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Sender::Node(id) => write!(f, "{id}"),
            Sender::Network => write!(f, "Network"),
        }
    }
}

impl Serialize for Sender {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Sender::Node(id) => serializer.serialize_u64(*id),
            Sender::Network => serializer.serialize_str("Network"),
        }
    }
}

impl<'de> Deserialize<'de> for Sender {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct SenderVisitor;

        impl<'de> Visitor<'de> for SenderVisitor {
            type Value = Sender;

            fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str("a node id (integer) or the string \"Network\"")
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Sender, E> {
                Ok(Sender::Node(v))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Sender, E> {
                Ok(Sender::Node(v as u64))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Sender, E> {
                if v == "Network" {
                    Ok(Sender::Network)
                } else {
                    v.parse::<u64>()
                        .map(Sender::Node)
                        .map_err(|_| de::Error::custom("unrecognized sender"))
                }
            }
        }

        deserializer.deserialize_any(SenderVisitor)
    }
}

/// A single value transfer between two participants.
///
/// Immutable after construction: `tx_hash` is computed once in [`Transaction::new`]
/// and never recomputed, matching the source's `Transaction.__init__`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub sender: Sender,
    pub receiver: u64,
    pub amount: u64,
    pub timestamp: f64,
    pub tx_hash: String,
}

impl Transaction {
    /// Builds a new transaction and computes its content hash.
    pub fn new(sender: Sender, receiver: u64, amount: u64, timestamp: f64) -> Self {
        let mut tx = Self {
            sender,
            receiver,
            amount,
            timestamp,
            tx_hash: String::new(),
        };
        tx.tx_hash = tx.compute_hash();
        tx
    }

    /// Recomputes the content hash over `{sender, receiver, amount, timestamp}`.
    ///
    /// Unlike [`crate::ledger::block::Block::compute_hash`], this does not
    /// stringify the timestamp first: the source's `Transaction.compute_hash`
    /// hashes the raw float through `json.dumps(..., sort_keys=True)` (no
    /// `default=str`), and JSON already has a native float representation.
    pub fn compute_hash(&self) -> String {
        let value = serde_json::json!({
            "sender": self.sender,
            "receiver": self.receiver,
            "amount": self.amount,
            "timestamp": self.timestamp,
        });
        sha256_hex_value(&value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_deterministic_for_equal_fields() {
        let a = Transaction::new(Sender::Node(0), 1, 5, 1_700_000_000.0);
        let b = Transaction::new(Sender::Node(0), 1, 5, 1_700_000_000.0);
        assert_eq!(a.tx_hash, b.tx_hash);
    }

    #[test]
    fn hash_changes_with_amount() {
        let a = Transaction::new(Sender::Node(0), 1, 5, 1_700_000_000.0);
        let b = Transaction::new(Sender::Node(0), 1, 6, 1_700_000_000.0);
        assert_ne!(a.tx_hash, b.tx_hash);
    }

    #[test]
    fn network_sender_serializes_as_literal_string() {
        let tx = Transaction::new(Sender::Network, 1, 1, 0.0);
        let v = serde_json::to_value(&tx).unwrap();
        assert_eq!(v["sender"], serde_json::json!("Network"));
    }
}
