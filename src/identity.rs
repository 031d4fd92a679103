//! Thread-safe node identity registry: maps node ids to their public keys.
//!
//! See `original_source/blockchain_sim/core/identity_management.py`. The
//! source guards a plain dict with a lock; this crate uses a concurrent
//! map instead so registration/lookup don't serialize on a single mutex
//! across every node task.

use dashmap::DashMap;

pub type NodeId = u64;

/// Registers and resolves node public keys (PEM-encoded).
///
/// Registration refuses duplicates outright rather than erroring: a
/// second `register` for an id that's already present returns `false`
/// and leaves the existing entry untouched, matching the source's
/// `register_node`.
#[derive(Debug, Default)]
pub struct IdentityRegistry {
    keys: DashMap<NodeId, String>,
}

impl IdentityRegistry {
    pub fn new() -> Self {
        Self {
            keys: DashMap::new(),
        }
    }

    /// Registers `node_id` with `public_key_pem`. Returns `false` without
    /// modifying the registry if `node_id` is already registered.
    pub fn register(&self, node_id: NodeId, public_key_pem: String) -> bool {
        if self.keys.contains_key(&node_id) {
            tracing::warn!(node_id, "registration refused: node id already registered");
            return false;
        }
        self.keys.insert(node_id, public_key_pem);
        true
    }

    /// Removes `node_id` from the registry, if present.
    pub fn unregister(&self, node_id: NodeId) -> bool {
        self.keys.remove(&node_id).is_some()
    }

    /// Returns the registered PEM public key for `node_id`, if any.
    pub fn get_public_key(&self, node_id: NodeId) -> Option<String> {
        self.keys.get(&node_id).map(|entry| entry.clone())
    }

    pub fn is_registered(&self, node_id: NodeId) -> bool {
        self.keys.contains_key(&node_id)
    }

    /// All currently registered node ids, in no particular order.
    pub fn list_nodes(&self) -> Vec<NodeId> {
        self.keys.iter().map(|entry| *entry.key()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_then_lookup() {
        let registry = IdentityRegistry::new();
        assert!(registry.register(1, "pem-1".to_string()));
        assert_eq!(registry.get_public_key(1), Some("pem-1".to_string()));
        assert!(registry.is_registered(1));
    }

    #[test]
    fn duplicate_registration_refused() {
        let registry = IdentityRegistry::new();
        assert!(registry.register(1, "pem-1".to_string()));
        assert!(!registry.register(1, "pem-2".to_string()));
        assert_eq!(registry.get_public_key(1), Some("pem-1".to_string()));
    }

    #[test]
    fn unregister_removes_entry() {
        let registry = IdentityRegistry::new();
        registry.register(1, "pem-1".to_string());
        assert!(registry.unregister(1));
        assert!(!registry.is_registered(1));
        assert!(!registry.unregister(1));
    }

    #[test]
    fn list_nodes_reflects_registrations() {
        let registry = IdentityRegistry::new();
        registry.register(1, "pem-1".to_string());
        registry.register(2, "pem-2".to_string());
        let mut nodes = registry.list_nodes();
        nodes.sort();
        assert_eq!(nodes, vec![1, 2]);
    }
}
