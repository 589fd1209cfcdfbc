//! Discovery collaborator interface.
//!
//! Peer discovery (local beacon, global announce server) lives outside
//! the node runtime; the dialer only consumes this trait to resolve
//! the `dynamic` address placeholder. The default implementation
//! resolves nothing, which leaves static addresses in charge.

use crate::identity::NodeId;

pub trait Discovery: Send + Sync {
    /// Current addresses for a peer, `host:port` strings.
    fn lookup(&self, peer: &NodeId) -> Vec<String>;
}

/// Resolves nothing.
pub struct NoDiscovery;

impl Discovery for NoDiscovery {
    fn lookup(&self, _peer: &NodeId) -> Vec<String> {
        Vec::new()
    }
}
