//! The seam between connection handling and message content.

use crate::manager::ConnectionManager;
use crate::peer::PeerConnection;

/// Handles message content on behalf of the connection manager.
///
/// The manager hands itself to every call so the processor can queue
/// replies with [`ConnectionManager::push_message`] or drop a peer with
/// [`PeerConnection::mark_for_disconnect`] without holding a reference back
/// to the manager.
pub trait MessageProcessor: Send + Sync + 'static {
    /// A connection was registered; typically sends `version` on outbound.
    fn initialize_node(&self, manager: &ConnectionManager, node: &PeerConnection);

    /// Handle queued inbound messages. Returns true if more work is
    /// pending, in which case the dispatch loop does not sleep.
    fn process_messages(&self, manager: &ConnectionManager, node: &PeerConnection) -> bool;

    /// Queue whatever the peer is owed (pings, address relay, ...).
    fn send_messages(&self, manager: &ConnectionManager, node: &PeerConnection);

    /// The connection is about to be destroyed. Returns true if the
    /// address store should refresh the peer's timestamp.
    fn finalize_node(&self, manager: &ConnectionManager, node: &PeerConnection) -> bool;
}
