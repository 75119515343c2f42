//! Callbacks surfaced by the pub/sub façade

use crate::error::Error;
use crate::topics::Topic;

/// Receiver of connection and topic lifecycle callbacks
///
/// Every method defaults to a no-op. Callbacks run on the façade's event
/// loop, one at a time, so implementations may hold plain mutable state but
/// must not block.
pub trait PubSubHandler: Send + 'static {
    fn on_connected(&mut self) {}

    fn on_disconnected(&mut self) {}

    fn on_error(&mut self, _error: &Error) {}

    /// A topic appeared in a `topics` reconciliation. Per-topic hooks may be
    /// installed on `topic` before any further message reaches it.
    fn on_new_topic(&mut self, _topic: &mut Topic) {}

    fn on_removed_topic(&mut self, _topic: &Topic) {}
}

impl PubSubHandler for () {}
