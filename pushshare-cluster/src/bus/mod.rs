//! Host-scoped broadcast bus between cooperating processes
//!
//! Delivery is per-sender FIFO with no ordering across senders, and a
//! subscriber never sees envelopes it published itself.

pub mod memory;
pub mod redis_pubsub;

use async_trait::async_trait;
use tokio::sync::mpsc;

use pushshare_core::models::{Envelope, ProcessId};

use crate::error::Result;

pub use memory::MemoryBus;
pub use redis_pubsub::RedisBus;

/// Receiving half of a bus subscription
pub type BusReceiver = mpsc::UnboundedReceiver<Envelope>;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LocalBus: Send + Sync {
    /// Broadcast an envelope to every other subscriber
    async fn publish(&self, envelope: Envelope) -> Result<()>;

    /// Subscribe on behalf of `me`; envelopes sent by `me` are filtered out
    async fn subscribe(&self, me: ProcessId) -> Result<BusReceiver>;
}
