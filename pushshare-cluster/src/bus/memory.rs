use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use pushshare_core::models::{Envelope, ProcessId};

use super::{BusReceiver, LocalBus};
use crate::error::Result;

/// In-process bus backed by a tokio broadcast channel
///
/// Every façade built from clones of one `MemoryBus` shares the same channel,
/// which is how several processes are simulated inside one runtime.
#[derive(Clone)]
pub struct MemoryBus {
    tx: broadcast::Sender<Envelope>,
}

impl MemoryBus {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Number of live subscriptions
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl LocalBus for MemoryBus {
    async fn publish(&self, envelope: Envelope) -> Result<()> {
        // No receivers is not an error: the sender may simply be alone on the host
        if self.tx.send(envelope).is_err() {
            debug!("Published to memory bus with no subscribers");
        }
        Ok(())
    }

    async fn subscribe(&self, me: ProcessId) -> Result<BusReceiver> {
        let mut rx = self.tx.subscribe();
        let (tx, out) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(envelope) => {
                        if envelope.from == me {
                            continue;
                        }
                        if tx.send(envelope).is_err() {
                            debug!(process_id = %me, "Memory bus subscriber dropped");
                            return;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(process_id = %me, skipped = skipped, "Memory bus subscriber lagged, messages dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });

        Ok(out)
    }
}
