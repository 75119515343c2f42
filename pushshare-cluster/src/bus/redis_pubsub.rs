use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client as RedisClient};
use tokio::sync::{mpsc, OnceCell};
use tokio::time::{timeout, Duration};
use tracing::{debug, error, info, warn};

use pushshare_core::models::{Envelope, ProcessId};

use super::{BusReceiver, LocalBus};
use crate::error::{Error, Result};

/// Timeout for Redis operations in seconds
const REDIS_TIMEOUT_SECS: u64 = 5;

/// Initial backoff delay for subscriber reconnection
const INITIAL_BACKOFF_SECS: u64 = 1;

/// Maximum backoff delay for subscriber reconnection
const MAX_BACKOFF_SECS: u64 = 30;

/// Bus carried over a single Redis pub/sub channel
///
/// Every envelope is published as JSON on `channel`; subscribers parse and
/// drop their own. Redis pub/sub preserves per-publisher order, which is all
/// the membership protocol relies on.
pub struct RedisBus {
    client: RedisClient,
    channel: String,
    publisher: OnceCell<ConnectionManager>,
}

impl RedisBus {
    /// Create a bus for `channel` on the Redis server at `redis_url`
    ///
    /// No connection is made until the first publish or subscribe.
    pub fn new(redis_url: &str, channel: impl Into<String>) -> Result<Self> {
        let client = RedisClient::open(redis_url)?;
        Ok(Self {
            client,
            channel: channel.into(),
            publisher: OnceCell::new(),
        })
    }

    #[must_use]
    pub fn channel(&self) -> &str {
        &self.channel
    }

    async fn publisher(&self) -> Result<ConnectionManager> {
        let manager = self
            .publisher
            .get_or_try_init(|| async {
                match timeout(
                    Duration::from_secs(REDIS_TIMEOUT_SECS),
                    self.client.get_connection_manager(),
                )
                .await
                {
                    Ok(result) => result.map_err(Error::from),
                    Err(_) => Err(Error::Timeout("connecting Redis bus publisher".to_string())),
                }
            })
            .await?;
        Ok(manager.clone())
    }
}

#[async_trait]
impl LocalBus for RedisBus {
    async fn publish(&self, envelope: Envelope) -> Result<()> {
        let payload = serde_json::to_string(&envelope)?;
        let mut conn = self.publisher().await?;

        let receivers: i64 = match timeout(
            Duration::from_secs(REDIS_TIMEOUT_SECS),
            conn.publish(&self.channel, payload),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => return Err(Error::Timeout("publishing to Redis bus".to_string())),
        };

        debug!(
            channel = %self.channel,
            message_type = envelope.message.message_type(),
            receivers = receivers,
            "Envelope published to Redis bus"
        );
        Ok(())
    }

    async fn subscribe(&self, me: ProcessId) -> Result<BusReceiver> {
        let (tx, rx) = mpsc::unbounded_channel();
        let client = self.client.clone();
        let channel = self.channel.clone();

        tokio::spawn(async move {
            let mut backoff_secs = INITIAL_BACKOFF_SECS;

            loop {
                match run_subscriber(&client, &channel, me, &tx).await {
                    SubscriberExit::ReceiverDropped => {
                        debug!(process_id = %me, "Redis bus subscriber dropped");
                        return;
                    }
                    SubscriberExit::Disconnected => {
                        error!(
                            channel = %channel,
                            "Redis bus subscription ended (connection lost), reconnecting after {}s",
                            INITIAL_BACKOFF_SECS
                        );
                        backoff_secs = INITIAL_BACKOFF_SECS;
                    }
                    SubscriberExit::ConnectFailed(e) => {
                        error!(
                            error = %e,
                            backoff_secs = backoff_secs,
                            "Redis bus subscriber failed to connect, retrying after backoff"
                        );
                    }
                }

                tokio::select! {
                    () = tx.closed() => return,
                    () = tokio::time::sleep(Duration::from_secs(backoff_secs)) => {}
                }
                backoff_secs = (backoff_secs * 2).min(MAX_BACKOFF_SECS);
            }
        });

        Ok(rx)
    }
}

enum SubscriberExit {
    /// The local receiver went away; stop for good
    ReceiverDropped,
    /// Connection was healthy and then dropped
    Disconnected,
    /// Could not connect or subscribe
    ConnectFailed(Error),
}

async fn run_subscriber(
    client: &RedisClient,
    channel: &str,
    me: ProcessId,
    tx: &mpsc::UnboundedSender<Envelope>,
) -> SubscriberExit {
    let mut pubsub = match timeout(Duration::from_secs(REDIS_TIMEOUT_SECS), client.get_async_pubsub()).await {
        Ok(Ok(ps)) => ps,
        Ok(Err(e)) => return SubscriberExit::ConnectFailed(e.into()),
        Err(_) => {
            return SubscriberExit::ConnectFailed(Error::Timeout(
                "getting Redis pub/sub connection".to_string(),
            ))
        }
    };

    match timeout(Duration::from_secs(REDIS_TIMEOUT_SECS), pubsub.subscribe(channel)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => return SubscriberExit::ConnectFailed(e.into()),
        Err(_) => {
            return SubscriberExit::ConnectFailed(Error::Timeout(format!("subscribing to {channel}")))
        }
    }

    info!(channel = %channel, process_id = %me, "Redis bus subscriber connected");

    let mut stream = pubsub.on_message();
    loop {
        let msg = tokio::select! {
            () = tx.closed() => return SubscriberExit::ReceiverDropped,
            msg = stream.next() => msg,
        };
        let Some(msg) = msg else {
            return SubscriberExit::Disconnected;
        };

        let payload: String = match msg.get_payload() {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, channel = %channel, "Invalid payload on Redis bus");
                continue;
            }
        };

        match serde_json::from_str::<Envelope>(&payload) {
            Ok(envelope) => {
                if envelope.from == me {
                    continue;
                }
                if tx.send(envelope).is_err() {
                    return SubscriberExit::ReceiverDropped;
                }
            }
            Err(e) => {
                warn!(
                    error = %e,
                    channel = %channel,
                    payload = %payload,
                    "Failed to deserialize bus envelope"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_accepts_valid_url_without_connecting() {
        let bus = RedisBus::new("redis://127.0.0.1:6379", "pushshare:test").unwrap();
        assert_eq!(bus.channel(), "pushshare:test");
    }

    #[test]
    fn test_new_rejects_invalid_url() {
        assert!(matches!(RedisBus::new("not a url", "c"), Err(Error::Redis(_))));
    }
}
