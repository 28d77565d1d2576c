//! Redis pub/sub bus backend

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use std::any::Any;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::traits::{Bus, BusMessage, Subscription};

const SUBSCRIBER_BUFFER: usize = 4096;
const MIN_RESUBSCRIBE_DELAY: Duration = Duration::from_millis(250);
const MAX_RESUBSCRIBE_DELAY: Duration = Duration::from_secs(8);

/// Production bus over redis pub/sub
///
/// Publishes go through a shared auto-reconnecting `ConnectionManager`;
/// each subscription runs its own pubsub connection in a background task
/// that resubscribes with backoff after connection loss.
pub struct RedisBus {
    client: redis::Client,
    publisher: ConnectionManager,
}

impl RedisBus {
    /// Connect to the bus at the given redis URL
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).context("Invalid bus URL")?;
        let publisher = client
            .get_connection_manager()
            .await
            .context("Bus connection failed")?;
        debug!("Bus connected: {}", url);
        Ok(Self { client, publisher })
    }

    async fn run_subscriber(
        client: redis::Client,
        pattern: String,
        tx: mpsc::Sender<BusMessage>,
    ) {
        let mut delay = MIN_RESUBSCRIBE_DELAY;
        loop {
            if tx.is_closed() {
                return;
            }

            let attempt: Result<()> = async {
                let mut pubsub = client.get_async_pubsub().await?;
                if pattern.contains('*') {
                    pubsub.psubscribe(&pattern).await?;
                } else {
                    pubsub.subscribe(&pattern).await?;
                }
                debug!("Bus subscribed: {}", pattern);
                delay = MIN_RESUBSCRIBE_DELAY;

                let mut stream = pubsub.on_message();
                while let Some(msg) = stream.next().await {
                    let message = BusMessage {
                        subject: msg.get_channel_name().to_string(),
                        payload: Bytes::copy_from_slice(msg.get_payload_bytes()),
                    };
                    if tx.send(message).await.is_err() {
                        // Subscriber dropped; exit quietly
                        return Ok(());
                    }
                }
                Err(anyhow::anyhow!("pubsub stream ended"))
            }
            .await;

            if tx.is_closed() {
                return;
            }
            if let Err(e) = attempt {
                warn!("Bus subscription {} lost: {}, retry {:?}", pattern, e, delay);
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(MAX_RESUBSCRIBE_DELAY);
            } else {
                return;
            }
        }
    }
}

#[async_trait]
impl Bus for RedisBus {
    fn as_any(&self) -> &dyn Any {
        self
    }

    async fn publish(&self, subject: &str, payload: Bytes) -> Result<()> {
        let mut conn = self.publisher.clone();
        let _: () = redis::cmd("PUBLISH")
            .arg(subject)
            .arg(payload.as_ref())
            .query_async(&mut conn)
            .await
            .with_context(|| format!("Publish failed: {}", subject))?;
        Ok(())
    }

    async fn subscribe(&self, pattern: &str) -> Result<Subscription> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        tokio::spawn(Self::run_subscriber(
            self.client.clone(),
            pattern.to_string(),
            tx,
        ));
        Ok(Subscription::new(rx))
    }

    async fn is_connected(&self) -> bool {
        let mut conn = self.publisher.clone();
        let pong: redis::RedisResult<String> = redis::cmd("PING").query_async(&mut conn).await;
        pong.is_ok()
    }
}
