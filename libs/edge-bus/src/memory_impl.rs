//! In-memory bus backend for unit tests

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::mpsc;
use tracing::warn;

use crate::traits::{subject_matches, Bus, BusMessage, Subscription};

const SUBSCRIBER_BUFFER: usize = 1024;

struct TopicEntry {
    pattern: String,
    tx: mpsc::Sender<BusMessage>,
}

/// In-process bus: publishes fan out to every matching subscriber
///
/// Delivery is best-effort like the production backend; a full subscriber
/// buffer drops the message rather than blocking the publisher.
pub struct MemoryBus {
    topics: Mutex<Vec<TopicEntry>>,
    published: AtomicU64,
    dropped: AtomicU64,
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBus {
    pub fn new() -> Self {
        Self {
            topics: Mutex::new(Vec::new()),
            published: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Total messages published (test inspection)
    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    /// Messages dropped due to full subscriber buffers
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Bus for MemoryBus {
    fn as_any(&self) -> &dyn Any {
        self
    }

    async fn publish(&self, subject: &str, payload: Bytes) -> Result<()> {
        self.published.fetch_add(1, Ordering::Relaxed);
        let mut topics = self.topics.lock().unwrap_or_else(|e| e.into_inner());
        // Prune closed subscribers while delivering
        topics.retain(|entry| !entry.tx.is_closed());
        for entry in topics.iter() {
            if subject_matches(&entry.pattern, subject) {
                let msg = BusMessage {
                    subject: subject.to_string(),
                    payload: payload.clone(),
                };
                if entry.tx.try_send(msg).is_err() {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    warn!("MemoryBus drop: {} (subscriber full)", subject);
                }
            }
        }
        Ok(())
    }

    async fn subscribe(&self, pattern: &str) -> Result<Subscription> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        self.topics
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(TopicEntry {
                pattern: pattern.to_string(),
                tx,
            });
        Ok(Subscription::new(rx))
    }

    async fn is_connected(&self) -> bool {
        true
    }
}
