//! Trait definitions for the bus abstraction

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::time::Duration;
use tokio::sync::mpsc;

/// A message delivered to a subscriber
#[derive(Debug, Clone)]
pub struct BusMessage {
    /// Concrete subject the message was published on
    pub subject: String,
    pub payload: Bytes,
}

impl BusMessage {
    /// Decode the payload as JSON
    pub fn json(&self) -> Result<serde_json::Value> {
        Ok(serde_json::from_slice(&self.payload)?)
    }
}

/// Handle to an active subscription
///
/// Dropping the subscription detaches it; the backend stops delivering
/// once the channel is closed.
pub struct Subscription {
    rx: mpsc::Receiver<BusMessage>,
}

impl Subscription {
    pub fn new(rx: mpsc::Receiver<BusMessage>) -> Self {
        Self { rx }
    }

    /// Next message, or None once the subscription is closed
    pub async fn next(&mut self) -> Option<BusMessage> {
        self.rx.recv().await
    }
}

/// Request/reply envelope carried over plain pub/sub
///
/// The requester subscribes to a unique `reply_to` subject before
/// publishing; the responder publishes its result there.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcEnvelope {
    pub reply_to: String,
    pub body: serde_json::Value,
}

/// Unified bus interface
///
/// Implementations:
/// - `RedisBus`: production backend over redis pub/sub
/// - `MemoryBus`: in-memory backend for testing
#[async_trait]
pub trait Bus: Send + Sync + 'static {
    /// Allow downcasting to concrete backends
    fn as_any(&self) -> &dyn Any;

    /// Publish a payload on a subject
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<()>;

    /// Subscribe to a subject or glob pattern (`*` wildcard)
    async fn subscribe(&self, pattern: &str) -> Result<Subscription>;

    /// Liveness probe for health reporting
    async fn is_connected(&self) -> bool;

    /// Request/reply with a timeout
    ///
    /// Default implementation built on publish + subscribe with the
    /// `RpcEnvelope` convention.
    async fn request(
        &self,
        subject: &str,
        body: serde_json::Value,
        timeout: Duration,
    ) -> Result<serde_json::Value> {
        let reply_to = format!("{}.reply.{}", subject, uuid::Uuid::new_v4().simple());
        let mut sub = self.subscribe(&reply_to).await?;

        let envelope = RpcEnvelope {
            reply_to: reply_to.clone(),
            body,
        };
        self.publish(subject, Bytes::from(serde_json::to_vec(&envelope)?))
            .await?;

        match tokio::time::timeout(timeout, sub.next()).await {
            Ok(Some(msg)) => msg.json(),
            Ok(None) => Err(anyhow::anyhow!("Reply subscription closed: {}", subject)),
            Err(_) => Err(anyhow::anyhow!("RPC timeout on {}", subject)),
        }
    }

    /// Publish a JSON payload (convenience)
    async fn publish_json(&self, subject: &str, value: &serde_json::Value) -> Result<()> {
        self.publish(subject, Bytes::from(serde_json::to_vec(value)?))
            .await
    }
}

/// Glob subject match: `*` matches any run of characters
///
/// Mirrors redis PSUBSCRIBE semantics closely enough for the subject
/// shapes this system uses (`connectivity.telemetry.write.v1.*`).
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    fn matches(p: &[u8], s: &[u8]) -> bool {
        match (p.first(), s.first()) {
            (None, None) => true,
            (Some(b'*'), _) => {
                // Greedy star: try consuming zero or more subject bytes
                matches(&p[1..], s) || (!s.is_empty() && matches(p, &s[1..]))
            },
            (Some(pc), Some(sc)) if pc == sc => matches(&p[1..], &s[1..]),
            _ => false,
        }
    }
    matches(pattern.as_bytes(), subject.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subject_match_exact() {
        assert!(subject_matches("a.b.c", "a.b.c"));
        assert!(!subject_matches("a.b.c", "a.b.d"));
        assert!(!subject_matches("a.b", "a.b.c"));
    }

    #[test]
    fn test_subject_match_trailing_star() {
        assert!(subject_matches(
            "connectivity.telemetry.write.v1.*",
            "connectivity.telemetry.write.v1.plc-1"
        ));
        assert!(!subject_matches(
            "connectivity.telemetry.write.v1.*",
            "connectivity.status.v1.plc-1"
        ));
    }

    #[test]
    fn test_subject_match_inner_star() {
        assert!(subject_matches("a.*.c", "a.b.c"));
        assert!(subject_matches("a.*.c", "a.b.b.c"));
        assert!(!subject_matches("a.*.c", "a.b.d"));
    }
}
