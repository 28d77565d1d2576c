//! Event-bus abstraction for the connectivity services
//!
//! Provides a unified publish/subscribe interface over Redis pub/sub,
//! with an in-memory backend for tests and a request/reply convention
//! for protocol discovery RPCs.
//!
//! # Key Components
//!
//! - **Bus trait**: publish, pattern subscribe, request/reply, liveness
//! - **RedisBus**: production backend over redis pub/sub
//! - **MemoryBus**: in-process backend for unit tests
//! - **subjects**: canonical subject names (`connectivity.*`)

pub mod memory_impl;
pub mod redis_impl;
pub mod subjects;
pub mod traits;

pub use bytes::Bytes;
pub use memory_impl::MemoryBus;
pub use redis_impl::RedisBus;
pub use traits::{Bus, BusMessage, RpcEnvelope, Subscription};

/// Helper functions for common operations
pub mod helpers {
    use super::{Bus, MemoryBus};
    use std::sync::Arc;

    /// Create an in-memory bus for unit testing
    ///
    /// No external services required; messages are routed in-process.
    pub fn create_test_bus() -> Arc<dyn Bus> {
        Arc::new(MemoryBus::new())
    }

    /// Create a concrete MemoryBus when a test needs to inspect it
    pub fn create_test_memory_bus() -> Arc<MemoryBus> {
        Arc::new(MemoryBus::new())
    }
}
