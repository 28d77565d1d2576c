//! Connection & Tag Acquisition Engine (`acqsrv`)
//!
//! An async-first industrial data acquisition and publishing edge
//! service: it maintains long-lived connections to field devices and
//! message brokers (OPC UA, Siemens S7, EtherNet/IP, MQTT including
//! Sparkplug B), polls or subscribes to named tags, normalizes every
//! observation into a uniform telemetry record, and delivers it to the
//! internal event bus. Outbound writes and MQTT re-publication ride the
//! same runtime.
//!
//! # Architecture
//!
//! ```text
//! config bus ──► Dispatcher ──► ConnectionManager ──► Drivers
//!                                      │                 │
//!                          MetaStore (SQLite)      PollScheduler
//!                                      │                 │
//!                               Reconciler        ChangeDetector
//!                                                        │
//!                              telemetry bus ◄── TelemetryEmitter
//! ```
//!
//! - **`core::drivers`**: one driver per protocol behind a uniform
//!   capability trait (connect, grouped subscriptions, read, write,
//!   browse, reconcile hooks)
//! - **`core::scheduler`**: multi-rate tickers with overrun skip and
//!   snapshot-per-tick semantics
//! - **`core::change`**: deadband/heartbeat/quality change detection,
//!   uniform across protocols
//! - **`core::manager`**: declarative config deltas to live driver state
//! - **`core::reconcile`**: periodic diff of driver state against the
//!   metadata store
//! - **`core::emitter`**: observation encoding, per-connection stats
//!   windows, status transitions
//! - **`api`**: axum health/status endpoints

pub mod api;
pub mod config;
pub mod core;
pub mod error;
pub mod utils;

pub use config::ServiceConfig;
pub use core::manager::{ConfigEvent, ConnectionManager, DefaultDriverFactory};
pub use error::{AcqError, Result};
