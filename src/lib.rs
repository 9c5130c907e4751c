//! Offline-resilience layer for the lesson PWA.
//!
//! Intercepts requests and answers them from named caches when the network
//! is slow or gone, queues protected writes durably while offline, replays
//! them in order once connectivity returns, and keeps a TTL-bound copy of
//! remote feature flags. Everything the UI needs to know arrives as a
//! [`signal::Signal`] on the bus.

pub mod cache;
pub mod clock;
pub mod config;
pub mod db;
pub mod flags;
pub mod http;
pub mod lifecycle;
pub mod logging;
pub mod queue;
pub mod signal;
pub mod sync;
pub mod timer;
pub mod worker;

pub use worker::Worker;
