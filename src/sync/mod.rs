//! Background sync: connectivity tracking and queue replay.

mod backoff;
mod connectivity;
mod coordinator;

pub use backoff::Backoff;
pub use connectivity::{spawn_health_probe, ConnectivityMonitor, ConnectivityState};
pub use coordinator::{ReplayReason, ReplaySummary, ReplayTrigger, SyncCoordinator};
