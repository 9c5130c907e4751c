//! Response caching and request routing.
//!
//! This module provides the interception side of the offline layer:
//! - Classifies requests into navigation, API read, static asset, protected write
//! - Network-first with timeout for navigations and API reads
//! - Stale-while-revalidate for scripts and styles
//! - Named, versioned cache partitions that never touch each other
//! - Hands failed protected writes to the mutation queue

mod layer;
mod router;
mod routes;
mod storage;
mod traits;

pub use layer::CacheLayer;
pub use router::{Router, RouterSettings, QUEUED_HEADER};
pub use routes::{PathTemplate, RouteKind, RouteTable};
pub use storage::{CacheStorage, SqliteStorage};
pub use traits::{CacheResult, CacheSource, CachedResponse, Partition, Strategy, UNVERSIONED};
