//! Caching primitives.
//!
//! - [`expiring`]: generic in-memory TTL cache used to memoise version lists.
//! - [`sweep`]: background task that periodically drops expired entries.
//! - [`store`]: on-disk content store for rewritten module archives.

pub mod expiring;
pub mod store;
pub mod sweep;

pub use expiring::ExpiringCache;
pub use store::{ContentStore, FsContentStore};
pub use sweep::{SweepHandle, start_cleanup_loop};
