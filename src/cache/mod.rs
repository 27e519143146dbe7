//! Short-lived on-disk clip cache shared across concurrent requests.

pub mod clock;
pub mod download;
pub mod flight;
pub mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use download::SourceDownloader;
pub use store::{CacheEntry, CacheKey, CacheStore, CachedSource, ReaderLease};
