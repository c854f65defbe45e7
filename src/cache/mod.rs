//! TTL caching for recommendation bundles, wardrobe snapshots and image URIs.
//!
//! Values are wrapped in a [`CacheEntry`] envelope carrying their write time and
//! expiry, and stored as JSON under a namespaced [`CacheKey`]. Expiry is
//! enforced lazily on read; the sweeper removes entries that are never read
//! again.

mod keys;
mod layer;
mod traits;

pub use keys::{is_cache_key, CacheKey, CACHE_PREFIXES};
pub use layer::TtlCache;
pub use traits::{CacheEntry, EntryHeader, Lookup, Miss};
