/// Fjall-backed cache of finished artifacts keyed by source URL
///
/// A later job for the same URL is served from the cache while the entry is
/// younger than the configured TTL and its file still exists on disk.
///
/// ## Partitions
///
/// - `artifacts`: art:{source_url} -> CacheEntry (JSON)
/// - `metadata`: meta:{key} -> value (string)
///
/// ## Usage
///
/// ```rust,ignore
/// use mediafix::cache::ArtifactCache;
///
/// let cache = ArtifactCache::open("data/cache", Duration::from_secs(30 * 86400))?;
/// cache.put("https://youtu.be/abc", &artifact)?;
/// let hit = cache.get("https://youtu.be/abc")?;
/// ```

pub mod error;
pub mod partitions;
pub mod pruning;
pub mod store;

pub use error::{CacheError, Result};
pub use pruning::PruneStats;
pub use store::{ArtifactCache, CacheEntry, CacheStats};
