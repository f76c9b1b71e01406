/// Expiry of cached artifacts
use chrono::{DateTime, Utc};
use fjall::{Keyspace, PartitionHandle};
use tracing::{debug, info};

use super::error::Result;
use super::partitions::{decode_artifact_key, encode_meta_key};
use super::store::CacheEntry;

/// Metadata key recording the last prune run (RFC 3339)
pub const META_LAST_PRUNE: &str = "last_prune";

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PruneStats {
    /// Entries older than the TTL
    pub expired: usize,
    /// Entries whose file no longer exists
    pub missing: usize,
    /// Entries that could not be decoded
    pub corrupt: usize,
}

impl PruneStats {
    pub fn total(&self) -> usize {
        self.expired + self.missing + self.corrupt
    }
}

/// Remove expired, vanished and undecodable entries
pub fn prune_expired(
    keyspace: &Keyspace,
    artifacts: &PartitionHandle,
    metadata: &PartitionHandle,
    cutoff: DateTime<Utc>,
) -> Result<PruneStats> {
    let mut stats = PruneStats::default();
    let mut doomed = Vec::new();

    for item in artifacts.iter() {
        let (key, value) = item?;
        match serde_json::from_slice::<CacheEntry>(&value) {
            Ok(entry) if entry.recorded_at < cutoff => {
                stats.expired += 1;
                doomed.push(key);
            }
            Ok(entry) if !entry.artifact.path.exists() => {
                stats.missing += 1;
                doomed.push(key);
            }
            Ok(_) => {}
            Err(e) => {
                debug!(key = ?decode_artifact_key(&key), error = %e, "Dropping undecodable cache entry");
                stats.corrupt += 1;
                doomed.push(key);
            }
        }
    }

    for key in doomed {
        artifacts.remove(key)?;
    }

    metadata.insert(
        encode_meta_key(META_LAST_PRUNE),
        Utc::now().to_rfc3339().as_bytes(),
    )?;
    keyspace.persist(fjall::PersistMode::SyncAll)?;
    info!(
        expired = stats.expired,
        missing = stats.missing,
        corrupt = stats.corrupt,
        "Cache pruning complete"
    );

    Ok(stats)
}
