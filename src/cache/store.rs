use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use fjall::{Config, Keyspace, PartitionCreateOptions, PartitionHandle};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::error::Result;
use super::partitions::{encode_artifact_key, encode_meta_key};
use super::pruning::{META_LAST_PRUNE, PruneStats, prune_expired};
use crate::handlers::Artifact;

/// Cached result of an earlier job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub artifact: Artifact,
    pub recorded_at: DateTime<Utc>,
}

/// Fjall-backed artifact cache
#[derive(Clone)]
pub struct ArtifactCache {
    keyspace: Keyspace,
    artifacts: PartitionHandle,
    metadata: PartitionHandle,
    ttl: ChronoDuration,
}

impl ArtifactCache {
    /// Open or create a cache at the given path
    pub fn open<P: AsRef<Path>>(path: P, ttl: Duration) -> Result<Self> {
        let path = path.as_ref();
        info!("Opening artifact cache at: {}", path.display());

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let keyspace = Config::new(path).open()?;
        let artifacts = keyspace.open_partition("artifacts", PartitionCreateOptions::default())?;
        let metadata = keyspace.open_partition("metadata", PartitionCreateOptions::default())?;

        Ok(Self {
            keyspace,
            artifacts,
            metadata,
            ttl: ChronoDuration::from_std(ttl).unwrap_or(ChronoDuration::MAX),
        })
    }

    fn is_fresh(&self, entry: &CacheEntry) -> bool {
        Utc::now()
            .checked_sub_signed(self.ttl)
            .is_none_or(|cutoff| entry.recorded_at >= cutoff)
    }

    /// Cached artifact for a URL, if unexpired and still on disk
    ///
    /// Stale entries found here are removed.
    pub fn get(&self, source_url: &str) -> Result<Option<Artifact>> {
        let key = encode_artifact_key(source_url);
        let Some(value) = self.artifacts.get(&key)? else {
            return Ok(None);
        };

        let entry: CacheEntry = serde_json::from_slice(&value)?;
        if self.is_fresh(&entry) && entry.artifact.path.exists() {
            debug!(source_url, path = %entry.artifact.path.display(), "Cache hit");
            return Ok(Some(entry.artifact));
        }

        debug!(source_url, "Dropping stale cache entry");
        self.artifacts.remove(key)?;
        Ok(None)
    }

    /// Record the final artifact of a successful job
    pub fn put(&self, source_url: &str, artifact: &Artifact) -> Result<()> {
        let entry = CacheEntry {
            artifact: artifact.clone(),
            recorded_at: Utc::now(),
        };
        self.artifacts
            .insert(encode_artifact_key(source_url), serde_json::to_vec(&entry)?)?;
        debug!(source_url, "Cached artifact");
        Ok(())
    }

    pub fn remove(&self, source_url: &str) -> Result<bool> {
        let key = encode_artifact_key(source_url);
        let existed = self.artifacts.get(&key)?.is_some();
        self.artifacts.remove(key)?;
        Ok(existed)
    }

    /// Prune expired entries and entries whose file vanished
    pub fn prune_expired(&self) -> Result<PruneStats> {
        let cutoff = Utc::now()
            .checked_sub_signed(self.ttl)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        prune_expired(&self.keyspace, &self.artifacts, &self.metadata, cutoff)
    }

    /// When `prune_expired` last ran
    pub fn last_prune(&self) -> Result<Option<DateTime<Utc>>> {
        let Some(value) = self.metadata.get(encode_meta_key(META_LAST_PRUNE))? else {
            return Ok(None);
        };
        Ok(std::str::from_utf8(&value)
            .ok()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|at| at.with_timezone(&Utc)))
    }

    /// Persist all pending writes to disk
    pub fn persist(&self) -> Result<()> {
        self.keyspace.persist(fjall::PersistMode::SyncAll)?;
        Ok(())
    }

    pub fn stats(&self) -> Result<CacheStats> {
        let mut entries = 0;
        for item in self.artifacts.iter() {
            item?;
            entries += 1;
        }
        Ok(CacheStats { entries })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub entries: usize,
}
