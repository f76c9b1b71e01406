//! Key layout for the cache partitions
//!
//! - `artifacts`: art:{source_url} -> CacheEntry (JSON)
//! - `metadata`: meta:{key} -> value (string)

/// Encode an artifact key: art:{source_url}
pub fn encode_artifact_key(source_url: &str) -> Vec<u8> {
    format!("art:{}", source_url).into_bytes()
}

/// Decode an artifact key: art:{source_url} -> source_url
pub fn decode_artifact_key(key: &[u8]) -> Option<String> {
    let key_str = std::str::from_utf8(key).ok()?;
    key_str.strip_prefix("art:").map(String::from)
}

/// Encode a metadata key: meta:{key}
pub fn encode_meta_key(key: &str) -> Vec<u8> {
    format!("meta:{}", key).into_bytes()
}
