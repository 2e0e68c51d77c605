//! Local metadata index (component B).
//!
//! A flat directory of small JSON records, one per prefix key, used by the
//! matching engine to find restore candidates after a process restart or
//! after a hot binding has been evicted. Naming follows the original
//! `slotcache_<key>.meta.json` convention rather than a generic `<key>.meta.json`.

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, thiserror::Error)]
pub enum MetadataError {
    #[error("failed to create metadata directory {0}: {1}")]
    CreateDir(PathBuf, std::io::Error),
    #[error("failed to write metadata record: {0}")]
    Write(std::io::Error),
    #[error("failed to serialize metadata record: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// On-disk metadata record. Field names (`blocks`, `prefix_len_chars`) match
/// the on-disk JSON shape exactly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaRecord {
    pub key: String,
    pub model_id: String,
    pub prefix_len_chars: usize,
    pub blocks: Vec<String>,
    pub words_per_block: usize,
    pub updated_at: u64,
}

/// A scanned record paired with the file's modification time, so callers can
/// sort by true recency rather than trusting file order.
pub struct ScannedRecord {
    pub record: MetaRecord,
    pub modified: SystemTime,
}

pub struct MetadataIndex {
    dir: PathBuf,
}

impl MetadataIndex {
    /// Ensures the metadata directory exists, creating it if necessary.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, MetadataError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| MetadataError::CreateDir(dir.clone(), e))?;
        Ok(Self { dir })
    }

    fn path_for_key(&self, key: &str) -> PathBuf {
        self.dir.join(format!("slotcache_{key}.meta.json"))
    }

    /// Writes a metadata record for `key`, atomically replacing any prior
    /// record (write to a sibling temp file, then rename).
    pub async fn write(
        &self,
        key: &str,
        prefix_len_chars: usize,
        model_id: &str,
        words_per_block: usize,
        blocks: Vec<String>,
    ) -> Result<(), MetadataError> {
        let updated_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let record = MetaRecord {
            key: key.to_string(),
            model_id: model_id.to_string(),
            prefix_len_chars,
            blocks,
            words_per_block,
            updated_at,
        };
        let body = serde_json::to_vec(&record)?;
        let final_path = self.path_for_key(key);
        let tmp_path = final_path.with_extension("meta.json.tmp");
        tokio::fs::write(&tmp_path, &body)
            .await
            .map_err(MetadataError::Write)?;
        tokio::fs::rename(&tmp_path, &final_path)
            .await
            .map_err(MetadataError::Write)?;
        Ok(())
    }

    /// Returns up to `limit` records, most-recently-modified first. Corrupt
    /// or unreadable records are skipped; the scan never fails outright.
    pub async fn scan(&self, limit: usize) -> Vec<ScannedRecord> {
        let dir = self.dir.clone();
        tokio::task::spawn_blocking(move || scan_blocking(&dir, limit))
            .await
            .unwrap_or_default()
    }
}

fn scan_blocking(dir: &Path, limit: usize) -> Vec<ScannedRecord> {
    let entries = match std::fs::read_dir(dir) {
        Ok(e) => e,
        Err(e) => {
            warn!(dir = %dir.display(), error = %e, "metadata_scan_dir_unreadable");
            return Vec::new();
        }
    };

    let mut candidates: Vec<(PathBuf, SystemTime)> = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        let name = match path.file_name().and_then(|n| n.to_str()) {
            Some(n) => n,
            None => continue,
        };
        if !(name.starts_with("slotcache_") && name.ends_with(".meta.json")) {
            continue;
        }
        let modified = match entry.metadata().and_then(|m| m.modified()) {
            Ok(m) => m,
            Err(_) => continue,
        };
        candidates.push((path, modified));
    }
    candidates.sort_by(|a, b| b.1.cmp(&a.1));

    let mut out = Vec::with_capacity(limit.min(candidates.len()));
    for (path, modified) in candidates.into_iter().take(limit) {
        match std::fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice::<MetaRecord>(&bytes) {
                Ok(record) => out.push(ScannedRecord { record, modified }),
                Err(e) => warn!(path = %path.display(), error = %e, "metadata_record_corrupt"),
            },
            Err(e) => warn!(path = %path.display(), error = %e, "metadata_record_unreadable"),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_then_scan_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        let index = MetadataIndex::open(tmp.path()).await.unwrap();
        index
            .write("abc123", 400, "llama.cpp", 16, vec!["h1".into(), "h2".into()])
            .await
            .unwrap();

        let scanned = index.scan(10).await;
        assert_eq!(scanned.len(), 1);
        assert_eq!(scanned[0].record.key, "abc123");
        assert_eq!(scanned[0].record.blocks, vec!["h1", "h2"]);
    }

    #[tokio::test]
    async fn scan_skips_corrupt_records() {
        let tmp = tempfile::tempdir().unwrap();
        let index = MetadataIndex::open(tmp.path()).await.unwrap();
        index.write("good", 10, "m", 16, vec!["h".into()]).await.unwrap();
        tokio::fs::write(tmp.path().join("slotcache_bad.meta.json"), b"not json")
            .await
            .unwrap();

        let scanned = index.scan(10).await;
        assert_eq!(scanned.len(), 1);
        assert_eq!(scanned[0].record.key, "good");
    }

    #[tokio::test]
    async fn scan_respects_limit() {
        let tmp = tempfile::tempdir().unwrap();
        let index = MetadataIndex::open(tmp.path()).await.unwrap();
        for i in 0..5 {
            index
                .write(&format!("k{i}"), 1, "m", 16, vec![format!("h{i}")])
                .await
                .unwrap();
        }
        let scanned = index.scan(2).await;
        assert_eq!(scanned.len(), 2);
    }
}
