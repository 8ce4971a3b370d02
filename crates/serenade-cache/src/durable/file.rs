//! File-per-key fallback engine
//!
//! Used when the primary engine cannot be opened. There are no indices:
//! tag, age and category queries are answered by scanning every record.
//! Total on-disk size is capped by a byte quota; a write that would exceed
//! it fails with [`CacheError::QuotaExceeded`].

use std::{
    io::{Read, Write},
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::debug;

use super::engine::{DurableEngine, DurableRecord, RecordInfo};
use crate::{CacheError, Result};

const RECORD_EXT: &str = "rec";
const TEMP_EXT: &str = "tmp";

/// Keyed store on plain files with a size quota
#[derive(Debug, Clone)]
pub struct FileEngine {
    base_path: PathBuf,
    quota_bytes: u64,
    compress: bool,
}

impl FileEngine {
    pub fn new<P: AsRef<Path>>(base_path: P, quota_bytes: u64) -> Self {
        Self {
            base_path: base_path.as_ref().to_path_buf(),
            quota_bytes,
            compress: false,
        }
    }

    /// Gzip record files
    pub fn with_compression(mut self, compress: bool) -> Self {
        self.compress = compress;
        self
    }

    pub fn quota_bytes(&self) -> u64 {
        self.quota_bytes
    }

    /// File path for a key
    ///
    /// Names are a SHA-256 digest so any key length fits the filesystem's
    /// name limit. The record itself carries the original key.
    fn key_path(&self, key: &str) -> PathBuf {
        let digest = Sha256::digest(key.as_bytes());
        self.base_path
            .join(format!("{}.{}", hex::encode(digest), RECORD_EXT))
    }

    async fn ensure_base_dir(&self) -> Result<()> {
        if !self.base_path.exists() {
            fs::create_dir_all(&self.base_path).await?;
        }
        Ok(())
    }

    fn encode(&self, record: &DurableRecord) -> Result<Vec<u8>> {
        let json = serde_json::to_vec(record)?;
        if !self.compress {
            return Ok(json);
        }
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&json)?;
        Ok(encoder.finish()?)
    }

    fn decode(&self, bytes: &[u8]) -> Result<DurableRecord> {
        let parsed = if bytes.starts_with(&[0x1f, 0x8b]) {
            let mut json = Vec::new();
            GzDecoder::new(bytes).read_to_end(&mut json)?;
            serde_json::from_slice(&json)
        } else {
            serde_json::from_slice(bytes)
        };
        parsed.map_err(|e| CacheError::Deserialization {
            message: e.to_string(),
        })
    }

    async fn record_paths(&self) -> Result<Vec<PathBuf>> {
        if !self.base_path.exists() {
            return Ok(Vec::new());
        }
        let mut paths = Vec::new();
        let mut entries = fs::read_dir(&self.base_path).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == RECORD_EXT) {
                paths.push(path);
            }
        }
        Ok(paths)
    }

    /// Bytes currently on disk across all records
    pub async fn used_bytes(&self) -> Result<u64> {
        let mut total = 0u64;
        for path in self.record_paths().await? {
            if let Ok(metadata) = fs::metadata(&path).await {
                total += metadata.len();
            }
        }
        Ok(total)
    }
}

#[async_trait]
impl DurableEngine for FileEngine {
    fn name(&self) -> &'static str {
        "file"
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let path = self.key_path(key);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let record = self.decode(&bytes)?;
        Ok(Some(record.payload))
    }

    async fn put(&self, record: &DurableRecord) -> Result<()> {
        self.ensure_base_dir().await?;

        let bytes = self.encode(record)?;
        let path = self.key_path(&record.key);
        let existing = fs::metadata(&path).await.map(|m| m.len()).unwrap_or(0);
        let used_by_others = self.used_bytes().await?.saturating_sub(existing);
        let requested = bytes.len() as u64;

        if used_by_others + requested > self.quota_bytes {
            return Err(CacheError::QuotaExceeded {
                requested,
                available: self.quota_bytes.saturating_sub(used_by_others),
            });
        }

        let temp_path = path.with_extension(TEMP_EXT);
        fs::write(&temp_path, &bytes).await?;
        fs::rename(&temp_path, &path).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        match fs::remove_file(self.key_path(key)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn keys(&self) -> Result<Vec<String>> {
        Ok(self.scan().await?.into_iter().map(|info| info.key).collect())
    }

    async fn scan(&self) -> Result<Vec<RecordInfo>> {
        let mut infos = Vec::new();
        for path in self.record_paths().await? {
            let bytes = match fs::read(&path).await {
                Ok(bytes) => bytes,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            match self.decode(&bytes) {
                Ok(record) => infos.push(RecordInfo {
                    size_bytes: bytes.len() as u64,
                    key: record.key,
                    category: record.category,
                    updated_at: record.updated_at,
                    tags: record.tags,
                }),
                Err(e) => {
                    debug!(path = %path.display(), error = %e, "removing unreadable cache record");
                    let _ = fs::remove_file(&path).await;
                }
            }
        }
        Ok(infos)
    }
}
