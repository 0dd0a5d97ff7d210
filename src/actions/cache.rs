//! URL-keyed download cache shared by plan generation and execution.
//!
//! Each entry is `<sha256(url)>.data` plus a `<sha256(url)>.meta` JSON
//! sidecar. Entries are trusted only after their size and checksum check out.

use crate::core::error::{Error, Result};
use crate::tripwire::hasher;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

use super::download::normalize_checksum;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheMeta {
    pub url: String,

    /// Checksum the entry was saved under, if one was known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,

    pub actual_hash: String,
    pub size: u64,
    pub cached_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheInfo {
    pub entries: usize,
    pub total_bytes: u64,
}

#[derive(Debug, Clone)]
pub struct DownloadCache {
    dir: PathBuf,
}

impl DownloadCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn entry_paths(&self, url: &str) -> (PathBuf, PathBuf) {
        let key = hex::encode(Sha256::digest(url.as_bytes()));
        (
            self.dir.join(format!("{}.data", key)),
            self.dir.join(format!("{}.meta", key)),
        )
    }

    /// Metadata for a cached URL, if present and readable.
    pub fn meta(&self, url: &str) -> Option<CacheMeta> {
        let (_, meta_path) = self.entry_paths(url);
        let content = std::fs::read_to_string(meta_path).ok()?;
        serde_json::from_str(&content).ok()
    }

    /// Metadata for an entry whose bytes still match it. A corrupt entry is
    /// removed and reported as absent.
    pub fn intact(&self, url: &str) -> Result<Option<CacheMeta>> {
        let (data_path, _) = self.entry_paths(url);
        let Some(meta) = self.meta(url) else {
            return Ok(None);
        };

        let on_disk = match std::fs::metadata(&data_path) {
            Ok(m) => m.len(),
            Err(_) => {
                self.invalidate(url);
                return Ok(None);
            }
        };
        if on_disk != meta.size {
            tracing::debug!(url, "download cache entry has wrong size, discarding");
            self.invalidate(url);
            return Ok(None);
        }

        let actual = hasher::sha256_file(&data_path)?;
        if actual != meta.actual_hash {
            tracing::debug!(url, "download cache entry is corrupt, discarding");
            self.invalidate(url);
            return Ok(None);
        }
        Ok(Some(meta))
    }

    /// Copy a cached file to `dest` if the entry is intact and matches
    /// `expected`. A corrupt or mismatching entry is removed and reported as
    /// a miss.
    pub fn check(&self, url: &str, dest: &Path, expected: &str) -> Result<bool> {
        let Some(meta) = self.intact(url)? else {
            return Ok(false);
        };
        if meta.actual_hash != normalize_checksum(expected) {
            tracing::debug!(url, "download cache entry checksum differs, discarding");
            self.invalidate(url);
            return Ok(false);
        }

        let (data_path, _) = self.entry_paths(url);
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
        }
        std::fs::copy(&data_path, dest).map_err(|e| Error::io(dest, e))?;
        Ok(true)
    }

    /// Store `src` under `url`. Data and metadata are each written to a
    /// unique temp file and renamed into place.
    pub fn save(&self, url: &str, src: &Path, checksum: Option<&str>) -> Result<()> {
        std::fs::create_dir_all(&self.dir).map_err(|e| Error::io(&self.dir, e))?;
        let (data_path, meta_path) = self.entry_paths(url);

        let size = std::fs::metadata(src).map_err(|e| Error::io(src, e))?.len();
        let actual_hash = hasher::sha256_file(src)?;

        let suffix = unique_suffix();
        let data_tmp = data_path.with_extension(format!("data.{}", suffix));
        std::fs::copy(src, &data_tmp).map_err(|e| Error::io(&data_tmp, e))?;
        if let Err(e) = std::fs::rename(&data_tmp, &data_path) {
            let _ = std::fs::remove_file(&data_tmp);
            return Err(Error::io(&data_path, e));
        }

        let meta = CacheMeta {
            url: url.to_string(),
            checksum: checksum.map(normalize_checksum),
            actual_hash,
            size,
            cached_at: Utc::now(),
        };
        let json = serde_json::to_string_pretty(&meta)?;
        let meta_tmp = meta_path.with_extension(format!("meta.{}", suffix));
        std::fs::write(&meta_tmp, json).map_err(|e| Error::io(&meta_tmp, e))?;
        std::fs::rename(&meta_tmp, &meta_path).map_err(|e| Error::io(&meta_path, e))?;
        Ok(())
    }

    pub fn invalidate(&self, url: &str) {
        let (data_path, meta_path) = self.entry_paths(url);
        let _ = std::fs::remove_file(data_path);
        let _ = std::fs::remove_file(meta_path);
    }

    pub fn info(&self) -> Result<CacheInfo> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(CacheInfo::default()),
            Err(e) => return Err(Error::io(&self.dir, e)),
        };

        let mut info = CacheInfo::default();
        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "data") {
                info.entries += 1;
                info.total_bytes += entry.metadata().map(|m| m.len()).unwrap_or(0);
            }
        }
        Ok(info)
    }

    /// Remove every cached file. Returns how many files were removed.
    pub fn clear(&self) -> Result<usize> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(Error::io(&self.dir, e)),
        };

        let mut removed = 0;
        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            if path.is_file() && std::fs::remove_file(&path).is_ok() {
                removed += 1;
            }
        }
        Ok(removed)
    }
}

fn unique_suffix() -> String {
    let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
    format!("{}-{:x}.tmp", std::process::id(), nanos)
}

#[cfg(test)]
mod tests {
    use super::*;

    const URL: &str = "https://example.com/tool-1.0.tar.gz";

    fn setup() -> (tempfile::TempDir, DownloadCache, PathBuf, String) {
        let dir = tempfile::tempdir().unwrap();
        let cache = DownloadCache::new(dir.path().join("downloads"));
        let src = dir.path().join("artifact");
        std::fs::write(&src, b"artifact bytes").unwrap();
        let sum = hasher::sha256_file(&src).unwrap();
        (dir, cache, src, sum)
    }

    #[test]
    fn test_cache_save_then_check_hits() {
        let (dir, cache, src, sum) = setup();
        cache.save(URL, &src, Some(&sum)).unwrap();

        let dest = dir.path().join("out/copy");
        assert!(cache.check(URL, &dest, &sum).unwrap());
        assert_eq!(std::fs::read(&dest).unwrap(), b"artifact bytes");

        let meta = cache.meta(URL).unwrap();
        assert_eq!(meta.size, 14);
        assert_eq!(meta.actual_hash, sum);
    }

    #[test]
    fn test_cache_check_accepts_prefixed_checksum() {
        let (dir, cache, src, sum) = setup();
        cache.save(URL, &src, None).unwrap();
        let prefixed = format!("sha256:{}", sum.to_uppercase());
        assert!(cache.check(URL, &dir.path().join("d"), &prefixed).unwrap());
    }

    #[test]
    fn test_cache_miss_on_unknown_url() {
        let (dir, cache, _src, sum) = setup();
        assert!(!cache.check(URL, &dir.path().join("d"), &sum).unwrap());
    }

    #[test]
    fn test_cache_wrong_checksum_invalidates() {
        let (dir, cache, src, _sum) = setup();
        cache.save(URL, &src, None).unwrap();
        let wrong = "0".repeat(64);
        assert!(!cache.check(URL, &dir.path().join("d"), &wrong).unwrap());
        assert!(cache.meta(URL).is_none());
        assert_eq!(cache.info().unwrap().entries, 0);
    }

    #[test]
    fn test_cache_tampered_data_invalidates() {
        let (dir, cache, src, sum) = setup();
        cache.save(URL, &src, Some(&sum)).unwrap();
        let (data_path, _) = cache.entry_paths(URL);
        std::fs::write(&data_path, b"tampered bytes").unwrap();
        assert!(!cache.check(URL, &dir.path().join("d"), &sum).unwrap());
    }

    #[test]
    fn test_cache_info_and_clear() {
        let (_dir, cache, src, _sum) = setup();
        cache.save(URL, &src, None).unwrap();
        cache.save("https://example.com/other", &src, None).unwrap();

        let info = cache.info().unwrap();
        assert_eq!(info.entries, 2);
        assert_eq!(info.total_bytes, 28);

        assert_eq!(cache.clear().unwrap(), 4);
        assert_eq!(cache.info().unwrap(), CacheInfo::default());
    }

    #[test]
    fn test_cache_info_missing_dir() {
        let cache = DownloadCache::new("/nonexistent/kura/cache");
        assert_eq!(cache.info().unwrap(), CacheInfo::default());
        assert_eq!(cache.clear().unwrap(), 0);
    }
}
