//! Streaming downloads with SHA-256 and size computed on the fly.

use crate::core::error::{Error, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

const CHUNK_SIZE: usize = 65536;

/// Where a download landed and what it hashed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadOutcome {
    pub path: PathBuf,
    /// Lowercase hex SHA-256
    pub checksum: String,
    pub size: u64,
}

#[async_trait]
pub trait Downloader: Send + Sync {
    /// Fetch `url` into `dest`. Must stop promptly once `cancel` fires and
    /// must not leave a partial file at `dest`.
    async fn download(
        &self,
        url: &str,
        dest: &Path,
        cancel: &CancellationToken,
    ) -> Result<DownloadOutcome>;
}

/// HTTP(S) via reqwest, plus `file://` for local mirrors.
#[derive(Debug, Clone)]
pub struct HttpDownloader {
    client: reqwest::Client,
}

impl HttpDownloader {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("kura/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| Error::download("<client>", e.to_string()))?;
        Ok(Self { client })
    }

    async fn fetch_http(
        &self,
        url: &str,
        mut file: tokio::fs::File,
        tmp: &Path,
        cancel: &CancellationToken,
    ) -> Result<(String, u64)> {
        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            r = self.client.get(url).send() => r.map_err(|e| Error::download(url, e.to_string()))?,
        };
        let response = response
            .error_for_status()
            .map_err(|e| Error::download(url, e.to_string()))?;

        let mut hasher = Sha256::new();
        let mut size = 0u64;
        let mut stream = response.bytes_stream();

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                chunk = stream.next() => chunk,
            };
            let Some(chunk) = next else { break };
            let chunk = chunk.map_err(|e| Error::download(url, e.to_string()))?;
            file.write_all(&chunk).await.map_err(|e| Error::io(tmp, e))?;
            hasher.update(&chunk);
            size += chunk.len() as u64;
        }
        file.flush().await.map_err(|e| Error::io(tmp, e))?;

        Ok((hex::encode(hasher.finalize()), size))
    }
}

async fn fetch_file(
    url: &str,
    src: &Path,
    mut output: tokio::fs::File,
    tmp: &Path,
    cancel: &CancellationToken,
) -> Result<(String, u64)> {
    let mut input = tokio::fs::File::open(src)
        .await
        .map_err(|e| Error::download(url, e.to_string()))?;
    let mut hasher = Sha256::new();
    let mut size = 0u64;
    let mut buf = vec![0u8; CHUNK_SIZE];

    loop {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let n = input.read(&mut buf).await.map_err(|e| Error::io(src, e))?;
        if n == 0 {
            break;
        }
        output
            .write_all(&buf[..n])
            .await
            .map_err(|e| Error::io(tmp, e))?;
        hasher.update(&buf[..n]);
        size += n as u64;
    }
    output.flush().await.map_err(|e| Error::io(tmp, e))?;

    Ok((hex::encode(hasher.finalize()), size))
}

#[async_trait]
impl Downloader for HttpDownloader {
    async fn download(
        &self,
        url: &str,
        dest: &Path,
        cancel: &CancellationToken,
    ) -> Result<DownloadOutcome> {
        let parent = match dest.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| Error::io(parent, e))?;

        // Unique per call, removed on drop unless persisted
        let (file, tmp) = tempfile::Builder::new()
            .prefix(".kura-")
            .suffix(".part")
            .tempfile_in(parent)
            .map_err(|e| Error::io(parent, e))?
            .into_parts();
        let file = tokio::fs::File::from_std(file);

        let (checksum, size) = match url.strip_prefix("file://") {
            Some(local) => fetch_file(url, Path::new(local), file, &tmp, cancel).await?,
            None if url.starts_with("http://") || url.starts_with("https://") => {
                self.fetch_http(url, file, &tmp, cancel).await?
            }
            None => return Err(Error::download(url, "unsupported URL scheme")),
        };

        tmp.persist(dest).map_err(|e| Error::io(dest, e.error))?;

        tracing::debug!(url, size, checksum = %checksum, "downloaded");
        Ok(DownloadOutcome {
            path: dest.to_path_buf(),
            checksum,
            size,
        })
    }
}

/// Strip an optional `sha256:` prefix and lowercase, so recipe-declared and
/// computed checksums compare equal.
pub fn normalize_checksum(checksum: &str) -> String {
    let trimmed = checksum.trim();
    trimmed
        .strip_prefix("sha256:")
        .unwrap_or(trimmed)
        .to_ascii_lowercase()
}
