//! Retrying download of remote files.
//!
//! Used for the acs-engine archive and the Windows package build script.
//! Each failed attempt is logged and followed by a linear backoff
//! (`attempt_index * backoff_unit`), so with the default unit the waits are
//! 0s, 1s, 2s, ... An optional SHA-256 checksum is verified once the download
//! succeeds; a mismatch is never retried.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs::File;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

/// Default backoff unit between attempts.
const DEFAULT_BACKOFF_UNIT: Duration = Duration::from_secs(1);

/// Default timeout for a single download attempt.
const DEFAULT_TIMEOUT_SECS: u64 = 300;

/// Errors from [`Fetcher`].
#[derive(Debug, Error)]
pub enum FetchError {
    /// Destination could not be created.
    #[error("cannot create {path}: {source}")]
    Create {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// HTTP request failed.
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// Server answered with a non-success status.
    #[error("server returned HTTP {status}")]
    Status { status: u16 },

    /// Writing the body to disk failed.
    #[error("cannot write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Every attempt failed; carries the last attempt's error.
    #[error("url={url} failed after {attempts} attempts: {source}")]
    Exhausted {
        url: String,
        attempts: u32,
        #[source]
        source: Box<FetchError>,
    },

    /// Downloaded file does not match the configured checksum.
    #[error("wrong checksum for {path}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    /// Downloaded file could not be read back for verification.
    #[error("cannot checksum {path}: {source}")]
    Checksum {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// A file to download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Download {
    /// Source URL.
    pub url: String,
    /// Local file, created (or truncated) up front.
    pub destination: PathBuf,
    /// Attempts before giving up; values below 1 are treated as 1.
    pub max_attempts: u32,
    /// Expected hex SHA-256 of the file; verification is skipped when `None`.
    pub checksum: Option<String>,
}

impl Download {
    /// Download `url` to `destination` with `max_attempts` tries and no checksum.
    #[must_use]
    pub fn new(url: impl Into<String>, destination: impl Into<PathBuf>, max_attempts: u32) -> Self {
        Self {
            url: url.into(),
            destination: destination.into(),
            max_attempts,
            checksum: None,
        }
    }

    /// Verify the file against an expected SHA-256.
    #[must_use]
    pub fn with_checksum(mut self, checksum: Option<String>) -> Self {
        self.checksum = checksum;
        self
    }
}

/// Capability to fetch a URL into a local file.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Download the file, retrying transient failures.
    async fn fetch(&self, download: &Download) -> Result<(), FetchError>;
}

/// [`Fetcher`] backed by `reqwest`.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
    backoff_unit: Duration,
}

impl HttpFetcher {
    /// Create a fetcher with the default one second backoff unit.
    ///
    /// # Errors
    /// Returns error if the HTTP client cannot be created.
    pub fn new() -> Result<Self, FetchError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()?;
        Ok(Self {
            client,
            backoff_unit: DEFAULT_BACKOFF_UNIT,
        })
    }

    /// Change the backoff unit.
    #[must_use]
    pub fn with_backoff_unit(mut self, unit: Duration) -> Self {
        self.backoff_unit = unit;
        self
    }

    async fn download_once(
        &self,
        url: &str,
        path: &Path,
        file: &mut File,
    ) -> Result<u64, FetchError> {
        let write_err = |source| FetchError::Write {
            path: path.to_path_buf(),
            source,
        };

        file.set_len(0).await.map_err(write_err)?;
        file.seek(SeekFrom::Start(0)).await.map_err(write_err)?;

        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                status: status.as_u16(),
            });
        }

        let mut written = 0u64;
        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await.map_err(write_err)?;
            written += chunk.len() as u64;
        }
        file.flush().await.map_err(write_err)?;

        Ok(written)
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, download: &Download) -> Result<(), FetchError> {
        let path = &download.destination;
        let mut file = File::create(path).await.map_err(|source| FetchError::Create {
            path: path.clone(),
            source,
        })?;

        let attempts = download.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            info!(
                url = %download.url,
                destination = %path.display(),
                attempt = attempt + 1,
                "Downloading"
            );

            match self.download_once(&download.url, path, &mut file).await {
                Ok(bytes) => {
                    debug!(url = %download.url, bytes, "Download complete");
                    break;
                }
                Err(e) if attempt + 1 >= attempts => {
                    return Err(FetchError::Exhausted {
                        url: download.url.clone(),
                        attempts,
                        source: Box::new(e),
                    });
                }
                Err(e) => {
                    warn!(
                        url = %download.url,
                        destination = %path.display(),
                        attempt = attempt + 1,
                        error = %e,
                        "Download failed"
                    );
                    tokio::time::sleep(self.backoff_unit * attempt).await;
                    attempt += 1;
                }
            }
        }
        drop(file);

        if let Some(expected) = &download.checksum {
            verify_checksum(path, expected).await?;
        }
        Ok(())
    }
}

/// Hex SHA-256 of a file.
///
/// # Errors
/// Returns error if the file cannot be read.
pub async fn file_sha256(path: &Path) -> Result<String, FetchError> {
    let content = tokio::fs::read(path)
        .await
        .map_err(|source| FetchError::Checksum {
            path: path.to_path_buf(),
            source,
        })?;
    Ok(hex::encode(Sha256::digest(&content)))
}

/// Compare a file against an expected hex SHA-256 (case-insensitive).
///
/// # Errors
/// Returns [`FetchError::ChecksumMismatch`] when the digests differ.
pub async fn verify_checksum(path: &Path, expected: &str) -> Result<(), FetchError> {
    let actual = file_sha256(path).await?;
    if !actual.eq_ignore_ascii_case(expected.trim()) {
        return Err(FetchError::ChecksumMismatch {
            path: path.to_path_buf(),
            expected: expected.trim().to_string(),
            actual,
        });
    }
    debug!(path = %path.display(), "Checksum verified");
    Ok(())
}
