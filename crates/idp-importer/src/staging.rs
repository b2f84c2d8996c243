//! Local staging of remote payloads
//!
//! Large source payloads are downloaded once into a content-addressed
//! staging directory. A retried attempt reuses the staged copy instead of
//! re-fetching, unless the copy is older than the configured max age or
//! missing.

use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use idp_common::{checksum, ImportError, Result};
use tracing::{debug, info};

/// Staging area for one engine instance
#[derive(Debug, Clone)]
pub struct Staging {
    dir: PathBuf,
    max_age: Duration,
}

impl Staging {
    pub fn new(dir: impl Into<PathBuf>, max_age: Duration) -> Self {
        Self {
            dir: dir.into(),
            max_age,
        }
    }

    /// Path a payload for `source_key` would be staged at
    pub fn path_for(&self, source_key: &str, extension: &str) -> PathBuf {
        let digest = checksum::bytes_sha256(source_key.as_bytes());
        self.dir.join(format!("{digest}.{extension}"))
    }

    /// Returns the staged copy for `source_key` if it exists and is fresh
    pub fn fresh_copy(&self, source_key: &str, extension: &str) -> Option<PathBuf> {
        let path = self.path_for(source_key, extension);
        let modified = std::fs::metadata(&path).and_then(|m| m.modified()).ok()?;
        let age = SystemTime::now()
            .duration_since(modified)
            .unwrap_or(Duration::ZERO);

        if age <= self.max_age {
            debug!(path = %path.display(), age_secs = age.as_secs(), "Reusing staged payload");
            Some(path)
        } else {
            debug!(path = %path.display(), age_secs = age.as_secs(), "Staged payload is stale");
            None
        }
    }

    /// Write a payload into staging, returning its path
    pub async fn stage_bytes(
        &self,
        source_key: &str,
        extension: &str,
        bytes: &[u8],
    ) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(source_key, extension);
        tokio::fs::write(&path, bytes).await?;
        info!(path = %path.display(), size_bytes = bytes.len(), "Staged payload");
        Ok(path)
    }

    /// Download `url` into staging unless a fresh copy already exists
    ///
    /// The prepared request is only sent on a staging miss, so retried
    /// attempts cost no remote traffic. HTTP errors are mapped to
    /// `SourceUnavailable` (connect/status) or `Timeout`.
    pub async fn fetch_or_reuse(
        &self,
        request: reqwest::RequestBuilder,
        source_key: &str,
        extension: &str,
    ) -> Result<PathBuf> {
        if let Some(path) = self.fresh_copy(source_key, extension) {
            return Ok(path);
        }

        let response = request.send().await.map_err(map_reqwest_error)?;
        let status = response.status();
        if !status.is_success() {
            return Err(ImportError::SourceUnavailable(format!(
                "{source_key}: HTTP {status}"
            )));
        }

        let bytes = response.bytes().await.map_err(map_reqwest_error)?;
        self.stage_bytes(source_key, extension, &bytes).await
    }
}

/// Classify a reqwest error into the importer taxonomy
pub fn map_reqwest_error(e: reqwest::Error) -> ImportError {
    if e.is_timeout() {
        ImportError::Timeout(e.to_string())
    } else if e.is_decode() {
        ImportError::Format(e.to_string())
    } else {
        ImportError::SourceUnavailable(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn staging(max_age: Duration) -> (tempfile::TempDir, Staging) {
        let dir = tempfile::tempdir().unwrap();
        let staging = Staging::new(dir.path(), max_age);
        (dir, staging)
    }

    #[tokio::test]
    async fn test_stage_and_reuse() {
        let (_dir, staging) = staging(Duration::from_secs(60));

        let path = staging
            .stage_bytes("https://example.org/data.csv", "csv", b"a,b\n1,2\n")
            .await
            .unwrap();
        assert!(path.exists());

        let reused = staging
            .fresh_copy("https://example.org/data.csv", "csv")
            .unwrap();
        assert_eq!(reused, path);
    }

    #[tokio::test]
    async fn test_stale_copy_is_not_reused() {
        let (_dir, staging) = staging(Duration::ZERO);

        staging
            .stage_bytes("https://example.org/data.csv", "csv", b"a,b\n")
            .await
            .unwrap();

        // max_age of zero makes every staged copy immediately stale
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(staging
            .fresh_copy("https://example.org/data.csv", "csv")
            .is_none());
    }

    #[test]
    fn test_paths_are_content_addressed() {
        let (_dir, staging) = staging(Duration::from_secs(60));
        let a = staging.path_for("https://example.org/a", "csv");
        let b = staging.path_for("https://example.org/b", "csv");
        assert_ne!(a, b);
        assert_eq!(a, staging.path_for("https://example.org/a", "csv"));
    }
}
