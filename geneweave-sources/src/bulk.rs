//! Local copies of bulk download files.

use futures_util::StreamExt;
use geneweave_core::{SourceError, SourceResult};
use reqwest::Client;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::io::AsyncWriteExt;

/// Keeps a TTL-governed local copy of a source's bulk file.
#[derive(Debug, Clone)]
pub struct BulkFileManager {
    source_name: String,
    data_dir: PathBuf,
    ttl: Duration,
    download_budget: Duration,
}

impl BulkFileManager {
    pub fn new(
        source_name: impl Into<String>,
        data_dir: impl Into<PathBuf>,
        ttl: Duration,
        download_budget: Duration,
    ) -> Self {
        Self {
            source_name: source_name.into(),
            data_dir: data_dir.into(),
            ttl,
            download_budget,
        }
    }

    pub fn path_for(&self, file_name: &str) -> PathBuf {
        self.data_dir.join(file_name)
    }

    /// Whether `path` exists and was written within the TTL.
    pub async fn is_fresh(&self, path: &Path) -> bool {
        let Ok(metadata) = tokio::fs::metadata(path).await else {
            return false;
        };
        let Ok(modified) = metadata.modified() else {
            return false;
        };
        SystemTime::now()
            .duration_since(modified)
            .map(|age| age < self.ttl)
            .unwrap_or(true)
    }

    /// Return a local path for `url`, downloading only when the existing
    /// copy is missing, stale or `force` is set.
    pub async fn ensure_file(
        &self,
        client: &Client,
        url: &str,
        file_name: &str,
        force: bool,
    ) -> SourceResult<PathBuf> {
        let target = self.path_for(file_name);
        if !force && self.is_fresh(&target).await {
            tracing::debug!(source = %self.source_name, path = %target.display(), "Reusing bulk file within TTL");
            return Ok(target);
        }

        tokio::fs::create_dir_all(&self.data_dir)
            .await
            .map_err(|e| self.file_error(format!("cannot create {}: {}", self.data_dir.display(), e)))?;

        let started = std::time::Instant::now();
        tracing::info!(source = %self.source_name, url, "Downloading bulk file");

        let partial = self.path_for(&format!("{}.part", file_name));
        let download = self.download_to(client, url, &partial);
        match tokio::time::timeout(self.download_budget, download).await {
            Ok(Ok(bytes)) => {
                tokio::fs::rename(&partial, &target)
                    .await
                    .map_err(|e| self.file_error(format!("cannot move download into place: {}", e)))?;
                tracing::info!(
                    source = %self.source_name,
                    bytes,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Bulk file downloaded"
                );
                Ok(target)
            }
            Ok(Err(e)) => {
                let _ = tokio::fs::remove_file(&partial).await;
                Err(e)
            }
            Err(_) => {
                let _ = tokio::fs::remove_file(&partial).await;
                Err(SourceError::Timeout {
                    source_name: self.source_name.clone(),
                    operation: "bulk download".to_string(),
                    budget: self.download_budget,
                })
            }
        }
    }

    async fn download_to(&self, client: &Client, url: &str, path: &Path) -> SourceResult<u64> {
        let response = client
            .get(url)
            .send()
            .await
            .map_err(|e| SourceError::transient(&self.source_name, None, format!("bulk download failed: {}", e)))?;
        let status = response.status();
        if !status.is_success() {
            let message = format!("bulk download returned {}", status);
            return Err(if status.is_server_error() || status.as_u16() == 429 {
                SourceError::transient(&self.source_name, Some(status.as_u16()), message)
            } else {
                SourceError::permanent(&self.source_name, Some(status.as_u16()), message)
            });
        }

        let mut file = tokio::fs::File::create(path)
            .await
            .map_err(|e| self.file_error(format!("cannot create {}: {}", path.display(), e)))?;
        let mut written = 0u64;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| {
                SourceError::transient(&self.source_name, None, format!("bulk download interrupted: {}", e))
            })?;
            file.write_all(&chunk)
                .await
                .map_err(|e| self.file_error(format!("write failed: {}", e)))?;
            written += chunk.len() as u64;
        }
        file.flush()
            .await
            .map_err(|e| self.file_error(format!("flush failed: {}", e)))?;
        Ok(written)
    }

    fn file_error(&self, reason: String) -> SourceError {
        SourceError::BulkFile {
            source_name: self.source_name.clone(),
            reason,
        }
    }
}
