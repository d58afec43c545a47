use std::path::Path;

use sha2::{Digest, Sha256};
use tracing::info;

use crate::error::StorageError;

/// A recognized storage locator for an adapter artifact: the bare download
/// URL plus the orchestration hints carried in its query string.
#[derive(Debug, Clone, PartialEq)]
pub struct Storage {
    /// Download URL with the query string stripped.
    pub url: String,
    /// Explicit cache filename override (`fname` query parameter).
    pub fname: Option<String>,
    /// Adapter scale (`scale` query parameter).
    pub scale: Option<f64>,
    /// Token name for textual inversions (`token` query parameter).
    pub token: Option<String>,
}

impl Storage {
    /// Parse a locator. Only http(s) URLs are recognized; anything else
    /// yields `None` and the caller decides whether to skip or raise.
    pub fn parse(spec: &str) -> Option<Storage> {
        if !spec.starts_with("http://") && !spec.starts_with("https://") {
            return None;
        }
        let (url, query) = match spec.split_once('?') {
            Some((url, query)) => (url, Some(query)),
            None => (spec, None),
        };
        let mut storage = Storage {
            url: url.to_string(),
            fname: None,
            scale: None,
            token: None,
        };
        if let Some(query) = query {
            for pair in query.split('&') {
                let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
                match key {
                    "fname" => storage.fname = Some(value.to_string()),
                    "scale" => storage.scale = value.parse().ok(),
                    "token" => storage.token = Some(value.to_string()),
                    _ => {}
                }
            }
        }
        Some(storage)
    }

    /// Cache filename for this artifact: the explicit `fname` override, or a
    /// content hash of the full descriptor string joined to the URL basename.
    pub fn cache_filename(&self, spec: &str, prefix: &str) -> String {
        let fname = match &self.fname {
            Some(fname) => fname.clone(),
            None => {
                let digest = Sha256::digest(spec.as_bytes());
                let hash = format!("{digest:x}");
                let basename = self.url.rsplit('/').next().unwrap_or_default();
                format!("url_{}--{}", &hash[..7], basename)
            }
        };
        format!("{prefix}--{fname}")
    }

    /// Fetch the artifact to `path`. Writes through a temp file so a failed
    /// download never leaves a partial artifact behind.
    pub async fn download_to(
        &self,
        client: &reqwest::Client,
        path: &Path,
    ) -> Result<(), StorageError> {
        info!(url = %self.url, path = %path.display(), "downloading artifact");
        let response = client
            .get(&self.url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| StorageError::Download {
                url: self.url.clone(),
                reason: e.to_string(),
            })?;
        let bytes = response.bytes().await.map_err(|e| StorageError::Download {
            url: self.url.clone(),
            reason: e.to_string(),
        })?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("part");
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }
}
