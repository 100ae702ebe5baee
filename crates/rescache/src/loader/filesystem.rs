//! Support to load from the local filesystem.

use bytes::Bytes;
use url::Url;

use crate::caching::LoadError;

/// Loader implementation that reads `file://` URLs.
#[derive(Debug, Default)]
pub struct FilesystemLoader {}

impl FilesystemLoader {
    pub fn new() -> Self {
        Self {}
    }

    pub async fn load_url(&self, url: &Url) -> Result<Bytes, LoadError> {
        let path = url
            .to_file_path()
            .map_err(|_| LoadError::Unsupported(format!("`{url}` is not a local path")))?;
        tracing::debug!("Loading resource from {:?}", path);

        let contents = tokio::fs::read(&path).await?;
        Ok(Bytes::from(contents))
    }
}
