//! Support to load from HTTP sources.

use bytes::Bytes;
use reqwest::{Client, StatusCode};
use url::Url;

use crate::caching::LoadError;
use crate::config::DownloadTimeouts;

/// The `User-Agent` sent with all requests.
pub const USER_AGENT: &str = concat!("rescache/", env!("CARGO_PKG_VERSION"));

/// Loader implementation that fetches `http://` and `https://` URLs.
#[derive(Debug)]
pub struct HttpLoader {
    client: Client,
}

impl HttpLoader {
    pub fn new(timeouts: &DownloadTimeouts) -> Result<Self, LoadError> {
        let client = Client::builder()
            .connect_timeout(timeouts.connect)
            .user_agent(USER_AGENT)
            .build()
            .map_err(LoadError::from_std_error)?;
        Ok(Self { client })
    }

    pub async fn load_url(&self, url: &Url) -> Result<Bytes, LoadError> {
        tracing::debug!("Fetching resource from `{}`", url);

        let response = self.client.get(url.clone()).send().await?;
        let status = response.status();
        if status.is_success() {
            tracing::trace!("Success hitting `{url}`");
            Ok(response.bytes().await?)
        } else {
            Err(status_to_error(url, status))
        }
    }
}

/// Infers the [`LoadError`] from the HTTP status code of a failed response.
fn status_to_error(url: &Url, status: StatusCode) -> LoadError {
    debug_assert!(!status.is_success());

    if matches!(status, StatusCode::FORBIDDEN | StatusCode::UNAUTHORIZED) {
        tracing::debug!("Insufficient permissions to fetch `{url}`: {status}");
        LoadError::PermissionDenied(status.to_string())
    } else if status.is_client_error() {
        // If it's a client error, chances are it's a 404.
        tracing::debug!("Unexpected client error status code from `{url}`: {status}");
        LoadError::NotFound
    } else if status == StatusCode::FOUND {
        tracing::debug!("Potential login page detected when fetching `{url}`: {status}");
        LoadError::PermissionDenied("Potential login page detected".to_string())
    } else {
        tracing::debug!("Unexpected status code from `{url}`: {status}");
        LoadError::DownloadError(status.to_string())
    }
}
