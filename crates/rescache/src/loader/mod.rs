//! Loaders produce the resources that a [`ResourceCache`](crate::ResourceCache) holds.
//!
//! The cache only ever talks to the [`ResourceLoader`] trait. Any `Fn(ResourceKey) -> Future`
//! closure is a loader, and [`DownloadLoader`] fetches raw bytes from `file://` and
//! `http(s)://` keys.

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use bytes::Bytes;
use futures::FutureExt;
use futures::future::BoxFuture;

use crate::caching::LoadError;
use crate::config::DownloadTimeouts;
use crate::key::ResourceKey;

mod filesystem;
mod http;

pub use filesystem::FilesystemLoader;
pub use http::HttpLoader;

/// The future returned by [`ResourceLoader::load`].
pub type LoadFuture<R> = BoxFuture<'static, Result<R, LoadError>>;

/// Produces the resource for a key.
///
/// The cache calls `load` at most once per key while a load is pending, and drives the returned
/// future to completion even if nobody is interested in the result anymore.
///
/// `load` is called while the cache is locked. It must not call back into the cache itself; all
/// actual work belongs into the returned future.
pub trait ResourceLoader<R>: Send + Sync + 'static {
    fn load(&self, key: &ResourceKey) -> LoadFuture<R>;
}

impl<R, F, Fut> ResourceLoader<R> for F
where
    F: Fn(ResourceKey) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, LoadError>> + Send + 'static,
{
    fn load(&self, key: &ResourceKey) -> LoadFuture<R> {
        self(key.clone()).boxed()
    }
}

/// Extension methods for [`ResourceLoader`]s.
pub trait ResourceLoaderExt<R>: ResourceLoader<R> + Sized {
    /// Turns the loaded value into another resource.
    ///
    /// A decoder failure is reported as [`LoadError::Malformed`].
    fn decode<T, E, F>(self, decoder: F) -> Decode<Self, F, R>
    where
        F: Fn(R) -> Result<T, E> + Send + Sync + 'static,
        E: std::fmt::Display,
    {
        Decode {
            loader: Arc::new(self),
            decoder: Arc::new(decoder),
            _raw: PhantomData,
        }
    }
}

impl<R, L: ResourceLoader<R>> ResourceLoaderExt<R> for L {}

/// A loader that decodes the output of an inner loader, see [`ResourceLoaderExt::decode`].
pub struct Decode<L, F, R> {
    loader: Arc<L>,
    decoder: Arc<F>,
    _raw: PhantomData<fn() -> R>,
}

impl<L, F, R, T, E> ResourceLoader<T> for Decode<L, F, R>
where
    L: ResourceLoader<R>,
    F: Fn(R) -> Result<T, E> + Send + Sync + 'static,
    E: std::fmt::Display,
    R: Send + 'static,
    T: 'static,
{
    fn load(&self, key: &ResourceKey) -> LoadFuture<T> {
        let raw = self.loader.load(key);
        let decoder = Arc::clone(&self.decoder);
        let key = key.clone();
        async move {
            let raw = raw.await?;
            decoder(raw).map_err(|e| {
                tracing::debug!(%key, "failed to decode resource: {e}");
                LoadError::Malformed(e.to_string())
            })
        }
        .boxed()
    }
}

/// Loads raw bytes from `file://` and `http(s)://` keys.
#[derive(Debug, Clone)]
pub struct DownloadLoader {
    fs: Arc<FilesystemLoader>,
    http: Arc<HttpLoader>,
    timeouts: DownloadTimeouts,
}

impl DownloadLoader {
    pub fn new(timeouts: DownloadTimeouts) -> Result<Self, LoadError> {
        Ok(Self {
            fs: Arc::new(FilesystemLoader::new()),
            http: Arc::new(HttpLoader::new(&timeouts)?),
            timeouts,
        })
    }

    async fn download(self, key: ResourceKey) -> Result<Bytes, LoadError> {
        let url = key
            .to_url()
            .map_err(|e| LoadError::Unsupported(format!("`{key}` is not a URL: {e}")))?;

        let download = async {
            match url.scheme() {
                "file" => self.fs.load_url(&url).await,
                "http" | "https" => self.http.load_url(&url).await,
                scheme => Err(LoadError::Unsupported(format!("scheme `{scheme}`"))),
            }
        };

        let max_download = self.timeouts.max_download;
        match tokio::time::timeout(max_download, download).await {
            Ok(result) => result,
            Err(_) => {
                tracing::debug!(%key, "download timed out after {:?}", max_download);
                Err(LoadError::Timeout(max_download))
            }
        }
    }
}

impl ResourceLoader<Bytes> for DownloadLoader {
    fn load(&self, key: &ResourceKey) -> LoadFuture<Bytes> {
        self.clone().download(key.clone()).boxed()
    }
}
