//! A reference counted cache of shared, asynchronously loaded resources.
//!
//! Many owners (widgets, scene nodes, documents) often need the same expensive resource, such
//! as a decoded texture. The [`ResourceCache`] loads each resource once, shares it between all
//! owners, and keeps track of who still needs it. A [`ResourceBinding`] ties one [`Owner`] to
//! one resource at a time and makes sure the owner only ever sees the result of its latest
//! request.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use bytes::Bytes;
//! use rescache::{Owner, ResourceBinding, ResourceCache};
//! use rescache::config::Config;
//! use rescache::loader::DownloadLoader;
//!
//! struct Sprite;
//!
//! impl Owner<Bytes> for Sprite {
//!     fn on_resource_bound(&self, texture: Option<Arc<Bytes>>) {
//!         println!("texture: {:?} bytes", texture.map(|t| t.len()));
//!     }
//! }
//!
//! # async fn run() -> anyhow::Result<()> {
//! let config = Config::get(None)?;
//! let loader = DownloadLoader::new(config.timeouts)?;
//! let cache = ResourceCache::new("textures", config.cache, loader);
//!
//! let binding = ResourceBinding::new(cache.clone(), Arc::new(Sprite), config.binding);
//! binding
//!     .bind_specifier(&config.key_resolver(), Some("https://example.com/brick.png"))?
//!     .settled()
//!     .await;
//! binding.dispose()?;
//! # Ok(())
//! # }
//! ```

#[macro_use]
pub mod metrics;

pub mod binding;
pub mod caching;
pub mod config;
pub mod key;
pub mod loader;
pub mod logging;

pub use binding::{BindRequest, BindingError, Owner, ResourceBinding};
pub use caching::{Fetch, LoadError, LoadResult, ReferenceError, ResourceCache};
pub use key::{InvalidKeyError, KeyResolver, ResourceKey};
pub use loader::{LoadFuture, ResourceLoader, ResourceLoaderExt};
