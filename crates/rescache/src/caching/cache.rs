use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use futures::FutureExt;
use futures::future::{self, BoxFuture, Either, Ready, Shared};

use crate::config::{CacheConfig, ReleasePolicy};
use crate::key::ResourceKey;
use crate::loader::ResourceLoader;

use super::{LoadResult, ReferenceError};

/// A load that is shared between all concurrent fetches of one key.
type SharedLoad<R> = Shared<BoxFuture<'static, LoadResult<R>>>;

/// The future returned by [`ResourceCache::fetch`].
pub type Fetch<R> = Either<Ready<LoadResult<R>>, SharedLoad<R>>;

/// The cache-side record of one key.
struct Entry<R> {
    /// The loaded resource. The entry holds the only strong reference the cache hands out from.
    resource: Option<Arc<R>>,
    /// Number of outstanding [`ResourceCache::add_reference`] calls.
    refcount: u32,
    /// The load that is currently running for this key.
    pending: Option<SharedLoad<R>>,
}

impl<R> Default for Entry<R> {
    fn default() -> Self {
        Self {
            resource: None,
            refcount: 0,
            pending: None,
        }
    }
}

impl<R> Entry<R> {
    /// Whether the configured release policy may drop this entry right away.
    fn is_disposable(&self) -> bool {
        self.refcount == 0 && self.pending.is_none()
    }
}

struct Inner<R> {
    name: &'static str,
    config: CacheConfig,
    loader: Box<dyn ResourceLoader<R>>,
    entries: Mutex<HashMap<ResourceKey, Entry<R>>>,
}

impl<R> Inner<R> {
    fn entries(&self) -> MutexGuard<'_, HashMap<ResourceKey, Entry<R>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records the outcome of the load for `key`.
    ///
    /// This runs exactly once per load, inside the shared future, before any waiter observes
    /// the result.
    fn settle(&self, key: &ResourceKey, result: &LoadResult<R>) {
        let mut entries = self.entries();
        let Some(entry) = entries.get_mut(key) else {
            tracing::error!(%key, cache = self.name, "settled a load without cache entry");
            return;
        };
        entry.pending = None;

        match result {
            Ok(resource) => {
                tracing::trace!(%key, cache = self.name, "load finished");
                entry.resource = Some(Arc::clone(resource));
            }
            Err(error) => {
                tracing::debug!(%key, cache = self.name, %error, "load failed");
                metric!(counter("caches.load.error") += 1, "cache" => self.name);
            }
        }

        if self.config.release == ReleasePolicy::Immediate && entry.is_disposable() {
            tracing::trace!(%key, cache = self.name, "disposing unreferenced entry");
            entries.remove(key);
        }
    }
}

/// A keyed pool of shared, reference counted resources.
///
/// The cache owns every resource it has loaded. Users announce their interest in a key with
/// [`add_reference`](Self::add_reference) and give it up with
/// [`remove_reference`](Self::remove_reference); a key whose count drops to zero is eligible
/// for disposal according to the configured [`ReleasePolicy`].
///
/// Reference management is orthogonal to [`fetch`](Self::fetch): fetching never changes a count.
/// Concurrent fetches of the same key are coalesced into a single call to the
/// [`ResourceLoader`], and every waiter observes the same resource or the same error. Failed
/// loads are not remembered, the next fetch starts over.
///
/// Cloning the cache is cheap and yields a handle to the same pool.
pub struct ResourceCache<R> {
    inner: Arc<Inner<R>>,
}

impl<R> Clone for ResourceCache<R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<R> fmt::Debug for ResourceCache<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries = self.inner.entries();
        let pending = entries.values().filter(|e| e.pending.is_some()).count();
        f.debug_struct("ResourceCache")
            .field("name", &self.inner.name)
            .field("config", &self.inner.config)
            .field("entries", &entries.len())
            .field("pending loads", &pending)
            .finish()
    }
}

impl<R> ResourceCache<R>
where
    R: Send + Sync + 'static,
{
    /// Creates an empty cache.
    ///
    /// `name` is used to tag logs and metrics.
    pub fn new(name: &'static str, config: CacheConfig, loader: impl ResourceLoader<R>) -> Self {
        let inner = Inner {
            name,
            config,
            loader: Box::new(loader),
            entries: Mutex::new(HashMap::new()),
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn name(&self) -> &'static str {
        self.inner.name
    }

    /// Announces interest in `key`, creating its entry if necessary.
    ///
    /// Every call must be paired with exactly one [`remove_reference`](Self::remove_reference).
    pub fn add_reference(&self, key: &ResourceKey) {
        let mut entries = self.inner.entries();
        let entry = entries.entry(key.clone()).or_default();
        entry.refcount += 1;
        tracing::trace!(%key, cache = self.inner.name, refcount = entry.refcount, "added reference");
    }

    /// Gives up interest in `key` and returns the remaining reference count.
    ///
    /// Releasing a key that holds no references is a bug in the caller. It is reported as
    /// [`ReferenceError::Underflow`] and asserted in debug builds.
    pub fn remove_reference(&self, key: &ResourceKey) -> Result<u32, ReferenceError> {
        let mut entries = self.inner.entries();
        let Some(entry) = entries.get_mut(key).filter(|e| e.refcount > 0) else {
            drop(entries);
            tracing::error!(%key, cache = self.inner.name, "reference count underflow");
            if cfg!(debug_assertions) {
                panic!("reference count underflow for `{key}`");
            }
            return Err(ReferenceError::Underflow { key: key.clone() });
        };

        entry.refcount -= 1;
        let refcount = entry.refcount;
        tracing::trace!(%key, cache = self.inner.name, refcount, "removed reference");

        if self.inner.config.release == ReleasePolicy::Immediate && entry.is_disposable() {
            tracing::trace!(%key, cache = self.inner.name, "disposing unreferenced entry");
            entries.remove(key);
        }
        Ok(refcount)
    }

    /// Fetches the resource for `key`.
    ///
    /// The lookup happens right away: a loaded resource is returned as a ready future, a pending
    /// load is joined, and otherwise a new load is started. New loads are driven to completion by
    /// a spawned task, so this has to be called from within a tokio runtime.
    pub fn fetch(&self, key: &ResourceKey) -> Fetch<R> {
        let name = self.inner.name;
        metric!(counter("caches.access") += 1, "cache" => name);

        let mut entries = self.inner.entries();
        let entry = entries.entry(key.clone()).or_default();

        if let Some(resource) = &entry.resource {
            metric!(counter("caches.memory.hit") += 1, "cache" => name);
            return Either::Left(future::ready(Ok(Arc::clone(resource))));
        }

        if let Some(pending) = &entry.pending {
            tracing::trace!(%key, cache = name, "joining pending load");
            metric!(counter("caches.load.joined") += 1, "cache" => name);
            return Either::Right(pending.clone());
        }

        tracing::debug!(%key, cache = name, "starting load");
        metric!(counter("caches.load") += 1, "cache" => name);

        let load = self.inner.loader.load(key);
        let weak: Weak<Inner<R>> = Arc::downgrade(&self.inner);
        let settle_key = key.clone();
        let shared = async move {
            let result = load.await.map(Arc::new);
            if let Some(inner) = weak.upgrade() {
                inner.settle(&settle_key, &result);
            }
            result
        }
        .boxed()
        .shared();

        entry.pending = Some(shared.clone());
        drop(entries);

        // Loads always run to completion, even if every waiter loses interest.
        tokio::spawn(shared.clone().map(|_| ()));

        Either::Right(shared)
    }

    /// Removes every entry that is neither referenced nor loading.
    ///
    /// Returns the number of removed entries.
    pub fn purge(&self) -> usize {
        let mut entries = self.inner.entries();
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_disposable());
        let purged = before - entries.len();
        drop(entries);

        if purged > 0 {
            tracing::debug!(cache = self.inner.name, purged, "purged unreferenced entries");
            metric!(counter("caches.purged") += purged as i64, "cache" => self.inner.name);
        }
        purged
    }

    /// The current reference count of `key`.
    pub fn refcount(&self, key: &ResourceKey) -> u32 {
        self.inner.entries().get(key).map_or(0, |e| e.refcount)
    }

    /// Whether a resource for `key` is loaded.
    pub fn is_loaded(&self, key: &ResourceKey) -> bool {
        self.inner
            .entries()
            .get(key)
            .is_some_and(|e| e.resource.is_some())
    }

    /// Whether a load for `key` is currently running.
    pub fn is_pending(&self, key: &ResourceKey) -> bool {
        self.inner
            .entries()
            .get(key)
            .is_some_and(|e| e.pending.is_some())
    }

    /// The number of entries, loaded or not.
    pub fn len(&self) -> usize {
        self.inner.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
