//! Per-owner bindings to cached resources.
//!
//! A [`ResourceBinding`] connects one [`Owner`] to at most one resource of a shared
//! [`ResourceCache`]. The owner says which key it wants, the binding takes care of reference
//! counting, loading, and of discarding results that were overtaken by a newer request.
//!
//! Every request is tagged with a monotonically increasing *generation*. When a load settles,
//! its generation is compared to the binding's current one; a mismatch means the request is
//! stale, its result is discarded and its reference released. This is how a later
//! [`bind`](ResourceBinding::bind) always wins over an earlier one, no matter which load
//! settles first.
//!
//! Owner notifications are queued in the order of the state transitions that produced them
//! and delivered by one caller at a time, so the owner observes the transitions in order even
//! when the binding is driven from several threads.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use thiserror::Error;
use tokio::task::JoinHandle;

use crate::caching::{LoadError, LoadResult, ResourceCache};
use crate::config::{BindingConfig, ErrorReporting};
use crate::key::{InvalidKeyError, KeyResolver, ResourceKey};

/// The consumer of a [`ResourceBinding`].
///
/// Callbacks are invoked without any lock held, so an owner may call back into its binding.
/// Notifications triggered from within a callback, or from another thread while a callback
/// runs, are delivered right after the running callback returns. Callbacks are never invoked
/// for stale requests.
pub trait Owner<R>: Send + Sync {
    /// The bound resource changed. `None` means the binding was cleared.
    fn on_resource_bound(&self, resource: Option<Arc<R>>);

    /// The current request failed. The previously bound resource, if any, stays bound.
    fn on_resource_error(&self, _error: &LoadError) {}
}

/// The outcome of [`ResourceBinding::bind`].
#[derive(Debug)]
pub enum BindRequest {
    /// The binding was cleared. The owner is notified with `None`.
    Cleared,
    /// The key is already bound or loading; nothing was started.
    Unchanged,
    /// The binding is disposed and ignores all requests.
    Disposed,
    /// A load was requested. The handle completes once the request has been settled.
    Loading(JoinHandle<()>),
}

impl BindRequest {
    /// Waits for the request to settle.
    ///
    /// Returns immediately for everything except [`BindRequest::Loading`].
    pub async fn settled(self) {
        if let BindRequest::Loading(handle) = self {
            if let Err(error) = handle.await {
                tracing::error!(%error, "binding settlement task failed");
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BindingError {
    #[error("binding was already disposed")]
    AlreadyDisposed,
}

/// A pending call into the [`Owner`].
enum Notification<R> {
    Bound(Option<Arc<R>>),
    Error(LoadError),
}

struct BindingState<R> {
    /// Identifies the live request. Settlements of any other generation are stale.
    generation: u64,
    /// The key whose reference this binding currently holds for its resource.
    bound_key: Option<ResourceKey>,
    /// The key of the live request.
    loading_key: Option<ResourceKey>,
    resource: Weak<R>,
    disposed: bool,
    /// Notifications not yet handed to the owner, oldest first.
    outbox: VecDeque<Notification<R>>,
    /// Set while a caller is draining the `outbox`.
    delivering: bool,
}

impl<R> BindingState<R> {
    /// Invalidates all outstanding requests and forgets the bound resource.
    ///
    /// Returns the key whose reference has to be released.
    fn clear(&mut self) -> Option<ResourceKey> {
        self.generation += 1;
        self.loading_key = None;
        self.resource = Weak::new();
        self.bound_key.take()
    }
}

/// A reference acquired for a request, released on drop unless it was committed.
///
/// This keeps the reference counts balanced even if the settlement task never runs to its end.
struct PendingReference<R: Send + Sync + 'static> {
    cache: ResourceCache<R>,
    key: Option<ResourceKey>,
}

impl<R: Send + Sync + 'static> PendingReference<R> {
    fn acquire(cache: &ResourceCache<R>, key: &ResourceKey) -> Self {
        cache.add_reference(key);
        Self {
            cache: cache.clone(),
            key: Some(key.clone()),
        }
    }

    /// Hands the reference over to the caller, who becomes responsible for releasing it.
    fn commit(mut self) -> Option<ResourceKey> {
        self.key.take()
    }
}

impl<R: Send + Sync + 'static> Drop for PendingReference<R> {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            self.cache.remove_reference(&key).ok();
        }
    }
}

/// Hands delivery over to the next caller if an owner callback panics.
struct DeliveryGuard<'a, R: Send + Sync + 'static>(&'a BindingInner<R>);

impl<R: Send + Sync + 'static> Drop for DeliveryGuard<'_, R> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.0.state().delivering = false;
        }
    }
}

struct BindingInner<R: Send + Sync + 'static> {
    cache: ResourceCache<R>,
    owner: Arc<dyn Owner<R>>,
    config: BindingConfig,
    state: Mutex<BindingState<R>>,
}

impl<R: Send + Sync + 'static> BindingInner<R> {
    fn state(&self) -> MutexGuard<'_, BindingState<R>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn release(&self, key: &ResourceKey) {
        self.cache.remove_reference(key).ok();
    }

    /// Clears the binding, releases its bound reference and queues the `None` notification.
    fn clear_binding(&self, state: &mut BindingState<R>) {
        let released = state.clear();
        tracing::trace!(key = ?released, "cleared binding");
        if let Some(released) = released {
            self.release(&released);
        }
        state.outbox.push_back(Notification::Bound(None));
    }

    /// Hands all queued notifications to the owner, oldest first.
    ///
    /// If another caller is already delivering, that caller picks up the queued notifications
    /// before it returns and this returns right away.
    fn deliver<'a>(&'a self, mut state: MutexGuard<'a, BindingState<R>>) {
        if state.delivering {
            return;
        }
        state.delivering = true;
        let _guard = DeliveryGuard(self);

        while let Some(notification) = state.outbox.pop_front() {
            drop(state);
            match notification {
                Notification::Bound(resource) => self.owner.on_resource_bound(resource),
                Notification::Error(error) => self.owner.on_resource_error(&error),
            }
            state = self.state();
        }
        state.delivering = false;
    }

    /// Applies the result of the request with the given `generation`.
    fn settle(&self, generation: u64, reference: PendingReference<R>, result: LoadResult<R>) {
        let mut state = self.state();
        if state.generation != generation || state.disposed {
            drop(state);
            tracing::trace!(key = ?reference.key, "discarding stale request");
            metric!(counter("bindings.stale") += 1);
            return;
        }
        state.loading_key = None;

        match result {
            Ok(resource) => {
                let key = reference.commit();
                if let Some(previous) = std::mem::replace(&mut state.bound_key, key) {
                    self.release(&previous);
                }
                state.resource = Arc::downgrade(&resource);
                tracing::trace!(key = ?state.bound_key, "bound resource");
                metric!(counter("bindings.bound") += 1);
                state.outbox.push_back(Notification::Bound(Some(resource)));
            }
            Err(error) => {
                let key = reference.key.clone();
                drop(reference);

                metric!(counter("bindings.error") += 1);
                match self.config.error_reporting {
                    ErrorReporting::Owner => {
                        tracing::debug!(?key, %error, "failed to load resource");
                        state.outbox.push_back(Notification::Error(error));
                    }
                    ErrorReporting::Log => {
                        tracing::warn!(?key, %error, "failed to load resource");
                    }
                }
            }
        }
        self.deliver(state);
    }
}

/// Binds one [`Owner`] to at most one resource of a [`ResourceCache`].
///
/// While a resource is bound, the binding holds one reference on its key. Every request in
/// flight holds another reference on the requested key, which is released once the request
/// is superseded or failed, or handed over to the bound key on success.
///
/// A binding has to be [`dispose`](Self::dispose)d to notify its owner of the release.
/// Dropping it releases all references silently.
pub struct ResourceBinding<R: Send + Sync + 'static> {
    inner: Arc<BindingInner<R>>,
}

impl<R: Send + Sync + 'static> ResourceBinding<R> {
    pub fn new(cache: ResourceCache<R>, owner: Arc<dyn Owner<R>>, config: BindingConfig) -> Self {
        let state = BindingState {
            generation: 0,
            bound_key: None,
            loading_key: None,
            resource: Weak::new(),
            disposed: false,
            outbox: VecDeque::new(),
            delivering: false,
        };
        let inner = BindingInner {
            cache,
            owner,
            config,
            state: Mutex::new(state),
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Binds the owner to the resource for `key`, or clears the binding with `None`.
    ///
    /// - `None` releases the bound resource, invalidates any request in flight and notifies
    ///   the owner with `None`.
    /// - The key of the request in flight is a no-op.
    /// - The bound key keeps the bound resource and invalidates any request in flight.
    /// - Any other key starts a new request. The currently bound resource stays bound until
    ///   the request succeeds.
    ///
    /// Requests are settled by a spawned task, so this has to be called from within a tokio
    /// runtime.
    pub fn bind(&self, key: Option<ResourceKey>) -> BindRequest {
        let mut state = self.inner.state();
        if state.disposed {
            drop(state);
            tracing::warn!(?key, "ignoring bind on disposed binding");
            return BindRequest::Disposed;
        }

        let Some(key) = key else {
            self.inner.clear_binding(&mut state);
            self.inner.deliver(state);
            return BindRequest::Cleared;
        };

        if state.loading_key.as_ref() == Some(&key) {
            return BindRequest::Unchanged;
        }
        if state.bound_key.as_ref() == Some(&key) {
            if let Some(loading) = state.loading_key.take() {
                state.generation += 1;
                tracing::trace!(%key, %loading, "returned to bound key, invalidated request");
            }
            return BindRequest::Unchanged;
        }

        state.generation += 1;
        let generation = state.generation;
        state.loading_key = Some(key.clone());

        let reference = PendingReference::acquire(&self.inner.cache, &key);
        let fetch = self.inner.cache.fetch(&key);
        drop(state);
        tracing::trace!(%key, generation, "requested resource");

        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            let result = fetch.await;
            inner.settle(generation, reference, result);
        });
        BindRequest::Loading(handle)
    }

    /// Resolves `specifier` and binds its key, see [`bind`](Self::bind).
    ///
    /// An invalid specifier is rejected before the cache or the binding is touched.
    pub fn bind_specifier(
        &self,
        resolver: &KeyResolver,
        specifier: Option<&str>,
    ) -> Result<BindRequest, InvalidKeyError> {
        let key = specifier.map(|s| resolver.resolve(s)).transpose()?;
        Ok(self.bind(key))
    }

    /// Clears the binding and makes it ignore all further requests.
    ///
    /// Only the first call succeeds, even if several calls race.
    pub fn dispose(&self) -> Result<(), BindingError> {
        let mut state = self.inner.state();
        if state.disposed {
            drop(state);
            tracing::warn!("binding was already disposed");
            return Err(BindingError::AlreadyDisposed);
        }
        state.disposed = true;
        self.inner.clear_binding(&mut state);
        self.inner.deliver(state);
        Ok(())
    }

    /// The key of the bound resource.
    pub fn bound_key(&self) -> Option<ResourceKey> {
        self.inner.state().bound_key.clone()
    }

    /// The key of the request in flight.
    pub fn loading_key(&self) -> Option<ResourceKey> {
        self.inner.state().loading_key.clone()
    }

    /// The bound resource, if it is still alive.
    pub fn resource(&self) -> Option<Arc<R>> {
        self.inner.state().resource.upgrade()
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.state().disposed
    }
}

impl<R: Send + Sync + 'static> Drop for ResourceBinding<R> {
    fn drop(&mut self) {
        let mut state = self.inner.state();
        if state.disposed {
            return;
        }
        state.disposed = true;
        let released = state.clear();
        drop(state);

        if let Some(released) = released {
            tracing::trace!(key = %released, "released binding on drop");
            self.inner.release(&released);
        }
    }
}

impl<R: Send + Sync + 'static> fmt::Debug for ResourceBinding<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state();
        f.debug_struct("ResourceBinding")
            .field("cache", &self.inner.cache.name())
            .field("generation", &state.generation)
            .field("bound_key", &state.bound_key)
            .field("loading_key", &state.loading_key)
            .field("disposed", &state.disposed)
            .field("queued notifications", &state.outbox.len())
            .finish()
    }
}
