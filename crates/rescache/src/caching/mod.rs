//! # Shared resource cache
//!
//! The [`ResourceCache`] is a keyed pool of resources that are shared between many owners.
//! It is the only place that holds strong references to loaded resources; owners only hold a
//! *reference count* on a key, plus possibly a weak back-reference to the resource itself.
//!
//! ## Reference counting
//!
//! Reference counts are managed explicitly through [`ResourceCache::add_reference`] and
//! [`ResourceCache::remove_reference`]. Each call to `add_reference` has to be paired with
//! exactly one `remove_reference`. Releasing more often than acquiring is a bug and is reported
//! as a [`ReferenceError`].
//!
//! Once a count drops to zero, the entry becomes eligible for disposal. What happens then is
//! up to the [`ReleasePolicy`](crate::config::ReleasePolicy):
//!
//! - `retain` keeps the resource around until [`ResourceCache::purge`] is called.
//! - `immediate` drops the entry as soon as it is neither referenced nor loading.
//!
//! ## Loading
//!
//! [`ResourceCache::fetch`] resolves immediately for loaded resources. Otherwise it starts a
//! load through the [`ResourceLoader`](crate::loader::ResourceLoader), or joins the load that
//! is already running for the key. There is at most one load per key at any time, and all of
//! its waiters observe the same outcome.
//!
//! A load always runs to completion, even if nobody waits for it anymore. Errors are handed to
//! the waiters but are never cached: the next fetch of that key starts a fresh load.
//!
//! ### Metrics
//!
//! Every metric is tagged with a `cache` field holding the cache name:
//!
//! - `caches.access`: All fetches.
//! - `caches.memory.hit`: Fetches served by an already loaded resource.
//! - `caches.load`: Loads actually started.
//! - `caches.load.joined`: Fetches that joined a pending load.
//! - `caches.load.error`: Loads that failed.
//! - `caches.purged`: Entries removed by [`ResourceCache::purge`].

mod cache;
mod error;

pub use cache::*;
pub use error::*;
