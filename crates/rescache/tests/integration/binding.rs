use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use rescache::config::{BindingConfig, CacheConfig, ErrorReporting, ReleasePolicy};
use rescache::{BindRequest, BindingError, LoadError, Owner, ResourceBinding};

use crate::{Event, RecordingOwner, Texture, bind_owner, bound, key, setup_cache, texture};

#[tokio::test]
async fn test_bind_resolves() {
    let (cache, gates) = setup_cache(CacheConfig::default());
    let (binding, owner) = bind_owner(&cache, BindingConfig::default());

    let request = binding.bind(Some(key("a")));
    assert!(matches!(request, BindRequest::Loading(_)));
    assert_eq!(binding.loading_key(), Some(key("a")));
    assert_eq!(binding.bound_key(), None);
    assert_eq!(cache.refcount(&key("a")), 1);

    gates.open("a", texture("a"));
    request.settled().await;

    assert_eq!(owner.events(), [bound("a")]);
    assert_eq!(binding.bound_key(), Some(key("a")));
    assert_eq!(binding.loading_key(), None);
    assert_eq!(cache.refcount(&key("a")), 1);
    assert!(Arc::ptr_eq(
        &binding.resource().unwrap(),
        &owner.last_resource().unwrap()
    ));
}

#[tokio::test]
async fn test_return_to_bound_key() {
    let (cache, gates) = setup_cache(CacheConfig::default());
    let (binding, owner) = bind_owner(&cache, BindingConfig::default());

    let request = binding.bind(Some(key("a")));
    gates.open("a", texture("a"));
    request.settled().await;
    assert_eq!(owner.events(), [bound("a")]);

    let request_b = binding.bind(Some(key("b")));
    assert_eq!(cache.refcount(&key("b")), 1);

    assert!(matches!(binding.bind(Some(key("a"))), BindRequest::Unchanged));
    assert_eq!(binding.loading_key(), None);
    assert_eq!(gates.requests("a"), 1);

    gates.open("b", texture("b"));
    request_b.settled().await;

    assert_eq!(owner.events(), [bound("a")]);
    assert_eq!(binding.bound_key(), Some(key("a")));
    assert_eq!(cache.refcount(&key("a")), 1);
    assert_eq!(cache.refcount(&key("b")), 0);
    // the superseded load still completed
    assert!(cache.is_loaded(&key("b")));
}

#[tokio::test]
async fn test_return_to_bound_key_swallows_error() {
    let (cache, gates) = setup_cache(CacheConfig::default());
    let (binding, owner) = bind_owner(&cache, BindingConfig::default());

    let request = binding.bind(Some(key("a")));
    gates.open("a", texture("a"));
    request.settled().await;

    let request_b = binding.bind(Some(key("b")));
    binding.bind(Some(key("a")));
    gates.open("b", Err(LoadError::NotFound));
    request_b.settled().await;

    assert_eq!(owner.events(), [bound("a")]);
    assert_eq!(cache.refcount(&key("b")), 0);
}

#[tokio::test]
async fn test_later_bind_wins() {
    let (cache, gates) = setup_cache(CacheConfig::default());
    let (binding, owner) = bind_owner(&cache, BindingConfig::default());

    let request_a = binding.bind(Some(key("a")));
    let request_b = binding.bind(Some(key("b")));
    assert_eq!(binding.loading_key(), Some(key("b")));

    // the newer request settles first
    gates.open("b", texture("b"));
    request_b.settled().await;
    gates.open("a", texture("a"));
    request_a.settled().await;

    assert_eq!(owner.events(), [bound("b")]);
    assert_eq!(binding.bound_key(), Some(key("b")));
    assert_eq!(cache.refcount(&key("a")), 0);
    assert_eq!(cache.refcount(&key("b")), 1);
}

#[tokio::test]
async fn test_stale_request_settles_first() {
    let (cache, gates) = setup_cache(CacheConfig::default());
    let (binding, owner) = bind_owner(&cache, BindingConfig::default());

    let request_a = binding.bind(Some(key("a")));
    let request_b = binding.bind(Some(key("b")));

    gates.open("a", texture("a"));
    request_a.settled().await;
    assert!(owner.events().is_empty());
    assert_eq!(binding.loading_key(), Some(key("b")));

    gates.open("b", texture("b"));
    request_b.settled().await;

    assert_eq!(owner.events(), [bound("b")]);
    assert_eq!(cache.refcount(&key("a")), 0);
    assert_eq!(cache.refcount(&key("b")), 1);
}

#[tokio::test]
async fn test_rebind_releases_previous() {
    let (cache, gates) = setup_cache(CacheConfig {
        release: ReleasePolicy::Immediate,
    });
    let (binding, owner) = bind_owner(&cache, BindingConfig::default());

    let request = binding.bind(Some(key("a")));
    gates.open("a", texture("a"));
    request.settled().await;

    let request = binding.bind(Some(key("b")));
    // the previous resource stays bound while loading
    assert_eq!(binding.resource().unwrap().name, "a");

    gates.open("b", texture("b"));
    request.settled().await;

    assert_eq!(owner.events(), [bound("a"), bound("b")]);
    assert_eq!(binding.resource().unwrap().name, "b");
    assert!(!cache.is_loaded(&key("a")));
    assert_eq!(cache.len(), 1);
}

#[tokio::test]
async fn test_dispose() {
    let (cache, gates) = setup_cache(CacheConfig::default());
    let (binding, owner) = bind_owner(&cache, BindingConfig::default());

    let request = binding.bind(Some(key("x")));
    gates.open("x", texture("x"));
    request.settled().await;
    assert_eq!(cache.refcount(&key("x")), 1);

    assert_eq!(binding.dispose(), Ok(()));
    assert_eq!(cache.refcount(&key("x")), 0);
    assert_eq!(owner.events(), [bound("x"), Event::Bound(None)]);

    assert!(matches!(binding.bind(Some(key("x"))), BindRequest::Disposed));
    assert!(matches!(binding.bind(Some(key("y"))), BindRequest::Disposed));
    assert_eq!(cache.refcount(&key("x")), 0);
    assert_eq!(cache.refcount(&key("y")), 0);
    assert_eq!(gates.requests("y"), 0);

    assert_eq!(binding.dispose(), Err(BindingError::AlreadyDisposed));
    assert_eq!(owner.events().len(), 2);
}

#[tokio::test]
async fn test_dispose_while_loading() {
    let (cache, gates) = setup_cache(CacheConfig::default());
    let (binding, owner) = bind_owner(&cache, BindingConfig::default());

    let request = binding.bind(Some(key("a")));
    binding.dispose().unwrap();
    assert_eq!(binding.loading_key(), None);

    gates.open("a", texture("a"));
    request.settled().await;

    assert_eq!(owner.events(), [Event::Bound(None)]);
    assert_eq!(cache.refcount(&key("a")), 0);
    assert!(binding.resource().is_none());
}

#[tokio::test]
async fn test_error_reported_to_owner() {
    let (cache, gates) = setup_cache(CacheConfig::default());
    let (binding, owner) = bind_owner(&cache, BindingConfig::default());

    let request = binding.bind(Some(key("a")));
    gates.open("a", texture("a"));
    request.settled().await;

    let request = binding.bind(Some(key("b")));
    gates.open("b", Err(LoadError::PermissionDenied("403 Forbidden".into())));
    request.settled().await;

    assert_eq!(
        owner.events(),
        [
            bound("a"),
            Event::Error(LoadError::PermissionDenied("403 Forbidden".into()))
        ]
    );
    // the previous resource stays bound
    assert_eq!(binding.bound_key(), Some(key("a")));
    assert_eq!(binding.loading_key(), None);
    assert_eq!(cache.refcount(&key("b")), 0);

    // failures are not cached, binding again retries the load
    let request = binding.bind(Some(key("b")));
    assert_eq!(gates.requests("b"), 2);
    gates.open("b", texture("b"));
    request.settled().await;

    assert_eq!(owner.events().last(), Some(&bound("b")));
    assert_eq!(cache.refcount(&key("a")), 0);
    assert_eq!(cache.refcount(&key("b")), 1);
}

#[tokio::test]
async fn test_error_reporting_log() {
    let (cache, gates) = setup_cache(CacheConfig::default());
    let config = BindingConfig {
        error_reporting: ErrorReporting::Log,
    };
    let (binding, owner) = bind_owner(&cache, config);

    let request = binding.bind(Some(key("a")));
    gates.open("a", Err(LoadError::NotFound));
    request.settled().await;

    assert!(owner.events().is_empty());
    assert_eq!(binding.loading_key(), None);
    assert_eq!(cache.refcount(&key("a")), 0);
}

#[tokio::test]
async fn test_bindings_share_resources() {
    let (cache, gates) = setup_cache(CacheConfig::default());
    let (first, first_owner) = bind_owner(&cache, BindingConfig::default());
    let (second, second_owner) = bind_owner(&cache, BindingConfig::default());

    let request_first = first.bind(Some(key("a")));
    let request_second = second.bind(Some(key("a")));
    assert_eq!(cache.refcount(&key("a")), 2);

    assert_eq!(gates.open("a", texture("a")), 1);
    request_first.settled().await;
    request_second.settled().await;

    assert!(Arc::ptr_eq(
        &first_owner.last_resource().unwrap(),
        &second_owner.last_resource().unwrap()
    ));

    first.dispose().unwrap();
    assert_eq!(cache.refcount(&key("a")), 1);
    second.dispose().unwrap();
    assert_eq!(cache.refcount(&key("a")), 0);
}

#[tokio::test]
async fn test_references_balance() {
    let (cache, gates) = setup_cache(CacheConfig::default());
    let (binding, _owner) = bind_owner(&cache, BindingConfig::default());

    let mut requests = vec![];
    for name in ["a", "b", "a", "c", "b", "b", "c"] {
        requests.push(binding.bind(Some(key(name))));
    }
    requests.push(binding.bind(None));
    requests.push(binding.bind(Some(key("a"))));

    gates.open("c", texture("c"));
    gates.open("b", Err(LoadError::NotFound));
    gates.open("a", texture("a"));
    for request in requests {
        request.settled().await;
    }
    assert_eq!(binding.bound_key(), Some(key("a")));

    binding.bind(Some(key("c"))).settled().await;
    assert_eq!(binding.bound_key(), Some(key("c")));

    binding.dispose().unwrap();
    for name in ["a", "b", "c"] {
        assert_eq!(cache.refcount(&key(name)), 0, "{name}");
    }
}

#[tokio::test]
async fn test_drop_releases_references() {
    let (cache, gates) = setup_cache(CacheConfig::default());
    let (binding, owner) = bind_owner(&cache, BindingConfig::default());

    let request = binding.bind(Some(key("a")));
    gates.open("a", texture("a"));
    request.settled().await;
    let pending = binding.bind(Some(key("b")));

    drop(binding);
    assert_eq!(cache.refcount(&key("a")), 0);

    gates.open("b", texture("b"));
    pending.settled().await;
    assert_eq!(cache.refcount(&key("b")), 0);
    assert_eq!(owner.events(), [bound("a")]);
}

#[test]
fn test_reference_released_on_shutdown() {
    rescache_test::setup();
    let runtime = tokio::runtime::Builder::new_current_thread()
        .build()
        .unwrap();

    let (cache, _gates) = setup_cache(CacheConfig::default());
    let (binding, owner) = bind_owner(&cache, BindingConfig::default());

    runtime.block_on(async {
        binding.bind(Some(key("a")));
        rescache_test::settle().await;
    });
    assert_eq!(cache.refcount(&key("a")), 1);

    // dropping the runtime drops the settlement task along with its reference
    drop(runtime);
    assert_eq!(cache.refcount(&key("a")), 0);
    assert!(owner.events().is_empty());

    drop(binding);
}

/// A [`RecordingOwner`] that takes its time with every notification.
#[derive(Default)]
struct SlowOwner {
    calls: AtomicUsize,
    recorder: RecordingOwner,
}

impl SlowOwner {
    /// Blocks until the owner has been entered `calls` times.
    fn wait_for_calls(&self, calls: usize) {
        while self.calls.load(Ordering::SeqCst) < calls {
            std::thread::yield_now();
        }
    }
}

impl Owner<Texture> for SlowOwner {
    fn on_resource_bound(&self, resource: Option<Arc<Texture>>) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(100));
        self.recorder.on_resource_bound(resource);
    }
}

#[tokio::test]
async fn test_concurrent_dispose() {
    let (cache, gates) = setup_cache(CacheConfig::default());
    let owner = Arc::new(SlowOwner::default());
    let binding = ResourceBinding::new(cache.clone(), owner.clone(), BindingConfig::default());

    let request = binding.bind(Some(key("a")));
    gates.open("a", texture("a"));
    request.settled().await;

    let (first, second) = std::thread::scope(|scope| {
        let first = scope.spawn(|| binding.dispose());
        // dispose again while the first call is still notifying the owner
        owner.wait_for_calls(2);
        let second = binding.dispose();
        (first.join().unwrap(), second)
    });

    assert_eq!(first, Ok(()));
    assert_eq!(second, Err(BindingError::AlreadyDisposed));
    assert_eq!(owner.recorder.events(), [bound("a"), Event::Bound(None)]);
    assert_eq!(cache.refcount(&key("a")), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_clear_during_bound_notification() {
    let (cache, gates) = setup_cache(CacheConfig::default());
    let owner = Arc::new(SlowOwner::default());
    let binding = ResourceBinding::new(cache.clone(), owner.clone(), BindingConfig::default());

    let request = binding.bind(Some(key("a")));
    gates.open("a", texture("a"));
    while owner.calls.load(Ordering::SeqCst) == 0 {
        tokio::task::yield_now().await;
    }

    // the settlement task is still notifying the owner about `a`
    assert!(matches!(binding.bind(None), BindRequest::Cleared));
    assert_eq!(binding.bound_key(), None);
    request.settled().await;

    assert_eq!(owner.recorder.events(), [bound("a"), Event::Bound(None)]);
    assert!(binding.resource().is_none());
    assert_eq!(cache.refcount(&key("a")), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_binds_balance_references() {
    let (cache, gates) = setup_cache(CacheConfig::default());
    for name in ["a", "b", "c"] {
        let fetch = cache.fetch(&key(name));
        gates.open(name, texture(name));
        fetch.await.unwrap();
    }
    let (binding, owner) = bind_owner(&cache, BindingConfig::default());
    let binding = Arc::new(binding);

    let tasks: Vec<_> = (0..4)
        .map(|worker| {
            let binding = binding.clone();
            tokio::spawn(async move {
                for round in 0..25 {
                    let name = ["a", "b", "c"][(worker + round) % 3];
                    binding.bind(Some(key(name))).settled().await;
                }
            })
        })
        .collect();
    for task in tasks {
        task.await.unwrap();
    }

    binding.dispose().unwrap();
    for name in ["a", "b", "c"] {
        assert_eq!(cache.refcount(&key(name)), 0, "{name}");
    }
    assert_eq!(owner.events().last(), Some(&Event::Bound(None)));
}
