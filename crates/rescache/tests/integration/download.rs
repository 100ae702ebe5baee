use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rescache::config::{BindingConfig, CacheConfig, Config, DownloadTimeouts};
use rescache::loader::DownloadLoader;
use rescache::{
    KeyResolver, LoadError, Owner, ResourceBinding, ResourceCache, ResourceKey, ResourceLoaderExt,
};
use rescache_test::{self as test, Server};

fn download_cache(timeouts: DownloadTimeouts) -> ResourceCache<Bytes> {
    test::setup();
    let loader = DownloadLoader::new(timeouts).unwrap();
    ResourceCache::new("downloads", CacheConfig::default(), loader)
}

#[tokio::test]
async fn test_download_http() {
    let server = Server::with_files([("textures/brick.png", "brick")]);
    let cache = download_cache(Default::default());
    let key = ResourceKey::from(server.url("textures/brick.png"));

    let (a, b) = futures::join!(cache.fetch(&key), cache.fetch(&key));
    assert_eq!(*a.unwrap(), Bytes::from_static(b"brick"));
    assert_eq!(*b.unwrap(), Bytes::from_static(b"brick"));

    cache.fetch(&key).await.unwrap();
    assert_eq!(server.hits("textures/brick.png"), 1);
}

#[tokio::test]
async fn test_download_http_errors() {
    let server = Server::new();
    let cache = download_cache(Default::default());

    let key = ResourceKey::from(server.url("textures/missing.png"));
    assert_eq!(cache.fetch(&key).await, Err(LoadError::NotFound));

    // errors are not cached
    assert_eq!(cache.fetch(&key).await, Err(LoadError::NotFound));
    assert_eq!(server.hits("textures/missing.png"), 2);

    let key = ResourceKey::from(server.url("respond_statuscode/401/brick.png"));
    assert_eq!(
        cache.fetch(&key).await,
        Err(LoadError::PermissionDenied("401 Unauthorized".into()))
    );
}

#[tokio::test]
async fn test_download_timeout() {
    let server = Server::with_files([("brick.png", "brick")]);
    let timeouts = DownloadTimeouts {
        max_download: Duration::from_millis(100),
        ..Default::default()
    };
    let cache = download_cache(timeouts);

    let key = ResourceKey::from(server.url("delay/5s/brick.png"));
    assert_eq!(
        cache.fetch(&key).await,
        Err(LoadError::Timeout(Duration::from_millis(100)))
    );
}

#[tokio::test]
async fn test_download_file() {
    let dir = test::tempdir();
    std::fs::write(dir.path().join("brick.png"), "brick").unwrap();

    let cache = download_cache(Default::default());
    let resolver = KeyResolver::with_base_dir(dir.path()).unwrap();

    let key = resolver.resolve("brick.png").unwrap();
    assert_eq!(*cache.fetch(&key).await.unwrap(), Bytes::from_static(b"brick"));

    let key = resolver.resolve("oak.png").unwrap();
    assert_eq!(cache.fetch(&key).await, Err(LoadError::NotFound));
}

#[tokio::test]
async fn test_unsupported_keys() {
    let cache = download_cache(Default::default());

    let result = cache.fetch(&ResourceKey::new("ftp://example.com/brick.png")).await;
    assert!(matches!(result, Err(LoadError::Unsupported(_))));

    let result = cache.fetch(&ResourceKey::new("brick.png")).await;
    assert!(matches!(result, Err(LoadError::Unsupported(_))));
}

#[tokio::test]
async fn test_decode() {
    test::setup();
    let server = Server::with_files([("hello.txt", "hello")]);
    let dir = test::tempdir();
    std::fs::write(dir.path().join("invalid.txt"), [0xff, 0xfe]).unwrap();

    let loader = DownloadLoader::new(Default::default())
        .unwrap()
        .decode(|bytes: Bytes| String::from_utf8(bytes.to_vec()));
    let cache = ResourceCache::new("text", CacheConfig::default(), loader);

    let key = ResourceKey::from(server.url("hello.txt"));
    assert_eq!(*cache.fetch(&key).await.unwrap(), "hello");

    let resolver = KeyResolver::with_base_dir(dir.path()).unwrap();
    let key = resolver.resolve("invalid.txt").unwrap();
    assert!(matches!(
        cache.fetch(&key).await,
        Err(LoadError::Malformed(_))
    ));
}

struct Sprite(std::sync::Mutex<Option<Arc<Bytes>>>);

impl Owner<Bytes> for Sprite {
    fn on_resource_bound(&self, texture: Option<Arc<Bytes>>) {
        *self.0.lock().unwrap() = texture;
    }
}

#[tokio::test]
async fn test_bind_configured_specifier() {
    let server = Server::with_files([("textures/brick.png", "brick")]);
    let yaml = format!(
        r#"
            base_url: {}
        "#,
        server.url("textures/")
    );
    let config = Config::from_reader(yaml.as_bytes()).unwrap();

    let cache = download_cache(config.timeouts);
    let sprite = Arc::new(Sprite(Default::default()));
    let binding = ResourceBinding::new(cache.clone(), sprite.clone(), BindingConfig::default());

    binding
        .bind_specifier(&config.key_resolver(), Some("brick.png"))
        .unwrap()
        .settled()
        .await;

    let texture = sprite.0.lock().unwrap().clone().unwrap();
    assert_eq!(*texture, Bytes::from_static(b"brick"));
    assert_eq!(
        binding.bound_key(),
        Some(ResourceKey::from(server.url("textures/brick.png")))
    );

    binding.dispose().unwrap();
    assert!(sprite.0.lock().unwrap().is_none());
    assert_eq!(cache.purge(), 1);
}
