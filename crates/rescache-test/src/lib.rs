//! Helpers for testing the resource cache and its loaders.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - When using [`tempdir`], make sure that the handle to the temp directory is held for the
//!    entire lifetime of the test, e.g. `let _dir = test::tempdir()`.
//!
//!  - When using a [`Server`], make sure that the server is held until all requests to it have
//!    been made. Dropping the server stops it and all further requests will fail.
//!
//!  - Loads that should settle in a specific order are best modelled with [`Gates`].

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use axum::Router;
use axum::extract::{self, Request};
use axum::http::{StatusCode, Uri};
use axum::middleware::{self, Next};
use axum::response::IntoResponse;
use axum::routing::get;
use tokio::sync::oneshot;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;
use url::Url;

pub use tempfile::TempDir;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `rescache` crate and mutes all
///    other logs (such as hyper or reqwest).
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("rescache=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Creates a temporary directory.
///
/// The directory is deleted when the [`TempDir`] instance is dropped.
pub fn tempdir() -> TempDir {
    TempDir::new().unwrap()
}

/// Gives spawned tasks on the current runtime the chance to run to their next suspension point.
pub async fn settle() {
    for _ in 0..32 {
        tokio::task::yield_now().await;
    }
}

/// Named gates that hold back futures until a test opens them.
///
/// Every call to [`wait`](Self::wait) is counted as a request for that gate, which makes this
/// useful to assert how often a loader was invoked.
#[derive(Debug)]
pub struct Gates<T> {
    inner: Arc<Mutex<GatesInner<T>>>,
}

#[derive(Debug)]
struct GatesInner<T> {
    waiting: BTreeMap<String, Vec<oneshot::Sender<T>>>,
    requests: BTreeMap<String, usize>,
}

impl<T> Clone for Gates<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for Gates<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Gates<T> {
    pub fn new() -> Self {
        let inner = GatesInner {
            waiting: BTreeMap::new(),
            requests: BTreeMap::new(),
        };
        Self {
            inner: Arc::new(Mutex::new(inner)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, GatesInner<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a waiter on the gate `name`.
    ///
    /// The receiver resolves once the gate is opened. It errors if the gate is dropped first.
    pub fn wait(&self, name: &str) -> oneshot::Receiver<T> {
        let (sender, receiver) = oneshot::channel();
        let mut inner = self.lock();
        inner.waiting.entry(name.to_owned()).or_default().push(sender);
        *inner.requests.entry(name.to_owned()).or_default() += 1;
        receiver
    }

    /// Opens the gate `name`, handing `value` to everybody currently waiting on it.
    ///
    /// Returns the number of released waiters.
    pub fn open(&self, name: &str, value: T) -> usize
    where
        T: Clone,
    {
        let waiting = self.lock().waiting.remove(name).unwrap_or_default();
        let mut released = 0;
        for sender in waiting {
            if sender.send(value.clone()).is_ok() {
                released += 1;
            }
        }
        released
    }

    /// The number of waiters ever registered on the gate `name`.
    pub fn requests(&self, name: &str) -> usize {
        self.lock().requests.get(name).copied().unwrap_or_default()
    }
}

/// A test server that binds to a random port and serves in-memory files.
///
/// Besides the files, the server understands these routes:
///
///  - `/respond_statuscode/:num/*tail` responds with the given status code.
///  - `/delay/:time/*path` waits for the given `humantime` duration, then redirects to `path`.
///
/// This server requires a `tokio` runtime and is supposed to be run in a `tokio::test`. It
/// automatically stops serving when dropped.
#[derive(Debug)]
pub struct Server {
    handle: tokio::task::JoinHandle<()>,
    socket: SocketAddr,
    hits: Arc<Mutex<BTreeMap<String, usize>>>,
}

impl Server {
    /// Creates a server without any files.
    pub fn new() -> Self {
        Self::with_files(std::iter::empty())
    }

    /// Creates a server that serves each `(path, contents)` pair.
    pub fn with_files<'a>(files: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        let files: Arc<BTreeMap<String, String>> = Arc::new(
            files
                .into_iter()
                .map(|(path, contents)| (path.trim_start_matches('/').to_owned(), contents.to_owned()))
                .collect(),
        );
        let hits = Arc::new(Mutex::new(BTreeMap::new()));

        let hitcounter = {
            let hits = Arc::clone(&hits);
            move |req: Request, next: Next| {
                let hits = Arc::clone(&hits);
                async move {
                    {
                        let mut hits = hits.lock().unwrap();
                        *hits.entry(req.uri().path().to_owned()).or_default() += 1;
                    }
                    next.run(req).await
                }
            }
        };

        let router = Router::new()
            .route(
                "/respond_statuscode/:num/*tail",
                get(
                    |extract::Path((num, _)): extract::Path<(u16, String)>| async move {
                        StatusCode::from_u16(num).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
                    },
                ),
            )
            .route(
                "/delay/:time/*path",
                get(
                    |extract::Path((time, path)): extract::Path<(String, String)>| async move {
                        let duration = humantime::parse_duration(&time).unwrap();
                        tokio::time::sleep(duration).await;

                        (StatusCode::FOUND, [("Location", format!("/{path}"))])
                    },
                ),
            )
            .fallback(move |uri: Uri| {
                let files = Arc::clone(&files);
                async move {
                    match files.get(uri.path().trim_start_matches('/')) {
                        Some(contents) => (StatusCode::OK, contents.clone()).into_response(),
                        None => StatusCode::NOT_FOUND.into_response(),
                    }
                }
            })
            .layer(middleware::from_fn(hitcounter));

        let listener = std::net::TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0))).unwrap();
        listener.set_nonblocking(true).unwrap();
        let socket = listener.local_addr().unwrap();

        let handle = tokio::spawn(async move {
            let listener = tokio::net::TcpListener::from_std(listener).unwrap();
            axum::serve(listener, router).await.unwrap();
        });

        Self {
            handle,
            socket,
            hits,
        }
    }

    /// Returns the port that this server listens on.
    pub fn port(&self) -> u16 {
        self.socket.port()
    }

    /// Returns a full URL pointing to the given path.
    pub fn url(&self, path: &str) -> Url {
        let path = path.trim_start_matches('/');
        format!("http://127.0.0.1:{}/{}", self.port(), path)
            .parse()
            .unwrap()
    }

    /// Returns the number of requests made to `path`.
    pub fn hits(&self, path: &str) -> usize {
        let path = format!("/{}", path.trim_start_matches('/'));
        self.hits.lock().unwrap().get(&path).copied().unwrap_or_default()
    }
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
