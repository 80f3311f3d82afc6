//! Helpers for testing the blob cache.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - When using [`BlobServer`], make sure that the server is held until all requests to
//!    the server have been made. If the server is dropped, connections to it will fail. To avoid
//!    this, assign it to a variable: `let server = BlobServer::new();`.

use std::collections::{BTreeMap, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Router;
use axum::extract::State;
use axum::http::{Uri, header};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use reqwest::Url;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;
use uuid::Uuid;

pub use axum::http::StatusCode;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `blobcache_service` crate and
///    mutes all other logs.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("blobcache_service=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Returns the path of a user picture with random ids, along with the picture id.
pub fn user_picture() -> (String, String) {
    let user_id = Uuid::new_v4();
    let picture_id = Uuid::new_v4().to_string();
    let path = format!("/v1/users/{user_id}/picture/{picture_id}/SMALL");
    (path, picture_id)
}

/// A test server that binds to a random port and serves a web app.
///
/// This server requires a `tokio` runtime and is supposed to be run in a `tokio::test`. It
/// automatically stops serving when dropped.
#[derive(Debug)]
pub struct Server {
    pub handle: tokio::task::JoinHandle<()>,
    pub socket: SocketAddr,
}

impl Server {
    pub fn with_router(router: Router) -> Self {
        let listener = std::net::TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0))).unwrap();
        listener.set_nonblocking(true).unwrap();
        let socket = listener.local_addr().unwrap();
        let listener = tokio::net::TcpListener::from_std(listener).unwrap();

        let handle = tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        Self { handle, socket }
    }

    /// Returns the socket address that this server listens on.
    pub fn addr(&self) -> SocketAddr {
        self.socket
    }

    /// Returns the port that this server listens on.
    pub fn port(&self) -> u16 {
        self.addr().port()
    }

    /// Returns a full URL pointing to the given path.
    ///
    /// This URL uses `localhost` as hostname.
    pub fn url(&self, path: &str) -> Url {
        let path = path.trim_start_matches('/');
        format!("http://localhost:{}/{}", self.port(), path)
            .parse()
            .unwrap()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[derive(Debug, Default)]
struct Script {
    hits: BTreeMap<String, usize>,
    fail_next: BTreeMap<String, VecDeque<StatusCode>>,
    fail_always: BTreeMap<String, StatusCode>,
    delay: Option<Duration>,
}

type SharedScript = Arc<Mutex<Script>>;

/// A blob server with scripted failures and hit counting.
///
/// Every path serves [`BlobServer::payload`] as `image/png`, except for paths below `/empty/`,
/// which answer with an empty body. Failures can be scripted per path.
pub struct BlobServer {
    server: Server,
    script: SharedScript,
}

impl BlobServer {
    pub fn new() -> Self {
        let script = SharedScript::default();
        let router = Router::new().fallback(serve).with_state(script.clone());
        let server = Server::with_router(router);

        Self { server, script }
    }

    /// The body served for `path`.
    pub fn payload(path: &str) -> Bytes {
        Bytes::from(format!("blob at {path}"))
    }

    pub fn url(&self, path: &str) -> Url {
        self.server.url(path)
    }

    /// The URL relative resource paths are resolved against.
    pub fn base_url(&self) -> Url {
        self.server.url("/")
    }

    /// Answers the next `times` requests to `path` with `status`.
    pub fn fail_next(&self, path: &str, times: usize, status: StatusCode) {
        let mut script = self.script.lock().unwrap();
        let queue = script.fail_next.entry(path.to_owned()).or_default();
        queue.extend(std::iter::repeat_n(status, times));
    }

    /// Answers every request to `path` with `status`.
    pub fn fail_always(&self, path: &str, status: StatusCode) {
        let mut script = self.script.lock().unwrap();
        script.fail_always.insert(path.to_owned(), status);
    }

    /// Delays every response by `delay`.
    pub fn set_delay(&self, delay: Duration) {
        self.script.lock().unwrap().delay = Some(delay);
    }

    /// The number of requests made to `path` so far.
    pub fn hits(&self, path: &str) -> usize {
        let script = self.script.lock().unwrap();
        script.hits.get(path).copied().unwrap_or_default()
    }

    /// The number of requests made to any path so far.
    pub fn accesses(&self) -> usize {
        self.script.lock().unwrap().hits.values().sum()
    }

    /// Waits until `path` was requested at least `hits` times.
    ///
    /// # Panics
    ///
    /// Panics if that does not happen within 5 seconds.
    pub async fn wait_for_hits(&self, path: &str, hits: usize) {
        let wait = async {
            while self.hits(path) < hits {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        };
        if tokio::time::timeout(Duration::from_secs(5), wait).await.is_err() {
            panic!(
                "expected {hits} requests to `{path}`, got {}",
                self.hits(path)
            );
        }
    }
}

impl Default for BlobServer {
    fn default() -> Self {
        Self::new()
    }
}

async fn serve(State(script): State<SharedScript>, uri: Uri) -> Response {
    let path = uri.path().to_owned();

    let (failure, delay) = {
        let mut script = script.lock().unwrap();
        *script.hits.entry(path.clone()).or_default() += 1;

        let failure = match script.fail_next.get_mut(&path).and_then(VecDeque::pop_front) {
            Some(status) => Some(status),
            None => script.fail_always.get(&path).copied(),
        };
        (failure, script.delay)
    };

    if let Some(delay) = delay {
        tokio::time::sleep(delay).await;
    }

    if let Some(status) = failure {
        return status.into_response();
    }

    let body = if path.starts_with("/empty/") {
        Bytes::new()
    } else {
        BlobServer::payload(&path)
    };
    ([(header::CONTENT_TYPE, "image/png")], body).into_response()
}
