//! Helpers for testing the resource loader.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - When using [`tempdir`], make sure that the handle to the temp directory is held for the
//!    entire lifetime of the test, e.g. `let cache_dir = test::tempdir()`.
//!
//!  - When using [`HitCounter`], make sure that the server is held until all requests to
//!    the server have been made. If the server is dropped, the ports remain open and all
//!    connections to it will time out.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use axum::extract;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Router, middleware};
use reqwest::Url;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

pub use tempfile::TempDir;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `resource_loader_service` crate
///    and mutes all other logs.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("resource_loader_service=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Creates a temporary directory.
///
/// The directory is deleted when the [`TempDir`] instance is dropped. Use it as a guard to
/// automatically clean up after tests.
pub fn tempdir() -> TempDir {
    TempDir::new().unwrap()
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

/// Serves a small body matching the extension of `path`.
fn serve_file(path: &str) -> Response {
    let extension = path.rsplit_once('.').map(|(_, ext)| ext).unwrap_or_default();
    let (content_type, body) = match extension {
        "json" => (
            "application/json",
            serde_json::json!({ "path": path }).to_string(),
        ),
        "css" => ("text/css", format!("/* {path} */ body {{ margin: 0; }}")),
        "js" => (
            "application/javascript",
            format!("console.log({:?});", path),
        ),
        _ => ("application/octet-stream", path.to_owned()),
    };
    ([(header::CONTENT_TYPE, content_type)], body).into_response()
}

/// A web server that counts the requests it receives.
///
/// Routes:
///
///  - `/files/*path`: serves a body matching the file extension.
///  - `/flaky/:failures/*path`: fails with `503` for the first `failures` requests of a path,
///    then serves it like `/files`.
///  - `/respond_statuscode/:num/*tail`: responds with the given status code.
///  - `/delay/:time/*path`: waits for the given humantime duration, then serves like `/files`.
///  - `/auth/*path`: requires a bearer token and echoes it back.
///  - `/garbage_data/*tail`: responds with the tail as a plain body.
pub struct HitCounter {
    server: Server,
    hits: Arc<Mutex<BTreeMap<String, usize>>>,
}

impl HitCounter {
    pub fn new() -> Self {
        let hits = Arc::new(Mutex::new(BTreeMap::new()));
        let flaky = Arc::new(Mutex::new(BTreeMap::<String, usize>::new()));

        let hitcounter = {
            let hits = hits.clone();
            move |extract::OriginalUri(uri): extract::OriginalUri,
                  req: extract::Request,
                  next: middleware::Next| {
                let hits = hits.clone();
                async move {
                    {
                        let mut hits = hits.lock().unwrap();
                        let hits = hits.entry(uri.to_string()).or_default();
                        *hits += 1;
                    }

                    next.run(req).await
                }
            }
        };

        let router = Router::new()
            .route(
                "/files/*path",
                get(|extract::Path(path): extract::Path<String>| async move { serve_file(&path) }),
            )
            .route(
                "/flaky/:failures/*path",
                get(
                    move |extract::Path((failures, path)): extract::Path<(usize, String)>| {
                        let flaky = flaky.clone();
                        async move {
                            let attempt = {
                                let mut flaky = flaky.lock().unwrap();
                                let attempt = flaky.entry(path.clone()).or_default();
                                *attempt += 1;
                                *attempt
                            };
                            if attempt <= failures {
                                StatusCode::SERVICE_UNAVAILABLE.into_response()
                            } else {
                                serve_file(&path)
                            }
                        }
                    },
                ),
            )
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
                        serve_file(&path)
                    },
                ),
            )
            .route(
                "/auth/*path",
                get(|headers: HeaderMap| async move {
                    let token = headers
                        .get(header::AUTHORIZATION)
                        .and_then(|value| value.to_str().ok())
                        .and_then(|value| value.strip_prefix("Bearer "))
                        .map(str::to_owned);
                    match token {
                        Some(token) => token.into_response(),
                        None => StatusCode::UNAUTHORIZED.into_response(),
                    }
                }),
            )
            .route(
                "/garbage_data/*tail",
                get(|extract::Path(tail): extract::Path<String>| async move { tail }),
            )
            .layer(middleware::from_fn(hitcounter));

        let server = Server::with_router(router);

        Self { server, hits }
    }

    /// Returns and resets the total number of requests.
    pub fn accesses(&self) -> usize {
        let map = std::mem::take(&mut *self.hits.lock().unwrap());
        map.into_values().sum()
    }

    /// Returns and resets the number of requests per path.
    pub fn all_hits(&self) -> Vec<(String, usize)> {
        let map = std::mem::take(&mut *self.hits.lock().unwrap());
        map.into_iter().collect()
    }

    pub fn url(&self, path: &str) -> Url {
        self.server.url(path)
    }
}

impl Default for HitCounter {
    fn default() -> Self {
        Self::new()
    }
}
