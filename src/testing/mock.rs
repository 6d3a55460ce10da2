use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use http::header::CONTENT_TYPE;
use http::{HeaderMap, Method, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

/// A request as seen by [`MockServer`], with the body already collected.
#[derive(Clone, Debug)]
pub struct MockRequest {
    pub method: Method,
    pub path: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl MockRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }
}

/// A plain HTTP server answering every request with the handler's status and
/// JSON body. Every request is recorded, so tests can assert on what was sent.
/// Requests to a path marked with [`MockServer::stall`] never get an answer.
pub struct MockServer {
    addr: SocketAddr,
    requests: Arc<Mutex<Vec<MockRequest>>>,
    stalled: Arc<Mutex<HashSet<String>>>,
    handle: JoinHandle<()>,
}

impl MockServer {
    pub async fn start<F>(handler: F) -> MockServer
    where
        F: Fn(&MockRequest) -> (StatusCode, String) + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handler = Arc::new(handler);
        let requests = Arc::new(Mutex::new(Vec::new()));
        let stalled = Arc::new(Mutex::new(HashSet::<String>::new()));

        let recorded = Arc::clone(&requests);
        let stalled_paths = Arc::clone(&stalled);
        let handle = tokio::spawn(async move {
            loop {
                let (stream, _peer) = listener.accept().await.unwrap();
                let handler = Arc::clone(&handler);
                let recorded = Arc::clone(&recorded);
                let stalled_paths = Arc::clone(&stalled_paths);

                tokio::spawn(async move {
                    let service = service_fn(move |req: Request<Incoming>| {
                        let handler = Arc::clone(&handler);
                        let recorded = Arc::clone(&recorded);
                        let stalled_paths = Arc::clone(&stalled_paths);

                        async move {
                            let (parts, incoming) = req.into_parts();
                            let body = incoming.collect().await?.to_bytes();
                            let req = MockRequest {
                                method: parts.method,
                                path: parts.uri.path().to_string(),
                                headers: parts.headers,
                                body,
                            };

                            let stall = stalled_paths.lock().unwrap().contains(&req.path);
                            let (status, body) = handler(&req);
                            recorded.lock().unwrap().push(req);

                            if stall {
                                std::future::pending::<()>().await;
                            }

                            let resp = Response::builder()
                                .status(status)
                                .header(CONTENT_TYPE, "application/json")
                                .body(Full::new(Bytes::from(body)))
                                .unwrap();

                            Ok::<_, hyper::Error>(resp)
                        }
                    });

                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });

        MockServer {
            addr,
            requests,
            stalled,
            handle,
        }
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn requests(&self) -> Vec<MockRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Count the recorded requests to `path`.
    pub fn hits(&self, path: &str) -> usize {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|req| req.path == path)
            .count()
    }

    /// Accept requests to `path` but never respond to them.
    pub fn stall(&self, path: &str) {
        self.stalled.lock().unwrap().insert(path.to_string());
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
