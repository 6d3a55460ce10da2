use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use bytes::Bytes;
use http::{Request, Response, StatusCode};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use pvesd::cache::CacheWriter;
use pvesd::config::{ProxmoxConfig, ResponderConfig};
use pvesd::discovery::Discovery;
use pvesd::proxmox::Client;
use pvesd::responder::{FileSnapshot, Responder};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

fn temp_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!(
        "pvesd-{}-{name}",
        std::process::id()
    ));
    std::fs::create_dir_all(&dir).unwrap();
    dir.join("scraper.output")
}

async fn start_responder(path: PathBuf) -> (SocketAddr, CancellationToken) {
    let config = ResponderConfig {
        listen: "127.0.0.1:0".parse().unwrap(),
        read_timeout: Duration::from_millis(200),
        write_timeout: Duration::from_secs(1),
    };

    let responder = Responder::bind(&config).await.unwrap();
    let addr = responder.local_addr().unwrap();
    let shutdown = CancellationToken::new();
    tokio::spawn(responder.serve(FileSnapshot::new(path), shutdown.clone()));

    (addr, shutdown)
}

async fn get(addr: SocketAddr) -> (String, String) {
    let mut conn = TcpStream::connect(addr).await.unwrap();
    conn.write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\nAccept: */*\r\n\r\n")
        .await
        .unwrap();

    let mut resp = String::new();
    conn.read_to_string(&mut resp).await.unwrap();

    let (head, body) = resp.split_once("\r\n\r\n").unwrap();
    (head.to_string(), body.to_string())
}

/// A Proxmox API refusing every login.
async fn start_forbidden_api() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::spawn(async move {
                let service = service_fn(|_req: Request<Incoming>| async {
                    Ok::<_, hyper::Error>(
                        Response::builder()
                            .status(StatusCode::FORBIDDEN)
                            .body(Full::new(Bytes::new()))
                            .unwrap(),
                    )
                });

                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });

    addr
}

#[tokio::test]
async fn missing_cache_file() {
    let path = temp_path("missing");
    let (addr, shutdown) = start_responder(path.clone()).await;

    let (head, body) = get(addr).await;
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"), "{head}");
    assert!(head.contains("Connection: close"), "{head}");
    assert_eq!(body, format!("File not found: {}", path.display()));

    shutdown.cancel();
}

#[tokio::test]
async fn serves_latest_snapshot() {
    let path = temp_path("latest");
    let writer = CacheWriter::new(&path);
    let (addr, shutdown) = start_responder(path).await;

    writer.write(b"[]").await.unwrap();
    let (head, body) = get(addr).await;
    assert!(head.contains("Content-Type: application/json"), "{head}");
    assert!(head.contains("Content-Length: 2"), "{head}");
    assert_eq!(body, "[]");

    let targets = r#"[{"targets":["192.168.210.5:9100"],"labels":{"vm_id":"101"}}]"#;
    writer.write(targets.as_bytes()).await.unwrap();
    let (_head, body) = get(addr).await;
    assert_eq!(body, targets);

    shutdown.cancel();
}

#[tokio::test]
async fn authentication_failure_is_served() {
    let api = start_forbidden_api().await;
    let path = temp_path("forbidden");

    let client = Client::new(&ProxmoxConfig {
        endpoint: format!("http://{api}/api2/json"),
        timeout: Duration::from_secs(5),
        ..Default::default()
    })
    .unwrap();
    let discovery = Discovery::new(
        client,
        "192.168.210.0/24".parse().unwrap(),
        CacheWriter::new(&path),
    );

    let discovery_shutdown = CancellationToken::new();
    let handle = tokio::spawn(discovery.run(Duration::from_secs(3600), discovery_shutdown.clone()));

    let (addr, shutdown) = start_responder(path.clone()).await;
    let mut body = String::new();
    for _ in 0..100 {
        body = get(addr).await.1;
        if !body.starts_with("File not found") {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    assert_eq!(body, r#"{"error":"Unable to authenticate"}"#);

    discovery_shutdown.cancel();
    shutdown.cancel();
    handle.await.unwrap();
}
