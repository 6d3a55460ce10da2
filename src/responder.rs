//! Serves the cache file to Prometheus. Every connection gets the current
//! snapshot as `200 OK` whatever it asked for, the request itself is only
//! drained so the peer doesn't see a reset.

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::cache;
use crate::config::ResponderConfig;

/// Requests larger than this are not drained any further.
const MAX_REQUEST_SIZE: usize = 16 * 1024;

/// Source of the body served to every client.
pub trait SnapshotProvider: Send + Sync + 'static {
    fn snapshot(&self) -> BoxFuture<'_, Vec<u8>>;
}

/// Serves whatever the cache file contains at the time of the request.
pub struct FileSnapshot {
    path: PathBuf,
}

impl FileSnapshot {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl SnapshotProvider for FileSnapshot {
    fn snapshot(&self) -> BoxFuture<'_, Vec<u8>> {
        Box::pin(cache::read(&self.path))
    }
}

/// The complete HTTP/1.1 response for `body`.
pub fn render_response(body: &[u8]) -> Vec<u8> {
    let head = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );

    let mut buf = Vec::with_capacity(head.len() + body.len());
    buf.extend_from_slice(head.as_bytes());
    buf.extend_from_slice(body);
    buf
}

pub struct Responder {
    listener: TcpListener,
    read_timeout: Duration,
    write_timeout: Duration,
}

impl Responder {
    pub async fn bind(config: &ResponderConfig) -> io::Result<Responder> {
        let listener = TcpListener::bind(config.listen).await?;

        Ok(Responder {
            listener,
            read_timeout: config.read_timeout,
            write_timeout: config.write_timeout,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until `shutdown` fires, each one is handled in
    /// its own task.
    pub async fn serve<P: SnapshotProvider>(self, provider: P, shutdown: CancellationToken) {
        let provider = Arc::new(provider);

        if let Ok(addr) = self.listener.local_addr() {
            info!(message = "responder started", listen = %addr);
        }

        loop {
            let (conn, peer) = tokio::select! {
                _ = shutdown.cancelled() => break,
                result = self.listener.accept() => match result {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        error!(
                            message = "accept new connection failed",
                            %err
                        );

                        continue
                    }
                }
            };

            let provider = Arc::clone(&provider);
            let read_timeout = self.read_timeout;
            let write_timeout = self.write_timeout;
            tokio::spawn(async move {
                if let Err(err) =
                    handle(conn, provider.as_ref(), read_timeout, write_timeout).await
                {
                    debug!(
                        message = "serve connection failed",
                        %peer,
                        %err
                    );
                }
            });
        }

        info!(message = "responder stopped");
    }
}

async fn handle<S, P>(
    mut conn: S,
    provider: &P,
    read_timeout: Duration,
    write_timeout: Duration,
) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
    P: SnapshotProvider + ?Sized,
{
    // whatever arrives in time is discarded
    let _ = tokio::time::timeout(read_timeout, drain_request(&mut conn)).await;

    let body = provider.snapshot().await;
    let resp = render_response(&body);

    tokio::time::timeout(write_timeout, async {
        conn.write_all(&resp).await?;
        conn.flush().await?;
        conn.shutdown().await
    })
    .await
    .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "write response timed out"))?
}

/// Read until the end of the request head, EOF or the size limit.
async fn drain_request<S: AsyncRead + Unpin>(conn: &mut S) -> io::Result<usize> {
    let mut buf = [0u8; 1024];
    let mut total = 0;
    // the last three bytes of the previous read, a terminator may straddle reads
    let mut tail = Vec::with_capacity(3 + buf.len());

    while total < MAX_REQUEST_SIZE {
        let n = conn.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        total += n;

        tail.extend_from_slice(&buf[..n]);
        if tail.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
        let keep = tail.len().saturating_sub(3);
        tail.drain(..keep);
    }

    Ok(total)
}
