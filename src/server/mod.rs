//! Async TCP server using Tokio.
//!
//! Accepts TCP connections and dispatches HTTP/1.1 requests to a [`Handler`].
//! Supports HTTP/1.1 persistent connections (keep-alive) out of the box.
//!
//! Responses stream straight to the socket through a [`ResponseWriter`]. The
//! body framing is chosen when the status is written: `Content-Length` when the
//! handler declared one, chunked transfer coding for HTTP/1.1 otherwise, and
//! close-delimited for HTTP/1.0 peers.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{BufMut, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use crate::http::{
    BoxFuture, Headers, ResponseWriter, StatusCode,
    request::{Request, RequestError},
    response::Response,
};
use crate::middleware::Handler;

/// Errors produced by the server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

/// Maximum size of a complete HTTP request we will buffer before rejecting it (8 MiB).
const MAX_REQUEST_SIZE: usize = 8 * 1024 * 1024;

/// Initial read buffer capacity per connection.
const INITIAL_BUF_SIZE: usize = 4096;

/// The site's HTTP server.
///
/// Binds to a TCP address and dispatches incoming HTTP/1.1 requests to a
/// [`Handler`].
///
/// # Examples
///
/// ```rust,no_run
/// use sss::router::{Router, StatusHandler};
/// use sss::server::Server;
/// use sss::StatusCode;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let mut router = Router::new();
///     router.route("/healthz", StatusHandler::new(StatusCode::Ok));
///
///     let server = Server::bind("127.0.0.1:8080").await?;
///     server.run(router).await?;
///     Ok(())
/// }
/// ```
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl Server {
    /// Binds the server to the given TCP address.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Bind`] if the address cannot be bound
    /// (e.g. port already in use, insufficient permissions).
    pub async fn bind(addr: impl AsRef<str>) -> Result<Self, ServerError> {
        let addr = addr.as_ref();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::Bind {
                addr: addr.to_owned(),
                source: e,
            })?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            local_addr,
        })
    }

    /// Returns the local address the server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Starts accepting connections and dispatching requests to `handler`.
    ///
    /// The handler is wrapped in an [`Arc`] and shared across all spawned
    /// Tokio tasks.
    ///
    /// This method runs until the process is terminated or the returned future
    /// is dropped.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Io`] if the TCP listener itself fails.
    pub async fn run<H: Handler + 'static>(self, handler: H) -> Result<(), ServerError> {
        let handler = Arc::new(handler);
        info!(address = %self.local_addr, "listening");

        loop {
            let (stream, peer_addr) = match self.listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    error!(error = %e, "failed to accept connection");
                    continue;
                }
            };

            debug!(peer = %peer_addr, "connection accepted");
            let handler = Arc::clone(&handler);

            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, peer_addr, handler).await {
                    warn!(peer = %peer_addr, error = %e, "connection closed with error");
                }
            });
        }
    }
}

/// Handles a single TCP connection over its lifetime.
///
/// HTTP/1.1 connections are persistent by default: we loop, reading one
/// request per iteration, until the peer closes the connection, signals
/// `Connection: close`, or a response had to be close-delimited.
async fn handle_connection<H: Handler>(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    handler: Arc<H>,
) -> Result<(), std::io::Error> {
    let mut buf = BytesMut::with_capacity(INITIAL_BUF_SIZE);

    loop {
        let bytes_read = stream.read_buf(&mut buf).await?;

        if bytes_read == 0 {
            debug!(peer = %peer_addr, "connection closed by peer");
            break;
        }

        // Guard against excessively large requests.
        if buf.len() > MAX_REQUEST_SIZE {
            warn!(peer = %peer_addr, "request too large, sending 413");
            let response = Response::new(StatusCode::PayloadTooLarge)
                .body("Request entity too large")
                .keep_alive(false);
            stream.write_all(&response.into_bytes()).await?;
            break;
        }

        // Attempt to parse the buffered data as an HTTP request.
        let (request, body_offset) = match Request::parse(&buf) {
            Ok(pair) => pair,
            Err(RequestError::Incomplete) => {
                // Headers not yet fully received, read more data.
                continue;
            }
            Err(e) => {
                warn!(peer = %peer_addr, error = %e, "bad request, sending 400");
                let response = Response::new(StatusCode::BadRequest)
                    .body(format!("Bad Request: {e}"))
                    .keep_alive(false);
                stream.write_all(&response.into_bytes()).await?;
                break;
            }
        };

        // Wait for the full body to arrive if Content-Length is set.
        let content_length = request.content_length().unwrap_or(0);
        let total_needed = match body_offset.checked_add(content_length) {
            Some(total) if total <= MAX_REQUEST_SIZE => total,
            _ => {
                warn!(peer = %peer_addr, content_length, "declared body too large, sending 413");
                let response = Response::new(StatusCode::PayloadTooLarge)
                    .body("Request entity too large")
                    .keep_alive(false);
                stream.write_all(&response.into_bytes()).await?;
                break;
            }
        };
        if buf.len() < total_needed {
            continue;
        }

        let request = request.with_remote_addr(peer_addr);

        debug!(
            peer = %peer_addr,
            method = %request.method(),
            path = %request.path(),
            "dispatching request"
        );

        let mut writer =
            ConnectionWriter::new(&mut stream, request.version(), request.is_keep_alive());
        handler.serve(&request, &mut writer).await;
        let keep_alive = writer.finish().await?;

        // Drop the consumed request bytes from the buffer.
        let _ = buf.split_to(total_needed);

        if !keep_alive {
            debug!(peer = %peer_addr, "closing connection after response");
            break;
        }
    }

    Ok(())
}

// How the body of the current response is delimited on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Framing {
    // Status not written yet.
    Pending,
    // Declared `Content-Length`; tracks bytes still owed.
    Length(usize),
    Chunked,
    // Body ends when the connection closes.
    Close,
    // Status forbids a body; writes are discarded.
    Empty,
}

/// [`ResponseWriter`] over one connection's socket.
///
/// Bytes are written to the stream as they arrive with no extra buffering.
/// [`finish`](ConnectionWriter::finish) must be called once the handler
/// returns to terminate the body framing.
struct ConnectionWriter<'s, S> {
    stream: &'s mut S,
    headers: Headers,
    version: u8,
    keep_alive: bool,
    framing: Framing,
}

impl<'s, S: AsyncWrite + Unpin + Send> ConnectionWriter<'s, S> {
    fn new(stream: &'s mut S, version: u8, keep_alive: bool) -> Self {
        Self {
            stream,
            headers: Headers::new(),
            version,
            keep_alive,
            framing: Framing::Pending,
        }
    }

    async fn start(&mut self, status: StatusCode) -> io::Result<()> {
        if self.framing != Framing::Pending {
            debug!(status = status.as_u16(), "status already written, ignoring");
            return Ok(());
        }

        self.framing = if status.is_bodiless() {
            Framing::Empty
        } else if let Some(len) = self
            .headers
            .get("content-length")
            .and_then(|v| v.trim().parse::<usize>().ok())
        {
            Framing::Length(len)
        } else if self.version >= 1 {
            self.headers.set("Transfer-Encoding", "chunked");
            Framing::Chunked
        } else {
            self.keep_alive = false;
            Framing::Close
        };

        let connection = if self.keep_alive {
            "keep-alive"
        } else {
            "close"
        };
        self.headers.set("Connection", connection);

        let mut head = BytesMut::with_capacity(128 + self.headers.len() * 64);
        head.put(
            format!(
                "HTTP/1.1 {} {}\r\n",
                status.as_u16(),
                status.canonical_reason()
            )
            .as_bytes(),
        );
        for (name, value) in self.headers.iter() {
            head.put(format!("{name}: {value}\r\n").as_bytes());
        }
        head.put(&b"\r\n"[..]);
        self.stream.write_all(&head).await
    }

    async fn send(&mut self, chunk: &[u8]) -> io::Result<()> {
        if self.framing == Framing::Pending {
            self.start(StatusCode::Ok).await?;
        }
        if chunk.is_empty() {
            return Ok(());
        }
        match self.framing {
            Framing::Chunked => {
                self.stream
                    .write_all(format!("{:x}\r\n", chunk.len()).as_bytes())
                    .await?;
                self.stream.write_all(chunk).await?;
                self.stream.write_all(b"\r\n").await
            }
            Framing::Length(remaining) => {
                if chunk.len() > remaining {
                    self.keep_alive = false;
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        "body longer than declared Content-Length",
                    ));
                }
                self.framing = Framing::Length(remaining - chunk.len());
                self.stream.write_all(chunk).await
            }
            Framing::Close => self.stream.write_all(chunk).await,
            Framing::Empty | Framing::Pending => Ok(()),
        }
    }

    /// Completes the response and reports whether the connection may be reused.
    ///
    /// A handler that wrote nothing produces `200 OK` with an empty body. A
    /// body shorter than its declared length poisons the connection.
    async fn finish(mut self) -> io::Result<bool> {
        if self.framing == Framing::Pending {
            self.headers.set("Content-Length", "0");
            self.start(StatusCode::Ok).await?;
        }
        match self.framing {
            Framing::Chunked => self.stream.write_all(b"0\r\n\r\n").await?,
            Framing::Length(remaining) if remaining > 0 => {
                warn!(remaining, "response body shorter than Content-Length");
                self.keep_alive = false;
            }
            _ => {}
        }
        self.stream.flush().await?;
        Ok(self.keep_alive)
    }
}

impl<S: AsyncWrite + Unpin + Send> ResponseWriter for ConnectionWriter<'_, S> {
    fn headers(&self) -> &Headers {
        &self.headers
    }

    fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    fn write_header(&mut self, status: StatusCode) -> BoxFuture<'_, io::Result<()>> {
        Box::pin(self.start(status))
    }

    fn write<'a>(&'a mut self, chunk: &'a [u8]) -> BoxFuture<'a, io::Result<()>> {
        Box::pin(self.send(chunk))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::{Router, StatusHandler};

    fn text(out: &[u8]) -> &str {
        std::str::from_utf8(out).unwrap()
    }

    #[tokio::test]
    async fn declared_length_is_sent_verbatim() {
        let mut out = Vec::new();
        let mut w = ConnectionWriter::new(&mut out, 1, true);
        w.headers_mut().set("Content-Length", "5");
        w.write_header(StatusCode::Ok).await.unwrap();
        w.write(b"hel").await.unwrap();
        w.write(b"lo").await.unwrap();
        assert!(w.finish().await.unwrap());

        let s = text(&out);
        assert!(s.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(s.contains("Content-Length: 5\r\n"));
        assert!(s.contains("Connection: keep-alive\r\n"));
        assert!(!s.contains("Transfer-Encoding"));
        assert!(s.ends_with("\r\n\r\nhello"));
    }

    #[tokio::test]
    async fn undeclared_length_is_chunked() {
        let mut out = Vec::new();
        let mut w = ConnectionWriter::new(&mut out, 1, true);
        w.write(b"ab").await.unwrap();
        w.write(b"").await.unwrap();
        w.write(b"cdefghijklmnopq").await.unwrap();
        assert!(w.finish().await.unwrap());

        let s = text(&out);
        assert!(s.contains("Transfer-Encoding: chunked\r\n"));
        assert!(s.ends_with("\r\n\r\n2\r\nab\r\nf\r\ncdefghijklmnopq\r\n0\r\n\r\n"));
    }

    #[tokio::test]
    async fn http10_body_is_close_delimited() {
        let mut out = Vec::new();
        let mut w = ConnectionWriter::new(&mut out, 0, true);
        w.write(b"legacy").await.unwrap();
        assert!(!w.finish().await.unwrap());

        let s = text(&out);
        assert!(s.contains("Connection: close\r\n"));
        assert!(s.ends_with("\r\n\r\nlegacy"));
    }

    #[tokio::test]
    async fn silent_handler_gets_empty_ok() {
        let mut out = Vec::new();
        let w = ConnectionWriter::new(&mut out, 1, true);
        assert!(w.finish().await.unwrap());

        let s = text(&out);
        assert!(s.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(s.contains("Content-Length: 0\r\n"));
        assert!(s.ends_with("\r\n\r\n"));
    }

    #[tokio::test]
    async fn repeated_status_is_ignored() {
        let mut out = Vec::new();
        let mut w = ConnectionWriter::new(&mut out, 1, true);
        w.headers_mut().set("Content-Length", "0");
        w.write_header(StatusCode::NotFound).await.unwrap();
        w.write_header(StatusCode::Ok).await.unwrap();
        w.finish().await.unwrap();

        let s = text(&out);
        assert!(s.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert_eq!(s.matches("HTTP/1.1").count(), 1);
    }

    #[tokio::test]
    async fn short_body_closes_connection() {
        let mut out = Vec::new();
        let mut w = ConnectionWriter::new(&mut out, 1, true);
        w.headers_mut().set("Content-Length", "10");
        w.write(b"short").await.unwrap();
        assert!(!w.finish().await.unwrap());
    }

    #[tokio::test]
    async fn long_body_is_rejected() {
        let mut out = Vec::new();
        let mut w = ConnectionWriter::new(&mut out, 1, true);
        w.headers_mut().set("Content-Length", "2");
        assert!(w.write(b"toolong").await.is_err());
    }

    async fn roundtrip(raw: &[u8]) -> String {
        let mut router = Router::new();
        router.route("/healthz", StatusHandler::new(StatusCode::Ok));

        let server = Server::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr();
        tokio::spawn(server.run(router));

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(raw).await.unwrap();
        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        String::from_utf8(out).unwrap()
    }

    #[tokio::test]
    async fn serves_over_tcp() {
        let s = roundtrip(b"GET /healthz HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n").await;
        assert!(s.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(s.contains("Content-Length: 0\r\n"));
        assert!(s.contains("Connection: close\r\n"));
    }

    #[tokio::test]
    async fn unknown_path_is_404_over_tcp() {
        let s = roundtrip(b"GET /missing HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n").await;
        assert!(s.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(s.ends_with("404 page not found"));
    }

    #[tokio::test]
    async fn overflowing_content_length_is_413() {
        let s = roundtrip(
            b"GET /healthz HTTP/1.1\r\nHost: x\r\nContent-Length: 18446744073709551615\r\n\r\n",
        )
        .await;
        assert!(s.starts_with("HTTP/1.1 413 Payload Too Large\r\n"));
        assert!(s.contains("Connection: close\r\n"));
    }

    #[tokio::test]
    async fn oversized_content_length_is_413() {
        let s = roundtrip(
            b"GET /healthz HTTP/1.1\r\nHost: x\r\nContent-Length: 9000000\r\n\r\n",
        )
        .await;
        assert!(s.starts_with("HTTP/1.1 413 Payload Too Large\r\n"));
    }

    #[tokio::test]
    async fn malformed_request_is_400() {
        let s = roundtrip(b"GET / HTTP/9.9\r\nHost: x\r\n\r\n").await;
        assert!(s.starts_with("HTTP/1.1 400 Bad Request\r\n"));
    }

    #[tokio::test]
    async fn bind_error_names_address() {
        let err = Server::bind("definitely-not-an-address").await.err().unwrap();
        assert!(err.to_string().contains("definitely-not-an-address"));
    }
}
