//! HTTP/1.1 response builder.
//!
//! Provides a fluent builder API for constructing small, fully buffered HTTP
//! responses. A built response is either serialized straight to a byte buffer
//! (for replies the server sends before any handler runs) or replayed into a
//! [`ResponseWriter`] via [`Response::send`].

use std::io;

use bytes::{BufMut, BytesMut};

use super::{Headers, ResponseWriter, StatusCode};

/// An HTTP/1.1 response, ready to be serialized and sent.
///
/// # Examples
///
/// ```
/// use sss::http::{Response, StatusCode};
///
/// let response = Response::new(StatusCode::Ok)
///     .header("Content-Type", "application/json")
///     .body(r#"{"status":"ok"}"#);
///
/// let bytes = response.into_bytes();
/// let text = std::str::from_utf8(&bytes).unwrap();
/// assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
/// assert!(text.contains("Content-Length: 15\r\n"));
/// ```
#[derive(Debug)]
pub struct Response {
    status: StatusCode,
    headers: Headers,
    body: Vec<u8>,
    keep_alive: bool,
}

impl Response {
    /// Creates a new response with the given status and an empty body.
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: Headers::new(),
            body: Vec::new(),
            keep_alive: true,
        }
    }

    /// Appends a response header. Multiple calls with the same name are additive.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Sets the response body from a string.
    ///
    /// The `Content-Length` header is written automatically by [`into_bytes`](Self::into_bytes).
    #[must_use]
    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into().into_bytes();
        self
    }

    /// Sets the response body from raw bytes.
    #[must_use]
    pub fn body_bytes(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// Controls whether the `Connection: keep-alive` or `Connection: close` header is written.
    #[must_use]
    pub fn keep_alive(mut self, keep_alive: bool) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    /// Returns the status code of this response.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Replays this response into a streaming writer.
    ///
    /// Headers are merged into the writer's staged headers (which may already
    /// carry headers added by middleware), `Content-Length` is set from the
    /// body, and the status and body are written.
    ///
    /// # Errors
    ///
    /// Returns the writer's I/O error if the status or body cannot be sent.
    pub async fn send(self, w: &mut dyn ResponseWriter) -> io::Result<()> {
        for (name, value) in self.headers.iter() {
            w.headers_mut().insert(name, value);
        }
        if !self.status.is_bodiless() {
            if !self.body.is_empty() && !w.headers().contains("content-type") {
                w.headers_mut()
                    .insert("Content-Type", "text/plain; charset=utf-8");
            }
            w.headers_mut()
                .set("Content-Length", self.body.len().to_string());
        }
        w.write_header(self.status).await?;
        if !self.body.is_empty() && !self.status.is_bodiless() {
            w.write(&self.body).await?;
        }
        Ok(())
    }

    /// Serializes the response into a `BytesMut` buffer using HTTP/1.1 wire format.
    ///
    /// Automatically adds:
    /// - `Content-Type: text/plain; charset=utf-8` if the body is non-empty and no
    ///   `Content-Type` header was set.
    /// - `Content-Length: <n>` (always written).
    /// - `Connection: keep-alive` or `Connection: close`.
    pub fn into_bytes(mut self) -> BytesMut {
        let content_length = self.body.len();

        if !self.body.is_empty() && !self.headers.contains("content-type") {
            self.headers
                .insert("Content-Type", "text/plain; charset=utf-8");
        }

        let connection = if self.keep_alive {
            "keep-alive"
        } else {
            "close"
        };
        self.headers.insert("Connection", connection);

        let estimated_size = 128 + self.headers.len() * 64 + content_length;
        let mut buf = BytesMut::with_capacity(estimated_size);

        // Status line
        buf.put(
            format!(
                "HTTP/1.1 {} {}\r\n",
                self.status.as_u16(),
                self.status.canonical_reason()
            )
            .as_bytes(),
        );

        // Headers
        for (name, value) in self.headers.iter() {
            buf.put(format!("{name}: {value}\r\n").as_bytes());
        }

        // Content-Length is always the last header before the blank line
        buf.put(format!("Content-Length: {content_length}\r\n").as_bytes());

        // Header/body separator
        buf.put(&b"\r\n"[..]);

        // Body
        if !self.body.is_empty() {
            buf.put(self.body.as_slice());
        }

        buf
    }
}

impl Default for Response {
    fn default() -> Self {
        Self::new(StatusCode::Ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn to_string(bytes: BytesMut) -> String {
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[test]
    fn simple_ok_response() {
        let r = Response::new(StatusCode::Ok).body("Hello");
        let s = to_string(r.into_bytes());
        assert!(s.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(s.contains("Content-Length: 5\r\n"));
        assert!(s.ends_with("\r\n\r\nHello"));
    }

    #[test]
    fn custom_header() {
        let r = Response::new(StatusCode::Ok)
            .header("X-Request-Id", "abc-123")
            .body("ok");
        let s = to_string(r.into_bytes());
        assert!(s.contains("X-Request-Id: abc-123\r\n"));
    }

    #[test]
    fn no_body_no_content_type() {
        let r = Response::new(StatusCode::NoContent);
        let s = to_string(r.into_bytes());
        assert!(!s.contains("Content-Type"));
        assert!(s.contains("Content-Length: 0\r\n"));
    }

    #[test]
    fn connection_close() {
        let r = Response::new(StatusCode::Ok).keep_alive(false);
        let s = to_string(r.into_bytes());
        assert!(s.contains("Connection: close\r\n"));
    }

    #[tokio::test]
    async fn send_replays_into_writer() {
        use crate::http::writer::Recorder;

        let mut rec = Recorder::new();
        rec.headers_mut().insert("Cache-Control", "no-store");
        Response::new(StatusCode::NotFound)
            .body("404 page not found")
            .send(&mut rec)
            .await
            .unwrap();

        assert_eq!(rec.status(), Some(StatusCode::NotFound));
        let sent = rec.sent_headers().unwrap();
        assert_eq!(sent.get("cache-control"), Some("no-store"));
        assert_eq!(sent.get("content-length"), Some("18"));
        assert_eq!(sent.get("content-type"), Some("text/plain; charset=utf-8"));
        assert_eq!(&rec.body()[..], b"404 page not found");
    }

    #[tokio::test]
    async fn send_empty_body() {
        use crate::http::writer::Recorder;

        let mut rec = Recorder::new();
        Response::new(StatusCode::MethodNotAllowed)
            .send(&mut rec)
            .await
            .unwrap();
        assert_eq!(rec.status(), Some(StatusCode::MethodNotAllowed));
        assert!(rec.body().is_empty());
        assert!(!rec.sent_headers().unwrap().contains("content-type"));
    }

    #[test]
    fn not_found() {
        let r = Response::new(StatusCode::NotFound).body("Not Found");
        let s = to_string(r.into_bytes());
        assert!(s.starts_with("HTTP/1.1 404 Not Found\r\n"));
    }
}
