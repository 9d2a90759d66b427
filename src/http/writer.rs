//! Streaming response sink.
//!
//! A [`ResponseWriter`] is what a handler writes its response into: headers are
//! mutable until the status is finalized, after which body bytes flow through
//! [`ResponseWriter::write`] as they are produced. Middleware decorates a
//! writer by wrapping it (see [`crate::middleware`]).

use std::future::Future;
use std::io;
use std::pin::Pin;

use bytes::{Bytes, BytesMut};

use super::{Headers, StatusCode};

/// A boxed, `Send` future borrowed for `'a`.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// The sink a handler writes a response into.
///
/// # Contract
///
/// - Headers may be edited through [`headers_mut`](Self::headers_mut) until the
///   status is finalized. Edits made afterwards are not sent.
/// - The first call to [`write_header`](Self::write_header) finalizes the
///   status. Later calls are ignored.
/// - [`write`](Self::write) finalizes status `200 OK` if no status has been
///   written yet, then sends the bytes unchanged.
/// - Errors are I/O errors from the underlying transport; a failed write does
///   not un-send what was already sent.
pub trait ResponseWriter: Send {
    /// Response headers staged for sending.
    fn headers(&self) -> &Headers;

    /// Mutable access to the staged response headers.
    fn headers_mut(&mut self) -> &mut Headers;

    /// Finalizes the status line and sends the staged headers.
    fn write_header(&mut self, status: StatusCode) -> BoxFuture<'_, io::Result<()>>;

    /// Sends a chunk of body bytes.
    fn write<'a>(&'a mut self, chunk: &'a [u8]) -> BoxFuture<'a, io::Result<()>>;
}

/// An in-memory [`ResponseWriter`] that records everything written to it.
///
/// Useful for driving handlers without a socket.
///
/// # Examples
///
/// ```
/// use sss::http::{ResponseWriter, StatusCode, writer::Recorder};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> std::io::Result<()> {
/// let mut rec = Recorder::new();
/// rec.headers_mut().insert("Content-Type", "text/plain");
/// rec.write(b"hello").await?;
///
/// assert_eq!(rec.status(), Some(StatusCode::Ok));
/// assert_eq!(&rec.body()[..], b"hello");
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Default)]
pub struct Recorder {
    staged: Headers,
    sent: Option<Headers>,
    status: Option<StatusCode>,
    body: BytesMut,
    status_writes: usize,
    fail_writes: bool,
}

impl Recorder {
    /// Creates an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a recorder whose body writes fail, as if the peer went away.
    pub fn failing() -> Self {
        Self {
            fail_writes: true,
            ..Self::default()
        }
    }

    /// The finalized status, if any.
    pub fn status(&self) -> Option<StatusCode> {
        self.status
    }

    /// Headers as they were when the status was finalized.
    pub fn sent_headers(&self) -> Option<&Headers> {
        self.sent.as_ref()
    }

    /// Body bytes received so far.
    pub fn body(&self) -> Bytes {
        self.body.clone().freeze()
    }

    /// Number of `write_header` calls, including ignored ones.
    pub fn status_writes(&self) -> usize {
        self.status_writes
    }

    fn finalize(&mut self, status: StatusCode) {
        self.status_writes += 1;
        if self.status.is_none() {
            self.status = Some(status);
            self.sent = Some(self.staged.clone());
        }
    }
}

impl ResponseWriter for Recorder {
    fn headers(&self) -> &Headers {
        &self.staged
    }

    fn headers_mut(&mut self) -> &mut Headers {
        &mut self.staged
    }

    fn write_header(&mut self, status: StatusCode) -> BoxFuture<'_, io::Result<()>> {
        self.finalize(status);
        Box::pin(async { Ok(()) })
    }

    fn write<'a>(&'a mut self, chunk: &'a [u8]) -> BoxFuture<'a, io::Result<()>> {
        Box::pin(async move {
            if self.status.is_none() {
                self.finalize(StatusCode::Ok);
            }
            if self.fail_writes {
                return Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "recorder configured to fail writes",
                ));
            }
            self.body.extend_from_slice(chunk);
            Ok(())
        })
    }
}
