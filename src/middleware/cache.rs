//! Response caching keyed by request path.
//!
//! On a hit the stored body is replayed with its content type and status
//! `200 OK`. On a miss the downstream handler writes through a
//! [`ResponseCapture`], which forwards every byte to the client as it arrives
//! and keeps a copy; once the handler returns, a non-empty copy is stored.
//!
//! Entries are keyed by the percent-decoded path, so `/a%2Etxt` and `/a.txt`
//! share one entry.
//!
//! Two consequences for callers:
//!
//! - The original status is not stored. A hit is always `200 OK`.
//! - Storage only checks that the body is non-empty. An error page with a
//!   body is cached like any other response and later replayed as `200 OK`.

use std::io;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tracing::{debug, warn};

use super::Handler;
use crate::StatusCode;
use crate::cache::{CachedData, FrequencyCache};
use crate::http::{BoxFuture, Headers, Request, ResponseWriter};
use crate::metrics::Metrics;

/// A [`ResponseWriter`] decorator that tees the body into a buffer.
///
/// - Body bytes go to the wrapped writer immediately and unchanged; the copy
///   is kept even if forwarding fails.
/// - Headers are snapshotted when the status is finalized.
/// - A miss for the request path is recorded when the status is finalized
///   with a code below 400, whether or not a body follows.
pub struct ResponseCapture<'w> {
    inner: &'w mut dyn ResponseWriter,
    path: &'w str,
    metrics: &'w dyn Metrics,
    status: Option<StatusCode>,
    snapshot: Option<Headers>,
    buf: BytesMut,
}

impl<'w> ResponseCapture<'w> {
    pub fn new(inner: &'w mut dyn ResponseWriter, path: &'w str, metrics: &'w dyn Metrics) -> Self {
        Self {
            inner,
            path,
            metrics,
            status: None,
            snapshot: None,
            buf: BytesMut::new(),
        }
    }

    /// The status the downstream handler finalized, if any.
    pub fn status(&self) -> Option<StatusCode> {
        self.status
    }

    /// Headers as they stood when the status was finalized.
    pub fn captured_headers(&self) -> Option<&Headers> {
        self.snapshot.as_ref()
    }

    /// Returns the captured body and the content type from the header snapshot
    /// (empty if none was set).
    pub fn into_parts(self) -> (Bytes, String) {
        let content_type = self
            .snapshot
            .as_ref()
            .and_then(|h| h.get("content-type"))
            .unwrap_or_default()
            .to_owned();
        (self.buf.freeze(), content_type)
    }
}

impl ResponseWriter for ResponseCapture<'_> {
    fn headers(&self) -> &Headers {
        self.inner.headers()
    }

    fn headers_mut(&mut self) -> &mut Headers {
        self.inner.headers_mut()
    }

    fn write_header(&mut self, status: StatusCode) -> BoxFuture<'_, io::Result<()>> {
        Box::pin(async move {
            if let Some(sent) = self.status {
                debug!(path = %self.path, sent = sent.as_u16(), ignored = status.as_u16(), "superfluous write_header");
                return Ok(());
            }
            self.status = Some(status);
            self.snapshot = Some(self.inner.headers().clone());
            let result = self.inner.write_header(status).await;
            if !status.is_error() {
                self.metrics.incr_miss(self.path);
            }
            result
        })
    }

    fn write<'a>(&'a mut self, chunk: &'a [u8]) -> BoxFuture<'a, io::Result<()>> {
        Box::pin(async move {
            let header = if self.status.is_none() {
                self.write_header(StatusCode::Ok).await
            } else {
                Ok(())
            };
            self.buf.extend_from_slice(chunk);
            let forwarded = self.inner.write(chunk).await;
            header.and(forwarded)
        })
    }
}

/// Serves repeat requests for a path from a shared [`FrequencyCache`].
///
/// The cache key is the decoded request path alone. The cache lock is only held for
/// the lookup and the final store; the downstream handler runs outside it.
pub struct CachingMiddleware<H> {
    inner: H,
    cache: Arc<FrequencyCache>,
    metrics: Arc<dyn Metrics>,
}

impl<H> CachingMiddleware<H> {
    pub fn new(inner: H, cache: Arc<FrequencyCache>, metrics: Arc<dyn Metrics>) -> Self {
        Self {
            inner,
            cache,
            metrics,
        }
    }

    /// The cache this layer reads and fills.
    pub fn cache(&self) -> &Arc<FrequencyCache> {
        &self.cache
    }
}

impl<H: Handler> Handler for CachingMiddleware<H> {
    fn serve<'a>(&'a self, req: &'a Request, w: &'a mut dyn ResponseWriter) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let key = req.decoded_path();
            let path = key.as_ref();

            if let Some(data) = self.cache.get(path) {
                if let Err(e) = replay(w, &data).await {
                    warn!(path = %path, error = %e, "failed to write cached response");
                }
                self.metrics.incr_hit(path);
                return;
            }

            let mut capture = ResponseCapture::new(w, path, self.metrics.as_ref());
            self.inner.serve(req, &mut capture).await;

            let (body, content_type) = capture.into_parts();
            if !body.is_empty() {
                self.cache.put(path, CachedData::new(content_type, body));
            }
        })
    }
}

async fn replay(w: &mut dyn ResponseWriter, data: &CachedData) -> io::Result<()> {
    if !data.content_type.is_empty() {
        w.headers_mut().set("Content-Type", data.content_type.as_str());
    }
    w.headers_mut().set("Content-Length", data.len().to_string());
    w.write_header(StatusCode::Ok).await?;
    w.write(&data.data).await
}
