//! Access log, response counters, and the `Cache-Control` policy.

use std::io;
use std::sync::Arc;

use tokio::time::Instant;
use tracing::info;

use super::Handler;
use crate::StatusCode;
use crate::http::{BoxFuture, Headers, Request, ResponseWriter};
use crate::metrics::Metrics;

/// `Cache-Control` value attached to every observed response.
pub const CACHE_POLICY: &str = "public, max-age=3600";

/// Outermost layer of the site pipeline.
///
/// Counts each request on entry and tags the response with [`CACHE_POLICY`].
/// When the status is finalized it logs one access line and counts the
/// response, its status code, and (for statuses below 400) the page path.
/// Paths of failed requests are not counted so clients cannot grow the page
/// table without bound.
pub struct ObservationMiddleware<H> {
    inner: H,
    metrics: Arc<dyn Metrics>,
}

impl<H> ObservationMiddleware<H> {
    pub fn new(inner: H, metrics: Arc<dyn Metrics>) -> Self {
        Self { inner, metrics }
    }
}

impl<H: Handler> Handler for ObservationMiddleware<H> {
    fn serve<'a>(&'a self, req: &'a Request, w: &'a mut dyn ResponseWriter) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            self.metrics.incr_requests();
            w.headers_mut().insert("Cache-Control", CACHE_POLICY);
            let mut observed = ObservedWriter {
                inner: w,
                req,
                metrics: self.metrics.as_ref(),
                started: Instant::now(),
                finalized: false,
            };
            self.inner.serve(req, &mut observed).await;
        })
    }
}

struct ObservedWriter<'w> {
    inner: &'w mut dyn ResponseWriter,
    req: &'w Request,
    metrics: &'w dyn Metrics,
    started: Instant,
    finalized: bool,
}

impl ObservedWriter<'_> {
    fn observe(&self, status: StatusCode) {
        let req = self.req;
        let remote = req
            .remote_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_default();
        info!(
            remote = %remote,
            user_agent = %req.user_agent(),
            method = %req.method(),
            host = %req.host(),
            target = %req.target(),
            status = status.as_u16(),
            elapsed = ?self.started.elapsed(),
            "request"
        );
        self.metrics.incr_responses();
        self.metrics.incr_status(status.as_u16());
        if !status.is_error() {
            self.metrics.incr_page(&req.decoded_path());
        }
    }
}

impl ResponseWriter for ObservedWriter<'_> {
    fn headers(&self) -> &Headers {
        self.inner.headers()
    }

    fn headers_mut(&mut self) -> &mut Headers {
        self.inner.headers_mut()
    }

    fn write_header(&mut self, status: StatusCode) -> BoxFuture<'_, io::Result<()>> {
        Box::pin(async move {
            if !self.finalized {
                self.finalized = true;
                self.observe(status);
            }
            self.inner.write_header(status).await
        })
    }

    fn write<'a>(&'a mut self, chunk: &'a [u8]) -> BoxFuture<'a, io::Result<()>> {
        Box::pin(async move {
            if !self.finalized {
                self.write_header(StatusCode::Ok).await?;
            }
            self.inner.write(chunk).await
        })
    }
}
