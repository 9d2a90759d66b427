//! Handler pipeline — composable layers around a content handler.
//!
//! Every layer is a [`Handler`] that owns the next one. A layer may answer a
//! request itself (short-circuit), pass it on untouched, or pass it on with a
//! decorated [`ResponseWriter`] so it can watch the status and body as the
//! downstream handler produces them.
//!
//! ## Core types
//!
//! - [`Handler`] — object-safe trait implemented by content handlers and layers.
//! - [`GetOnlyMiddleware`] — answers anything but `GET` with `405`.
//! - [`CachingMiddleware`] / [`ResponseCapture`] — serve repeat requests from
//!   a [`FrequencyCache`](crate::cache::FrequencyCache).
//! - [`ObservationMiddleware`] — counters, `Cache-Control`, and the access log.
//!
//! A site pipeline is built inside out:
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use sss::cache::FrequencyCache;
//! use sss::files::FileServer;
//! use sss::metrics::{Counters, Metrics};
//! use sss::middleware::{CachingMiddleware, GetOnlyMiddleware, ObservationMiddleware};
//!
//! let metrics: Arc<dyn Metrics> = Arc::new(Counters::new());
//! let cache = Arc::new(FrequencyCache::new(10_000_000));
//! let site = ObservationMiddleware::new(
//!     GetOnlyMiddleware::new(CachingMiddleware::new(
//!         FileServer::new("target"),
//!         cache,
//!         Arc::clone(&metrics),
//!     )),
//!     metrics,
//! );
//! ```

mod cache;
mod observe;

use std::sync::Arc;

use tracing::warn;

use crate::http::{BoxFuture, ResponseWriter};
use crate::{Method, Request, Response, StatusCode};

pub use cache::{CachingMiddleware, ResponseCapture};
pub use observe::{CACHE_POLICY, ObservationMiddleware};

/// Something that answers a request by writing into a [`ResponseWriter`].
///
/// # Contract
///
/// - Implementations must be `Send + Sync`; one handler instance serves every
///   connection concurrently.
/// - The returned future must be `Send` so it can run on a multi-threaded
///   runtime.
/// - Write errors are the handler's to log; there is nobody upstream to
///   report them to once the status line is out.
pub trait Handler: Send + Sync {
    /// Serve `req`, writing the response into `w`.
    fn serve<'a>(&'a self, req: &'a Request, w: &'a mut dyn ResponseWriter) -> BoxFuture<'a, ()>;
}

impl<H: Handler + ?Sized> Handler for Arc<H> {
    fn serve<'a>(&'a self, req: &'a Request, w: &'a mut dyn ResponseWriter) -> BoxFuture<'a, ()> {
        (**self).serve(req, w)
    }
}

/// Rejects every method except `GET` with `405 Method Not Allowed`.
///
/// The rejection carries no body, so a caching layer below never sees it.
pub struct GetOnlyMiddleware<H> {
    inner: H,
}

impl<H> GetOnlyMiddleware<H> {
    pub fn new(inner: H) -> Self {
        Self { inner }
    }
}

impl<H: Handler> Handler for GetOnlyMiddleware<H> {
    fn serve<'a>(&'a self, req: &'a Request, w: &'a mut dyn ResponseWriter) -> BoxFuture<'a, ()> {
        if req.method() == &Method::Get {
            return self.inner.serve(req, w);
        }
        Box::pin(async move {
            if let Err(e) = Response::new(StatusCode::MethodNotAllowed).send(w).await {
                warn!(path = %req.path(), error = %e, "failed to write 405");
            }
        })
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Shared fixtures for handler tests.

    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::Handler;
    use crate::http::{BoxFuture, ResponseWriter};
    use crate::{Request, StatusCode};

    /// Builds a GET (or other method) request for `path`.
    pub(crate) fn request(method: &str, path: &str) -> Request {
        let raw = format!(
            "{method} {path} HTTP/1.1\r\nHost: localhost\r\nUser-Agent: test\r\n\r\n"
        );
        let (req, _) = Request::parse(raw.as_bytes()).unwrap();
        req
    }

    /// A content handler with a fixed answer that counts its invocations.
    pub(crate) struct Origin {
        pub(crate) status: StatusCode,
        pub(crate) content_type: &'static str,
        pub(crate) chunks: Vec<&'static [u8]>,
        calls: AtomicUsize,
    }

    impl Origin {
        pub(crate) fn new(
            status: StatusCode,
            content_type: &'static str,
            chunks: Vec<&'static [u8]>,
        ) -> Self {
            Self {
                status,
                content_type,
                chunks,
                calls: AtomicUsize::new(0),
            }
        }

        pub(crate) fn ok(body: &'static [u8]) -> Self {
            Self::new(StatusCode::Ok, "text/plain", vec![body])
        }

        pub(crate) fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl Handler for Origin {
        fn serve<'a>(
            &'a self,
            _req: &'a Request,
            w: &'a mut dyn ResponseWriter,
        ) -> BoxFuture<'a, ()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move {
                w.headers_mut().set("Content-Type", self.content_type);
                let _ = w.write_header(self.status).await;
                for chunk in &self.chunks {
                    let _ = w.write(chunk).await;
                }
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{Origin, request};
    use super::*;
    use crate::http::writer::Recorder;

    #[tokio::test]
    async fn get_passes_through() {
        let origin = Origin::ok(b"hello");
        let handler = GetOnlyMiddleware::new(origin);
        let mut rec = Recorder::new();
        handler.serve(&request("GET", "/"), &mut rec).await;
        assert_eq!(rec.status(), Some(StatusCode::Ok));
        assert_eq!(&rec.body()[..], b"hello");
    }

    #[tokio::test]
    async fn other_methods_are_rejected() {
        let handler = GetOnlyMiddleware::new(Arc::new(Origin::ok(b"hello")));
        for method in ["POST", "PUT", "DELETE", "HEAD"] {
            let mut rec = Recorder::new();
            handler.serve(&request(method, "/foo.html"), &mut rec).await;
            assert_eq!(rec.status(), Some(StatusCode::MethodNotAllowed), "{method}");
            assert!(rec.body().is_empty());
        }
        assert_eq!(handler.inner.calls(), 0);
    }
}
