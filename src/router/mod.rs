//! Request routing — map URL paths to handlers.
//!
//! [`Router`] dispatches each request to the first registered handler whose
//! pattern matches the request path. Two pattern styles are supported:
//!
//! | Pattern        | Example match            |
//! |----------------|--------------------------|
//! | `/healthz`     | `/healthz`               |
//! | `/static/*`    | `/static/css/site.css`   |
//!
//! Trailing slashes are normalized on exact patterns and incoming paths, so
//! `/healthz/` and `/healthz` are treated as equivalent. `/*` matches every
//! path and is the usual catch-all for site content.
//!
//! Routes are matched in registration order; register exact paths before a
//! catch-all.
//!
//! [`site`] assembles the router the `sss` binary serves.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::warn;

use crate::cache::FrequencyCache;
use crate::files::FileServer;
use crate::http::{BoxFuture, ResponseWriter};
use crate::metrics::{Counters, Metrics, VarsHandler};
use crate::middleware::{CachingMiddleware, GetOnlyMiddleware, Handler, ObservationMiddleware};
use crate::{Request, Response, StatusCode};

// Compiled representation of a route pattern string.
#[derive(Debug, Clone)]
enum Pattern {
    // Matches one exact path string, e.g. `/healthz`.
    Exact(String),
    // Matches any path that starts with the given prefix, e.g. `/files/*`.
    Prefix(String),
}

impl Pattern {
    /// Parse a route pattern string into a `Pattern`.
    ///
    /// A pattern ending in `/*` matches every path under its prefix; anything
    /// else is a literal path. A trailing slash (other than on the root `/`) is
    /// stripped first so that `/users/` and `/users` compile identically.
    fn parse(pattern: &str) -> Self {
        if let Some(prefix) = pattern.strip_suffix("/*") {
            return Pattern::Prefix(prefix.to_string());
        }
        Pattern::Exact(trim_trailing_slash(pattern).to_string())
    }

    fn matches(&self, path: &str) -> bool {
        match self {
            Pattern::Exact(p) => p == trim_trailing_slash(path),
            Pattern::Prefix(prefix) => path
                .strip_prefix(prefix.as_str())
                .is_some_and(|rest| rest.is_empty() || rest.starts_with('/')),
        }
    }
}

fn trim_trailing_slash(path: &str) -> &str {
    if path != "/" && path.ends_with('/') {
        &path[..path.len() - 1]
    } else {
        path
    }
}

// A single registered route binding a pattern to a handler.
struct Route {
    pattern: Pattern,
    handler: Arc<dyn Handler>,
}

/// Path multiplexer over [`Handler`]s.
///
/// When no route matches, `404 Not Found` is returned.
///
/// # Examples
///
/// ```rust
/// use sss::router::{Router, StatusHandler};
/// use sss::StatusCode;
///
/// let mut router = Router::new();
/// router.route("/healthz", StatusHandler::new(StatusCode::Ok));
/// assert_eq!(router.len(), 1);
/// ```
#[derive(Default)]
pub struct Router {
    routes: Vec<Route>,
}

impl Router {
    /// Create a new, empty `Router` with no registered routes.
    pub fn new() -> Self {
        Self { routes: Vec::new() }
    }

    /// Register `handler` for paths matching `pattern`.
    pub fn route(&mut self, pattern: &str, handler: impl Handler + 'static) {
        self.routes.push(Route {
            pattern: Pattern::parse(pattern),
            handler: Arc::new(handler),
        });
    }

    /// Return the number of routes registered in this router.
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Return `true` if no routes have been registered.
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    fn find(&self, path: &str) -> Option<&Arc<dyn Handler>> {
        self.routes
            .iter()
            .find(|route| route.pattern.matches(path))
            .map(|route| &route.handler)
    }
}

impl Handler for Router {
    fn serve<'a>(&'a self, req: &'a Request, w: &'a mut dyn ResponseWriter) -> BoxFuture<'a, ()> {
        match self.find(req.path()) {
            Some(handler) => handler.serve(req, w),
            None => Box::pin(async move {
                if let Err(e) = Response::new(StatusCode::NotFound)
                    .body("404 page not found")
                    .send(w)
                    .await
                {
                    warn!(path = %req.path(), error = %e, "failed to write 404");
                }
            }),
        }
    }
}

/// Answers every request with a fixed status and an empty body.
///
/// Used for liveness checks such as `/healthz`.
pub struct StatusHandler {
    status: StatusCode,
}

impl StatusHandler {
    pub fn new(status: StatusCode) -> Self {
        Self { status }
    }
}

impl Handler for StatusHandler {
    fn serve<'a>(&'a self, req: &'a Request, w: &'a mut dyn ResponseWriter) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            if let Err(e) = Response::new(self.status).send(w).await {
                warn!(path = %req.path(), error = %e, "failed to write status");
            }
        })
    }
}

/// Builds the site router.
///
/// - `/healthz` answers `200` with an empty body.
/// - `/debug/vars` serves `counters` and the cache gauges as JSON.
/// - Everything else is served from `root` through observation, the GET-only
///   filter, and (when `cache` is set) the response cache.
pub fn site(
    root: impl Into<PathBuf>,
    counters: Arc<Counters>,
    cache: Option<Arc<FrequencyCache>>,
) -> Router {
    let metrics: Arc<dyn Metrics> = counters.clone();
    let files = FileServer::new(root);

    let mut router = Router::new();
    router.route("/healthz", StatusHandler::new(StatusCode::Ok));
    router.route("/debug/vars", VarsHandler::new(counters, cache.clone()));
    match cache {
        Some(cache) => {
            let cached = CachingMiddleware::new(files, cache, Arc::clone(&metrics));
            router.route(
                "/*",
                ObservationMiddleware::new(GetOnlyMiddleware::new(cached), metrics),
            );
        }
        None => router.route(
            "/*",
            ObservationMiddleware::new(GetOnlyMiddleware::new(files), metrics),
        ),
    }
    router
}
