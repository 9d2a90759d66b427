//! Request counters.
//!
//! Middleware records what happens through the increment-only [`Metrics`]
//! trait, injected at construction. [`Counters`] is the in-memory
//! implementation; its [`snapshot`](Counters::snapshot) is what the
//! `/debug/vars` endpoint ([`VarsHandler`]) serves.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use tracing::warn;

use crate::cache::FrequencyCache;
use crate::http::{BoxFuture, ResponseWriter};
use crate::middleware::Handler;
use crate::{Request, Response, StatusCode};

/// Write-only sink for request, response, and cache counters.
pub trait Metrics: Send + Sync {
    /// A request entered the pipeline.
    fn incr_requests(&self);

    /// A response status was finalized.
    fn incr_responses(&self);

    /// A response was finalized with `code`.
    fn incr_status(&self, code: u16);

    /// A page was served successfully (status below 400).
    fn incr_page(&self, path: &str);

    /// `path` was served from the cache.
    fn incr_hit(&self, path: &str);

    /// `path` was not cached and the origin answered successfully.
    fn incr_miss(&self, path: &str);
}

/// In-memory counters backing [`Metrics`].
///
/// # Examples
///
/// ```
/// use sss::metrics::{Counters, Metrics};
///
/// let counters = Counters::new();
/// counters.incr_requests();
/// counters.incr_hit("/index.html");
/// counters.incr_hit("/index.html");
///
/// let snap = counters.snapshot();
/// assert_eq!(snap.requests, 1);
/// assert_eq!(snap.cache_hits["/index.html"], 2);
/// ```
#[derive(Debug, Default)]
pub struct Counters {
    requests: AtomicU64,
    responses: AtomicU64,
    status_codes: Mutex<BTreeMap<u16, u64>>,
    pages: Mutex<BTreeMap<String, u64>>,
    hits: Mutex<BTreeMap<String, u64>>,
    misses: Mutex<BTreeMap<String, u64>>,
}

/// A copy of every counter at one point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CountersSnapshot {
    pub requests: u64,
    pub responses: u64,
    pub status_codes: BTreeMap<u16, u64>,
    pub pages: BTreeMap<String, u64>,
    pub cache_hits: BTreeMap<String, u64>,
    pub cache_misses: BTreeMap<String, u64>,
}

impl Counters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copies out the current values.
    pub fn snapshot(&self) -> CountersSnapshot {
        CountersSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            responses: self.responses.load(Ordering::Relaxed),
            status_codes: read(&self.status_codes),
            pages: read(&self.pages),
            cache_hits: read(&self.hits),
            cache_misses: read(&self.misses),
        }
    }
}

fn bump<K: Ord>(map: &Mutex<BTreeMap<K, u64>>, key: K) {
    let mut map = map.lock().unwrap_or_else(PoisonError::into_inner);
    *map.entry(key).or_insert(0) += 1;
}

fn read<K: Ord + Clone>(map: &Mutex<BTreeMap<K, u64>>) -> BTreeMap<K, u64> {
    map.lock().unwrap_or_else(PoisonError::into_inner).clone()
}

impl Metrics for Counters {
    fn incr_requests(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    fn incr_responses(&self) {
        self.responses.fetch_add(1, Ordering::Relaxed);
    }

    fn incr_status(&self, code: u16) {
        bump(&self.status_codes, code);
    }

    fn incr_page(&self, path: &str) {
        bump(&self.pages, path.to_owned());
    }

    fn incr_hit(&self, path: &str) {
        bump(&self.hits, path.to_owned());
    }

    fn incr_miss(&self, path: &str) {
        bump(&self.misses, path.to_owned());
    }
}

/// Body of the `/debug/vars` endpoint.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Vars {
    #[serde(flatten)]
    counters: CountersSnapshot,
    #[serde(skip_serializing_if = "Option::is_none")]
    cache_size_items: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    cache_size_bytes_cur: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    cache_size_bytes_max: Option<usize>,
}

/// Serves every counter, plus the cache gauges when caching is enabled, as JSON.
pub struct VarsHandler {
    counters: Arc<Counters>,
    cache: Option<Arc<FrequencyCache>>,
}

impl VarsHandler {
    pub fn new(counters: Arc<Counters>, cache: Option<Arc<FrequencyCache>>) -> Self {
        Self { counters, cache }
    }

    fn vars(&self) -> Vars {
        let stats = self.cache.as_ref().map(|cache| cache.stats());
        Vars {
            counters: self.counters.snapshot(),
            cache_size_items: stats.map(|s| s.entries),
            cache_size_bytes_cur: stats.map(|s| s.size),
            cache_size_bytes_max: stats.map(|s| s.max_size),
        }
    }
}

impl Handler for VarsHandler {
    fn serve<'a>(&'a self, req: &'a Request, w: &'a mut dyn ResponseWriter) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let response = match serde_json::to_vec_pretty(&self.vars()) {
                Ok(body) => Response::new(StatusCode::Ok)
                    .header("Content-Type", "application/json; charset=utf-8")
                    .body_bytes(body),
                Err(e) => {
                    warn!(error = %e, "failed to encode counters");
                    Response::new(StatusCode::InternalServerError)
                }
            };
            if let Err(e) = response.send(w).await {
                warn!(path = %req.path(), error = %e, "failed to write vars");
            }
        })
    }
}
