//! # sss
//!
//! A static site builder and server with an in-memory, frequency-evicting
//! response cache.
//!
//! The [`build`] step turns a tree of markdown pages into HTML. The server
//! answers requests from the built tree through a handler pipeline:
//! observation, a GET-only filter, the response cache, and the file server.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use sss::cache::FrequencyCache;
//! use sss::metrics::Counters;
//! use sss::server::Server;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let cache = Arc::new(FrequencyCache::new(10_000_000));
//!     let site = sss::router::site("target", Arc::new(Counters::new()), Some(cache));
//!
//!     let server = Server::bind("127.0.0.1:8080").await?;
//!     println!("Listening on http://127.0.0.1:8080");
//!     server.run(site).await?;
//!     Ok(())
//! }
//! ```

pub mod build;
pub mod cache;
pub mod files;
pub mod http;
pub mod metrics;
pub mod middleware;
pub mod router;
pub mod server;

// ── Convenience re-exports ────────────────────────────────────────────────────
pub use http::{Headers, Method, Request, Response, ResponseWriter, StatusCode};
pub use middleware::Handler;
pub use server::{Server, ServerError};
