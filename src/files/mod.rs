//! Static file serving from a directory tree.
//!
//! [`FileServer`] maps request paths onto a root directory. Directories are
//! served through their `index.html`, and the canonical URL of a directory
//! always ends in `/`: requests for `/dir` and `/dir/index.html` are both
//! redirected to `/dir/`.

use std::io;
use std::path::{Path, PathBuf};

use percent_encoding::percent_decode_str;
use tokio::fs::{self, File};
use tokio::io::AsyncReadExt;
use tracing::{debug, warn};

use crate::http::{BoxFuture, ResponseWriter};
use crate::middleware::Handler;
use crate::{Request, Response, StatusCode};

/// Bytes read from disk per body write.
const CHUNK_SIZE: usize = 32 * 1024;

const INDEX: &str = "index.html";

/// Serves files below a root directory.
///
/// Bodies are streamed in [`CHUNK_SIZE`] pieces with `Content-Length` taken
/// from the file metadata and `Content-Type` guessed from the extension.
///
/// # Examples
///
/// ```rust,no_run
/// use sss::files::FileServer;
/// use sss::server::Server;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let server = Server::bind("127.0.0.1:8080").await?;
///     server.run(FileServer::new("target")).await?;
///     Ok(())
/// }
/// ```
#[derive(Debug, Clone)]
pub struct FileServer {
    root: PathBuf,
}

// Outcome of mapping a request path onto the tree.
enum Lookup {
    Serve(PathBuf),
    Redirect(String),
}

impl FileServer {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The directory files are served from.
    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn lookup(&self, raw: &str) -> io::Result<Lookup> {
        if let Some(dir) = raw.strip_suffix(INDEX).filter(|dir| dir.ends_with('/')) {
            return Ok(Lookup::Redirect(dir.to_owned()));
        }

        let full = self.root.join(relative_path(raw)?);
        let meta = fs::metadata(&full).await?;
        if meta.is_dir() {
            if !raw.ends_with('/') {
                return Ok(Lookup::Redirect(format!("{raw}/")));
            }
            let index = full.join(INDEX);
            if !fs::metadata(&index).await?.is_file() {
                return Err(io::ErrorKind::NotFound.into());
            }
            return Ok(Lookup::Serve(index));
        }
        if raw.ends_with('/') {
            return Ok(Lookup::Redirect(raw.trim_end_matches('/').to_owned()));
        }
        Ok(Lookup::Serve(full))
    }

    async fn respond(&self, req: &Request, w: &mut dyn ResponseWriter) -> io::Result<()> {
        let path = match self.lookup(req.path()).await {
            Ok(Lookup::Serve(path)) => path,
            Ok(Lookup::Redirect(location)) => return redirect(req, location, w).await,
            Err(e) => return lookup_failed(e, w).await,
        };
        let file = match File::open(&path).await {
            Ok(file) => file,
            Err(e) => return lookup_failed(e, w).await,
        };
        stream(file, &path, w).await
    }
}

impl Handler for FileServer {
    fn serve<'a>(&'a self, req: &'a Request, w: &'a mut dyn ResponseWriter) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            if let Err(e) = self.respond(req, w).await {
                warn!(path = %req.path(), error = %e, "failed to serve file");
            }
        })
    }
}

/// Decodes a URL path into a path relative to the root.
///
/// Any `..` segment makes the path unreachable.
fn relative_path(raw: &str) -> io::Result<PathBuf> {
    let decoded = percent_decode_str(raw)
        .decode_utf8()
        .map_err(|_| io::Error::from(io::ErrorKind::NotFound))?;
    let mut rel = PathBuf::new();
    for segment in decoded.split('/') {
        match segment {
            ".." => return Err(io::ErrorKind::NotFound.into()),
            "" | "." => {}
            s if s.contains('\0') => return Err(io::ErrorKind::NotFound.into()),
            s => rel.push(s),
        }
    }
    Ok(rel)
}

async fn stream(mut file: File, path: &Path, w: &mut dyn ResponseWriter) -> io::Result<()> {
    let len = file.metadata().await?.len();
    let content_type = mime_guess::from_path(path).first_or_octet_stream();
    w.headers_mut().set("Content-Type", content_type.to_string());
    w.headers_mut().set("Content-Length", len.to_string());
    w.write_header(StatusCode::Ok).await?;

    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        w.write(&buf[..n]).await?;
    }
}

async fn redirect(req: &Request, mut location: String, w: &mut dyn ResponseWriter) -> io::Result<()> {
    if let Some(query) = req.query_string() {
        location.push('?');
        location.push_str(query);
    }
    debug!(from = %req.path(), to = %location, "redirecting");
    Response::new(StatusCode::MovedPermanently)
        .header("Location", location)
        .send(w)
        .await
}

async fn lookup_failed(err: io::Error, w: &mut dyn ResponseWriter) -> io::Result<()> {
    let (status, body) = match err.kind() {
        io::ErrorKind::NotFound | io::ErrorKind::NotADirectory => {
            (StatusCode::NotFound, "404 page not found")
        }
        io::ErrorKind::PermissionDenied => (StatusCode::Forbidden, "403 Forbidden"),
        _ => {
            warn!(error = %err, "file lookup failed");
            (StatusCode::InternalServerError, "500 Internal Server Error")
        }
    };
    Response::new(status)
        .header("Content-Type", "text/plain; charset=utf-8")
        .body(body)
        .send(w)
        .await
}
