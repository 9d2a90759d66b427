//! Site build step: markdown pages to HTML, everything else copied.
//!
//! [`build_tree`] mirrors a source directory into a destination directory.
//! Files whose name ends in `md` become `.html` pages: their first line holds
//! the title as `=== Title ===`, the rest is CommonMark rendered into the
//! [`PostTemplate`]. Every other file is copied byte for byte.

use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use pulldown_cmark::{CowStr, Event, Options, Parser, Tag, TagEnd, html};
use regex::Regex;
use serde::Serialize;
use tera::{Context, Tera};
use thiserror::Error;
use tracing::{debug, info};
use walkdir::WalkDir;

/// Errors produced while building the site.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("title is missing")]
    MissingTitle,

    #[error("template error: {0}")]
    Template(#[from] tera::Error),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to walk source tree: {0}")]
    Walk(#[from] walkdir::Error),

    #[error("error building file {path}: {source}")]
    File {
        path: PathBuf,
        #[source]
        source: Box<BuildError>,
    },
}

impl BuildError {
    fn io(path: &Path, source: io::Error) -> Self {
        BuildError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

static TITLE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^=== ([^=]+) ===$").expect("title pattern compiles"));

/// Variables available to the post template.
#[derive(Debug, Clone, Serialize)]
pub struct Page {
    pub title: String,
    pub content: String,
}

/// The HTML template every markdown page is rendered into.
///
/// The template sees `title` and `content`. Output is not HTML-escaped:
/// `content` is already HTML.
///
/// # Examples
///
/// ```
/// use sss::build::{Page, PostTemplate};
///
/// let tmpl = PostTemplate::from_source("post", "<title>{{ title }}</title>{{ content }}")?;
/// let page = Page { title: "hi".into(), content: "<p>x</p>".into() };
/// assert_eq!(tmpl.render(&page)?, "<title>hi</title><p>x</p>");
/// # Ok::<(), sss::build::BuildError>(())
/// ```
pub struct PostTemplate {
    tera: Tera,
    name: String,
}

impl PostTemplate {
    /// Compiles a template from source text.
    pub fn from_source(name: &str, source: &str) -> Result<Self, BuildError> {
        let mut tera = Tera::default();
        tera.autoescape_on(vec![]);
        tera.add_raw_template(name, source)?;
        Ok(Self {
            tera,
            name: name.to_owned(),
        })
    }

    /// Loads and compiles the template at `path`, named after its file name.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, BuildError> {
        let path = path.as_ref();
        let source = fs::read_to_string(path).map_err(|e| BuildError::io(path, e))?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "post".to_owned());
        Self::from_source(&name, &source)
    }

    pub fn render(&self, page: &Page) -> Result<String, BuildError> {
        let context = Context::from_serialize(page)?;
        Ok(self.tera.render(&self.name, &context)?)
    }
}

/// Splits a markdown source into its title and body.
fn split_title(source: &str) -> Result<(&str, &str), BuildError> {
    let (line, body) = source.split_once('\n').unwrap_or((source, ""));
    let line = line.strip_suffix('\r').unwrap_or(line);
    let title = TITLE
        .captures(line)
        .and_then(|caps| caps.get(1))
        .ok_or(BuildError::MissingTitle)?;
    Ok((title.as_str(), body))
}

/// Renders CommonMark to HTML with tables, strikethrough, footnotes, heading
/// attributes, and an `id` on every heading.
///
/// Headings without an explicit `{#id}` get one derived from their text:
/// lowercased letters and digits, other runs collapsed to `-`. Repeated ids
/// get `-1`, `-2`, ... appended.
///
/// ```
/// let html = sss::build::render_markdown("# Hello, World!\n## Hello, World!\n");
/// assert!(html.contains(r#"<h1 id="hello-world">"#));
/// assert!(html.contains(r#"<h2 id="hello-world-1">"#));
/// ```
pub fn render_markdown(markdown: &str) -> String {
    let mut options = Options::empty();
    options.insert(Options::ENABLE_TABLES);
    options.insert(Options::ENABLE_STRIKETHROUGH);
    options.insert(Options::ENABLE_FOOTNOTES);
    options.insert(Options::ENABLE_HEADING_ATTRIBUTES);

    let mut events: Vec<Event<'_>> = Parser::new_ext(markdown, options).collect();
    let mut used = HashSet::new();

    for i in 0..events.len() {
        let Event::Start(Tag::Heading { id, .. }) = &events[i] else {
            continue;
        };
        if let Some(explicit) = id {
            used.insert(explicit.to_string());
            continue;
        }
        let slug = slugify(&heading_text(&events[i + 1..]));
        if slug.is_empty() {
            continue;
        }
        let unique = unique_id(slug, &mut used);
        if let Event::Start(Tag::Heading { id, .. }) = &mut events[i] {
            *id = Some(CowStr::from(unique));
        }
    }

    let mut out = String::with_capacity(markdown.len() * 3 / 2);
    html::push_html(&mut out, events.into_iter());
    out
}

// Text of the heading whose contents start at `events[0]`.
fn heading_text(events: &[Event<'_>]) -> String {
    let mut text = String::new();
    for event in events {
        match event {
            Event::End(TagEnd::Heading(_)) => break,
            Event::Text(t) | Event::Code(t) => text.push_str(t),
            _ => {}
        }
    }
    text
}

fn slugify(text: &str) -> String {
    let mut slug = String::with_capacity(text.len());
    let mut gap = false;
    for c in text.chars() {
        if c.is_alphanumeric() {
            if gap && !slug.is_empty() {
                slug.push('-');
            }
            gap = false;
            slug.extend(c.to_lowercase());
        } else {
            gap = true;
        }
    }
    slug
}

fn unique_id(slug: String, used: &mut HashSet<String>) -> String {
    if used.insert(slug.clone()) {
        return slug;
    }
    let mut n = 1;
    loop {
        let candidate = format!("{slug}-{n}");
        if used.insert(candidate.clone()) {
            return candidate;
        }
        n += 1;
    }
}

/// Renders a markdown page (title line plus body) into `tmpl`.
pub fn build_markdown(source: &str, tmpl: &PostTemplate) -> Result<String, BuildError> {
    let (title, body) = split_title(source)?;
    tmpl.render(&Page {
        title: title.to_owned(),
        content: render_markdown(body),
    })
}

fn is_markdown(path: &Path) -> bool {
    path.to_string_lossy().ends_with("md")
}

/// Builds one file from `src` into `dst`.
///
/// Markdown is rendered through `tmpl`; anything else is copied unchanged.
pub fn build_file(src: &Path, dst: &Path, tmpl: &PostTemplate) -> Result<(), BuildError> {
    info!(path = %src.display(), "building file");
    if is_markdown(src) {
        let source = fs::read_to_string(src).map_err(|e| BuildError::io(src, e))?;
        let page = build_markdown(&source, tmpl)?;
        fs::write(dst, page).map_err(|e| BuildError::io(dst, e))
    } else {
        fs::copy(src, dst)
            .map(|_| ())
            .map_err(|e| BuildError::io(src, e))
    }
}

/// Output path for `file` (below `src_root`) under `dst_root`.
///
/// Markdown files take an `.html` extension. Parent directories are created.
pub fn destination(src_root: &Path, dst_root: &Path, file: &Path) -> Result<PathBuf, BuildError> {
    let rel = file.strip_prefix(src_root).map_err(|_| {
        BuildError::io(
            file,
            io::Error::new(io::ErrorKind::InvalidInput, "file is outside the source tree"),
        )
    })?;
    let mut out = dst_root.join(rel);
    if is_markdown(rel) {
        out.set_extension("html");
    }
    if let Some(parent) = out.parent() {
        fs::create_dir_all(parent).map_err(|e| BuildError::io(parent, e))?;
    }
    Ok(out)
}

/// Builds every regular file below `src` into `dst`.
///
/// Stops at the first failure; the error names the offending file.
pub fn build_tree(dst: &Path, src: &Path, tmpl: &PostTemplate) -> Result<(), BuildError> {
    let mut built = 0usize;
    for entry in WalkDir::new(src) {
        let entry = entry?;
        if entry.file_type().is_dir() {
            continue;
        }
        let file = entry.path();
        let out = destination(src, dst, file)?;
        debug!(src = %file.display(), dst = %out.display(), "mapped");
        build_file(file, &out, tmpl).map_err(|e| BuildError::File {
            path: file.to_path_buf(),
            source: Box::new(e),
        })?;
        built += 1;
    }
    info!(files = built, dst = %dst.display(), "site built");
    Ok(())
}
