use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{ArgAction, Parser};
use tracing::info;
use tracing_subscriber::EnvFilter;

use sss::build::{self, PostTemplate};
use sss::cache::FrequencyCache;
use sss::metrics::Counters;
use sss::server::Server;

/// Build a markdown site and serve it with an in-memory response cache.
#[derive(Debug, Parser)]
#[command(name = "sss", version, about)]
struct Cli {
    /// Port on which to serve
    #[arg(long, default_value_t = 8080)]
    port: u16,

    /// Source directory to build
    #[arg(long, default_value = "pages")]
    src_dir: PathBuf,

    /// Build output directory, and the directory that is served
    #[arg(long, default_value = "target")]
    dst_dir: PathBuf,

    /// Path to the post template
    #[arg(long, default_value = "templates/post-template.html")]
    post_tmpl: PathBuf,

    /// Whether to build the site
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    build: bool,

    /// Whether to start the server
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    serve: bool,

    /// Response cache capacity in bytes
    #[arg(long, default_value_t = 10_000_000)]
    cache_size: usize,

    /// Whether to cache responses in memory
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    enable_caching: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match run(Cli::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    if cli.build {
        build_site(&cli)?;
    }
    if cli.serve {
        serve_site(&cli).await?;
    }
    Ok(())
}

fn build_site(cli: &Cli) -> anyhow::Result<()> {
    info!(
        src = %cli.src_dir.display(),
        dst = %cli.dst_dir.display(),
        template = %cli.post_tmpl.display(),
        "building site"
    );
    let tmpl = PostTemplate::from_file(&cli.post_tmpl)
        .with_context(|| format!("can't load template {}", cli.post_tmpl.display()))?;
    build::build_tree(&cli.dst_dir, &cli.src_dir, &tmpl).context("build failed")
}

async fn serve_site(cli: &Cli) -> anyhow::Result<()> {
    let cache = cli
        .enable_caching
        .then(|| Arc::new(FrequencyCache::new(cli.cache_size)));
    let site = sss::router::site(&cli.dst_dir, Arc::new(Counters::new()), cache);

    let server = Server::bind(format!("0.0.0.0:{}", cli.port)).await?;
    info!(
        root = %cli.dst_dir.display(),
        caching = cli.enable_caching,
        cache_size = cli.cache_size,
        "serving at http://localhost:{}",
        server.local_addr().port()
    );

    tokio::select! {
        result = server.run(site) => result?,
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for shutdown signal")?;
            info!("shutting down");
        }
    }
    Ok(())
}
