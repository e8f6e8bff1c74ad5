//! plumharvest - Scopus/PlumX Altmetric Crawl & Flatten Pipeline
//!
//! Crawls a Scopus search's result pages, pulls each document's PlumX metric
//! breakdown, persists every completed row for crash-safe resumption, and
//! flattens the heterogeneous records into one rectangular CSV.
//!
//! ## Usage
//!
//! ```bash
//! plumharvest crawl --work-dir ./nature-2015 'TITLE-ABS-KEY(perovskite)'
//! plumharvest resolve --work-dir ./nature-2015
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use plumharvest::cookies::CookieManager;
use plumharvest::crawler::HttpFetcher;
use plumharvest::listing::{Credentials, HttpListing};
use plumharvest::session::{
    resolve_work_dir, CrawlSession, SessionConfig, SessionOutcome, WorkDir, DEFAULT_PAGE_SIZE,
};
use plumharvest::store::FsRecordStore;
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::{fmt, EnvFilter};

// ============================================================================
// CLI Definition
// ============================================================================

/// Scopus/PlumX Altmetric Crawl & Flatten Pipeline
#[derive(Parser)]
#[command(name = "plumharvest")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Crawl a search's result pages and export the flattened metrics
    Crawl {
        /// Scopus advanced search string
        query: String,

        /// Working directory for this crawl (records, markers, exports)
        #[arg(short, long, default_value = "./work")]
        work_dir: PathBuf,

        /// Scopus account username (login itself happens in the browser;
        /// passed through to the listing source)
        #[arg(long, default_value = "")]
        username: String,

        /// Scopus account password
        #[arg(long, default_value = "")]
        password: String,

        /// Result rows per page
        #[arg(long, default_value_t = DEFAULT_PAGE_SIZE, value_parser = clap::value_parser!(u64).range(1..))]
        page_size: u64,

        /// Proxy URL (e.g., http://127.0.0.1:7890)
        #[arg(long)]
        proxy: Option<String>,

        /// Cookie file path (default: ~/.plumharvest_cookies.json)
        #[arg(long)]
        cookie_file: Option<PathBuf>,
    },

    /// Flatten and export whatever is persisted, without crawling
    Resolve {
        /// Working directory of the crawl to export
        #[arg(short, long, default_value = "./work")]
        work_dir: PathBuf,
    },

    /// Manage session cookies
    Cookies {
        #[command(subcommand)]
        action: CookieAction,
    },
}

#[derive(Subcommand)]
enum CookieAction {
    /// Clear stored cookies
    Clear,
    /// Show cookie file path
    Path,
}

// ============================================================================
// Main Entry Point
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.debug { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level.to_string()));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .init();

    match cli.command {
        Commands::Crawl {
            query,
            work_dir,
            username,
            password,
            page_size,
            proxy,
            cookie_file,
        } => {
            run_crawl(
                query, work_dir, username, password, page_size, proxy, cookie_file,
            )
            .await
        }
        Commands::Resolve { work_dir } => run_resolve(work_dir),
        Commands::Cookies { action } => handle_cookies(action),
    }
}

// ============================================================================
// Crawl
// ============================================================================

async fn run_crawl(
    query: String,
    work_dir: PathBuf,
    username: String,
    password: String,
    page_size: u64,
    proxy: Option<String>,
    cookie_file: Option<PathBuf>,
) -> Result<()> {
    let started = chrono::Local::now();
    println!(
        "Crawl started {} into {}",
        started.format("%Y-%m-%d %H:%M:%S"),
        work_dir.display()
    );

    let cookie_manager = match cookie_file {
        Some(path) => CookieManager::with_path(path),
        None => CookieManager::new().context("Cannot locate cookie file")?,
    };
    let cookies = cookie_manager.load_as_map();
    if cookies.is_empty() {
        println!(
            "No cookies found at {:?}. Export your authenticated Scopus session \
             cookies there first (see 'plumharvest cookies path').",
            cookie_manager.path()
        );
    }

    let listing = HttpListing::new(cookies, page_size, proxy.as_deref())
        .context("Failed to build listing client")?;
    let fetcher = HttpFetcher::new(proxy.as_deref()).context("Failed to build HTTP client")?;
    let work = WorkDir::new(&work_dir);
    let store = FsRecordStore::new(work.pickles()).context("Failed to open record store")?;

    let mut config = SessionConfig::new(&work_dir, &query);
    config.page_size = page_size;
    config.credentials = Credentials { username, password };

    let mut session = CrawlSession::new(config, listing, fetcher, store);

    // Ctrl-C requests a cooperative stop: the in-flight page completes, then
    // the session halts with everything so far persisted.
    let stop = session.stop_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received, stopping after the current page");
            stop.stop();
        }
    });

    match session.run().await? {
        SessionOutcome::Finished(summary) => {
            println!(
                "Finished: {} records ({} distinct DOIs), {} columns -> {}",
                summary.records,
                summary.distinct_dois,
                summary.columns,
                summary.csv_path.display()
            );
        }
        SessionOutcome::Stopped => {
            println!("Stopped. Re-run the same command to resume where it left off.");
        }
    }

    let elapsed = (chrono::Local::now() - started).num_seconds();
    println!("Done in {}s", elapsed);
    Ok(())
}

// ============================================================================
// Resolve
// ============================================================================

fn run_resolve(work_dir: PathBuf) -> Result<()> {
    let summary = resolve_work_dir(&work_dir).context("Export failed")?;
    println!(
        "Exported {} records ({} distinct DOIs, {} columns) to {}",
        summary.records,
        summary.distinct_dois,
        summary.columns,
        summary.csv_path.display()
    );
    Ok(())
}

// ============================================================================
// Cookie Management
// ============================================================================

fn handle_cookies(action: CookieAction) -> Result<()> {
    let manager = CookieManager::new()?;

    match action {
        CookieAction::Clear => {
            manager.clear()?;
            println!("Cookies cleared.");
        }
        CookieAction::Path => {
            println!("Cookie file: {:?}", manager.path());
            println!();
            println!("To set up a session: sign in to https://www.scopus.com in your");
            println!("browser, export the cookies as JSON, and save them to that file.");
            println!("Format: [{{\"name\":\"...\",\"value\":\"...\",\"domain\":\".scopus.com\"}},...]");
        }
    }

    Ok(())
}
