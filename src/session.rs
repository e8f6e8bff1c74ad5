//! Crawl session orchestration.
//!
//! A session owns the whole multi-page loop: working-directory layout, page
//! arithmetic, the cooperative stop token, the terminal finish marker, and
//! the flatten-and-export step that fires on completion. One session instance
//! drives one run; `Stopped` and `Finished` are terminal, and a fresh run
//! over the same working directory resumes from whatever is persisted.

use crate::crawler::{MetricsFetcher, PageCrawler};
use crate::error::{HarvestError, Result};
use crate::flatten::{export_records, ExportSummary};
use crate::listing::{Credentials, ResultListing};
use crate::store::{FsRecordStore, RecordStore};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

/// Result rows per page
pub const DEFAULT_PAGE_SIZE: u64 = 50;

/// Session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Running,
    /// Stopped by the caller; persisted rows remain for resumption
    Stopped,
    /// All pages processed and the export written
    Finished,
}

/// How a run ended
#[derive(Debug)]
pub enum SessionOutcome {
    Finished(ExportSummary),
    Stopped,
}

/// Cooperative stop signal, settable from any thread.
///
/// Polled once per page; an in-flight page always completes, so page
/// boundaries are the checkpoint granularity. Relaxed ordering is enough for
/// an eventually-visible flag.
#[derive(Debug, Clone, Default)]
pub struct StopToken(Arc<AtomicBool>);

impl StopToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request the session stop before its next page
    pub fn stop(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Working-directory layout of one crawl.
#[derive(Debug, Clone)]
pub struct WorkDir {
    root: PathBuf,
}

impl WorkDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Download/staging area
    pub fn tmp(&self) -> PathBuf {
        self.root.join("tmp")
    }

    /// Per-row persisted records
    pub fn pickles(&self) -> PathBuf {
        self.tmp().join("pickles")
    }

    /// Terminal marker directory, present once a crawl ran to completion
    pub fn finish_marker(&self) -> PathBuf {
        self.root.join("finish")
    }

    /// Flattened export destination
    pub fn csv_export(&self) -> PathBuf {
        self.tmp().join("plumx.csv")
    }

    /// Duplicate-DOI diagnostic listing
    pub fn doi_listing(&self) -> PathBuf {
        self.tmp().join("doi_listing.tsv")
    }

    pub fn is_finished(&self) -> bool {
        self.finish_marker().exists()
    }

    pub fn ensure_layout(&self) -> Result<()> {
        std::fs::create_dir_all(self.pickles())?;
        Ok(())
    }

    fn mark_finished(&self) -> Result<()> {
        std::fs::create_dir_all(self.finish_marker())?;
        Ok(())
    }
}

/// Everything a crawl run needs from the caller
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub work_dir: PathBuf,
    pub query: String,
    pub credentials: Credentials,
    pub page_size: u64,
}

impl SessionConfig {
    pub fn new(work_dir: impl Into<PathBuf>, query: impl Into<String>) -> Self {
        Self {
            work_dir: work_dir.into(),
            query: query.into(),
            credentials: Credentials::default(),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

/// Total pages needed for a result count
pub fn total_pages(total_records: u64, page_size: u64) -> u64 {
    total_records.div_ceil(page_size)
}

/// Row count of one page: full pages everywhere, the remainder on the last
/// page, and a full last page when the total is an exact multiple.
pub fn rows_on_page(total_records: u64, page_size: u64, page_index: u64) -> u64 {
    let pages = total_pages(total_records, page_size);
    if page_index + 1 == pages {
        let rest = total_records % page_size;
        if rest == 0 {
            page_size
        } else {
            rest
        }
    } else {
        page_size
    }
}

/// Drives one crawl over a working directory.
pub struct CrawlSession<L, F, S> {
    config: SessionConfig,
    work: WorkDir,
    listing: L,
    crawler: PageCrawler<F, S>,
    stop: StopToken,
    state: SessionState,
}

impl<L, F, S> CrawlSession<L, F, S>
where
    L: ResultListing,
    F: MetricsFetcher,
    S: RecordStore,
{
    pub fn new(config: SessionConfig, listing: L, fetcher: F, store: S) -> Self {
        let work = WorkDir::new(config.work_dir.clone());
        let crawler = PageCrawler::new(fetcher, store, config.page_size);
        Self {
            config,
            work,
            listing,
            crawler,
            stop: StopToken::new(),
            state: SessionState::Idle,
        }
    }

    /// Handle for requesting a stop from another thread
    pub fn stop_token(&self) -> StopToken {
        self.stop.clone()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Run the crawl to completion, stop, or finish-marker short-circuit.
    ///
    /// # Errors
    ///
    /// Returns error when the session was already consumed, the page size is
    /// zero, the listing cannot be opened, or a persist/export write fails. Data-level trouble
    /// never surfaces here; rows with problems are logged and skipped.
    pub async fn run(&mut self) -> Result<SessionOutcome> {
        if self.state != SessionState::Idle {
            return Err(HarvestError::Config(
                "session already ran; start a new one".to_string(),
            ));
        }
        if self.config.page_size == 0 {
            return Err(HarvestError::Config(
                "page size must be at least 1".to_string(),
            ));
        }

        if self.work.is_finished() {
            info!(work = ?self.work.root(), "Finish marker present, exporting without crawling");
            let summary = self.resolve_data()?;
            self.state = SessionState::Finished;
            return Ok(SessionOutcome::Finished(summary));
        }

        self.work.ensure_layout()?;
        self.state = SessionState::Running;
        let started = chrono::Local::now();

        let total = self
            .listing
            .open(&self.config.query, &self.config.credentials)
            .await?;
        let page_size = self.config.page_size;
        let pages = total_pages(total, page_size);
        info!(total = total, pages = pages, "Crawl plan");

        for page_index in 0..pages {
            if self.stop.is_stopped() {
                warn!(page = page_index, "Stop requested, halting before next page");
                self.state = SessionState::Stopped;
                return Ok(SessionOutcome::Stopped);
            }

            let row_count = rows_on_page(total, page_size, page_index);
            let html = self.listing.page_html(page_index).await?;
            let cookies = self.listing.session_cookies();
            self.crawler
                .process_page(page_index, row_count, &html, &cookies, total)
                .await?;
        }

        self.work.mark_finished()?;
        let summary = self.resolve_data()?;
        self.state = SessionState::Finished;
        let elapsed = (chrono::Local::now() - started).num_seconds();
        info!(records = summary.records, elapsed_secs = elapsed, "Crawl finished");
        Ok(SessionOutcome::Finished(summary))
    }

    /// Flatten and export whatever is persisted right now, without crawling.
    /// Usable mid-run output, too: partial sets export fine.
    pub fn resolve_data(&self) -> Result<ExportSummary> {
        std::fs::create_dir_all(self.work.tmp())?;
        let records = self.crawler.store().load_all()?;
        export_records(&records, &self.work.csv_export(), &self.work.doi_listing())
    }
}

/// Flatten and export a working directory's persisted records without a
/// session (the manual "resolve data" entry point).
pub fn resolve_work_dir(work_dir: &Path) -> Result<ExportSummary> {
    let work = WorkDir::new(work_dir);
    std::fs::create_dir_all(work.tmp())?;
    let store = FsRecordStore::new(work.pickles())?;
    let records = store.load_all()?;
    export_records(&records, &work.csv_export(), &work.doi_listing())
}
