//! Per-page crawling: row resolution, chained metric lookups, durable persists.
//!
//! One page at a time, strictly row by row. Each row resolves to an eid, the
//! eid resolves to a PlumX artifact id through the documents facade, and the
//! artifact payload parses into a [`MetricRecord`] that is written to the
//! store before the crawler moves on. Rows whose sequence number is already
//! persisted are skipped without any network traffic, which is what makes
//! interrupted runs cheap to resume.

use crate::cookies::build_cookie_header;
use crate::error::{HarvestError, Result};
use crate::listing::parse_result_rows;
use crate::metrics::{parse_metric_payload, MetricRecord};
use crate::store::RecordStore;
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Documents facade endpoint, keyed by eid
const DOCUMENTS_FACADE_URL: &str = "https://api.scopus.com/documentsfacade/documents";

/// PlumX artifact endpoint, keyed by artifact id
const PLUMX_ARTIFACT_URL: &str = "https://plu.mx/api/v1/artifact/id";

/// User agent string for requests
const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36";

/// Fixed pause between retries of a failed request
const RETRY_BACKOFF: Duration = Duration::from_secs(1);

/// Authenticated text fetch, the crawler's only network seam.
#[async_trait]
pub trait MetricsFetcher {
    /// Fetch a URL with session cookies and return the response body
    async fn fetch_text(&self, url: &str, cookies: &HashMap<String, String>) -> Result<String>;
}

/// Reqwest-backed fetcher that retries indefinitely.
///
/// The remote side is treated as eventually available: transport failures
/// (timeouts, connection resets) are retried forever with a fixed short
/// backoff. A response that arrives but does not parse is the caller's
/// problem, not a network failure.
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    /// Build a fetcher with an optional proxy
    pub fn new(proxy: Option<&str>) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(5));

        if let Some(proxy_url) = proxy {
            let proxy = reqwest::Proxy::all(proxy_url).map_err(|e| {
                HarvestError::Config(format!("Invalid proxy URL '{}': {}", proxy_url, e))
            })?;
            builder = builder.proxy(proxy);
        }

        let client = builder
            .build()
            .map_err(|e| HarvestError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self { client })
    }
}

#[async_trait]
impl MetricsFetcher for HttpFetcher {
    async fn fetch_text(&self, url: &str, cookies: &HashMap<String, String>) -> Result<String> {
        let cookie_header = build_cookie_header(cookies);

        loop {
            let mut request = self
                .client
                .get(url)
                .header("Accept", "application/json, text/html;q=0.9, */*;q=0.8");
            if !cookie_header.is_empty() {
                request = request.header("Cookie", &cookie_header);
            }

            match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    match response.text().await {
                        Ok(body) => {
                            if !status.is_success() {
                                warn!(url = url, status = %status, "Non-success response");
                            }
                            debug!(url = url, "Request succeeded");
                            return Ok(body);
                        }
                        Err(e) => {
                            warn!(url = url, error = %e, "Failed reading body, retrying");
                        }
                    }
                }
                Err(e) => {
                    warn!(url = url, error = %e, "Request failed, retrying");
                }
            }

            tokio::time::sleep(RETRY_BACKOFF).await;
        }
    }
}

// === Documents facade response types ===

#[derive(Debug, Deserialize)]
struct FacadePayload {
    #[serde(rename = "plumXMetrics")]
    plumx_metrics: Option<FacadePlumxLink>,
}

#[derive(Debug, Deserialize)]
struct FacadePlumxLink {
    #[serde(default)]
    link: String,
}

/// Last path segment of the facade's PlumX link is the artifact id
fn artifact_id_from_link(link: &str) -> Option<&str> {
    link.rsplit('/').next().filter(|id| !id.is_empty())
}

/// Crawls the rows of one result page.
pub struct PageCrawler<F, S> {
    fetcher: F,
    store: S,
    page_size: u64,
}

impl<F: MetricsFetcher, S: RecordStore> PageCrawler<F, S> {
    pub fn new(fetcher: F, store: S, page_size: u64) -> Self {
        Self {
            fetcher,
            store,
            page_size,
        }
    }

    /// The underlying record store
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Process one result page: resolve rows, fetch and parse their metric
    /// payloads, persist each completed row under its global sequence number.
    ///
    /// Row-level problems (missing slot, malformed payload, missing DOI) are
    /// logged and skipped; they never abort the page. Already-persisted rows
    /// are skipped without fetching.
    ///
    /// # Errors
    ///
    /// Returns error only for page-level failures: unparseable page HTML or a
    /// store write that fails.
    pub async fn process_page(
        &self,
        page_index: u64,
        row_count: u64,
        html: &str,
        cookies: &HashMap<String, String>,
        total_records: u64,
    ) -> Result<Vec<MetricRecord>> {
        let rows = parse_result_rows(html, row_count)?;
        let mut completed = Vec::new();

        for row in rows {
            let sequence = page_index * self.page_size + row.index;

            if self.store.contains(sequence) {
                debug!(sequence = sequence, "Row already persisted, skipping");
                continue;
            }

            let facade_url = format!("{}/{}/metrics", DOCUMENTS_FACADE_URL, row.eid);
            let facade_raw = match self.fetcher.fetch_text(&facade_url, cookies).await {
                Ok(body) => body,
                Err(e) => {
                    error!(sequence = sequence, error = %e, "Facade lookup failed, skipping row");
                    continue;
                }
            };

            let artifact_id = match parse_facade_payload(&facade_raw) {
                Ok(id) => id,
                Err(e) => {
                    error!(
                        sequence = sequence,
                        payload = %facade_raw,
                        error = %e,
                        "Bad facade payload, skipping row"
                    );
                    continue;
                }
            };

            let artifact_url = format!("{}/{}", PLUMX_ARTIFACT_URL, artifact_id);
            let artifact_raw = match self.fetcher.fetch_text(&artifact_url, cookies).await {
                Ok(body) => body,
                Err(e) => {
                    error!(sequence = sequence, error = %e, "Artifact lookup failed, skipping row");
                    continue;
                }
            };

            let mut record = match parse_metric_payload(&artifact_raw) {
                Ok(Some(record)) => record,
                Ok(None) => {
                    // No metric data for this document. Persist a placeholder
                    // so the row counts as done on resume; the flatten pass
                    // drops DOI-less records.
                    info!(sequence = sequence, title = %row.title, "No metric data");
                    let placeholder = MetricRecord::new("", row.title.clone());
                    self.store.put(sequence, &placeholder)?;
                    continue;
                }
                Err(e) => {
                    error!(
                        sequence = sequence,
                        payload = %artifact_raw,
                        error = %e,
                        "Bad artifact payload, skipping row"
                    );
                    continue;
                }
            };

            record.paper_title = row.title;
            self.store.put(sequence, &record)?;

            let percent = ((sequence + 1) * 100).div_ceil(total_records.max(1));
            info!(
                page = page_index + 1,
                sequence = sequence,
                doi = %record.doi,
                percent = percent,
                "Row complete"
            );

            completed.push(record);
        }

        Ok(completed)
    }
}

fn parse_facade_payload(raw: &str) -> Result<String> {
    let payload: FacadePayload = serde_json::from_str(raw)?;
    payload
        .plumx_metrics
        .as_ref()
        .and_then(|m| artifact_id_from_link(&m.link))
        .map(str::to_string)
        .ok_or_else(|| HarvestError::Parse("no plumXMetrics link in facade payload".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryRecordStore;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Canned-response fetcher that counts every call
    struct MockFetcher {
        responses: HashMap<String, String>,
        calls: Arc<AtomicUsize>,
    }

    impl MockFetcher {
        fn new(responses: HashMap<String, String>) -> Self {
            Self {
                responses,
                calls: Arc::new(AtomicUsize::new(0)),
            }
        }

        fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl MetricsFetcher for MockFetcher {
        async fn fetch_text(
            &self,
            url: &str,
            _cookies: &HashMap<String, String>,
        ) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.responses
                .get(url)
                .cloned()
                .ok_or_else(|| HarvestError::Parse(format!("unexpected url: {}", url)))
        }
    }

    fn row_html(index: u64, title: &str, eid: &str) -> String {
        format!(
            r#"<tr id="resultDataRow{}"><td data-type="docTitle"><a href="/record/display.uri?eid={}&origin=resultslist">{}</a></td></tr>"#,
            index, eid, title
        )
    }

    fn facade_url(eid: &str) -> String {
        format!("{}/{}/metrics", DOCUMENTS_FACADE_URL, eid)
    }

    fn artifact_url(id: &str) -> String {
        format!("{}/{}", PLUMX_ARTIFACT_URL, id)
    }

    fn facade_body(artifact_id: &str) -> String {
        format!(
            r#"{{"plumXMetrics": {{"link": "https://plu.mx/plum/a/{}"}}}}"#,
            artifact_id
        )
    }

    fn artifact_body(doi: &str) -> String {
        format!(
            r#"{{
                "identifier": {{"doi": [{{"value": "{}"}}]}},
                "sort_count": {{
                    "usage": {{
                        "total": 10,
                        "count_types": [{{
                            "name": "ABSTRACT_VIEWS",
                            "total": 10,
                            "sources": [{{"name": "EBSCO", "total": 10}}]
                        }}]
                    }}
                }}
            }}"#,
            doi
        )
    }

    fn page_fixture() -> (String, HashMap<String, String>) {
        let html = format!(
            "<html><body><table>{}{}</table></body></html>",
            row_html(0, "Paper A", "eid-a"),
            row_html(1, "Paper B", "eid-b"),
        );

        let mut responses = HashMap::new();
        responses.insert(facade_url("eid-a"), facade_body("art-a"));
        responses.insert(facade_url("eid-b"), facade_body("art-b"));
        responses.insert(artifact_url("art-a"), artifact_body("10.1/a"));
        responses.insert(artifact_url("art-b"), artifact_body("10.1/b"));

        (html, responses)
    }

    #[tokio::test]
    async fn test_process_page_persists_rows_with_titles() -> Result<()> {
        let (html, responses) = page_fixture();
        let crawler = PageCrawler::new(MockFetcher::new(responses), MemoryRecordStore::new(), 50);

        let records = crawler
            .process_page(0, 2, &html, &HashMap::new(), 2)
            .await?;

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].paper_title, "Paper A");
        assert_eq!(records[0].doi, "10.1/a");
        assert!(crawler.store().contains(0));
        assert!(crawler.store().contains(1));
        Ok(())
    }

    #[tokio::test]
    async fn test_sequence_numbers_span_pages() -> Result<()> {
        let (html, responses) = page_fixture();
        let crawler = PageCrawler::new(MockFetcher::new(responses), MemoryRecordStore::new(), 50);

        // Page index 2 with page size 50 starts at sequence 100.
        crawler.process_page(2, 2, &html, &HashMap::new(), 125).await?;
        assert!(crawler.store().contains(100));
        assert!(crawler.store().contains(101));
        assert!(!crawler.store().contains(0));
        Ok(())
    }

    #[tokio::test]
    async fn test_rerun_over_persisted_page_makes_no_fetches() -> Result<()> {
        let (html, responses) = page_fixture();
        let crawler = PageCrawler::new(MockFetcher::new(responses), MemoryRecordStore::new(), 50);

        crawler.process_page(0, 2, &html, &HashMap::new(), 2).await?;
        let fetches_after_first = crawler.fetcher.call_count();
        assert_eq!(fetches_after_first, 4); // facade + artifact per row

        let rerun = crawler.process_page(0, 2, &html, &HashMap::new(), 2).await?;
        assert!(rerun.is_empty());
        assert_eq!(crawler.fetcher.call_count(), fetches_after_first);
        assert_eq!(crawler.store().len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_bad_artifact_payload_skips_only_that_row() -> Result<()> {
        let (html, mut responses) = page_fixture();
        responses.insert(artifact_url("art-a"), "{not valid json".to_string());
        let crawler = PageCrawler::new(MockFetcher::new(responses), MemoryRecordStore::new(), 50);

        let records = crawler
            .process_page(0, 2, &html, &HashMap::new(), 2)
            .await?;

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].doi, "10.1/b");
        assert!(!crawler.store().contains(0));
        assert!(crawler.store().contains(1));
        Ok(())
    }

    #[tokio::test]
    async fn test_no_data_payload_persists_placeholder() -> Result<()> {
        let (html, mut responses) = page_fixture();
        responses.insert(artifact_url("art-a"), r#"{"identifier": {}}"#.to_string());
        let crawler = PageCrawler::new(MockFetcher::new(responses), MemoryRecordStore::new(), 50);

        let records = crawler
            .process_page(0, 2, &html, &HashMap::new(), 2)
            .await?;

        // The no-data row is marked done but not returned as a record.
        assert_eq!(records.len(), 1);
        assert!(crawler.store().contains(0));
        assert!(crawler.store().contains(1));

        // And the rerun does not refetch it.
        let fetches = crawler.fetcher.call_count();
        crawler.process_page(0, 2, &html, &HashMap::new(), 2).await?;
        assert_eq!(crawler.fetcher.call_count(), fetches);
        Ok(())
    }

    #[test]
    fn test_artifact_id_from_link() {
        assert_eq!(
            artifact_id_from_link("https://plu.mx/plum/a/artifact-123"),
            Some("artifact-123")
        );
        assert_eq!(artifact_id_from_link("trailing/"), None);
        assert_eq!(artifact_id_from_link(""), None);
    }
}
