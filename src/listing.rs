//! Scopus result-listing boundary.
//!
//! The crawl engine consumes result pages through the [`ResultListing`] trait:
//! something that announces a total hit count and serves one page of result
//! HTML at a time with an authenticated cookie session. [`HttpListing`] is the
//! plain-HTTP implementation; sign-in itself happens in a browser the user
//! drives once, and the exported cookies carry the session (see
//! [`crate::cookies`]).
//!
//! Row extraction also lives here: each result row renders as
//! `tr#resultDataRow{i}` with the document title link under
//! `td[data-type="docTitle"]`, and the link's `eid` query parameter is the
//! external reference id for the metrics lookup.

use crate::crawler::{HttpFetcher, MetricsFetcher};
use crate::error::{HarvestError, OptionExt, Result};
use async_trait::async_trait;
use regex::Regex;
use scraper::{Html, Selector};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

/// Default Scopus base URL
pub const DEFAULT_SCOPUS_URL: &str = "https://www.scopus.com";

/// Sign-in credentials, owned by the caller and handed to the listing
/// collaborator (which may or may not need them; the HTTP implementation
/// authenticates via exported cookies instead).
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// One result row located on a page
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultRow {
    /// Row index within its page
    pub index: u64,
    /// Display title of the document
    pub title: String,
    /// External reference id from the row's detail link
    pub eid: String,
}

/// A paged, authenticated source of search result rows.
#[async_trait]
pub trait ResultListing {
    /// Open the listing for a query and return the announced total hit count
    async fn open(&mut self, query: &str, credentials: &Credentials) -> Result<u64>;

    /// Fetch the HTML snapshot of one result page (zero-based index)
    async fn page_html(&mut self, page_index: u64) -> Result<String>;

    /// Cookies of the authenticated session, sent with dependent lookups
    fn session_cookies(&self) -> HashMap<String, String>;
}

/// Locate up to `row_count` result rows in a page snapshot.
///
/// A missing slot is logged and skipped; pages sometimes render fewer rows
/// than announced and that must not abort the page.
pub fn parse_result_rows(html: &str, row_count: u64) -> Result<Vec<ResultRow>> {
    let document = Html::parse_document(html);
    let title_cell_selector = Selector::parse(r#"td[data-type="docTitle"] a"#)
        .map_err(|e| HarvestError::Parse(e.to_string()))?;

    let mut rows = Vec::new();

    for index in 0..row_count {
        let row_selector = Selector::parse(&format!("tr#resultDataRow{}", index))
            .map_err(|e| HarvestError::Parse(e.to_string()))?;

        let Some(row) = document.select(&row_selector).next() else {
            warn!(index = index, "Result row missing from page, skipping");
            continue;
        };

        let Some(link) = row.select(&title_cell_selector).next() else {
            warn!(index = index, "Result row has no title link, skipping");
            continue;
        };

        let title = link.text().collect::<String>().trim().to_string();
        let href = link.value().attr("href").unwrap_or("");

        match extract_eid(href) {
            Some(eid) => rows.push(ResultRow { index, title, eid }),
            None => {
                warn!(index = index, href = href, "No eid in detail link, skipping");
            }
        }
    }

    Ok(rows)
}

/// Pull the `eid` query parameter out of a row's detail link.
///
/// Links come back relative (`/record/display.uri?eid=...`), so resolve
/// against the Scopus base before reading the query string.
pub fn extract_eid(href: &str) -> Option<String> {
    let base = Url::parse(DEFAULT_SCOPUS_URL).ok()?;
    let url = base.join(href).ok()?;
    url.query_pairs()
        .find(|(name, _)| name == "eid")
        .map(|(_, value)| value.into_owned())
        .filter(|value| !value.is_empty())
}

/// Extract the announced total hit count from the results banner.
///
/// The banner renders like `1,234 document results`; commas are stripped.
pub fn extract_total_results(html: &str) -> Result<u64> {
    let document = Html::parse_document(html);
    let selector =
        Selector::parse(".resultsCount").map_err(|e| HarvestError::Parse(e.to_string()))?;

    let text = document
        .select(&selector)
        .next()
        .map(|el| el.text().collect::<String>())
        .ok_or_parse("results count banner not found")?;

    let count_regex =
        Regex::new(r"[\d,]+").map_err(|e| HarvestError::Parse(e.to_string()))?;
    let digits = count_regex
        .find(&text)
        .map(|m| m.as_str().replace(',', ""))
        .ok_or_parse("results count banner has no number")?;

    digits
        .parse::<u64>()
        .map_err(|e| HarvestError::Parse(format!("bad results count '{}': {}", digits, e)))
}

/// HTTP-backed result listing.
pub struct HttpListing {
    fetcher: HttpFetcher,
    cookies: HashMap<String, String>,
    base_url: String,
    page_size: u64,
    query: String,
    first_page: Option<String>,
}

impl HttpListing {
    /// Create a listing over an already-authenticated cookie session
    pub fn new(
        cookies: HashMap<String, String>,
        page_size: u64,
        proxy: Option<&str>,
    ) -> Result<Self> {
        Ok(Self {
            fetcher: HttpFetcher::new(proxy)?,
            cookies,
            base_url: DEFAULT_SCOPUS_URL.to_string(),
            page_size,
            query: String::new(),
            first_page: None,
        })
    }

    /// Override the base URL (mirrors, test servers)
    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    fn search_url(&self, page_index: u64) -> Result<Url> {
        let mut url = Url::parse(&format!("{}/results/results.uri", self.base_url))
            .map_err(|e| HarvestError::Config(format!("Invalid base URL: {}", e)))?;

        {
            let mut params = url.query_pairs_mut();
            params.append_pair("src", "s");
            params.append_pair("s", &self.query);
            params.append_pair("offset", &(page_index * self.page_size + 1).to_string());
            params.append_pair("count", &self.page_size.to_string());
        }

        Ok(url)
    }
}

#[async_trait]
impl ResultListing for HttpListing {
    async fn open(&mut self, query: &str, _credentials: &Credentials) -> Result<u64> {
        if self.cookies.is_empty() {
            warn!("No session cookies loaded. Run 'plumharvest cookies' for setup instructions.");
        } else {
            debug!("Using {} session cookies", self.cookies.len());
        }

        self.query = query.to_string();
        let html = self
            .fetcher
            .fetch_text(self.search_url(0)?.as_str(), &self.cookies)
            .await?;
        let total = extract_total_results(&html)?;
        info!(query = query, total = total, "Opened result listing");

        self.first_page = Some(html);
        Ok(total)
    }

    async fn page_html(&mut self, page_index: u64) -> Result<String> {
        if page_index == 0 {
            if let Some(html) = self.first_page.take() {
                return Ok(html);
            }
        }

        // Small random delay between page loads, same courtesy the result
        // site expects from a human paging through.
        let delay = rand::random::<u64>() % 1500 + 500;
        tokio::time::sleep(Duration::from_millis(delay)).await;

        self.fetcher
            .fetch_text(self.search_url(page_index)?.as_str(), &self.cookies)
            .await
    }

    fn session_cookies(&self) -> HashMap<String, String> {
        self.cookies.clone()
    }
}
