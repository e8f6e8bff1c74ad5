//! Cookie management for authenticated Scopus requests.
//!
//! Signing in to Scopus is handled outside this crate (a browser session the
//! user drives once). The cookies exported from that session are persisted
//! here; only the ones scoped to the hosts the crawl actually talks to are
//! attached to metrics-lookup requests.

use crate::error::{HarvestError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// Hosts the crawl talks to. Cookies scoped to anything else (the export
/// usually carries the whole browser profile) stay out of the session map.
const SESSION_DOMAINS: &[&str] = &["scopus.com", "elsevier.com", "plu.mx"];

/// Default cookie file path: `~/.plumharvest_cookies.json`
fn default_cookie_path() -> Result<PathBuf> {
    dirs::home_dir()
        .map(|p| p.join(".plumharvest_cookies.json"))
        .ok_or_else(|| HarvestError::Config("Cannot determine home directory".to_string()))
}

/// Cookie entry matching the browser's export format
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    pub domain: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub secure: bool,
    #[serde(default)]
    pub http_only: bool,
    #[serde(default)]
    pub expires: Option<f64>,
}

impl Cookie {
    /// Whether this cookie belongs to one of the crawl's hosts
    fn is_session_cookie(&self) -> bool {
        SESSION_DOMAINS
            .iter()
            .any(|domain| self.domain.contains(domain))
    }
}

/// Cookie manager for loading and saving cookies
pub struct CookieManager {
    path: PathBuf,
}

impl CookieManager {
    /// Create a new CookieManager with default path
    pub fn new() -> Result<Self> {
        Ok(Self {
            path: default_cookie_path()?,
        })
    }

    /// Create a new CookieManager with custom path
    pub fn with_path(path: PathBuf) -> Self {
        Self { path }
    }

    /// Get the cookie file path
    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Load all stored cookies.
    ///
    /// Returns empty vec if the file doesn't exist or is invalid; a stale or
    /// mangled export should read as "no session", not kill the run.
    pub fn load(&self) -> Vec<Cookie> {
        if !self.path.exists() {
            debug!("Cookie file not found: {:?}", self.path);
            return Vec::new();
        }

        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) => {
                warn!("Failed to read cookie file: {}", e);
                return Vec::new();
            }
        };

        match serde_json::from_str::<Vec<Cookie>>(&content) {
            Ok(cookies) => {
                info!("Loaded {} cookies from {:?}", cookies.len(), self.path);
                cookies
            }
            Err(e) => {
                warn!("Failed to parse cookies: {}", e);
                Vec::new()
            }
        }
    }

    /// Load the crawl-relevant cookies as a name -> value map, the shape the
    /// crawler sends. Cookies scoped to unrelated domains are dropped here so
    /// they never reach the Scopus or PlumX endpoints.
    pub fn load_as_map(&self) -> HashMap<String, String> {
        let cookies = self.load();
        let total = cookies.len();

        let session: HashMap<String, String> = cookies
            .into_iter()
            .filter(Cookie::is_session_cookie)
            .map(|c| (c.name, c.value))
            .collect();

        if session.len() < total {
            debug!(
                kept = session.len(),
                dropped = total - session.len(),
                "Dropped cookies outside the session domains"
            );
        }
        session
    }

    /// Save cookies to file
    pub fn save(&self, cookies: &[Cookie]) -> Result<()> {
        let content = serde_json::to_string_pretty(cookies)?;
        std::fs::write(&self.path, content)?;
        info!("Saved {} cookies to {:?}", cookies.len(), self.path);
        Ok(())
    }

    /// Clear stored cookies
    pub fn clear(&self) -> Result<()> {
        if self.path.exists() {
            std::fs::remove_file(&self.path)?;
            info!("Cleared cookies at {:?}", self.path);
        }
        Ok(())
    }
}

impl Default for CookieManager {
    fn default() -> Self {
        Self::new().unwrap_or_else(|_| Self {
            path: PathBuf::from(".plumharvest_cookies.json"),
        })
    }
}

/// Build a `Cookie:` header value from a cookie map
pub fn build_cookie_header(cookies: &HashMap<String, String>) -> String {
    cookies
        .iter()
        .map(|(name, value)| format!("{}={}", name, value))
        .collect::<Vec<_>>()
        .join("; ")
}
