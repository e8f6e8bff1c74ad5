//! # plumharvest
//!
//! Scopus/PlumX Altmetric Crawl & Flatten Pipeline
//!
//! ## Modules
//!
//! - [`session`] - Multi-page crawl orchestration with stop/resume
//! - [`crawler`] - Per-page row crawling and chained metric lookups
//! - [`listing`] - Result-listing source and row extraction
//! - [`metrics`] - PlumX metric payload parsing
//! - [`store`] - Sequence-keyed record persistence
//! - [`flatten`] - Union-schema flattening and CSV export
//! - [`cookies`] - Cookie persistence for the authenticated session
//! - [`error`] - Custom error types
//!
//! ## Usage
//!
//! ```rust,no_run
//! use plumharvest::session;
//!
//! fn main() -> anyhow::Result<()> {
//!     let summary = session::resolve_work_dir(std::path::Path::new("./nature-2015"))?;
//!     println!("Exported {} records", summary.records);
//!     Ok(())
//! }
//! ```

pub mod cookies;
pub mod crawler;
pub mod error;
pub mod flatten;
pub mod listing;
pub mod metrics;
pub mod session;
pub mod store;

pub use error::{HarvestError, Result};
