//! PlumX metric payload parsing.
//!
//! A PlumX artifact document reports altmetric counts grouped by category
//! (usage, capture, citation, social_media, mention). Each category carries a
//! total plus a list of count types, each broken down by source. This module
//! normalizes that payload into a [`MetricRecord`] whose nested values are a
//! tagged tree of [`MetricValue`]s instead of a duck-typed dictionary.

use crate::error::{HarvestError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Count type whose externally reported total is authoritative.
///
/// Citation totals aggregated by PlumX can diverge from the sum of the visible
/// per-source counts (sources overlap), so the reported figure wins.
const CITED_BY_COUNT: &str = "CITED_BY_COUNT";

/// A single metric leaf or a per-source breakdown.
///
/// `Breakdown` is recursive, so a breakdown nested inside another one flattens
/// to a four-segment column path later on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricValue {
    /// A plain count
    Scalar(i64),
    /// Counts keyed by source name (plus a `total` entry)
    Breakdown(BTreeMap<String, MetricValue>),
}

impl MetricValue {
    /// Return the scalar count, if this is a leaf
    pub fn as_scalar(&self) -> Option<i64> {
        match self {
            MetricValue::Scalar(n) => Some(*n),
            MetricValue::Breakdown(_) => None,
        }
    }
}

/// One document's normalized altmetric record.
///
/// Keyed by DOI; the crawler additionally keys the persisted artifact by the
/// row's global sequence number, so duplicate DOIs are representable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricRecord {
    /// Digital Object Identifier
    pub doi: String,
    /// Display title from the result row (attached by the crawler)
    #[serde(default)]
    pub paper_title: String,
    /// category -> metric name -> value tree
    #[serde(default)]
    pub categories: BTreeMap<String, BTreeMap<String, MetricValue>>,
}

impl MetricRecord {
    /// Create a record with no metric data
    pub fn new(doi: impl Into<String>, paper_title: impl Into<String>) -> Self {
        Self {
            doi: doi.into(),
            paper_title: paper_title.into(),
            categories: BTreeMap::new(),
        }
    }
}

// === PlumX artifact response types ===

#[derive(Debug, Deserialize)]
struct ArtifactPayload {
    #[serde(default)]
    sort_count: Option<BTreeMap<String, CategoryPayload>>,
    #[serde(default)]
    identifier: Option<IdentifierPayload>,
}

#[derive(Debug, Deserialize)]
struct IdentifierPayload {
    #[serde(default)]
    doi: Vec<DoiEntry>,
}

#[derive(Debug, Deserialize)]
struct DoiEntry {
    #[serde(default)]
    value: String,
}

#[derive(Debug, Deserialize)]
struct CategoryPayload {
    #[serde(default)]
    total: i64,
    #[serde(default)]
    count_types: Vec<CountTypePayload>,
}

#[derive(Debug, Deserialize)]
struct CountTypePayload {
    #[serde(default)]
    name: String,
    #[serde(default)]
    total: i64,
    #[serde(default)]
    sources: Vec<SourcePayload>,
}

#[derive(Debug, Deserialize)]
struct SourcePayload {
    #[serde(default)]
    name: String,
    #[serde(default)]
    total: i64,
}

/// Parse a raw PlumX artifact payload into a [`MetricRecord`].
///
/// Returns `Ok(None)` when the payload has no `sort_count` section, which
/// PlumX sends for documents with no recorded metrics. Callers treat that as
/// "no data", not a failure. A payload *with* metrics but without
/// `identifier.doi[0].value` cannot be keyed and is a parse error.
///
/// # Errors
///
/// Returns error if the payload is not valid JSON or lacks a DOI.
pub fn parse_metric_payload(raw: &str) -> Result<Option<MetricRecord>> {
    let payload: ArtifactPayload = serde_json::from_str(raw)?;

    let Some(sort_count) = payload.sort_count else {
        return Ok(None);
    };

    let doi = payload
        .identifier
        .and_then(|id| id.doi.into_iter().next())
        .map(|entry| entry.value)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| HarvestError::Parse("missing identifier.doi[0].value".to_string()))?;

    let mut record = MetricRecord::new(doi, "");

    for (category_name, category) in sort_count {
        let mut metrics: BTreeMap<String, MetricValue> = BTreeMap::new();
        metrics.insert("total".to_string(), MetricValue::Scalar(category.total));

        for count_type in category.count_types {
            // A source may appear more than once; accumulate, never overwrite.
            let mut by_source: BTreeMap<String, i64> = BTreeMap::new();
            for source in count_type.sources {
                *by_source.entry(source.name).or_insert(0) += source.total;
            }

            let computed_total: i64 = by_source.values().sum();
            let total = if count_type.name == CITED_BY_COUNT {
                count_type.total
            } else {
                computed_total
            };

            let mut breakdown: BTreeMap<String, MetricValue> = by_source
                .into_iter()
                .map(|(name, count)| (name, MetricValue::Scalar(count)))
                .collect();
            breakdown.insert("total".to_string(), MetricValue::Scalar(total));

            metrics.insert(count_type.name, MetricValue::Breakdown(breakdown));
        }

        record.categories.insert(category_name, metrics);
    }

    Ok(Some(record))
}
