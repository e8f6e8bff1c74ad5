//! Schema-inferring flattening of persisted metric records.
//!
//! Per-record metric trees are heterogeneous: different categories, different
//! count types, different sources. The flattener walks every record, collects
//! the union of dotted column paths (`category`, `category-metric`,
//! `category-metric-source`, one more level for nested breakdowns), sorts
//! them, and materializes each record against that one schema with missing
//! numeric cells defaulted to 0. `paper_title` and `doi` are always the first
//! two columns.

use crate::error::Result;
use crate::metrics::{MetricRecord, MetricValue};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Path separator in column names
const PATH_SEPARATOR: &str = "-";

/// Category whose nested `total` subfields duplicate the metric-level total
/// and are dropped from the schema.
const SOCIAL_MEDIA: &str = "social_media";

/// The inferred union schema.
///
/// Columns keep their segment vectors; the dotted name is only a rendering.
/// Resolving by segments keeps sources whose names themselves contain the
/// separator (e.g. "Academic Citation Index (ACI) - airiti") addressable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
    /// Metric column paths, sorted by their dotted names
    metric_paths: Vec<Vec<String>>,
}

impl Schema {
    /// Infer the union schema over a record set.
    ///
    /// Deterministic and independent of input order.
    pub fn discover(records: &[MetricRecord]) -> Self {
        // Keyed by dotted name so the column order is the sorted name order.
        let mut paths: BTreeMap<String, Vec<String>> = BTreeMap::new();

        for record in records {
            for (category, metrics) in &record.categories {
                for (name, value) in metrics {
                    let path = vec![category.clone(), name.clone()];
                    collect_paths(category, path, value, &mut paths);
                }
            }
        }

        Self {
            metric_paths: paths.into_values().collect(),
        }
    }

    /// Column names: `paper_title`, `doi`, then the sorted metric paths
    pub fn header(&self) -> Vec<String> {
        let mut header = vec!["paper_title".to_string(), "doi".to_string()];
        header.extend(
            self.metric_paths
                .iter()
                .map(|path| path.join(PATH_SEPARATOR)),
        );
        header
    }

    /// Number of columns including the two fixed ones
    pub fn column_count(&self) -> usize {
        self.metric_paths.len() + 2
    }

    /// Materialize one record against the schema.
    ///
    /// Metric cells missing from the record default to 0; the two fixed
    /// string columns default to "".
    pub fn flatten_record(&self, record: &MetricRecord) -> Vec<String> {
        let mut row = Vec::with_capacity(self.column_count());
        row.push(record.paper_title.clone());
        row.push(record.doi.clone());

        for path in &self.metric_paths {
            row.push(resolve_path(record, path).unwrap_or(0).to_string());
        }

        row
    }
}

fn collect_paths(
    category: &str,
    path: Vec<String>,
    value: &MetricValue,
    paths: &mut BTreeMap<String, Vec<String>>,
) {
    match value {
        MetricValue::Scalar(_) => {
            paths.insert(path.join(PATH_SEPARATOR), path);
        }
        MetricValue::Breakdown(map) => {
            for (key, child) in map {
                if category == SOCIAL_MEDIA && key == "total" {
                    continue;
                }
                let mut child_path = path.clone();
                child_path.push(key.clone());
                collect_paths(category, child_path, child, paths);
            }
        }
    }
}

/// Descend the record's metric tree along a column path
fn resolve_path(record: &MetricRecord, path: &[String]) -> Option<i64> {
    let (category, rest) = path.split_first()?;
    let metrics = record.categories.get(category)?;
    let (first, deeper) = rest.split_first()?;
    let mut current = metrics.get(first)?;

    for segment in deeper {
        match current {
            MetricValue::Breakdown(inner) => current = inner.get(segment)?,
            MetricValue::Scalar(_) => return None,
        }
    }

    current.as_scalar()
}

/// Flatten a record set: inferred schema plus one positional row per record.
pub fn flatten(records: &[MetricRecord]) -> (Schema, Vec<Vec<String>>) {
    let schema = Schema::discover(records);
    let rows = records
        .iter()
        .map(|record| schema.flatten_record(record))
        .collect();
    (schema, rows)
}

/// Outcome of the duplicate-DOI scan
#[derive(Debug)]
pub struct DuplicateReport {
    /// Total records scanned
    pub total: usize,
    /// Distinct DOIs among them
    pub distinct: usize,
    /// DOIs appearing more than once, sorted
    pub duplicated: Vec<String>,
}

impl DuplicateReport {
    pub fn has_duplicates(&self) -> bool {
        self.distinct < self.total
    }
}

/// Scan for duplicate DOIs across the persisted set.
///
/// Duplicates are diagnosed, never dropped: the same document reached from
/// two result rows still exports as two rows.
pub fn check_duplicates(records: &[(u64, MetricRecord)]) -> DuplicateReport {
    let mut dois: Vec<&str> = records.iter().map(|(_, r)| r.doi.as_str()).collect();
    dois.sort_unstable();

    let distinct = dois.iter().collect::<HashSet<_>>().len();
    let mut duplicated = Vec::new();
    for pair in dois.windows(2) {
        if pair[0] == pair[1] && duplicated.last().map(String::as_str) != Some(pair[0]) {
            duplicated.push(pair[0].to_string());
        }
    }

    DuplicateReport {
        total: records.len(),
        distinct,
        duplicated,
    }
}

/// Write the `index \t doi \t title` diagnostic listing (1-based, in
/// sequence order)
pub fn write_doi_listing(records: &[(u64, MetricRecord)], path: &Path) -> Result<()> {
    let mut lines = String::new();
    for (i, (_, record)) in records.iter().enumerate() {
        lines.push_str(&format!(
            "{}\t{}\t{}\n",
            i + 1,
            record.doi,
            record.paper_title
        ));
    }
    std::fs::write(path, lines)?;
    Ok(())
}

/// Summary of a completed export
#[derive(Debug)]
pub struct ExportSummary {
    pub records: usize,
    pub distinct_dois: usize,
    pub columns: usize,
    pub csv_path: PathBuf,
}

/// Flatten all persisted records and write the CSV export plus the DOI
/// diagnostic listing.
pub fn export_records(
    records: &[(u64, MetricRecord)],
    csv_path: &Path,
    listing_path: &Path,
) -> Result<ExportSummary> {
    let report = check_duplicates(records);
    if report.has_duplicates() {
        warn!(
            total = report.total,
            distinct = report.distinct,
            "Duplicate DOIs in record set"
        );
        for doi in &report.duplicated {
            warn!(doi = %doi, "Duplicated DOI");
        }
    }
    write_doi_listing(records, listing_path)?;

    let flat_records: Vec<MetricRecord> = records.iter().map(|(_, r)| r.clone()).collect();
    let (schema, rows) = flatten(&flat_records);

    let mut writer = csv::Writer::from_path(csv_path)?;
    writer.write_record(schema.header())?;
    for row in &rows {
        writer.write_record(row)?;
    }
    writer.flush()?;

    info!(
        records = records.len(),
        columns = schema.column_count(),
        path = ?csv_path,
        "Export written"
    );

    Ok(ExportSummary {
        records: records.len(),
        distinct_dois: report.distinct,
        columns: schema.column_count(),
        csv_path: csv_path.to_path_buf(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn breakdown(pairs: &[(&str, i64)]) -> MetricValue {
        MetricValue::Breakdown(
            pairs
                .iter()
                .map(|(name, count)| (name.to_string(), MetricValue::Scalar(*count)))
                .collect(),
        )
    }

    fn record_with(
        doi: &str,
        title: &str,
        category: &str,
        total: i64,
        metrics: &[(&str, MetricValue)],
    ) -> MetricRecord {
        let mut record = MetricRecord::new(doi, title);
        let mut map: BTreeMap<String, MetricValue> = BTreeMap::new();
        map.insert("total".to_string(), MetricValue::Scalar(total));
        for (name, value) in metrics {
            map.insert(name.to_string(), value.clone());
        }
        record.categories.insert(category.to_string(), map);
        record
    }

    fn usage_record() -> MetricRecord {
        record_with(
            "10.1/usage",
            "Usage paper",
            "usage",
            10,
            &[(
                "ABSTRACT_VIEWS",
                breakdown(&[("EBSCO", 10), ("total", 10)]),
            )],
        )
    }

    fn capture_record() -> MetricRecord {
        record_with(
            "10.1/capture",
            "Capture paper",
            "capture",
            5,
            &[("READER_COUNT", breakdown(&[("Mendeley", 5), ("total", 5)]))],
        )
    }

    #[test]
    fn test_end_to_end_schema_and_default_fill() {
        let records = vec![
            usage_record(),
            capture_record(),
            MetricRecord::new("10.1/empty", "Empty paper"),
        ];

        let (schema, rows) = flatten(&records);

        assert_eq!(
            schema.header(),
            vec![
                "paper_title",
                "doi",
                "capture-READER_COUNT-Mendeley",
                "capture-READER_COUNT-total",
                "capture-total",
                "usage-ABSTRACT_VIEWS-EBSCO",
                "usage-ABSTRACT_VIEWS-total",
                "usage-total",
            ]
        );

        // The empty record's metric cells are all 0.
        let empty_row = &rows[2];
        assert_eq!(empty_row[0], "Empty paper");
        assert_eq!(empty_row[1], "10.1/empty");
        assert!(empty_row[2..].iter().all(|cell| cell == "0"));

        // Cross-fill: usage record has zeros in capture columns and its own
        // counts in usage columns.
        let usage_row = &rows[0];
        assert_eq!(usage_row[2], "0");
        assert_eq!(usage_row[5], "10");
        assert_eq!(usage_row[7], "10");
    }

    #[test]
    fn test_schema_is_input_order_independent() {
        let a = usage_record();
        let b = capture_record();

        let forward = Schema::discover(&[a.clone(), b.clone()]);
        let backward = Schema::discover(&[b, a]);
        assert_eq!(forward, backward);
    }

    #[test]
    fn test_social_media_nested_total_excluded() {
        let record = record_with(
            "10.1/sm",
            "Social paper",
            "social_media",
            695,
            &[("TWEET_COUNT", breakdown(&[("Twitter", 695), ("total", 695)]))],
        );

        let schema = Schema::discover(&[record]);
        let header = schema.header();

        assert!(header.contains(&"social_media-total".to_string()));
        assert!(header.contains(&"social_media-TWEET_COUNT-Twitter".to_string()));
        assert!(!header.contains(&"social_media-TWEET_COUNT-total".to_string()));
    }

    #[test]
    fn test_four_segment_paths() {
        let mut inner: BTreeMap<String, MetricValue> = BTreeMap::new();
        inner.insert("Wikipedia".to_string(), breakdown(&[("en", 3), ("de", 1)]));
        let record = record_with(
            "10.1/deep",
            "Deep paper",
            "mention",
            4,
            &[("REFERENCE_COUNT", MetricValue::Breakdown(inner))],
        );

        let (schema, rows) = flatten(&[record]);
        let header = schema.header();

        let col = header
            .iter()
            .position(|c| c == "mention-REFERENCE_COUNT-Wikipedia-en")
            .expect("4-segment column missing");
        assert_eq!(rows[0][col], "3");
    }

    #[test]
    fn test_separator_inside_source_name_resolves() {
        let record = record_with(
            "10.1/aci",
            "ACI paper",
            "citation",
            2,
            &[(
                "CITED_BY_COUNT",
                breakdown(&[("Academic Citation Index (ACI) - airiti", 2), ("total", 2)]),
            )],
        );

        let (schema, rows) = flatten(&[record.clone()]);
        let header = schema.header();
        let col = header
            .iter()
            .position(|c| c == "citation-CITED_BY_COUNT-Academic Citation Index (ACI) - airiti")
            .expect("column missing");
        assert_eq!(rows[0][col], "2");
    }

    #[test]
    fn test_duplicates_reported_but_both_rows_exported() {
        let records = vec![
            (0u64, usage_record()),
            (1u64, usage_record()),
            (2u64, capture_record()),
        ];

        let report = check_duplicates(&records);
        assert!(report.has_duplicates());
        assert_eq!(report.total, 3);
        assert_eq!(report.distinct, 2);
        assert_eq!(report.duplicated, vec!["10.1/usage".to_string()]);

        let flat: Vec<MetricRecord> = records.iter().map(|(_, r)| r.clone()).collect();
        let (_, rows) = flatten(&flat);
        assert_eq!(rows.len(), 3);
    }

    #[test]
    fn test_export_writes_csv_and_listing() -> Result<()> {
        let temp = TempDir::new()?;
        let csv_path = temp.path().join("plumx.csv");
        let listing_path = temp.path().join("doi_listing.tsv");

        let records = vec![(0u64, usage_record()), (1u64, capture_record())];
        let summary = export_records(&records, &csv_path, &listing_path)?;

        assert_eq!(summary.records, 2);
        assert_eq!(summary.distinct_dois, 2);

        let csv_content = std::fs::read_to_string(&csv_path)?;
        assert!(csv_content.starts_with("paper_title,doi,"));
        assert_eq!(csv_content.lines().count(), 3);

        let listing = std::fs::read_to_string(&listing_path)?;
        assert_eq!(listing, "1\t10.1/usage\tUsage paper\n2\t10.1/capture\tCapture paper\n");
        Ok(())
    }
}
