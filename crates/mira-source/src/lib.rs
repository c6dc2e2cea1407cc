//! Delimited source loading, column typing and the field-normalizer seam.

use std::path::{Path, PathBuf};

use anyhow::Result;
use encoding_rs::{Encoding, UTF_8, WINDOWS_1252};
use mira_core::{columns, parse_feature_triples, ListingRecord, ParsedRow};
use serde::Serialize;
use thiserror::Error;

pub const CRATE_NAME: &str = "mira-source";

/// Candidate encodings tried in order. The exporter emits either UTF-8 or a
/// single-byte Windows/Latin encoding; under WHATWG labels the latin1 and
/// cp1252 variants all decode through windows-1252.
const CANDIDATE_ENCODINGS: &[&'static Encoding] = &[UTF_8, WINDOWS_1252];

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("could not decode {path} with any supported encoding")]
    EncodingExhausted { path: PathBuf },
}

/// In-memory tabular form of one source file. The whole file is
/// materialized before any downstream step runs; sources are bounded to
/// what fits in memory.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceTable {
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
}

/// Inferred storage type of one source column, judged over its non-empty
/// values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ColumnType {
    /// No non-empty values to judge from.
    Empty,
    Integer,
    Float,
    Text,
}

impl ColumnType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Empty => "empty",
            Self::Integer => "integer",
            Self::Float => "float",
            Self::Text => "text",
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, Self::Integer | Self::Float)
    }
}

impl SourceTable {
    pub fn new(headers: Vec<String>, rows: Vec<Vec<String>>) -> Self {
        let width = headers.len();
        let rows = rows
            .into_iter()
            .map(|mut row| {
                row.resize(width, String::new());
                row
            })
            .collect();
        Self { headers, rows }
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    pub fn rows(&self) -> &[Vec<String>] {
        &self.rows
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.headers.iter().position(|h| h == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column_index(name).is_some()
    }

    /// Cell content at (row, column name); `None` when the column is absent.
    /// Empty and whitespace-only cells come back as `Some("")`-trimmed.
    pub fn cell(&self, row: usize, name: &str) -> Option<&str> {
        let idx = self.column_index(name)?;
        self.rows.get(row).map(|r| r[idx].trim())
    }

    pub fn column_values(&self, name: &str) -> Option<impl Iterator<Item = &str>> {
        let idx = self.column_index(name)?;
        Some(self.rows.iter().map(move |r| r[idx].trim()))
    }

    /// Infer the column's type from its non-empty values: all integers
    /// yields `Integer`, all numeric yields `Float`, anything else `Text`.
    pub fn infer_column_type(&self, name: &str) -> Option<ColumnType> {
        let values = self.column_values(name)?;
        let mut seen = false;
        let mut all_int = true;
        let mut all_num = true;
        for value in values {
            if value.is_empty() {
                continue;
            }
            seen = true;
            if value.parse::<i64>().is_err() {
                all_int = false;
            }
            if value.parse::<f64>().is_err() {
                all_num = false;
                break;
            }
        }
        Some(if !seen {
            ColumnType::Empty
        } else if all_int {
            ColumnType::Integer
        } else if all_num {
            ColumnType::Float
        } else {
            ColumnType::Text
        })
    }
}

/// Read a delimited source file, resolving the text encoding by trying each
/// candidate in order and accepting the first that decodes and parses.
///
/// Best-effort by design: a wrong-but-decodable encoding passes silently,
/// and downstream validation is the safety net for corrupted text.
pub fn load_table(path: impl AsRef<Path>) -> Result<SourceTable, LoadError> {
    let path = path.as_ref();
    let bytes = std::fs::read(path).map_err(|source| LoadError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    for encoding in CANDIDATE_ENCODINGS {
        let (text, _, had_errors) = encoding.decode(&bytes);
        if had_errors {
            continue;
        }
        match parse_csv(&text) {
            Ok(table) => return Ok(table),
            Err(_) => continue,
        }
    }

    Err(LoadError::EncodingExhausted {
        path: path.to_path_buf(),
    })
}

fn parse_csv(text: &str) -> Result<SourceTable, csv::Error> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_reader(text.as_bytes());
    let headers = reader
        .headers()?
        .iter()
        .map(|h| h.trim().to_string())
        .collect::<Vec<_>>();

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        rows.push(record.iter().map(|c| c.to_string()).collect());
    }
    Ok(SourceTable::new(headers, rows))
}

/// Write a table back out as UTF-8 CSV (processed audit copy, backups).
pub fn write_table_csv(table: &SourceTable, path: impl AsRef<Path>) -> Result<()> {
    let mut writer = csv::Writer::from_path(path.as_ref())?;
    writer.write_record(table.headers())?;
    for row in table.rows() {
        writer.write_record(row)?;
    }
    writer.flush()?;
    Ok(())
}

/// Sibling path for the normalizer's persisted audit copy.
pub fn processed_copy_path(source: &Path) -> PathBuf {
    let stem = source
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "source".to_string());
    source.with_file_name(format!("{stem}_processed.csv"))
}

/// Maps raw source columns to the canonical attribute vocabulary. The real
/// mapping logic is an external collaborator; implementations must leave
/// underivable canonical columns absent rather than synthesize them.
pub trait FieldNormalizer: Send + Sync {
    fn normalize(&self, table: SourceTable) -> Result<SourceTable>;
}

/// Static alias-table normalizer used as the default collaborator. Renames
/// known raw headers (trimmed, case-insensitive match) to canonical names
/// and passes everything else through untouched.
#[derive(Debug, Default)]
pub struct AliasNormalizer;

const HEADER_ALIASES: &[(&str, &[&str])] = &[
    (columns::LIST_NUMBER, &["List Number", "ListNumber", "MLS Number"]),
    (columns::AGENCY_NAME, &["Agency Name", "Agency"]),
    (columns::AGENCY_PHONE, &["Agency Phone"]),
    (columns::LISTING_AGENT, &["Listing Agent", "Agent"]),
    (columns::PROPERTY_TYPE, &["Property Type", "Type"]),
    (columns::STATUS, &["Status"]),
    (columns::DAYS_ON_MARKET, &["Days on Market", "DOM"]),
    (columns::AREA, &["Area"]),
    (columns::COMMUNITY, &["Community"]),
    (columns::INITIAL_PRICE, &["Initial Price", "List Price"]),
    (columns::CURRENT_PRICE, &["Current Price", "Price"]),
    (columns::SOLD_PRICE, &["Sold Price"]),
    (columns::DEVELOPMENT_NAME, &["Development Name", "Property Name"]),
    (columns::STATE, &["State"]),
    (columns::CONSTRUCTION_FT2, &["Construction Ft2", "Construction (ft2)"]),
    (columns::CONSTRUCTION_M2, &["Construction M2", "Construction (m2)"]),
    (columns::LOT_MEASUREMENTS, &["Lot Measurements"]),
    (columns::HALF_BATH, &["Half Bath", "Half Baths"]),
    (columns::FLOOR_NUMBER, &["Floor Number", "Floor"]),
    (columns::FURNISHED, &["Furnished"]),
    (columns::FEATURES, &["Features"]),
];

fn canonical_header(raw: &str) -> Option<&'static str> {
    let raw = raw.trim();
    for (canonical, aliases) in HEADER_ALIASES {
        if raw.eq_ignore_ascii_case(canonical) {
            return Some(canonical);
        }
        if aliases.iter().any(|a| raw.eq_ignore_ascii_case(a)) {
            return Some(canonical);
        }
    }
    None
}

impl FieldNormalizer for AliasNormalizer {
    fn normalize(&self, table: SourceTable) -> Result<SourceTable> {
        let headers = table
            .headers()
            .iter()
            .map(|h| match canonical_header(h) {
                Some(canonical) => canonical.to_string(),
                None => h.clone(),
            })
            .collect::<Vec<_>>();
        Ok(SourceTable::new(headers, table.rows))
    }
}

fn opt_text(cell: Option<&str>) -> Option<String> {
    match cell {
        Some(v) if !v.is_empty() => Some(v.to_string()),
        _ => None,
    }
}

fn opt_i64(cell: Option<&str>) -> Option<i64> {
    let v = cell?.trim();
    if v.is_empty() {
        return None;
    }
    // exporters write whole numbers as "12.0" often enough to tolerate it
    v.parse::<i64>()
        .ok()
        .or_else(|| v.parse::<f64>().ok().map(|f| f as i64))
}

fn opt_f64(cell: Option<&str>) -> Option<f64> {
    let v = cell?.trim();
    if v.is_empty() {
        return None;
    }
    v.parse::<f64>().ok()
}

fn opt_bool(cell: Option<&str>) -> Option<bool> {
    match cell?.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "y" | "1" => Some(true),
        "false" | "no" | "n" | "0" => Some(false),
        _ => None,
    }
}

/// Convert a normalized table into per-row upsert inputs. Rows without a
/// natural key produce `record: None` and are skipped downstream rather
/// than aborting the import.
pub fn extract_rows(table: &SourceTable) -> Vec<ParsedRow> {
    (0..table.row_count())
        .map(|row| {
            let line = row + 1;
            let features = table
                .cell(row, columns::FEATURES)
                .map(parse_feature_triples)
                .unwrap_or_default();

            let record = opt_text(table.cell(row, columns::LIST_NUMBER)).map(|list_number| {
                ListingRecord {
                    list_number,
                    agency_name: opt_text(table.cell(row, columns::AGENCY_NAME)),
                    agency_phone: opt_text(table.cell(row, columns::AGENCY_PHONE)),
                    listing_agent: opt_text(table.cell(row, columns::LISTING_AGENT)),
                    property_type: opt_text(table.cell(row, columns::PROPERTY_TYPE)),
                    status: opt_text(table.cell(row, columns::STATUS)),
                    days_on_market: opt_i64(table.cell(row, columns::DAYS_ON_MARKET)),
                    area: opt_text(table.cell(row, columns::AREA)),
                    community: opt_text(table.cell(row, columns::COMMUNITY)),
                    initial_price: opt_f64(table.cell(row, columns::INITIAL_PRICE)),
                    current_price: opt_f64(table.cell(row, columns::CURRENT_PRICE)),
                    sold_price: opt_f64(table.cell(row, columns::SOLD_PRICE)),
                    development_name: opt_text(table.cell(row, columns::DEVELOPMENT_NAME)),
                    state: opt_text(table.cell(row, columns::STATE)),
                    construction_ft2: opt_f64(table.cell(row, columns::CONSTRUCTION_FT2)),
                    construction_m2: opt_f64(table.cell(row, columns::CONSTRUCTION_M2)),
                    lot_measurements: opt_text(table.cell(row, columns::LOT_MEASUREMENTS)),
                    half_bath: opt_i64(table.cell(row, columns::HALF_BATH)),
                    floor_number: opt_i64(table.cell(row, columns::FLOOR_NUMBER)),
                    furnished: opt_bool(table.cell(row, columns::FURNISHED)),
                    begin_date: None,
                }
            });

            ParsedRow {
                line,
                record,
                features,
            }
        })
        .collect()
}
