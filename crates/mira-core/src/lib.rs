//! Core domain model for the MIRA listing import pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "mira-core";

/// Canonical attribute vocabulary produced by the field normalizer.
pub mod columns {
    pub const LIST_NUMBER: &str = "list_number";
    pub const AGENCY_NAME: &str = "agency_name";
    pub const AGENCY_PHONE: &str = "agency_phone";
    pub const LISTING_AGENT: &str = "listing_agent";
    pub const PROPERTY_TYPE: &str = "property_type";
    pub const STATUS: &str = "status";
    pub const DAYS_ON_MARKET: &str = "days_on_market";
    pub const AREA: &str = "area";
    pub const COMMUNITY: &str = "community";
    pub const INITIAL_PRICE: &str = "initial_price";
    pub const CURRENT_PRICE: &str = "current_price";
    pub const SOLD_PRICE: &str = "sold_price";
    pub const DEVELOPMENT_NAME: &str = "development_name";
    pub const STATE: &str = "state";
    pub const CONSTRUCTION_FT2: &str = "construction_ft2";
    pub const CONSTRUCTION_M2: &str = "construction_m2";
    pub const LOT_MEASUREMENTS: &str = "lot_measurements";
    pub const HALF_BATH: &str = "half_bath";
    pub const FLOOR_NUMBER: &str = "floor_number";
    pub const FURNISHED: &str = "furnished";
    pub const FEATURES: &str = "features";

    /// Columns that must exist before any write is attempted.
    pub const REQUIRED: &[&str] = &[
        LIST_NUMBER,
        AGENCY_NAME,
        STATUS,
        AREA,
        CURRENT_PRICE,
        PROPERTY_TYPE,
    ];

    /// Columns whose inferred type must be numeric.
    pub const NUMERIC_CHECKED: &[&str] = &[CURRENT_PRICE, CONSTRUCTION_FT2, DAYS_ON_MARKET];

    /// Columns whose inferred type must be textual.
    pub const TEXT_CHECKED: &[&str] = &[LIST_NUMBER];
}

/// One persisted real-estate offering. The field set is closed on purpose:
/// update-in-place overwrites these attributes and nothing else.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ListingRecord {
    /// Natural key; globally unique among persisted listings.
    pub list_number: String,
    pub agency_name: Option<String>,
    pub agency_phone: Option<String>,
    pub listing_agent: Option<String>,
    pub property_type: Option<String>,
    pub status: Option<String>,
    pub days_on_market: Option<i64>,
    pub area: Option<String>,
    pub community: Option<String>,
    pub initial_price: Option<f64>,
    pub current_price: Option<f64>,
    pub sold_price: Option<f64>,
    pub development_name: Option<String>,
    pub state: Option<String>,
    pub construction_ft2: Option<f64>,
    pub construction_m2: Option<f64>,
    pub lot_measurements: Option<String>,
    pub half_bath: Option<i64>,
    pub floor_number: Option<i64>,
    pub furnished: Option<bool>,
    pub begin_date: Option<DateTime<Utc>>,
}

/// One `category|feature|value` assignment parsed from the features column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureTriple {
    pub category: String,
    pub feature: String,
    pub value: String,
}

/// Parse the `;`-separated `category|feature|value` sub-format.
///
/// Malformed entries (wrong arity, empty category or feature name) are
/// skipped individually; the rest of the row still imports.
pub fn parse_feature_triples(raw: &str) -> Vec<FeatureTriple> {
    raw.split(';')
        .filter_map(|entry| {
            let entry = entry.trim();
            if entry.is_empty() {
                return None;
            }
            let mut parts = entry.split('|');
            let category = parts.next()?.trim();
            let feature = parts.next()?.trim();
            let value = parts.next()?.trim();
            if parts.next().is_some() || category.is_empty() || feature.is_empty() {
                return None;
            }
            Some(FeatureTriple {
                category: category.to_string(),
                feature: feature.to_string(),
                value: value.to_string(),
            })
        })
        .collect()
}

/// One normalized source row handed to the batch controller.
///
/// `record` is `None` when the row carries no natural key; such rows are
/// counted as skipped rather than failing the batch.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedRow {
    /// 1-based data row number in the source file (header excluded).
    pub line: usize,
    pub record: Option<ListingRecord>,
    pub features: Vec<FeatureTriple>,
}

/// Which branch the upsert engine took for a natural key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpsertOutcome {
    Created,
    Updated,
}

/// Aggregate counts for a completed import run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ImportSummary {
    pub created: usize,
    pub updated: usize,
    pub skipped: usize,
}

impl ImportSummary {
    pub fn rows_applied(&self) -> usize {
        self.created + self.updated
    }

    pub fn record(&mut self, outcome: UpsertOutcome) {
        match outcome {
            UpsertOutcome::Created => self.created += 1,
            UpsertOutcome::Updated => self.updated += 1,
        }
    }

    pub fn absorb(&mut self, other: ImportSummary) {
        self.created += other.created;
        self.updated += other.updated;
        self.skipped += other.skipped;
    }
}

/// Post-import verification verdict, reported separately from import
/// success so operators can tell "completed but looks wrong" apart from
/// "broke midway".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum VerificationOutcome {
    Passed,
    Failed { reason: String },
}

impl VerificationOutcome {
    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Failed {
            reason: reason.into(),
        }
    }

    pub fn is_passed(&self) -> bool {
        matches!(self, Self::Passed)
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Passed => None,
            Self::Failed { reason } => Some(reason),
        }
    }
}
