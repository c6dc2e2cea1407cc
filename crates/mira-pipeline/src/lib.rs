//! Import orchestration: validation gate, backup, reconciliation and the
//! end-to-end run.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use mira_core::{columns, ImportSummary, VerificationOutcome};
use mira_source::{
    extract_rows, load_table, processed_copy_path, write_table_csv, AliasNormalizer, ColumnType,
    FieldNormalizer, LoadError, SourceTable,
};
use mira_store::{
    count_listings, fetch_all_listings, init_database, sample_listings, BatchFailure,
    BatchImporter, StoreError, StoredListing, DEFAULT_BATCH_SIZE,
};
use serde::Serialize;
use sqlx::SqlitePool;
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "mira-pipeline";

/// Rows sampled for reconciliation's type and null checks.
pub const RECONCILE_SAMPLE_LIMIT: i64 = 100;

/// Columns that must never be NULL in persisted rows.
const RECONCILE_NULL_CHECKED: &[&str] = &[
    columns::LIST_NUMBER,
    columns::PROPERTY_TYPE,
    columns::STATUS,
    columns::AREA,
];

/// Append-only, timestamp-named, human-readable run log artifact. One
/// handle per concern (field verification, import verification), owned by
/// the orchestrator and passed into the steps that need it.
pub struct RunLog {
    path: PathBuf,
    file: File,
}

impl RunLog {
    pub fn create(dir: &Path, prefix: &str, stamp: &str) -> std::io::Result<Self> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(format!("{prefix}_log_{stamp}.txt"));
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn info(&mut self, message: &str) {
        info!("{message}");
        self.append("INFO", message);
    }

    pub fn warning(&mut self, message: &str) {
        warn!("{message}");
        self.append("WARNING", message);
    }

    pub fn error(&mut self, message: &str) {
        error!("{message}");
        self.append("ERROR", message);
    }

    fn append(&mut self, level: &str, message: &str) {
        let stamp = Utc::now().format("%Y-%m-%d %H:%M:%S");
        if let Err(err) = writeln!(self.file, "{stamp} - {level} - {message}") {
            warn!(path = %self.path.display(), "could not append to run log: {err}");
        }
    }
}

/// Verdict plus structured findings from the validation gate.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FieldReport {
    pub passed: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl FieldReport {
    fn fail(&mut self, log: &mut RunLog, message: String) {
        log.error(&message);
        self.errors.push(message);
        self.passed = false;
    }

    fn warn(&mut self, log: &mut RunLog, message: String) {
        log.warning(&message);
        self.warnings.push(message);
    }
}

/// Validate a normalized table before any write occurs. Recoverable data
/// issues never panic; they become a fail verdict (or a warning) plus log
/// entries. A fail verdict must keep the batch controller from starting.
pub fn verify_fields(table: &SourceTable, log: &mut RunLog) -> FieldReport {
    let mut report = FieldReport {
        passed: true,
        ..Default::default()
    };

    // 1. Required columns must exist at all.
    let missing: Vec<&str> = columns::REQUIRED
        .iter()
        .copied()
        .filter(|name| !table.has_column(name))
        .collect();
    if !missing.is_empty() {
        report.fail(log, format!("missing required fields: {}", missing.join(", ")));
        return report;
    }

    // 2. Inferred column types must conform.
    for name in columns::NUMERIC_CHECKED {
        if let Some(inferred) = table.infer_column_type(name) {
            if !inferred.is_numeric() && inferred != ColumnType::Empty {
                report.fail(
                    log,
                    format!(
                        "invalid data type for {name}: expected numeric, got {}",
                        inferred.as_str()
                    ),
                );
            }
        }
    }
    for name in columns::TEXT_CHECKED {
        if let Some(inferred) = table.infer_column_type(name) {
            if inferred != ColumnType::Text && inferred != ColumnType::Empty {
                report.fail(
                    log,
                    format!(
                        "invalid data type for {name}: expected text, got {}",
                        inferred.as_str()
                    ),
                );
            }
        }
    }
    if !report.passed {
        return report;
    }

    // 3. Empty values in required columns are tolerated; the natural key is
    //    the only hard requirement for addressability downstream.
    for name in columns::REQUIRED {
        if let Some(values) = table.column_values(name) {
            let empty = values.filter(|v| v.is_empty()).count();
            if empty > 0 {
                report.warn(log, format!("found {empty} empty values in {name}"));
            }
        }
    }

    // 4. Value ranges: unusable prices fail, zero-recorded sizes only warn.
    if let Some(values) = table.column_values(columns::CURRENT_PRICE) {
        let invalid = values
            .filter(|v| v.parse::<f64>().map(|p| p <= 0.0).unwrap_or(false))
            .count();
        if invalid > 0 {
            report.fail(log, format!("found {invalid} invalid prices (<= 0)"));
        }
    }
    if let Some(values) = table.column_values(columns::CONSTRUCTION_FT2) {
        let invalid = values
            .filter(|v| v.parse::<f64>().map(|s| s <= 0.0).unwrap_or(false))
            .count();
        if invalid > 0 {
            report.warn(
                log,
                format!("found {invalid} invalid construction sizes (<= 0)"),
            );
        }
    }

    // 5. In-batch duplicate keys resolve via upsert idempotency, not here.
    if let Some(values) = table.column_values(columns::LIST_NUMBER) {
        let mut seen = std::collections::HashSet::new();
        let duplicates = values
            .filter(|v| !v.is_empty())
            .filter(|v| !seen.insert(v.to_string()))
            .count();
        if duplicates > 0 {
            report.warn(log, format!("found {duplicates} duplicate listing numbers"));
        }
    }

    if report.passed {
        log.info("field verification completed successfully");
    }
    report
}

/// Columns written to the backup artifact, in order.
const BACKUP_HEADERS: &[&str] = &[
    "id",
    columns::LIST_NUMBER,
    columns::AGENCY_NAME,
    columns::AGENCY_PHONE,
    columns::LISTING_AGENT,
    columns::PROPERTY_TYPE,
    columns::STATUS,
    columns::DAYS_ON_MARKET,
    columns::AREA,
    columns::COMMUNITY,
    columns::INITIAL_PRICE,
    columns::CURRENT_PRICE,
    columns::SOLD_PRICE,
    columns::DEVELOPMENT_NAME,
    columns::STATE,
    columns::CONSTRUCTION_FT2,
    columns::CONSTRUCTION_M2,
    columns::LOT_MEASUREMENTS,
    columns::HALF_BATH,
    columns::FLOOR_NUMBER,
    columns::FURNISHED,
    "begin_date",
];

fn fmt_opt<T: ToString>(value: &Option<T>) -> String {
    value.as_ref().map(ToString::to_string).unwrap_or_default()
}

fn listings_to_table(listings: &[StoredListing]) -> SourceTable {
    let headers = BACKUP_HEADERS.iter().map(|h| h.to_string()).collect();
    let rows = listings
        .iter()
        .map(|l| {
            vec![
                l.id.to_string(),
                l.list_number.clone(),
                fmt_opt(&l.agency_name),
                fmt_opt(&l.agency_phone),
                fmt_opt(&l.listing_agent),
                fmt_opt(&l.property_type),
                fmt_opt(&l.status),
                fmt_opt(&l.days_on_market),
                fmt_opt(&l.area),
                fmt_opt(&l.community),
                fmt_opt(&l.initial_price),
                fmt_opt(&l.current_price),
                fmt_opt(&l.sold_price),
                fmt_opt(&l.development_name),
                fmt_opt(&l.state),
                fmt_opt(&l.construction_ft2),
                fmt_opt(&l.construction_m2),
                fmt_opt(&l.lot_measurements),
                fmt_opt(&l.half_bath),
                fmt_opt(&l.floor_number),
                fmt_opt(&l.furnished),
                l.begin_date.map(|d| d.to_rfc3339()).unwrap_or_default(),
            ]
        })
        .collect();
    SourceTable::new(headers, rows)
}

/// Snapshot the listings table to `backup_{stamp}.csv` under `data_dir`.
/// Failure is logged and swallowed: the import proceeds without a backup
/// rather than aborting.
pub async fn create_backup(pool: &SqlitePool, data_dir: &Path, stamp: &str) -> Option<PathBuf> {
    match try_create_backup(pool, data_dir, stamp).await {
        Ok(path) => {
            info!(path = %path.display(), "created pre-import backup");
            Some(path)
        }
        Err(err) => {
            warn!("could not create backup: {err:#}");
            None
        }
    }
}

async fn try_create_backup(
    pool: &SqlitePool,
    data_dir: &Path,
    stamp: &str,
) -> anyhow::Result<PathBuf> {
    let listings = fetch_all_listings(pool).await?;
    std::fs::create_dir_all(data_dir)?;
    let path = data_dir.join(format!("backup_{stamp}.csv"));
    write_table_csv(&listings_to_table(&listings), &path)?;
    Ok(path)
}

fn column_is_null(listing: &StoredListing, name: &str) -> bool {
    if name == columns::LIST_NUMBER {
        listing.list_number.trim().is_empty()
    } else if name == columns::PROPERTY_TYPE {
        listing.property_type.is_none()
    } else if name == columns::STATUS {
        listing.status.is_none()
    } else if name == columns::AREA {
        listing.area.is_none()
    } else {
        false
    }
}

/// Compare the persisted state against the source file after an import:
/// row counts (shrink is fatal), sampled inferred types per shared column
/// (warnings only) and unexpected NULLs in required columns (fatal).
pub async fn verify_import(
    source_path: &Path,
    pool: &SqlitePool,
    log: &mut RunLog,
) -> VerificationOutcome {
    log.info(&format!("reading source file: {}", source_path.display()));
    let source = match load_table(source_path) {
        Ok(table) => table,
        Err(err) => {
            let reason = format!("error during import verification: {err}");
            log.error(&reason);
            return VerificationOutcome::failed(reason);
        }
    };
    let source_count = source.row_count();
    log.info(&format!("source contains {source_count} records"));

    let db_count = match count_listings(pool).await {
        Ok(count) => count as usize,
        Err(err) => {
            let reason = format!("error during import verification: {err}");
            log.error(&reason);
            return VerificationOutcome::failed(reason);
        }
    };
    log.info(&format!("store contains {db_count} records"));

    if db_count < source_count {
        let reason =
            format!("missing records: source has {source_count} but store has {db_count}");
        log.error(&reason);
        return VerificationOutcome::failed(reason);
    }

    let sample = match sample_listings(pool, RECONCILE_SAMPLE_LIMIT).await {
        Ok(sample) => sample,
        Err(err) => {
            let reason = format!("error during import verification: {err}");
            log.error(&reason);
            return VerificationOutcome::failed(reason);
        }
    };
    let sample_table = listings_to_table(&sample);

    for header in sample_table.headers() {
        let Some(source_type) = source.infer_column_type(header) else {
            continue;
        };
        let Some(store_type) = sample_table.infer_column_type(header) else {
            continue;
        };
        if source_type == ColumnType::Empty || store_type == ColumnType::Empty {
            continue;
        }
        if source_type != store_type {
            log.warning(&format!(
                "data type mismatch for {header}: source={}, store={}",
                source_type.as_str(),
                store_type.as_str()
            ));
        }
    }

    let mut fields_with_nulls: Vec<&str> = Vec::new();
    for name in RECONCILE_NULL_CHECKED.iter().copied() {
        if sample.iter().any(|listing| column_is_null(listing, name)) {
            fields_with_nulls.push(name);
        }
    }
    if !fields_with_nulls.is_empty() {
        let reason = format!(
            "found null values in required fields: {}",
            fields_with_nulls.join(", ")
        );
        log.error(&reason);
        return VerificationOutcome::failed(reason);
    }

    log.info("import verification completed successfully");
    VerificationOutcome::Passed
}

/// Where one run reads from and writes to.
#[derive(Debug, Clone)]
pub struct ImportConfig {
    pub source_path: PathBuf,
    pub db_path: PathBuf,
    /// Backup artifacts land here.
    pub data_dir: PathBuf,
    /// Timestamp-named log artifacts land here.
    pub log_dir: PathBuf,
    pub batch_size: usize,
}

impl ImportConfig {
    pub fn new(source_path: impl Into<PathBuf>, db_path: impl Into<PathBuf>) -> Self {
        Self {
            source_path: source_path.into(),
            db_path: db_path.into(),
            data_dir: PathBuf::from("data"),
            log_dir: PathBuf::from("logs"),
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

/// Why a run could not complete, split by phase so callers can tell
/// "could not even start" from "started but something broke".
/// Reconciliation problems are not here: they ride in the report as a
/// verification outcome on an otherwise successful import.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("could not load source file: {0}")]
    Load(#[from] LoadError),
    #[error("field normalization failed: {0}")]
    Normalize(String),
    #[error("field validation failed: {reasons}")]
    Validation { reasons: String },
    #[error("could not open listing store: {0}")]
    Store(#[from] StoreError),
    #[error("import aborted after {rows_committed} rows committed: {source}")]
    Storage {
        rows_committed: usize,
        committed: ImportSummary,
        #[source]
        source: StoreError,
    },
    #[error("could not create run log: {0}")]
    Log(#[from] std::io::Error),
}

impl From<BatchFailure> for RunError {
    fn from(failure: BatchFailure) -> Self {
        Self::Storage {
            rows_committed: failure.rows_committed,
            committed: failure.committed,
            source: failure.source,
        }
    }
}

/// Everything a completed run reports back.
#[derive(Debug, Clone, Serialize)]
pub struct ImportReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub source_rows: usize,
    pub summary: ImportSummary,
    /// Validation gate findings (warnings survive a passing run).
    pub field_report: FieldReport,
    pub backup_path: Option<PathBuf>,
    pub processed_copy: Option<PathBuf>,
    pub field_log: PathBuf,
    pub import_log: PathBuf,
    /// JSON artifact of this report; `None` when the write failed.
    pub report_path: Option<PathBuf>,
    pub verification: VerificationOutcome,
}

/// One full ingestion-and-reconciliation run: load, normalize, validate,
/// back up, upsert in batches, reconcile. Strictly sequential; the store
/// connection is owned by the run for its whole duration.
pub struct ImportRun {
    config: ImportConfig,
    normalizer: Box<dyn FieldNormalizer>,
}

impl ImportRun {
    pub fn new(config: ImportConfig) -> Self {
        Self {
            config,
            normalizer: Box::new(AliasNormalizer),
        }
    }

    pub fn with_normalizer(mut self, normalizer: Box<dyn FieldNormalizer>) -> Self {
        self.normalizer = normalizer;
        self
    }

    pub async fn execute(&self) -> Result<ImportReport, RunError> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let stamp = started_at.format("%Y%m%d_%H%M%S").to_string();
        info!(%run_id, source = %self.config.source_path.display(), "starting import run");

        let raw = load_table(&self.config.source_path)?;
        info!(rows = raw.row_count(), "loaded source table");

        let table = self
            .normalizer
            .normalize(raw)
            .map_err(|err| RunError::Normalize(format!("{err:#}")))?;
        let source_rows = table.row_count();

        // Persisted audit copy of the normalized table. Best effort: the
        // copy aids audits, it does not gate the import.
        let copy_path = processed_copy_path(&self.config.source_path);
        let processed_copy = match write_table_csv(&table, &copy_path) {
            Ok(()) => Some(copy_path),
            Err(err) => {
                warn!("could not write processed copy: {err:#}");
                None
            }
        };

        let mut field_log = RunLog::create(&self.config.log_dir, "field_verification", &stamp)?;
        let field_report = verify_fields(&table, &mut field_log);
        if !field_report.passed {
            return Err(RunError::Validation {
                reasons: field_report.errors.join("; "),
            });
        }

        let pool = init_database(&self.config.db_path).await?;
        let backup_path = create_backup(&pool, &self.config.data_dir, &stamp).await;

        let rows = extract_rows(&table);
        let importer = BatchImporter::new(pool.clone(), self.config.batch_size);
        let summary = importer.run(&rows).await?;

        let mut import_log = RunLog::create(&self.config.log_dir, "import_verification", &stamp)?;
        let verification = verify_import(&self.config.source_path, &pool, &mut import_log).await;

        let finished_at = Utc::now();
        info!(
            %run_id,
            created = summary.created,
            updated = summary.updated,
            skipped = summary.skipped,
            verified = verification.is_passed(),
            "import run finished"
        );

        let mut report = ImportReport {
            run_id,
            started_at,
            finished_at,
            source_rows,
            summary,
            field_report,
            backup_path,
            processed_copy,
            field_log: field_log.path().to_path_buf(),
            import_log: import_log.path().to_path_buf(),
            report_path: None,
            verification,
        };

        // Machine-readable run record next to the logs. Best effort, like
        // the other side artifacts.
        let report_path = self.config.log_dir.join(format!("import_report_{stamp}.json"));
        match write_report_json(&report, &report_path) {
            Ok(()) => {
                info!(path = %report_path.display(), "wrote import report");
                report.report_path = Some(report_path);
            }
            Err(err) => warn!("could not write import report: {err:#}"),
        }

        Ok(report)
    }
}

fn write_report_json(report: &ImportReport, path: &Path) -> anyhow::Result<()> {
    let json = serde_json::to_vec_pretty(report)?;
    std::fs::write(path, json)?;
    Ok(())
}

/// Standalone reconciliation of an existing store against a source file,
/// without importing anything.
pub async fn verify_only(
    source_path: &Path,
    db_path: &Path,
    log_dir: &Path,
) -> Result<(VerificationOutcome, PathBuf), RunError> {
    let stamp = Utc::now().format("%Y%m%d_%H%M%S").to_string();
    let pool = init_database(db_path).await?;
    let mut log = RunLog::create(log_dir, "import_verification", &stamp)?;
    let outcome = verify_import(source_path, &pool, &mut log).await;
    Ok((outcome, log.path().to_path_buf()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn log_in(dir: &Path) -> RunLog {
        RunLog::create(dir, "field_verification", "19700101_000000").expect("run log")
    }

    fn table(headers: &[&str], rows: &[&[&str]]) -> SourceTable {
        SourceTable::new(
            headers.iter().map(|h| h.to_string()).collect(),
            rows.iter()
                .map(|r| r.iter().map(|c| c.to_string()).collect())
                .collect(),
        )
    }

    const VALID_HEADERS: &[&str] = &[
        "list_number",
        "agency_name",
        "status",
        "area",
        "current_price",
        "property_type",
        "construction_ft2",
    ];

    #[test]
    fn valid_table_passes() {
        let dir = tempdir().expect("tempdir");
        let mut log = log_in(dir.path());
        let t = table(
            VALID_HEADERS,
            &[&["A1", "Coastal", "Active", "North", "100000", "House", "1500"]],
        );
        let report = verify_fields(&t, &mut log);
        assert!(report.passed, "errors: {:?}", report.errors);
        assert!(report.warnings.is_empty());
    }

    #[test]
    fn missing_required_column_fails_with_names() {
        let dir = tempdir().expect("tempdir");
        let mut log = log_in(dir.path());
        let t = table(
            &["list_number", "agency_name", "area", "current_price", "property_type"],
            &[&["A1", "Coastal", "North", "100000", "House"]],
        );
        let report = verify_fields(&t, &mut log);
        assert!(!report.passed);
        assert!(report.errors[0].contains("status"));
    }

    #[test]
    fn non_positive_price_fails_but_size_only_warns() {
        let dir = tempdir().expect("tempdir");
        let mut log = log_in(dir.path());
        let t = table(
            VALID_HEADERS,
            &[&["A1", "Coastal", "Active", "North", "-5", "House", "0"]],
        );
        let report = verify_fields(&t, &mut log);
        assert!(!report.passed);
        assert!(report.errors.iter().any(|e| e.contains("invalid prices")));
        assert!(report
            .warnings
            .iter()
            .any(|w| w.contains("construction sizes")));
    }

    #[test]
    fn type_mismatch_fails() {
        let dir = tempdir().expect("tempdir");
        let mut log = log_in(dir.path());
        let t = table(
            VALID_HEADERS,
            &[&["A1", "Coastal", "Active", "North", "expensive", "House", "1500"]],
        );
        let report = verify_fields(&t, &mut log);
        assert!(!report.passed);
        assert!(report.errors[0].contains("current_price"));
    }

    #[test]
    fn duplicates_and_empty_required_values_warn_only() {
        let dir = tempdir().expect("tempdir");
        let mut log = log_in(dir.path());
        let t = table(
            VALID_HEADERS,
            &[
                &["A1", "Coastal", "Active", "North", "100000", "House", "1500"],
                &["A1", "", "Active", "North", "120000", "House", "1500"],
            ],
        );
        let report = verify_fields(&t, &mut log);
        assert!(report.passed);
        assert!(report
            .warnings
            .iter()
            .any(|w| w.contains("duplicate listing numbers")));
        assert!(report
            .warnings
            .iter()
            .any(|w| w.contains("empty values in agency_name")));
    }

    #[test]
    fn run_log_entries_are_appended() {
        let dir = tempdir().expect("tempdir");
        let mut log = log_in(dir.path());
        log.info("first");
        log.error("second");
        let text = std::fs::read_to_string(log.path()).expect("read log");
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains(" - INFO - first"));
        assert!(lines[1].contains(" - ERROR - second"));
    }
}
