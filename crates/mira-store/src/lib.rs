//! SQLite-backed listing store: schema, taxonomy resolver, upsert engine
//! and the batch transaction controller.

use std::path::Path;

use chrono::{DateTime, Utc};
use mira_core::{FeatureTriple, ImportSummary, ListingRecord, ParsedRow, UpsertOutcome};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Sqlite, SqlitePool, Transaction};
use thiserror::Error;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "mira-store";

/// Rows committed per transaction. Policy value, not derived from input:
/// larger batches buy throughput at the cost of a wider rollback window
/// when a batch fails midway.
pub const DEFAULT_BATCH_SIZE: usize = 10;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Open (creating if needed) the listing database and ensure the schema.
///
/// The pool is capped at one connection: the import pipeline is a single
/// logical writer and concurrent runs against the same store are out of
/// scope.
pub async fn init_database(db_path: &Path) -> StoreResult<SqlitePool> {
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect(&db_url)
        .await?;

    sqlx::query("PRAGMA foreign_keys = ON").execute(&pool).await?;
    sqlx::query("PRAGMA journal_mode = WAL").execute(&pool).await?;
    sqlx::query("PRAGMA busy_timeout = 5000").execute(&pool).await?;

    ensure_schema(&pool).await?;
    Ok(pool)
}

/// Create all four tables idempotently. Structure and constraints only; all
/// mutation goes through the upsert engine and taxonomy resolver.
pub async fn ensure_schema(pool: &SqlitePool) -> StoreResult<()> {
    create_listings_table(pool).await?;
    create_feature_categories_table(pool).await?;
    create_features_table(pool).await?;
    create_listing_features_table(pool).await?;
    Ok(())
}

async fn create_listings_table(pool: &SqlitePool) -> StoreResult<()> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS listings (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            list_number TEXT NOT NULL UNIQUE,
            agency_name TEXT,
            agency_phone TEXT,
            listing_agent TEXT,
            property_type TEXT,
            status TEXT,
            days_on_market INTEGER,
            area TEXT,
            community TEXT,
            initial_price REAL,
            current_price REAL,
            sold_price REAL,
            development_name TEXT,
            state TEXT,
            construction_ft2 REAL,
            construction_m2 REAL,
            lot_measurements TEXT,
            half_bath INTEGER,
            floor_number INTEGER,
            furnished INTEGER,
            begin_date TEXT
        )",
    )
    .execute(pool)
    .await?;
    Ok(())
}

async fn create_feature_categories_table(pool: &SqlitePool) -> StoreResult<()> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS feature_categories (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE
        )",
    )
    .execute(pool)
    .await?;
    Ok(())
}

async fn create_features_table(pool: &SqlitePool) -> StoreResult<()> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS features (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            category_id INTEGER NOT NULL REFERENCES feature_categories(id),
            name TEXT NOT NULL,
            UNIQUE(category_id, name)
        )",
    )
    .execute(pool)
    .await?;
    Ok(())
}

async fn create_listing_features_table(pool: &SqlitePool) -> StoreResult<()> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS listing_features (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            listing_id INTEGER NOT NULL REFERENCES listings(id) ON DELETE CASCADE,
            feature_id INTEGER NOT NULL REFERENCES features(id),
            value TEXT
        )",
    )
    .execute(pool)
    .await?;
    Ok(())
}

/// Get-or-create a (category, feature) taxonomy pair and return the feature
/// id. Names are trimmed, otherwise matched exactly: "Pool" and "pool" are
/// distinct nodes. Safe to call repeatedly with identical arguments.
pub async fn resolve_feature(
    tx: &mut Transaction<'_, Sqlite>,
    category: &str,
    feature: &str,
) -> StoreResult<i64> {
    let category = category.trim();
    let feature = feature.trim();

    let category_id = match sqlx::query_scalar::<_, i64>(
        "SELECT id FROM feature_categories WHERE name = ?1",
    )
    .bind(category)
    .fetch_optional(&mut **tx)
    .await?
    {
        Some(id) => id,
        None => sqlx::query("INSERT INTO feature_categories (name) VALUES (?1)")
            .bind(category)
            .execute(&mut **tx)
            .await?
            .last_insert_rowid(),
    };

    let feature_id = match sqlx::query_scalar::<_, i64>(
        "SELECT id FROM features WHERE category_id = ?1 AND name = ?2",
    )
    .bind(category_id)
    .bind(feature)
    .fetch_optional(&mut **tx)
    .await?
    {
        Some(id) => id,
        None => sqlx::query("INSERT INTO features (category_id, name) VALUES (?1, ?2)")
            .bind(category_id)
            .bind(feature)
            .execute(&mut **tx)
            .await?
            .last_insert_rowid(),
    };

    Ok(feature_id)
}

/// Reconcile one normalized row against the store by natural key.
///
/// Every mapped attribute is overwritten with the incoming value, absent
/// values included (last-write-wins, no merge), and the listing's feature
/// associations are fully replaced by the freshly parsed set inside the
/// caller's transaction. After this returns, the stored feature set for
/// the key equals `features` exactly.
pub async fn apply_listing(
    tx: &mut Transaction<'_, Sqlite>,
    record: &ListingRecord,
    features: &[FeatureTriple],
) -> StoreResult<UpsertOutcome> {
    let existing = sqlx::query_scalar::<_, i64>("SELECT id FROM listings WHERE list_number = ?1")
        .bind(&record.list_number)
        .fetch_optional(&mut **tx)
        .await?;

    let (listing_id, outcome) = match existing {
        Some(id) => {
            update_listing(tx, id, record).await?;
            (id, UpsertOutcome::Updated)
        }
        None => (insert_listing(tx, record).await?, UpsertOutcome::Created),
    };

    sqlx::query("DELETE FROM listing_features WHERE listing_id = ?1")
        .bind(listing_id)
        .execute(&mut **tx)
        .await?;

    for triple in features {
        let feature_id = resolve_feature(tx, &triple.category, &triple.feature).await?;
        sqlx::query("INSERT INTO listing_features (listing_id, feature_id, value) VALUES (?1, ?2, ?3)")
            .bind(listing_id)
            .bind(feature_id)
            .bind(triple.value.trim())
            .execute(&mut **tx)
            .await?;
    }

    Ok(outcome)
}

async fn insert_listing(
    tx: &mut Transaction<'_, Sqlite>,
    record: &ListingRecord,
) -> StoreResult<i64> {
    let result = sqlx::query(
        "INSERT INTO listings (
            list_number, agency_name, agency_phone, listing_agent,
            property_type, status, days_on_market, area, community,
            initial_price, current_price, sold_price, development_name,
            state, construction_ft2, construction_m2, lot_measurements,
            half_bath, floor_number, furnished, begin_date
        ) VALUES (
            ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11,
            ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21
        )",
    )
    .bind(&record.list_number)
    .bind(&record.agency_name)
    .bind(&record.agency_phone)
    .bind(&record.listing_agent)
    .bind(&record.property_type)
    .bind(&record.status)
    .bind(record.days_on_market)
    .bind(&record.area)
    .bind(&record.community)
    .bind(record.initial_price)
    .bind(record.current_price)
    .bind(record.sold_price)
    .bind(&record.development_name)
    .bind(&record.state)
    .bind(record.construction_ft2)
    .bind(record.construction_m2)
    .bind(&record.lot_measurements)
    .bind(record.half_bath)
    .bind(record.floor_number)
    .bind(record.furnished)
    .bind(record.begin_date)
    .execute(&mut **tx)
    .await?;
    Ok(result.last_insert_rowid())
}

async fn update_listing(
    tx: &mut Transaction<'_, Sqlite>,
    listing_id: i64,
    record: &ListingRecord,
) -> StoreResult<()> {
    sqlx::query(
        "UPDATE listings SET
            list_number = ?1, agency_name = ?2, agency_phone = ?3,
            listing_agent = ?4, property_type = ?5, status = ?6,
            days_on_market = ?7, area = ?8, community = ?9,
            initial_price = ?10, current_price = ?11, sold_price = ?12,
            development_name = ?13, state = ?14, construction_ft2 = ?15,
            construction_m2 = ?16, lot_measurements = ?17, half_bath = ?18,
            floor_number = ?19, furnished = ?20, begin_date = ?21
        WHERE id = ?22",
    )
    .bind(&record.list_number)
    .bind(&record.agency_name)
    .bind(&record.agency_phone)
    .bind(&record.listing_agent)
    .bind(&record.property_type)
    .bind(&record.status)
    .bind(record.days_on_market)
    .bind(&record.area)
    .bind(&record.community)
    .bind(record.initial_price)
    .bind(record.current_price)
    .bind(record.sold_price)
    .bind(&record.development_name)
    .bind(&record.state)
    .bind(record.construction_ft2)
    .bind(record.construction_m2)
    .bind(&record.lot_measurements)
    .bind(record.half_bath)
    .bind(record.floor_number)
    .bind(record.furnished)
    .bind(record.begin_date)
    .bind(listing_id)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// One persisted listing row, as read back for backups and reconciliation.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct StoredListing {
    pub id: i64,
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

pub async fn count_listings(pool: &SqlitePool) -> StoreResult<i64> {
    Ok(sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM listings")
        .fetch_one(pool)
        .await?)
}

/// Full listing table in insertion order, for the pre-import backup.
pub async fn fetch_all_listings(pool: &SqlitePool) -> StoreResult<Vec<StoredListing>> {
    Ok(
        sqlx::query_as::<_, StoredListing>("SELECT * FROM listings ORDER BY id")
            .fetch_all(pool)
            .await?,
    )
}

/// Bounded sample used by reconciliation's type and null checks.
pub async fn sample_listings(pool: &SqlitePool, limit: i64) -> StoreResult<Vec<StoredListing>> {
    Ok(
        sqlx::query_as::<_, StoredListing>("SELECT * FROM listings ORDER BY id LIMIT ?1")
            .bind(limit)
            .fetch_all(pool)
            .await?,
    )
}

/// Fatal outcome of an interrupted import: the failing batch rolled back,
/// everything before it stayed committed.
#[derive(Debug, Error)]
#[error("storage failure after {rows_committed} rows committed: {source}")]
pub struct BatchFailure {
    pub rows_committed: usize,
    pub committed: ImportSummary,
    #[source]
    pub source: StoreError,
}

/// Drives the upsert engine over the full ordered row sequence, grouping
/// writes into fixed-size transactions. Owns the store connection for the
/// duration of the run.
pub struct BatchImporter {
    pool: SqlitePool,
    batch_size: usize,
}

impl BatchImporter {
    pub fn new(pool: SqlitePool, batch_size: usize) -> Self {
        Self {
            pool,
            batch_size: batch_size.max(1),
        }
    }

    /// Apply all rows. Rows without a natural key are skipped and counted;
    /// a storage error voids the current batch and surfaces as fatal with
    /// the counts committed before the failure.
    pub async fn run(&self, rows: &[ParsedRow]) -> Result<ImportSummary, BatchFailure> {
        let total = rows.len();
        let mut committed = ImportSummary::default();
        let mut rows_committed = 0usize;

        for chunk in rows.chunks(self.batch_size) {
            match self.apply_batch(chunk).await {
                Ok(batch) => {
                    committed.absorb(batch);
                    rows_committed += chunk.len();
                    info!(
                        processed = rows_committed,
                        total,
                        created = committed.created,
                        updated = committed.updated,
                        skipped = committed.skipped,
                        "committed batch"
                    );
                }
                Err(source) => {
                    return Err(BatchFailure {
                        rows_committed,
                        committed,
                        source,
                    });
                }
            }
        }

        Ok(committed)
    }

    async fn apply_batch(&self, chunk: &[ParsedRow]) -> StoreResult<ImportSummary> {
        let mut tx = self.pool.begin().await?;
        let mut summary = ImportSummary::default();
        for row in chunk {
            match &row.record {
                Some(record) => {
                    let outcome = apply_listing(&mut tx, record, &row.features).await?;
                    summary.record(outcome);
                }
                None => {
                    warn!(line = row.line, "row has no natural key; skipped");
                    summary.skipped += 1;
                }
            }
        }
        tx.commit().await?;
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{tempdir, TempDir};

    async fn test_pool() -> (TempDir, SqlitePool) {
        let dir = tempdir().expect("tempdir");
        let pool = init_database(&dir.path().join("mira.db"))
            .await
            .expect("init database");
        (dir, pool)
    }

    fn record(list_number: &str) -> ListingRecord {
        ListingRecord {
            list_number: list_number.to_string(),
            agency_name: Some("Coastal Realty".into()),
            status: Some("Active".into()),
            area: Some("North".into()),
            property_type: Some("House".into()),
            current_price: Some(250_000.0),
            ..Default::default()
        }
    }

    fn triple(category: &str, feature: &str, value: &str) -> FeatureTriple {
        FeatureTriple {
            category: category.into(),
            feature: feature.into(),
            value: value.into(),
        }
    }

    async fn feature_names_for(pool: &SqlitePool, list_number: &str) -> Vec<String> {
        let mut names = sqlx::query_scalar::<_, String>(
            "SELECT f.name FROM listing_features lf
             JOIN features f ON f.id = lf.feature_id
             JOIN listings l ON l.id = lf.listing_id
             WHERE l.list_number = ?1",
        )
        .bind(list_number)
        .fetch_all(pool)
        .await
        .expect("feature names");
        names.sort();
        names
    }

    #[tokio::test]
    async fn taxonomy_resolution_is_idempotent_and_case_sensitive() {
        let (_dir, pool) = test_pool().await;
        let mut tx = pool.begin().await.expect("begin");

        let first = resolve_feature(&mut tx, "Amenities", "Pool").await.expect("resolve");
        let second = resolve_feature(&mut tx, " Amenities ", "Pool ").await.expect("resolve");
        assert_eq!(first, second);

        let lower = resolve_feature(&mut tx, "Amenities", "pool").await.expect("resolve");
        assert_ne!(first, lower);
        tx.commit().await.expect("commit");

        let categories = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM feature_categories")
            .fetch_one(&pool)
            .await
            .expect("count");
        let features = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM features")
            .fetch_one(&pool)
            .await
            .expect("count");
        assert_eq!(categories, 1);
        assert_eq!(features, 2);
    }

    #[tokio::test]
    async fn upsert_replaces_feature_set_exactly() {
        let (_dir, pool) = test_pool().await;

        let mut tx = pool.begin().await.expect("begin");
        let outcome = apply_listing(
            &mut tx,
            &record("K1"),
            &[triple("Amenities", "A", "1"), triple("Amenities", "B", "1")],
        )
        .await
        .expect("apply");
        tx.commit().await.expect("commit");
        assert_eq!(outcome, UpsertOutcome::Created);
        assert_eq!(feature_names_for(&pool, "K1").await, vec!["A", "B"]);

        let mut tx = pool.begin().await.expect("begin");
        let outcome = apply_listing(
            &mut tx,
            &record("K1"),
            &[triple("Amenities", "B", "1"), triple("Amenities", "C", "1")],
        )
        .await
        .expect("apply");
        tx.commit().await.expect("commit");
        assert_eq!(outcome, UpsertOutcome::Updated);
        // {A,B} -> {B,C}: A removed, C added, B retained; never the union
        assert_eq!(feature_names_for(&pool, "K1").await, vec!["B", "C"]);
        assert_eq!(count_listings(&pool).await.expect("count"), 1);
    }

    #[tokio::test]
    async fn update_overwrites_with_absent_values() {
        let (_dir, pool) = test_pool().await;

        let mut tx = pool.begin().await.expect("begin");
        apply_listing(&mut tx, &record("K2"), &[]).await.expect("apply");
        tx.commit().await.expect("commit");

        let mut sparse = record("K2");
        sparse.agency_name = None;
        sparse.current_price = Some(199_000.0);
        let mut tx = pool.begin().await.expect("begin");
        apply_listing(&mut tx, &sparse, &[]).await.expect("apply");
        tx.commit().await.expect("commit");

        let rows = fetch_all_listings(&pool).await.expect("fetch");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].agency_name, None);
        assert_eq!(rows[0].current_price, Some(199_000.0));
    }

    #[tokio::test]
    async fn batch_importer_counts_and_skips() {
        let (_dir, pool) = test_pool().await;
        let rows = vec![
            ParsedRow {
                line: 1,
                record: Some(record("A1")),
                features: vec![triple("Amenities", "Pool", "Yes")],
            },
            ParsedRow {
                line: 2,
                record: None,
                features: vec![],
            },
            ParsedRow {
                line: 3,
                record: Some(record("A2")),
                features: vec![],
            },
        ];

        let importer = BatchImporter::new(pool.clone(), 2);
        let summary = importer.run(&rows).await.expect("run");
        assert_eq!(summary.created, 2);
        assert_eq!(summary.updated, 0);
        assert_eq!(summary.skipped, 1);

        // same rows again: idempotent, no accumulation
        let summary = importer.run(&rows).await.expect("run");
        assert_eq!(summary.created, 0);
        assert_eq!(summary.updated, 2);
        assert_eq!(summary.skipped, 1);
        assert_eq!(count_listings(&pool).await.expect("count"), 2);
        assert_eq!(feature_names_for(&pool, "A1").await, vec!["Pool"]);
    }

    #[tokio::test]
    async fn mid_batch_failure_rolls_back_batch_and_keeps_earlier_commits() {
        let (_dir, pool) = test_pool().await;
        // storage starts rejecting writes at one specific key
        sqlx::query(
            "CREATE TRIGGER reject_b3 BEFORE INSERT ON listings
             WHEN NEW.list_number = 'B3'
             BEGIN SELECT RAISE(ABORT, 'write rejected'); END",
        )
        .execute(&pool)
        .await
        .expect("create trigger");

        let rows: Vec<ParsedRow> = ["B0", "B1", "B2", "B3"]
            .iter()
            .enumerate()
            .map(|(idx, key)| ParsedRow {
                line: idx + 1,
                record: Some(record(key)),
                features: vec![triple("Amenities", "Pool", "Yes")],
            })
            .collect();

        let importer = BatchImporter::new(pool.clone(), 2);
        let failure = importer.run(&rows).await.expect_err("must fail");
        assert_eq!(failure.rows_committed, 2);
        assert_eq!(failure.committed.created, 2);
        assert_eq!(failure.committed.updated, 0);

        // the failing batch rolled back whole: B2 went down with B3
        assert_eq!(count_listings(&pool).await.expect("count"), 2);
        assert_eq!(feature_names_for(&pool, "B1").await, vec!["Pool"]);
        assert!(feature_names_for(&pool, "B2").await.is_empty());
    }

    #[tokio::test]
    async fn duplicate_keys_within_a_batch_resolve_by_upsert() {
        let (_dir, pool) = test_pool().await;
        let mut second = record("D1");
        second.current_price = Some(300_000.0);
        let rows = vec![
            ParsedRow {
                line: 1,
                record: Some(record("D1")),
                features: vec![],
            },
            ParsedRow {
                line: 2,
                record: Some(second),
                features: vec![],
            },
        ];

        let importer = BatchImporter::new(pool.clone(), DEFAULT_BATCH_SIZE);
        let summary = importer.run(&rows).await.expect("run");
        assert_eq!(summary.created, 1);
        assert_eq!(summary.updated, 1);

        let stored = fetch_all_listings(&pool).await.expect("fetch");
        assert_eq!(stored.len(), 1);
        // last write wins within the batch
        assert_eq!(stored[0].current_price, Some(300_000.0));
    }
}
