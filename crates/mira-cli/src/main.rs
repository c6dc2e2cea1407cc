use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};
use mira_pipeline::{verify_only, ImportConfig, ImportRun, RunError};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "mira-cli")]
#[command(about = "MLS listing import and reconciliation")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Create the listing database and schema.
    InitDb {
        #[arg(long, default_value = "mira.db")]
        db: PathBuf,
    },
    /// Import a listing export file, then reconcile the store against it.
    Import {
        /// Delimited source file.
        #[arg(long)]
        file: PathBuf,
        #[arg(long, default_value = "mira.db")]
        db: PathBuf,
        /// Directory for backup snapshots.
        #[arg(long, default_value = "data")]
        data_dir: PathBuf,
        /// Directory for verification log artifacts.
        #[arg(long, default_value = "logs")]
        log_dir: PathBuf,
        /// Rows committed per transaction.
        #[arg(long, default_value_t = mira_store::DEFAULT_BATCH_SIZE)]
        batch_size: usize,
    },
    /// Reconcile an existing store against a source file without importing.
    Verify {
        #[arg(long)]
        file: PathBuf,
        #[arg(long, default_value = "mira.db")]
        db: PathBuf,
        #[arg(long, default_value = "logs")]
        log_dir: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::InitDb { db } => {
            mira_store::init_database(&db).await?;
            println!("database schema ready at {}", db.display());
            Ok(ExitCode::SUCCESS)
        }
        Commands::Import {
            file,
            db,
            data_dir,
            log_dir,
            batch_size,
        } => {
            let mut config = ImportConfig::new(file, db);
            config.data_dir = data_dir;
            config.log_dir = log_dir;
            config.batch_size = batch_size;

            match ImportRun::new(config).execute().await {
                Ok(report) => {
                    println!(
                        "import complete: run_id={} created={} updated={} skipped={}",
                        report.run_id,
                        report.summary.created,
                        report.summary.updated,
                        report.summary.skipped
                    );
                    if let Some(path) = &report.backup_path {
                        println!("backup: {}", path.display());
                    }
                    if let Some(path) = &report.report_path {
                        println!("report: {}", path.display());
                    }
                    match report.verification.reason() {
                        None => {
                            println!("import verification passed");
                            Ok(ExitCode::SUCCESS)
                        }
                        Some(reason) => {
                            // completed, but the store does not match the source
                            eprintln!("import verification failed: {reason}");
                            eprintln!("details: {}", report.import_log.display());
                            Ok(ExitCode::FAILURE)
                        }
                    }
                }
                Err(err @ (RunError::Load(_) | RunError::Normalize(_) | RunError::Validation { .. })) => {
                    eprintln!("import did not start: {err}");
                    Ok(ExitCode::FAILURE)
                }
                Err(RunError::Storage {
                    rows_committed,
                    committed,
                    source,
                }) => {
                    eprintln!(
                        "import aborted: {source} ({rows_committed} rows committed, created={} updated={})",
                        committed.created, committed.updated
                    );
                    Ok(ExitCode::FAILURE)
                }
                Err(err) => Err(err.into()),
            }
        }
        Commands::Verify { file, db, log_dir } => {
            let (outcome, log_path) = verify_only(&file, &db, &log_dir).await?;
            match outcome.reason() {
                None => {
                    println!("import verification passed");
                    Ok(ExitCode::SUCCESS)
                }
                Some(reason) => {
                    eprintln!("import verification failed: {reason}");
                    eprintln!("details: {}", log_path.display());
                    Ok(ExitCode::FAILURE)
                }
            }
        }
    }
}
