//! Phased PostgreSQL backup and restore through S3-compatible storage
//!
//! Provides CLI interface for backup, restore, or both in one run

// pgphase/src/main.rs
mod backup;
mod config;
mod errors;
mod restore;
mod storage;
mod utils;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{ArgGroup, Parser};
use tracing::Instrument;
use uuid::Uuid;

use config::{AppConfig, Mode};
use errors::{AppError, Result};
use storage::{ObjectStore, S3Store};
use utils::confirm::{AutoConfirm, ConfirmationProvider, StdinConfirmation};
use utils::logger;
use utils::retry::RetryPolicy;
use utils::setting::check_db_connection;

#[derive(Parser, Debug)]
#[command(
    name = "pgphase",
    version,
    about = "Phased logical backup and restore of a PostgreSQL database"
)]
#[command(group(ArgGroup::new("mode").required(true).args(["backup", "restore", "both"])))]
struct Args {
    /// Dump the source database into object storage
    #[arg(long)]
    backup: bool,

    /// Restore the stored archive into the destination database
    #[arg(long)]
    restore: bool,

    /// Backup, then restore the same label
    #[arg(long)]
    both: bool,

    #[arg(long)]
    skip_connectivity_checks: bool,

    /// Answer yes to every confirmation prompt
    #[arg(long)]
    force: bool,

    #[arg(long, short)]
    quiet: bool,

    #[arg(long)]
    debug: bool,

    /// Multipart chunk size, overrides STORAGE_CHUNK_SIZE_MB
    #[arg(long, value_name = "MB")]
    chunk_size_mb: Option<u64>,

    /// Load settings from this file instead of ./.env
    #[arg(long, value_name = "PATH")]
    env_file: Option<PathBuf>,
}

impl Args {
    fn mode(&self) -> Mode {
        if self.both {
            Mode::Both
        } else if self.backup {
            Mode::Backup
        } else {
            Mode::Restore
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    if let Err(e) = logger::init(logger::level_for(args.quiet, args.debug)) {
        eprintln!("❌ Failed to initialise logging: {}", e);
    }

    let span = tracing::info_span!("run", id = %Uuid::new_v4());
    let interrupted = async {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };

    let outcome = tokio::select! {
        result = run_app(&args).instrument(span) => result,
        _ = interrupted => Err(AppError::Cancelled("interrupted by signal".into())),
    };

    match outcome {
        Ok(()) => {
            tracing::info!("✅ Operation completed successfully.");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!("❌ {}", e);
            ExitCode::from(&e)
        }
    }
}

async fn run_app(args: &Args) -> Result<()> {
    let mode = args.mode();
    let config = AppConfig::from_env(mode, args.env_file.as_ref())?
        .with_chunk_size_mb(args.chunk_size_mb)?;
    tracing::info!(
        "🚀 Starting {} of {} (label {})",
        mode,
        config.descriptor.database,
        config.descriptor.label
    );

    let policy = RetryPolicy::new(config.tuning.max_attempts, config.tuning.retry_backoff);
    let store = S3Store::connect(&config.storage, policy, config.tuning.chunk_size).await?;

    if args.skip_connectivity_checks {
        tracing::warn!("⚠️ Connectivity checks skipped");
    } else {
        preflight(&config, &store).await?;
    }

    let confirm: Box<dyn ConfirmationProvider> = if args.force {
        Box::new(AutoConfirm)
    } else {
        Box::new(StdinConfirmation)
    };

    if mode.runs_backup() {
        backup::run_backup_flow(&config, &store, confirm.as_ref()).await?;
    }
    if mode.runs_restore() {
        restore::run_restore_flow(&config, &store, confirm.as_ref()).await?;
    }
    Ok(())
}

/// Checks every endpoint the selected mode touches before any work starts.
async fn preflight(config: &AppConfig, store: &dyn ObjectStore) -> Result<()> {
    if let Some(source) = &config.source {
        check_db_connection(source).await?;
    }
    if let Some(destination) = &config.destination {
        // The destination database may not exist yet.
        check_db_connection(&destination.with_database(&config.maintenance_db)).await?;
    }
    store.check_bucket().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_exactly_one_mode() {
        assert!(Args::try_parse_from(["pgphase"]).is_err());
        assert!(Args::try_parse_from(["pgphase", "--backup", "--restore"]).is_err());

        let args =
            Args::try_parse_from(["pgphase", "--both", "--force", "--chunk-size-mb", "128"])
                .unwrap();
        assert_eq!(args.mode(), Mode::Both);
        assert_eq!(args.chunk_size_mb, Some(128));
        assert!(args.force);
    }
}
