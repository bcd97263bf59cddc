pub(crate) mod db_restore;
pub(crate) mod logic;
pub(crate) mod manifest;
pub(crate) mod s3_download;
pub(crate) mod safety;
pub(crate) mod verification;

use crate::config::AppConfig;
use crate::errors::{AppError, Result};
use crate::storage::ObjectStore;
use crate::utils::confirm::ConfirmationProvider;

use db_restore::PgRestore;
use logic::{join_phases, PhaseOrchestrator, RestoreReport, RestoreState};
use safety::PgDestinationGuard;

/// Restores the configured artifact into the destination database, then
/// checks the result against the archive's listing.
pub async fn run_restore_flow(
    config: &AppConfig,
    store: &dyn ObjectStore,
    confirm: &dyn ConfirmationProvider,
) -> Result<RestoreReport> {
    let destination = config
        .destination
        .as_ref()
        .ok_or_else(|| AppError::Configuration("restore requires a destination database".into()))?;

    let engine = PgRestore::locate(config.pg_bin_dir.as_deref(), config.tuning.keep_ownership)?;
    let guard = PgDestinationGuard::new(&config.maintenance_db, &config.marker_schema);

    let mut report = RestoreReport::new();
    let outcome = PhaseOrchestrator::new(store, &engine, &guard, confirm)
        .run(
            &config.descriptor,
            destination,
            config.tuning.restore_parallelism,
            &mut report,
        )
        .await;
    if let RestoreState::Aborted { failed } = report.state {
        tracing::error!(
            "❌ Restore aborted in {} phase; completed phases: [{}]",
            failed,
            join_phases(&report.executed)
        );
    }
    outcome?;

    tracing::info!(
        "✅ Restore of {} into {} finished; executed [{}], skipped [{}]",
        config.descriptor.location,
        destination.database,
        join_phases(&report.executed),
        join_phases(&report.skipped)
    );
    verification::verify_restore(destination, &report.expected).await;
    Ok(report)
}
