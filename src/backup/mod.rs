pub(crate) mod db_dump;
mod logic;
pub(crate) mod s3_upload;

use crate::config::AppConfig;
use crate::errors::{AppError, Result};
use crate::storage::{DescriptorRecord, ObjectStore};
use crate::utils::confirm::ConfirmationProvider;

use db_dump::PgDump;

/// Dumps the source database into the configured storage key.
pub async fn run_backup_flow(
    config: &AppConfig,
    store: &dyn ObjectStore,
    confirm: &dyn ConfirmationProvider,
) -> Result<DescriptorRecord> {
    let source = config
        .source
        .as_ref()
        .ok_or_else(|| AppError::Configuration("backup requires a source database".into()))?;

    let engine = PgDump::locate(config.pg_bin_dir.as_deref())?;
    logic::perform_backup(
        store,
        &engine,
        confirm,
        source,
        &config.descriptor,
        config.tuning.compression_level,
    )
    .await
}
