// pgphase/src/utils/setting.rs
use sqlx::{Connection, PgConnection};

use crate::config::ConnectionProfile;
use crate::errors::{AppError, Result};

/// Opens a connection to `profile` and runs `SELECT 1`.
pub async fn check_db_connection(profile: &ConnectionProfile) -> Result<()> {
    let mut conn = PgConnection::connect_with(&profile.connect_options())
        .await
        .map_err(|e| AppError::Connectivity(format!("failed to connect to {}: {}", profile, e)))?;

    sqlx::query("SELECT 1")
        .execute(&mut conn)
        .await
        .map_err(|e| AppError::Connectivity(format!("{} did not answer: {}", profile, e)))?;

    if let Err(e) = conn.close().await {
        tracing::debug!("closing check connection to {} failed: {}", profile, e);
    }
    tracing::info!("✅ Successfully connected to {}", profile);
    Ok(())
}
