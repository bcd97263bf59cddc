// pgphase/src/backup/db_dump.rs
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWrite;
use tokio::process::Command;

use crate::config::ConnectionProfile;
use crate::errors::{AppError, Result};
use crate::utils::find_executable;
use crate::utils::process::{collect_stderr, describe_status, stderr_text};

/// Produces a custom-format archive of one database into `sink`.
#[async_trait]
pub trait DumpEngine: Send + Sync {
    /// Returns the number of bytes written to `sink`.
    async fn dump(
        &self,
        source: &ConnectionProfile,
        compression: u8,
        sink: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<u64>;
}

pub struct PgDump {
    binary: PathBuf,
}

impl PgDump {
    pub fn locate(bin_dir: Option<&Path>) -> Result<Self> {
        let binary = find_executable("pg_dump", bin_dir)?;
        tracing::debug!("Using pg_dump at {}", binary.display());
        Ok(PgDump { binary })
    }
}

fn dump_args(compression: u8) -> Vec<String> {
    vec![
        "--format=custom".to_string(),
        format!("--compress={}", compression),
        "--no-password".to_string(),
    ]
}

#[async_trait]
impl DumpEngine for PgDump {
    async fn dump(
        &self,
        source: &ConnectionProfile,
        compression: u8,
        sink: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<u64> {
        tracing::info!("Dumping {} with pg_dump (compression {})", source, compression);
        let mut child = Command::new(&self.binary)
            .args(dump_args(compression))
            .envs(source.engine_env())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| AppError::PhaseExecution {
                phase: "BACKUP".into(),
                status: "not started".into(),
                stderr: e.to_string(),
            })?;

        let stderr = collect_stderr(child.stderr.take());
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| AppError::Internal(anyhow::anyhow!("pg_dump stdout was not captured")))?;

        let copied = tokio::io::copy(&mut stdout, sink).await;
        drop(stdout);
        if copied.is_err() {
            // Nobody is reading any more; do not leave pg_dump blocked on a full pipe.
            child.start_kill().ok();
        }
        let status = child.wait().await?;
        let stderr = stderr_text(stderr).await;

        let written = copied.map_err(|e| {
            AppError::Storage(format!("writing archive to the upload stream failed: {}", e))
        })?;
        if !status.success() {
            return Err(AppError::PhaseExecution {
                phase: "BACKUP".into(),
                status: describe_status(&status),
                stderr,
            });
        }
        if !stderr.is_empty() {
            tracing::debug!("pg_dump stderr: {}", stderr);
        }
        Ok(written)
    }
}
