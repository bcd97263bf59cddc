// pgphase/src/restore/db_restore.rs
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tempfile::NamedTempFile;
use tokio::io::AsyncReadExt;
use tokio::process::Command;

use crate::config::ConnectionProfile;
use crate::errors::{AppError, Result};
use crate::restore::logic::Phase;
use crate::restore::manifest::{ManifestEntry, Section};
use crate::restore::s3_download::{pump, StreamOutcome};
use crate::storage::ArchiveSource;
use crate::utils::find_executable;
use crate::utils::process::{collect_stderr, describe_status, stderr_text};

/// Which part of the archive a phase applies.
#[derive(Debug, Clone, Copy)]
pub enum SectionSelector<'a> {
    Whole(Section),
    /// Exactly these entries, in listing order.
    Subset(&'a [ManifestEntry]),
}

#[derive(Debug, Clone, Copy)]
pub struct PhaseRequest<'a> {
    pub phase: Phase,
    pub selector: SectionSelector<'a>,
    pub destination: &'a ConnectionProfile,
    pub parallelism: u32,
}

/// The external restore engine, fed one archive stream per call.
#[async_trait]
pub trait RestoreEngine: Send + Sync {
    /// Returns the raw `--list --verbose` output for the archive.
    async fn list_manifest(&self, archive: ArchiveSource) -> Result<String>;

    async fn apply_section(&self, archive: ArchiveSource, request: &PhaseRequest<'_>) -> Result<()>;
}

/// `pg_restore` driven through stdin.
pub struct PgRestore {
    binary: PathBuf,
    keep_ownership: bool,
}

impl PgRestore {
    pub fn locate(bin_dir: Option<&Path>, keep_ownership: bool) -> Result<Self> {
        let binary = find_executable("pg_restore", bin_dir)?;
        tracing::debug!("Using pg_restore at {}", binary.display());
        Ok(PgRestore { binary, keep_ownership })
    }
}

#[async_trait]
impl RestoreEngine for PgRestore {
    async fn list_manifest(&self, mut archive: ArchiveSource) -> Result<String> {
        let mut child = Command::new(&self.binary)
            .args(["--list", "--verbose", "--format=custom"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| AppError::Manifest(format!("failed to start pg_restore: {}", e)))?;

        let stderr = collect_stderr(child.stderr.take());
        let (Some(mut stdin), Some(mut stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(AppError::Manifest("pg_restore pipes were not available".into()));
        };

        let feed = async move {
            let outcome = pump(&mut archive, &mut stdin).await;
            drop(stdin);
            outcome
        };
        let read = async move {
            let mut listing = String::new();
            stdout.read_to_string(&mut listing).await.map(|_| listing)
        };
        let (fed, listing, status) = tokio::join!(feed, read, child.wait());
        let status = status?;
        let stderr = stderr_text(stderr).await;

        if !status.success() {
            let mut message =
                format!("pg_restore --list failed ({}): {}", describe_status(&status), stderr);
            if let Err(e) = &fed {
                message.push_str(&format!("; {}", e));
            }
            return Err(AppError::Manifest(message));
        }
        let outcome = fed?;
        log_transfer("manifest", &outcome);
        Ok(listing?)
    }

    async fn apply_section(
        &self,
        mut archive: ArchiveSource,
        request: &PhaseRequest<'_>,
    ) -> Result<()> {
        let use_list = match request.selector {
            SectionSelector::Subset(entries) => Some(write_use_list(entries)?),
            SectionSelector::Whole(_) => None,
        };
        let jobs = effective_jobs(request.parallelism);
        let args = restore_args(
            request,
            use_list.as_ref().map(|file| file.path()),
            self.keep_ownership,
        );
        tracing::debug!(phase = %request.phase, jobs, "pg_restore {}", args.join(" "));

        let mut child = Command::new(&self.binary)
            .args(&args)
            .envs(request.destination.engine_env())
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| AppError::PhaseExecution {
                phase: request.phase.to_string(),
                status: "not started".into(),
                stderr: e.to_string(),
            })?;

        let stderr = collect_stderr(child.stderr.take());
        let mut stdin = child.stdin.take().ok_or_else(|| {
            AppError::Internal(anyhow::anyhow!("pg_restore stdin was not captured"))
        })?;

        let feed = async move {
            let outcome = pump(&mut archive, &mut stdin).await;
            drop(stdin);
            outcome
        };
        let (fed, status) = tokio::join!(feed, child.wait());
        let status = status?;
        let stderr = stderr_text(stderr).await;
        // The use-list has to outlive the child.
        drop(use_list);

        if !status.success() {
            let mut detail = stderr;
            if let Err(e) = &fed {
                detail.push_str(&format!("\n{}", e));
            }
            return Err(AppError::PhaseExecution {
                phase: request.phase.to_string(),
                status: describe_status(&status),
                stderr: detail,
            });
        }
        let outcome = fed?;
        log_transfer(&request.phase.to_string(), &outcome);
        if !stderr.is_empty() {
            tracing::debug!(phase = %request.phase, "pg_restore stderr: {}", stderr);
        }
        Ok(())
    }
}

fn log_transfer(what: &str, outcome: &StreamOutcome) {
    match outcome {
        StreamOutcome::Completed { bytes } => {
            tracing::debug!("{}: streamed full archive ({} bytes)", what, bytes)
        }
        StreamOutcome::ConsumerClosed { bytes } => {
            tracing::debug!("{}: pg_restore stopped reading after {} bytes", what, bytes)
        }
    }
}

/// A stdin archive cannot be read out of order, so parallel restore is unavailable.
fn effective_jobs(requested: u32) -> u32 {
    if requested > 1 {
        tracing::warn!(
            "⚠️ RESTORE_PARALLELISM={} ignored: \
             the archive is streamed and cannot be restored with parallel jobs",
            requested
        );
    }
    1
}

fn write_use_list(entries: &[ManifestEntry]) -> Result<NamedTempFile> {
    let mut file = tempfile::Builder::new()
        .prefix("pgphase-")
        .suffix(".list")
        .tempfile()?;
    for entry in entries {
        tracing::trace!(
            "use-list {} {} {}.{} owner={} depends on {:?}",
            entry.dump_id,
            entry.kind,
            entry.namespace,
            entry.name,
            entry.owner,
            entry.dependencies
        );
        writeln!(file, "{}", entry.line)?;
    }
    file.flush()?;
    Ok(file)
}

fn restore_args(
    request: &PhaseRequest<'_>,
    use_list: Option<&Path>,
    keep_ownership: bool,
) -> Vec<String> {
    let mut args = vec![
        "--format=custom".to_string(),
        "--exit-on-error".to_string(),
        "--no-password".to_string(),
        format!("--dbname={}", request.destination.database),
    ];
    if !keep_ownership {
        args.push("--no-owner".into());
        args.push("--no-privileges".into());
    }
    match (request.selector, use_list) {
        (SectionSelector::Whole(section), _) => {
            args.push(format!("--section={}", section.as_flag()))
        }
        (SectionSelector::Subset(_), Some(path)) => {
            args.push(format!("--use-list={}", path.display()))
        }
        (SectionSelector::Subset(_), None) => {}
    }
    args
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::restore::manifest::{fixtures::APP_LISTING, Manifest};

    fn destination() -> ConnectionProfile {
        ConnectionProfile::from_url("postgres://restorer:pw@db.internal:5433/app_copy").unwrap()
    }

    #[test]
    fn test_whole_section_args() {
        let dest = destination();
        let request = PhaseRequest {
            phase: Phase::Schema,
            selector: SectionSelector::Whole(Section::PreData),
            destination: &dest,
            parallelism: 1,
        };
        let args = restore_args(&request, None, false);
        assert!(args.contains(&"--section=pre-data".to_string()));
        assert!(args.contains(&"--exit-on-error".to_string()));
        assert!(args.contains(&"--dbname=app_copy".to_string()));
        assert!(args.contains(&"--no-owner".to_string()));
        assert!(!args.iter().any(|a| a.contains("pw")));
    }

    #[test]
    fn test_keep_ownership_drops_no_owner() {
        let dest = destination();
        let request = PhaseRequest {
            phase: Phase::Data,
            selector: SectionSelector::Whole(Section::Data),
            destination: &dest,
            parallelism: 1,
        };
        let args = restore_args(&request, None, true);
        assert!(!args.contains(&"--no-owner".to_string()));
        assert!(!args.contains(&"--no-privileges".to_string()));
        assert!(args.contains(&"--section=data".to_string()));
    }

    #[test]
    fn test_use_list_holds_subset_lines() -> anyhow::Result<()> {
        let manifest = Manifest::parse(APP_LISTING)?;
        let partition = manifest.partition();
        let file = write_use_list(&partition.index_only)?;
        let written = std::fs::read_to_string(file.path())?;
        assert_eq!(
            written,
            "3251; 1259 16397 INDEX public users_email_idx app\n\
             3252; 1259 16398 INDEX billing invoices_user_idx app\n"
        );

        let dest = destination();
        let request = PhaseRequest {
            phase: Phase::Index,
            selector: SectionSelector::Subset(&partition.index_only),
            destination: &dest,
            parallelism: 4,
        };
        let args = restore_args(&request, Some(file.path()), false);
        assert!(args.iter().any(|a| a.starts_with("--use-list=")));
        assert!(!args.iter().any(|a| a.starts_with("--section")));
        Ok(())
    }

    #[test]
    fn test_parallelism_is_clamped() {
        assert_eq!(effective_jobs(8), 1);
        assert_eq!(effective_jobs(1), 1);
    }
}
