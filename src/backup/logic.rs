// pgphase/src/backup/logic.rs
use chrono::Utc;
use tokio::time::Instant;

use crate::backup::db_dump::DumpEngine;
use crate::config::{BackupDescriptor, ConnectionProfile};
use crate::errors::Result;
use crate::storage::{DescriptorRecord, ObjectStore};
use crate::utils::confirm::{require_confirmation, ActionSummary, ConfirmationProvider};

/// Dumps `source` straight into the object store under `descriptor`.
///
/// The upload only becomes visible once pg_dump exits cleanly; the descriptor
/// sidecar is written after that.
pub async fn perform_backup(
    store: &dyn ObjectStore,
    engine: &dyn DumpEngine,
    confirm: &dyn ConfirmationProvider,
    source: &ConnectionProfile,
    descriptor: &BackupDescriptor,
    compression: u8,
) -> Result<DescriptorRecord> {
    let started = Instant::now();
    let existing = store.object_size(&descriptor.location).await?;
    if let Some(size) = existing {
        tracing::warn!("⚠️ A backup already exists at {} ({} bytes)", descriptor.location, size);
        require_confirmation(
            confirm,
            &ActionSummary {
                action: "overwrite existing backup".into(),
                source: source.to_string(),
                destination: descriptor.location.clone(),
                storage_key: descriptor.location.clone(),
            },
        )?;
    }

    let mut sink = store.upload(&descriptor.location, existing.is_some()).await?;
    let size = match engine.dump(source, compression, &mut sink).await {
        Ok(dumped) => {
            let stored = sink.finish().await?;
            tracing::debug!("pg_dump produced {} bytes, {} stored", dumped, stored);
            stored
        }
        Err(dump_error) => {
            tracing::error!("❌ Dump of {} failed, discarding the partial upload", source.database);
            // An uploader failure takes precedence over the dump error.
            sink.abort().await?;
            return Err(dump_error);
        }
    };

    let record = DescriptorRecord {
        database: descriptor.database.clone(),
        label: descriptor.label.clone(),
        key: descriptor.location.clone(),
        size_bytes: size,
        compression_level: compression,
        created_at: Utc::now(),
    };
    store.put_descriptor(&descriptor.metadata_location(), &record).await?;

    tracing::info!(
        "✅ Backup of {} stored at {} ({} bytes, {:.1}s)",
        descriptor.database,
        descriptor.location,
        size,
        started.elapsed().as_secs_f64()
    );
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::AppError;
    use crate::storage::testing::MemoryStore;
    use crate::utils::confirm::testing::FixedAnswer;
    use async_trait::async_trait;
    use tokio::io::{AsyncWrite, AsyncWriteExt};

    /// Writes a fixed body, optionally failing afterwards like a pg_dump that died mid-stream.
    struct CannedDump {
        body: Vec<u8>,
        fail: bool,
    }

    #[async_trait]
    impl DumpEngine for CannedDump {
        async fn dump(
            &self,
            _source: &ConnectionProfile,
            _compression: u8,
            sink: &mut (dyn AsyncWrite + Send + Unpin),
        ) -> Result<u64> {
            sink.write_all(&self.body).await?;
            if self.fail {
                return Err(AppError::PhaseExecution {
                    phase: "BACKUP".into(),
                    status: "exit code 1".into(),
                    stderr: "pg_dump: error: connection lost".into(),
                });
            }
            Ok(self.body.len() as u64)
        }
    }

    fn source() -> ConnectionProfile {
        ConnectionProfile::from_url("postgres://backup@db:5432/app").unwrap()
    }

    fn descriptor() -> BackupDescriptor {
        BackupDescriptor::new(None, "app", "nightly")
    }

    #[tokio::test]
    async fn test_backup_stores_archive_and_descriptor() -> anyhow::Result<()> {
        let store = MemoryStore::default();
        let engine = CannedDump { body: b"PGDMP archive".to_vec(), fail: false };
        let confirm = FixedAnswer::no();

        let record = perform_backup(&store, &engine, &confirm, &source(), &descriptor(), 6).await?;

        assert_eq!(store.object("app/nightly.dump"), Some(b"PGDMP archive".to_vec()));
        assert_eq!(record.size_bytes, 13);
        assert_eq!(record.compression_level, 6);
        let stored = store.descriptors.lock().unwrap().get("app/nightly.dump.meta.json").cloned();
        assert_eq!(stored, Some(record));
        assert_eq!(confirm.times_asked(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_dump_leaves_no_artifact() {
        let store = MemoryStore::default();
        let engine = CannedDump { body: b"PGDMP trunc".to_vec(), fail: true };

        let err = perform_backup(&store, &engine, &FixedAnswer::yes(), &source(), &descriptor(), 6)
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::PhaseExecution { ref phase, .. } if phase == "BACKUP"));
        assert_eq!(store.object("app/nightly.dump"), None);
        assert!(store.descriptors.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_existing_backup_needs_confirmation() -> anyhow::Result<()> {
        let store = MemoryStore::with_object("app/nightly.dump", b"old");
        let engine = CannedDump { body: b"PGDMP new".to_vec(), fail: false };

        let declined =
            perform_backup(&store, &engine, &FixedAnswer::no(), &source(), &descriptor(), 6).await;
        assert!(matches!(declined, Err(AppError::Cancelled(_))));
        assert_eq!(store.object("app/nightly.dump"), Some(b"old".to_vec()));

        let confirm = FixedAnswer::yes();
        perform_backup(&store, &engine, &confirm, &source(), &descriptor(), 6).await?;
        assert_eq!(store.object("app/nightly.dump"), Some(b"PGDMP new".to_vec()));
        assert_eq!(confirm.times_asked(), 1);
        Ok(())
    }
}
