// pgphase/src/restore/logic.rs
//! Four-phase restore: SCHEMA, INDEX, DATA, POST_DATA, strictly in that order.
use std::fmt;

use crate::config::{BackupDescriptor, ConnectionProfile};
use crate::errors::{AppError, Result};
use crate::restore::db_restore::{PhaseRequest, RestoreEngine, SectionSelector};
use crate::restore::manifest::{Manifest, ObjectCounts, PostDataPartition, Section};
use crate::restore::safety::{prepare_destination, DestinationGuard};
use crate::storage::ObjectStore;
use crate::utils::confirm::{ActionSummary, ConfirmationProvider};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Schema,
    Index,
    Data,
    PostData,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Phase::Schema => "SCHEMA",
            Phase::Index => "INDEX",
            Phase::Data => "DATA",
            Phase::PostData => "POST_DATA",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreState {
    SchemaPending,
    IndexPending,
    DataPending,
    PostDataPending,
    Done,
    Aborted { failed: Phase },
}

impl RestoreState {
    /// The phase this state waits on, if any.
    pub fn pending(&self) -> Option<Phase> {
        match self {
            RestoreState::SchemaPending => Some(Phase::Schema),
            RestoreState::IndexPending => Some(Phase::Index),
            RestoreState::DataPending => Some(Phase::Data),
            RestoreState::PostDataPending => Some(Phase::PostData),
            RestoreState::Done | RestoreState::Aborted { .. } => None,
        }
    }

    /// State after the pending phase finished or was skipped.
    fn advance(self) -> Self {
        match self {
            RestoreState::SchemaPending => RestoreState::IndexPending,
            RestoreState::IndexPending => RestoreState::DataPending,
            RestoreState::DataPending => RestoreState::PostDataPending,
            RestoreState::PostDataPending => RestoreState::Done,
            terminal => terminal,
        }
    }
}

/// Progress of one restore. Filled in as the run goes, so it stays
/// meaningful when the run fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreReport {
    pub state: RestoreState,
    pub executed: Vec<Phase>,
    pub skipped: Vec<Phase>,
    pub expected: ObjectCounts,
}

impl RestoreReport {
    pub fn new() -> Self {
        RestoreReport {
            state: RestoreState::SchemaPending,
            executed: Vec::new(),
            skipped: Vec::new(),
            expected: ObjectCounts::default(),
        }
    }
}

impl Default for RestoreReport {
    fn default() -> Self {
        Self::new()
    }
}

/// Drives one restore of one artifact into one destination.
pub struct PhaseOrchestrator<'a> {
    store: &'a dyn ObjectStore,
    engine: &'a dyn RestoreEngine,
    guard: &'a dyn DestinationGuard,
    confirm: &'a dyn ConfirmationProvider,
}

impl<'a> PhaseOrchestrator<'a> {
    pub fn new(
        store: &'a dyn ObjectStore,
        engine: &'a dyn RestoreEngine,
        guard: &'a dyn DestinationGuard,
        confirm: &'a dyn ConfirmationProvider,
    ) -> Self {
        PhaseOrchestrator { store, engine, guard, confirm }
    }

    /// Runs every phase, recording progress in `report`. On failure the
    /// report is left in [`RestoreState::Aborted`] once any phase has been tried.
    pub async fn run(
        &self,
        descriptor: &BackupDescriptor,
        destination: &ConnectionProfile,
        parallelism: u32,
        report: &mut RestoreReport,
    ) -> Result<()> {
        let size = self.verify_artifact(descriptor).await?;
        tracing::info!(
            "Restoring s3 object {} ({} bytes) into {}",
            descriptor.location,
            size,
            destination
        );

        let summary = ActionSummary {
            action: "restore into existing database".into(),
            source: format!("{} ({})", descriptor.database, descriptor.label),
            destination: destination.to_string(),
            storage_key: descriptor.location.clone(),
        };
        prepare_destination(self.guard, self.confirm, destination, &summary).await?;

        let manifest = self.load_manifest(descriptor).await?;
        let partition = manifest.partition();
        tracing::info!(
            "Manifest: {} entries, {} index / {} other post-data",
            manifest.entries().len(),
            partition.index_only.len(),
            partition.other_post_data.len()
        );

        report.expected = manifest.counts();

        while let Some(phase) = report.state.pending() {
            let Some(selector) = selector_for(phase, &partition) else {
                tracing::info!("⏭️  {} phase skipped: nothing to restore", phase);
                report.skipped.push(phase);
                report.state = report.state.advance();
                continue;
            };

            tracing::info!("▶️  {} phase starting", phase);
            let request = PhaseRequest { phase, selector, destination, parallelism };
            let outcome = match self.store.download(&descriptor.location).await {
                Ok(archive) => self.engine.apply_section(archive, &request).await,
                Err(e) => Err(e),
            };

            if let Err(e) = outcome {
                report.state = RestoreState::Aborted { failed: phase };
                tracing::error!(
                    "❌ {} phase failed; destination {} is left as is",
                    phase,
                    destination.database
                );
                return Err(e);
            }
            tracing::info!("✅ {} phase complete", phase);
            report.executed.push(phase);
            report.state = report.state.advance();
        }

        Ok(())
    }

    /// Confirms the artifact exists and matches its descriptor sidecar.
    async fn verify_artifact(&self, descriptor: &BackupDescriptor) -> Result<u64> {
        let size = self.store.object_size(&descriptor.location).await?.ok_or_else(|| {
            AppError::Storage(format!("no backup found at {}", descriptor.location))
        })?;

        match self.store.get_descriptor(&descriptor.metadata_location()).await? {
            Some(record) if record.size_bytes != size => Err(AppError::Storage(format!(
                "{} is {} bytes but its descriptor records {} bytes; \
                 refusing to restore a modified or partial artifact",
                descriptor.location, size, record.size_bytes
            ))),
            Some(record) => {
                tracing::debug!(
                    "Artifact matches descriptor (created {}, compression {})",
                    record.created_at,
                    record.compression_level
                );
                Ok(size)
            }
            None => {
                tracing::warn!(
                    "⚠️ No descriptor at {}; the artifact size cannot be verified",
                    descriptor.metadata_location()
                );
                Ok(size)
            }
        }
    }

    async fn load_manifest(&self, descriptor: &BackupDescriptor) -> Result<Manifest> {
        let archive = self.store.download(&descriptor.location).await?;
        let listing = self.engine.list_manifest(archive).await?;
        Manifest::parse(&listing)
    }
}

fn selector_for(phase: Phase, partition: &PostDataPartition) -> Option<SectionSelector<'_>> {
    match phase {
        Phase::Schema => Some(SectionSelector::Whole(Section::PreData)),
        Phase::Index if partition.index_only.is_empty() => None,
        Phase::Index => Some(SectionSelector::Subset(&partition.index_only)),
        Phase::Data => Some(SectionSelector::Whole(Section::Data)),
        Phase::PostData => Some(SectionSelector::Subset(&partition.other_post_data)),
    }
}

pub(crate) fn join_phases(phases: &[Phase]) -> String {
    phases.iter().map(Phase::to_string).collect::<Vec<_>>().join(", ")
}
