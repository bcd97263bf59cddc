// pgphase/src/restore/safety.rs
use async_trait::async_trait;
use sqlx::{Connection, PgConnection};

use crate::config::ConnectionProfile;
use crate::errors::{AppError, Result};
use crate::utils::confirm::{require_confirmation, ActionSummary, ConfirmationProvider};

/// Every database starts with this schema, so only its contents can mark it as in use.
const PUBLIC_SCHEMA: &str = "public";

/// Objects in the marker schema that were not installed by an extension:
/// tables, partitioned tables, views, materialized views, sequences, foreign
/// tables, composite types, functions and the remaining non-array types.
/// Yields no row when the schema does not exist.
const MARKER_OBJECTS_SQL: &str = "\
SELECT
    (SELECT count(*) FROM pg_class c
      WHERE c.relnamespace = n.oid AND c.relkind IN ('r', 'p', 'v', 'm', 'S', 'f', 'c')
        AND NOT EXISTS (SELECT 1 FROM pg_depend d WHERE d.classid = 'pg_class'::regclass
                        AND d.objid = c.oid AND d.deptype = 'e'))
  + (SELECT count(*) FROM pg_proc p
      WHERE p.pronamespace = n.oid
        AND NOT EXISTS (SELECT 1 FROM pg_depend d WHERE d.classid = 'pg_proc'::regclass
                        AND d.objid = p.oid AND d.deptype = 'e'))
  + (SELECT count(*) FROM pg_type t
      WHERE t.typnamespace = n.oid AND t.typrelid = 0 AND t.typcategory <> 'A'
        AND NOT EXISTS (SELECT 1 FROM pg_depend d WHERE d.classid = 'pg_type'::regclass
                        AND d.objid = t.oid AND d.deptype = 'e'))
FROM pg_namespace n
WHERE n.nspname = $1";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestinationState {
    Absent,
    Empty,
    /// The marker schema is present; `objects` is what it holds.
    Occupied { objects: i64 },
}

/// Classifies an existing database from its marker schema.
///
/// `marker_objects` is `None` when the schema does not exist. A dedicated
/// marker schema counts as present as soon as it exists; `public` only once
/// it holds something.
pub fn classify(marker_schema: &str, marker_objects: Option<i64>) -> DestinationState {
    match marker_objects {
        None => DestinationState::Empty,
        Some(objects) if marker_schema != PUBLIC_SCHEMA => DestinationState::Occupied { objects },
        Some(objects) if objects > 0 => DestinationState::Occupied { objects },
        Some(_) => DestinationState::Empty,
    }
}

#[async_trait]
pub trait DestinationGuard: Send + Sync {
    async fn inspect(&self, destination: &ConnectionProfile) -> Result<DestinationState>;

    /// Creates the destination database, owned by the restoring principal.
    async fn create(&self, destination: &ConnectionProfile) -> Result<()>;
}

pub struct PgDestinationGuard {
    maintenance_db: String,
    marker_schema: String,
}

impl PgDestinationGuard {
    pub fn new(maintenance_db: &str, marker_schema: &str) -> Self {
        PgDestinationGuard {
            maintenance_db: maintenance_db.to_string(),
            marker_schema: marker_schema.to_string(),
        }
    }

    async fn connect(profile: &ConnectionProfile) -> Result<PgConnection> {
        PgConnection::connect_with(&profile.connect_options())
            .await
            .map_err(|e| AppError::Connectivity(format!("cannot connect to {}: {}", profile, e)))
    }
}

#[async_trait]
impl DestinationGuard for PgDestinationGuard {
    async fn inspect(&self, destination: &ConnectionProfile) -> Result<DestinationState> {
        let maintenance = destination.with_database(&self.maintenance_db);
        let mut admin = Self::connect(&maintenance).await?;
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM pg_database WHERE datname = $1)")
                .bind(&destination.database)
                .fetch_one(&mut admin)
                .await?;
        admin.close().await.ok();

        if !exists {
            return Ok(DestinationState::Absent);
        }

        let mut conn = Self::connect(destination).await?;
        let marker_objects: Option<i64> = sqlx::query_scalar(MARKER_OBJECTS_SQL)
            .bind(&self.marker_schema)
            .fetch_optional(&mut conn)
            .await?;
        conn.close().await.ok();

        match marker_objects {
            Some(objects) => tracing::debug!(
                "Destination {} has schema {} with {} object(s)",
                destination.database,
                self.marker_schema,
                objects
            ),
            None => tracing::debug!(
                "Destination {} has no schema {}",
                destination.database,
                self.marker_schema
            ),
        }
        Ok(classify(&self.marker_schema, marker_objects))
    }

    async fn create(&self, destination: &ConnectionProfile) -> Result<()> {
        let maintenance = destination.with_database(&self.maintenance_db);
        let mut admin = Self::connect(&maintenance).await?;
        let sql = format!(
            "CREATE DATABASE {} OWNER {}",
            quote_ident(&destination.database),
            quote_ident(&destination.principal)
        );
        sqlx::query(&sql).execute(&mut admin).await?;
        admin.close().await.ok();
        tracing::info!("✅ Created database {}", destination.database);
        Ok(())
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Makes sure a restore may write into `destination`, creating it when absent.
///
/// Runs before anything is handed to the restore engine.
pub async fn prepare_destination(
    guard: &dyn DestinationGuard,
    confirm: &dyn ConfirmationProvider,
    destination: &ConnectionProfile,
    summary: &ActionSummary,
) -> Result<DestinationState> {
    let state = guard.inspect(destination).await?;
    match state {
        DestinationState::Absent => {
            tracing::info!(
                "Destination database {} does not exist, creating it",
                destination.database
            );
            guard.create(destination).await?;
        }
        DestinationState::Occupied { objects } => {
            return Err(AppError::SafetyViolation(format!(
                "destination database '{}' already has the application schema ({} object(s)); \
                 restore only targets new or empty databases",
                destination.database, objects
            )));
        }
        DestinationState::Empty => {
            tracing::warn!("Destination database {} exists but is empty", destination.database);
            require_confirmation(confirm, summary)?;
        }
    }
    Ok(state)
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Reports a fixed state and records creations.
    pub struct FixedDestination {
        pub state: DestinationState,
        pub created: Mutex<Vec<String>>,
    }

    impl FixedDestination {
        pub fn new(state: DestinationState) -> Self {
            FixedDestination { state, created: Mutex::new(Vec::new()) }
        }
    }

    #[async_trait]
    impl DestinationGuard for FixedDestination {
        async fn inspect(&self, _destination: &ConnectionProfile) -> Result<DestinationState> {
            Ok(self.state)
        }

        async fn create(&self, destination: &ConnectionProfile) -> Result<()> {
            self.created.lock().unwrap().push(destination.database.clone());
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::FixedDestination;
    use super::*;
    use crate::utils::confirm::testing::FixedAnswer;

    fn destination() -> ConnectionProfile {
        ConnectionProfile::from_url("postgres://restorer@localhost:5432/app_copy").unwrap()
    }

    fn summary() -> ActionSummary {
        ActionSummary {
            action: "restore into existing database".into(),
            source: "s3://bucket/app/nightly.dump".into(),
            destination: "restorer@localhost:5432/app_copy".into(),
            storage_key: "app/nightly.dump".into(),
        }
    }

    #[tokio::test]
    async fn test_absent_destination_is_created_without_prompt() -> anyhow::Result<()> {
        let guard = FixedDestination::new(DestinationState::Absent);
        let confirm = FixedAnswer::no();
        let state = prepare_destination(&guard, &confirm, &destination(), &summary()).await?;
        assert_eq!(state, DestinationState::Absent);
        assert_eq!(*guard.created.lock().unwrap(), vec!["app_copy".to_string()]);
        assert_eq!(confirm.times_asked(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_occupied_destination_is_refused() {
        let guard = FixedDestination::new(DestinationState::Occupied { objects: 3 });
        let confirm = FixedAnswer::yes();
        let err = prepare_destination(&guard, &confirm, &destination(), &summary())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::SafetyViolation(ref msg) if msg.contains("3 object")));
        assert_eq!(confirm.times_asked(), 0);
        assert!(guard.created.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_empty_destination_needs_confirmation() -> anyhow::Result<()> {
        let guard = FixedDestination::new(DestinationState::Empty);

        let declined =
            prepare_destination(&guard, &FixedAnswer::no(), &destination(), &summary()).await;
        assert!(matches!(declined, Err(AppError::Cancelled(_))));

        let confirm = FixedAnswer::yes();
        let state = prepare_destination(&guard, &confirm, &destination(), &summary()).await?;
        assert_eq!(state, DestinationState::Empty);
        assert_eq!(confirm.times_asked(), 1);
        Ok(())
    }

    #[test]
    fn test_dedicated_marker_schema_counts_once_it_exists() {
        assert_eq!(classify("app", None), DestinationState::Empty);
        // Holding only functions or types, or nothing at all, still marks the database as used.
        assert_eq!(classify("app", Some(0)), DestinationState::Occupied { objects: 0 });
        assert_eq!(classify("app", Some(2)), DestinationState::Occupied { objects: 2 });
    }

    #[test]
    fn test_public_marker_schema_counts_by_contents() {
        assert_eq!(classify("public", Some(0)), DestinationState::Empty);
        assert_eq!(classify("public", None), DestinationState::Empty);
        assert_eq!(classify("public", Some(1)), DestinationState::Occupied { objects: 1 });
    }

    #[test]
    fn test_marker_query_covers_functions_and_types() {
        assert!(MARKER_OBJECTS_SQL.contains("FROM pg_proc"));
        assert!(MARKER_OBJECTS_SQL.contains("FROM pg_type"));
        assert!(MARKER_OBJECTS_SQL.contains("FROM pg_namespace"));
    }

    #[test]
    fn test_quote_ident_doubles_quotes() {
        assert_eq!(quote_ident("app"), "\"app\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }
}
