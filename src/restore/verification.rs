// pgphase/src/restore/verification.rs
use sqlx::{Connection, PgConnection};

use crate::config::ConnectionProfile;
use crate::errors::{AppError, Result};
use crate::restore::manifest::ObjectCounts;

const USER_SCHEMAS: &str = "n.nspname NOT IN ('pg_catalog', 'information_schema') \
     AND n.nspname NOT LIKE 'pg_toast%' AND n.nspname NOT LIKE 'pg_temp%'";

const NOT_EXTENSION_MEMBER: &str = "NOT EXISTS (SELECT 1 FROM pg_depend d \
     WHERE d.classid = 'pg_class'::regclass AND d.objid = c.oid AND d.deptype = 'e')";

/// Constraint rows as `(contype, convalidated, count)`.
type ConstraintRow = (String, bool, i64);

/// Constraints the archive lists as entries of their own.
///
/// Validated CHECK constraints are part of their table's definition; only
/// `NOT VALID` ones get a separate `CHECK CONSTRAINT` entry.
fn counted_constraints(rows: &[ConstraintRow]) -> usize {
    rows.iter()
        .filter(|(kind, validated, _)| match kind.as_str() {
            "p" | "u" | "f" | "x" => true,
            "c" => !validated,
            _ => false,
        })
        .map(|(_, _, count)| (*count).max(0) as usize)
        .sum()
}

/// Counts tables, standalone indexes and constraints in the restored database,
/// the way the manifest counts them. Extension members are left out.
pub async fn count_objects(destination: &ConnectionProfile) -> Result<ObjectCounts> {
    let mut conn = PgConnection::connect_with(&destination.connect_options())
        .await
        .map_err(|e| {
            AppError::Connectivity(format!(
                "cannot connect to {} for verification: {}",
                destination, e
            ))
        })?;

    let tables: i64 = sqlx::query_scalar(&format!(
        "SELECT count(*) FROM pg_class c JOIN pg_namespace n ON n.oid = c.relnamespace \
         WHERE c.relkind IN ('r', 'p') AND {} AND {}",
        USER_SCHEMAS, NOT_EXTENSION_MEMBER
    ))
    .fetch_one(&mut conn)
    .await?;

    // Indexes backing a primary key, unique or exclusion constraint come with the constraint.
    let indexes: i64 = sqlx::query_scalar(&format!(
        "SELECT count(*) FROM pg_class c JOIN pg_namespace n ON n.oid = c.relnamespace \
         WHERE c.relkind IN ('i', 'I') AND {} AND {} \
         AND NOT EXISTS (SELECT 1 FROM pg_constraint con \
                         WHERE con.conindid = c.oid AND con.contype IN ('p', 'u', 'x'))",
        USER_SCHEMAS, NOT_EXTENSION_MEMBER
    ))
    .fetch_one(&mut conn)
    .await?;

    let constraint_rows: Vec<ConstraintRow> = sqlx::query_as(&format!(
        "SELECT con.contype::text, con.convalidated, count(*) \
         FROM pg_constraint con JOIN pg_class c ON c.oid = con.conrelid \
         JOIN pg_namespace n ON n.oid = c.relnamespace \
         WHERE con.contype IN ('p', 'u', 'f', 'x', 'c') AND {} AND {} \
         GROUP BY 1, 2",
        USER_SCHEMAS, NOT_EXTENSION_MEMBER
    ))
    .fetch_all(&mut conn)
    .await?;

    conn.close().await.ok();
    Ok(ObjectCounts {
        tables: tables.max(0) as usize,
        indexes: indexes.max(0) as usize,
        constraints: counted_constraints(&constraint_rows),
    })
}

/// Human-readable differences between what the archive listed and what landed.
pub fn compare(expected: &ObjectCounts, actual: &ObjectCounts) -> Vec<String> {
    [
        ("tables", expected.tables, actual.tables),
        ("indexes", expected.indexes, actual.indexes),
        ("constraints", expected.constraints, actual.constraints),
    ]
    .into_iter()
    .filter(|(_, want, got)| want != got)
    .map(|(what, want, got)| format!("{}: archive lists {}, destination has {}", what, want, got))
    .collect()
}

/// Logs the outcome; never fails the restore.
pub async fn verify_restore(destination: &ConnectionProfile, expected: &ObjectCounts) {
    let actual = match count_objects(destination).await {
        Ok(actual) => actual,
        Err(e) => {
            tracing::warn!("⚠️ Post-restore verification skipped: {}", e);
            return;
        }
    };
    let mismatches = compare(expected, &actual);
    if mismatches.is_empty() {
        tracing::info!("✅ Verification passed for {}: {}", destination.database, actual);
    } else {
        for mismatch in &mismatches {
            tracing::warn!(
                "⚠️ Verification mismatch in {}: {}",
                destination.database,
                mismatch
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compare_reports_only_differences() {
        let expected = ObjectCounts { tables: 2, indexes: 2, constraints: 2 };
        assert!(compare(&expected, &expected).is_empty());

        let actual = ObjectCounts { tables: 2, indexes: 1, constraints: 2 };
        assert_eq!(
            compare(&expected, &actual),
            vec!["indexes: archive lists 2, destination has 1".to_string()]
        );
    }

    #[test]
    fn test_only_not_valid_checks_are_counted() {
        let rows: Vec<ConstraintRow> = vec![
            ("p".into(), true, 3),
            ("f".into(), true, 2),
            ("f".into(), false, 1),
            ("c".into(), true, 7),
            ("c".into(), false, 1),
            ("t".into(), true, 4),
        ];
        assert_eq!(counted_constraints(&rows), 7);
        assert_eq!(counted_constraints(&[]), 0);
    }
}
