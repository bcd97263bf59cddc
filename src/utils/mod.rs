pub mod confirm;
pub mod logger;
pub mod process;
pub mod retry;
pub mod setting;

use std::path::{Path, PathBuf};

use which::which;

use crate::errors::{AppError, Result};

/// Finds a PostgreSQL client binary, preferring `bin_dir` over the PATH.
pub fn find_executable(name: &str, bin_dir: Option<&Path>) -> Result<PathBuf> {
    if let Some(dir) = bin_dir {
        let candidate = dir.join(name);
        if candidate.is_file() {
            return Ok(candidate);
        }
        return Err(AppError::Configuration(format!(
            "{} not found in PG_BIN_DIR {}",
            name,
            dir.display()
        )));
    }
    which(name).map_err(|_| {
        AppError::Configuration(format!(
            "{} executable not found in PATH. \
             Please ensure PostgreSQL client tools are installed and in your PATH.",
            name
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bin_dir_lookup_requires_file() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        assert!(find_executable("pg_restore", Some(dir.path())).is_err());

        std::fs::write(dir.path().join("pg_restore"), b"#!/bin/sh\n")?;
        let found = find_executable("pg_restore", Some(dir.path()))?;
        assert_eq!(found, dir.path().join("pg_restore"));
        Ok(())
    }
}
