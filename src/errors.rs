use std::process::ExitCode;

use thiserror::Error;

/// Process exit codes. Stable within a build; documented in DESIGN.md.
pub mod exit_code {
    pub const SUCCESS: u8 = 0;
    pub const INTERNAL: u8 = 1;
    pub const CONFIGURATION: u8 = 2;
    pub const CONNECTIVITY: u8 = 3;
    pub const MANIFEST: u8 = 4;
    pub const PHASE_FAILURE: u8 = 5;
    pub const SAFETY_VIOLATION: u8 = 6;
    pub const STORAGE: u8 = 7;
    pub const CANCELLED: u8 = 8;
}

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Connectivity error: {0}")]
    Connectivity(String),

    #[error("Manifest error: {0}")]
    Manifest(String),

    #[error("Storage operation '{operation}' failed after {attempts} attempt(s): {message}")]
    TransientStorage {
        operation: String,
        attempts: u32,
        message: String,
    },

    #[error("Storage operation failed: {0}")]
    Storage(String),

    #[error("{phase} phase failed ({status}): {stderr}")]
    PhaseExecution {
        phase: String,
        status: String,
        stderr: String,
    },

    #[error("Safety violation: {0}")]
    SafetyViolation(String),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    pub fn exit_code(&self) -> u8 {
        match self {
            AppError::Configuration(_) => exit_code::CONFIGURATION,
            AppError::Connectivity(_) => exit_code::CONNECTIVITY,
            AppError::Manifest(_) => exit_code::MANIFEST,
            AppError::TransientStorage { .. } | AppError::Storage(_) => exit_code::STORAGE,
            AppError::PhaseExecution { .. } => exit_code::PHASE_FAILURE,
            AppError::SafetyViolation(_) => exit_code::SAFETY_VIOLATION,
            AppError::Cancelled(_) => exit_code::CANCELLED,
            AppError::Io(_) | AppError::Database(_) | AppError::Internal(_) => exit_code::INTERNAL,
        }
    }
}

impl From<&AppError> for ExitCode {
    fn from(err: &AppError) -> Self {
        ExitCode::from(err.exit_code())
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
