use std::path::PathBuf;

use miette::Diagnostic;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum AcquireError {
    #[error("invalid species identifier: {0:?}")]
    InvalidSpecies(String),

    #[error("invalid release: {0} (expected a positive number or \"current\")")]
    InvalidRelease(String),

    #[error("invalid asset kind: {0}")]
    InvalidKind(String),

    #[error("invalid division: {0}")]
    InvalidDivision(String),

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("failed to read species list {path}: {message}")]
    SpeciesList { path: PathBuf, message: String },

    #[error("connection to {target} failed: {message}")]
    ConnectFailed { target: String, message: String },

    #[error("remote path not resolvable: {path}: {message}")]
    ResolveFailed { path: String, message: String },

    #[error("transfer of {file} failed: {message}")]
    TransferFailed { file: String, message: String },

    #[error("checksum mismatch for {file}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        file: String,
        expected: String,
        actual: String,
    },

    #[error("no checksum manifest entry for {0}; refusing to finalize an unverified file")]
    Unverifiable(String),

    #[error("decompression of {file} failed: {message}")]
    DecompressFailed { file: String, message: String },

    #[error("required tool not found: {0}")]
    MissingTool(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),
}

/// Coarse failure taxonomy recorded in results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorClass {
    ConnectFailed,
    ResolveFailed,
    TransferFailed,
    ChecksumMismatch,
    Unverifiable,
    DecompressFailed,
    MissingTool,
    Filesystem,
    Internal,
}

impl AcquireError {
    pub fn class(&self) -> ErrorClass {
        match self {
            AcquireError::ConnectFailed { .. } => ErrorClass::ConnectFailed,
            AcquireError::ResolveFailed { .. } => ErrorClass::ResolveFailed,
            AcquireError::TransferFailed { .. } => ErrorClass::TransferFailed,
            AcquireError::ChecksumMismatch { .. } => ErrorClass::ChecksumMismatch,
            AcquireError::Unverifiable(_) => ErrorClass::Unverifiable,
            AcquireError::DecompressFailed { .. } => ErrorClass::DecompressFailed,
            AcquireError::MissingTool(_) => ErrorClass::MissingTool,
            AcquireError::Filesystem(_)
            | AcquireError::ConfigRead(_)
            | AcquireError::SpeciesList { .. } => ErrorClass::Filesystem,
            AcquireError::InvalidSpecies(_)
            | AcquireError::InvalidRelease(_)
            | AcquireError::InvalidKind(_)
            | AcquireError::InvalidDivision(_)
            | AcquireError::ConfigParse(_) => ErrorClass::Internal,
        }
    }

    /// Whether a fresh attempt could succeed where this one failed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AcquireError::TransferFailed { .. }
                | AcquireError::ChecksumMismatch { .. }
                | AcquireError::ConnectFailed { .. }
        )
    }

    pub(crate) fn fs(err: impl std::fmt::Display) -> Self {
        AcquireError::Filesystem(err.to_string())
    }
}
