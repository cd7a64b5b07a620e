//! Remote archives behind a common capability: resolve, list a manifest, fetch.
//!
//! A connector is chosen once from the request's [`Source`]; it opens one
//! [`ArchiveSession`] per species, and that session is owned by the worker
//! that opened it for its whole lifetime.

pub mod ensembl;
pub mod ncbi;

use std::path::Path;

use serde::Serialize;

use crate::domain::{AssetKind, AssetRequest, Source};
use crate::error::AcquireError;
use crate::manifest::ChecksumManifest;
use crate::store::Layout;

/// Where one remote file lives. `base` is a URL for HTTP archives and a local
/// extraction directory for packaged archives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteLocation {
    pub base: String,
    pub file_name: String,
    pub source: Source,
}

impl RemoteLocation {
    pub fn new(base: impl Into<String>, file_name: impl Into<String>, source: Source) -> Self {
        Self {
            base: base.into(),
            file_name: file_name.into(),
            source,
        }
    }

    /// Base and file name joined with exactly one separator.
    pub fn joined(&self) -> String {
        format!(
            "{}/{}",
            self.base.trim_end_matches('/'),
            self.file_name.trim_start_matches('/')
        )
    }

    /// Last path component of `file_name`; the name used locally.
    pub fn local_name(&self) -> &str {
        self.file_name
            .rsplit('/')
            .next()
            .unwrap_or(self.file_name.as_str())
    }
}

/// Extra file shipped next to an asset (README, raw manifest), stored under a
/// kind-specific name so sequence and annotation copies do not collide.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuxiliaryArtifact {
    pub location: RemoteLocation,
    pub local_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteAsset {
    /// Matching files in listing order.
    pub candidates: Vec<RemoteLocation>,
    pub manifest: ChecksumManifest,
    pub auxiliary: Vec<AuxiliaryArtifact>,
}

impl RemoteAsset {
    /// First match in listing order. Several matches usually mean assembly
    /// variants; the caller reports that instead of guessing.
    pub fn selected(&self) -> Option<&RemoteLocation> {
        self.candidates.first()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Available(RemoteAsset),
    /// The archive publishes no asset of this kind for the species.
    NotAvailable,
}

pub trait ArchiveSession {
    fn resolve(&mut self, kind: AssetKind) -> Result<Resolution, AcquireError>;

    fn list_manifest(&mut self, kind: AssetKind) -> Result<ChecksumManifest, AcquireError>;

    /// One transfer attempt into `destination`, created or truncated.
    /// Returns the number of bytes written.
    fn fetch(&mut self, location: &RemoteLocation, destination: &Path) -> Result<u64, AcquireError>;

    /// Called after a fetched copy failed verification.
    fn invalidate(&mut self, _location: &RemoteLocation) {}

    fn close(&mut self) -> Result<(), AcquireError> {
        Ok(())
    }
}

pub trait ArchiveConnector: Send + Sync {
    type Session: ArchiveSession;

    fn connect(&self, request: &AssetRequest, layout: &Layout) -> Result<Self::Session, AcquireError>;
}
