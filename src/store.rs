use std::collections::BTreeMap;
use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;

use crate::domain::{AssetKind, AssetRequest, Source};
use crate::error::AcquireError;

/// Suffix of files still being written; never authoritative.
pub const PARTIAL_SUFFIX: &str = ".part";

const STAGING_DIR: &str = ".staging";

/// On-disk layout: `root/<archive>/<division>/<species>/<release>/`.
#[derive(Debug, Clone)]
pub struct Layout {
    root: Utf8PathBuf,
}

impl Layout {
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn species_dir(&self, request: &AssetRequest) -> Utf8PathBuf {
        let source = request.source();
        // Ensembl paths are lower-case remotely; mirror that so case variants
        // of one species share a directory.
        let species = match source {
            Source::Ensembl(_) => request.species().ensembl_name(),
            Source::Ncbi(_) => request.species().dir_name(),
        };
        self.root
            .join(source.archive_label())
            .join(source.division_label())
            .join(species)
    }

    pub fn release_dir(&self, request: &AssetRequest) -> Utf8PathBuf {
        self.species_dir(request)
            .join(request.release().to_string())
    }

    /// Scratch space for archive packages; lives inside the release directory.
    pub fn staging_dir(&self, request: &AssetRequest) -> Utf8PathBuf {
        self.release_dir(request).join(STAGING_DIR)
    }

    pub fn ensure_release_dir(&self, request: &AssetRequest) -> Result<Utf8PathBuf, AcquireError> {
        let dir = self.release_dir(request);
        fs::create_dir_all(dir.as_std_path()).map_err(AcquireError::fs)?;
        Ok(dir)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "path", rename_all = "snake_case")]
pub enum LocalState {
    Missing,
    /// Decompressed final file; trusted without re-hashing.
    Final(Utf8PathBuf),
    /// Compressed download that still needs verification and decompression.
    Intermediate(Utf8PathBuf),
    /// A previous run learned that the archive has no such asset.
    Unavailable,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LocalAsset {
    pub species: String,
    pub kind: AssetKind,
    pub state: LocalState,
}

impl LocalAsset {
    pub fn path(&self) -> Option<&Utf8Path> {
        match &self.state {
            LocalState::Final(path) | LocalState::Intermediate(path) => Some(path),
            LocalState::Missing | LocalState::Unavailable => None,
        }
    }

    pub fn exists(&self) -> bool {
        self.path().is_some()
    }

    pub fn verified(&self) -> bool {
        matches!(self.state, LocalState::Final(_))
    }

    pub fn is_satisfied(&self) -> bool {
        matches!(self.state, LocalState::Final(_) | LocalState::Unavailable)
    }
}

/// Reports what `dir` already holds for each requested kind.
pub fn inspect(
    dir: &Utf8Path,
    species: &str,
    kinds: impl IntoIterator<Item = AssetKind>,
) -> Result<BTreeMap<AssetKind, LocalAsset>, AcquireError> {
    let names = list_file_names(dir)?;
    let mut assets = BTreeMap::new();
    for kind in kinds {
        let state = if let Some(name) = names.iter().find(|name| kind.matches_final(name)) {
            LocalState::Final(dir.join(name))
        } else if let Some(name) = names.iter().find(|name| kind.matches_intermediate(name)) {
            LocalState::Intermediate(dir.join(name))
        } else if names.contains(&kind.unavailable_marker()) {
            LocalState::Unavailable
        } else {
            LocalState::Missing
        };
        assets.insert(
            kind,
            LocalAsset {
                species: species.to_string(),
                kind,
                state,
            },
        );
    }
    Ok(assets)
}

/// Deletes `*.part` files left behind by an interrupted run.
pub fn remove_partials(dir: &Utf8Path) -> Result<usize, AcquireError> {
    let mut removed = 0;
    for name in list_file_names(dir)? {
        if name.ends_with(PARTIAL_SUFFIX) {
            fs::remove_file(dir.join(&name).as_std_path()).map_err(AcquireError::fs)?;
            removed += 1;
        }
    }
    Ok(removed)
}

/// Removes every final or intermediate file of `kind` except `keep`.
pub fn remove_other_candidates(
    dir: &Utf8Path,
    kind: AssetKind,
    keep: &Utf8Path,
) -> Result<(), AcquireError> {
    for name in list_file_names(dir)? {
        let path = dir.join(&name);
        if path == keep {
            continue;
        }
        if kind.matches_final(&name) || kind.matches_intermediate(&name) {
            fs::remove_file(path.as_std_path()).map_err(AcquireError::fs)?;
        }
    }
    Ok(())
}

pub fn write_unavailable_marker(dir: &Utf8Path, kind: AssetKind) -> Result<(), AcquireError> {
    let content = format!(
        "no {} published for this species; recorded {}\n",
        kind.label(),
        chrono::Utc::now().to_rfc3339()
    );
    write_bytes_atomic(&dir.join(kind.unavailable_marker()), content.as_bytes())
}

/// Removes the release directory and then the species directory when empty.
/// Returns true when the species directory is gone.
pub fn remove_if_empty(release_dir: &Utf8Path, species_dir: &Utf8Path) -> bool {
    for dir in [release_dir, species_dir] {
        if !dir.as_std_path().exists() {
            continue;
        }
        // remove_dir refuses non-empty directories
        if fs::remove_dir(dir.as_std_path()).is_err() {
            return false;
        }
    }
    true
}

pub fn write_bytes_atomic(path: &Utf8Path, content: &[u8]) -> Result<(), AcquireError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent.as_std_path()).map_err(AcquireError::fs)?;
    }
    let tmp_path = partial_path(path);
    fs::write(tmp_path.as_std_path(), content).map_err(AcquireError::fs)?;
    fs::rename(tmp_path.as_std_path(), path.as_std_path()).map_err(AcquireError::fs)?;
    Ok(())
}

pub fn copy_file_atomic(source: &Utf8Path, dest: &Utf8Path) -> Result<(), AcquireError> {
    let parent = dest
        .parent()
        .ok_or_else(|| AcquireError::Filesystem("invalid destination path".to_string()))?;
    fs::create_dir_all(parent.as_std_path()).map_err(AcquireError::fs)?;
    let temp = tempfile::Builder::new()
        .prefix(".genome-fetch")
        .suffix(PARTIAL_SUFFIX)
        .tempfile_in(parent.as_std_path())
        .map_err(AcquireError::fs)?;
    fs::copy(source.as_std_path(), temp.path()).map_err(AcquireError::fs)?;
    temp.persist(dest.as_std_path()).map_err(AcquireError::fs)?;
    Ok(())
}

pub fn partial_path(path: &Utf8Path) -> Utf8PathBuf {
    Utf8PathBuf::from(format!("{path}{PARTIAL_SUFFIX}"))
}

/// Sorted names of the regular files directly inside `dir`.
fn list_file_names(dir: &Utf8Path) -> Result<Vec<String>, AcquireError> {
    if !dir.as_std_path().exists() {
        return Ok(Vec::new());
    }
    let mut names = Vec::new();
    for entry in fs::read_dir(dir.as_std_path()).map_err(AcquireError::fs)? {
        let entry = entry.map_err(AcquireError::fs)?;
        if !entry.file_type().map_err(AcquireError::fs)?.is_file() {
            continue;
        }
        if let Ok(name) = entry.file_name().into_string() {
            names.push(name);
        }
    }
    names.sort();
    Ok(names)
}
