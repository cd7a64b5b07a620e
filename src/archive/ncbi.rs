use std::collections::BTreeMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;

use crate::archive::{
    ArchiveConnector, ArchiveSession, AuxiliaryArtifact, RemoteAsset, RemoteLocation, Resolution,
};
use crate::domain::{AssemblySource, AssetKind, AssetRequest, Source};
use crate::error::AcquireError;
use crate::fetch::RetryPolicy;
use crate::fs_util;
use crate::manifest::{ChecksumManifest, DigestAlgorithm};
use crate::store::{self, Layout};

pub const DATASETS_TOOL: &str = "datasets";

const PACKAGE_ZIP: &str = "ncbi_dataset.zip";
const PACKAGE_DIR: &str = "package";
const COMMAND_LOG: &str = "datasets.log";
const DATA_DIR: &str = "ncbi_dataset/data";
const CATALOG_FILE: &str = "dataset_catalog.json";
const MD5_FILE: &str = "md5sum.txt";
const README_FILE: &str = "README.md";
const README_LOCAL_NAME: &str = "README.ncbi.md";
const POLL_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone)]
pub struct NcbiConfig {
    /// Explicit `datasets` binary; looked up on `PATH` when unset.
    pub datasets: Option<PathBuf>,
    /// Restrict downloads to reference genomes.
    pub reference: bool,
    pub command_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for NcbiConfig {
    fn default() -> Self {
        Self {
            datasets: None,
            reference: true,
            command_timeout: Duration::from_secs(3600),
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NcbiConnector {
    config: NcbiConfig,
    datasets: Option<PathBuf>,
}

impl NcbiConnector {
    pub fn new(config: NcbiConfig) -> Self {
        let datasets = config
            .datasets
            .clone()
            .or_else(|| find_in_path(DATASETS_TOOL));
        Self { config, datasets }
    }

    pub fn datasets(&self) -> Option<&Path> {
        self.datasets.as_deref()
    }

    pub fn require_datasets(&self) -> Result<&Path, AcquireError> {
        self.datasets()
            .ok_or_else(|| AcquireError::MissingTool(DATASETS_TOOL.to_string()))
    }
}

impl ArchiveConnector for NcbiConnector {
    type Session = NcbiSession;

    fn connect(&self, request: &AssetRequest, layout: &Layout) -> Result<NcbiSession, AcquireError> {
        let datasets = self.require_datasets()?.to_path_buf();
        let Source::Ncbi(assembly) = request.source() else {
            return Err(AcquireError::ResolveFailed {
                path: request.source().to_string(),
                message: "not an NCBI source".to_string(),
            });
        };
        Ok(NcbiSession {
            datasets,
            species: request.species().as_str().to_string(),
            assembly,
            reference: self.config.reference,
            includes: request.kinds().iter().map(|kind| include_label(*kind)).collect(),
            staging: layout.staging_dir(request),
            timeout: self.config.command_timeout,
            retry: self.config.retry.clone(),
            package: None,
        })
    }
}

/// Catalog entries of the first assembly that carries an accession.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageCatalog {
    pub accession: String,
    /// Paths relative to `ncbi_dataset/data`.
    pub files: BTreeMap<AssetKind, String>,
}

#[derive(Debug, Deserialize)]
struct RawCatalog {
    #[serde(default)]
    assemblies: Vec<RawAssembly>,
}

#[derive(Debug, Deserialize)]
struct RawAssembly {
    accession: Option<String>,
    #[serde(default)]
    files: Vec<RawCatalogFile>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawCatalogFile {
    file_path: String,
    file_type: String,
}

pub fn parse_catalog(text: &str) -> Result<PackageCatalog, AcquireError> {
    let raw: RawCatalog = serde_json::from_str(text).map_err(|err| AcquireError::ResolveFailed {
        path: CATALOG_FILE.to_string(),
        message: err.to_string(),
    })?;
    let assembly = raw
        .assemblies
        .into_iter()
        .find(|assembly| assembly.accession.is_some())
        .ok_or_else(|| AcquireError::ResolveFailed {
            path: CATALOG_FILE.to_string(),
            message: "no assembly with an accession".to_string(),
        })?;

    let mut files = BTreeMap::new();
    for file in assembly.files {
        let kind = match file.file_type.as_str() {
            "GENOMIC_NUCLEOTIDE_FASTA" => AssetKind::Sequence,
            "GTF" => AssetKind::Annotation,
            _ => continue,
        };
        files.entry(kind).or_insert(file.file_path);
    }
    Ok(PackageCatalog {
        accession: assembly.accession.unwrap_or_default(),
        files,
    })
}

#[derive(Debug)]
struct StagedPackage {
    root: Utf8PathBuf,
    catalog: PackageCatalog,
}

/// One `datasets` package per species, downloaded on first use into the
/// release directory's staging area and served from there.
pub struct NcbiSession {
    datasets: PathBuf,
    species: String,
    assembly: AssemblySource,
    reference: bool,
    includes: Vec<&'static str>,
    staging: Utf8PathBuf,
    timeout: Duration,
    retry: RetryPolicy,
    package: Option<StagedPackage>,
}

impl NcbiSession {
    pub fn download_args(&self, filename: &Path) -> Vec<String> {
        let mut args = vec![
            "download".to_string(),
            "genome".to_string(),
            "taxon".to_string(),
            self.species.clone(),
            "--include".to_string(),
            self.includes.join(","),
            "--assembly-source".to_string(),
            self.assembly.datasets_flag().to_string(),
        ];
        if self.reference {
            args.push("--reference".to_string());
        }
        args.push("--filename".to_string());
        args.push(filename.to_string_lossy().to_string());
        args.push("--no-progressbar".to_string());
        args
    }

    fn package(&mut self) -> Result<&StagedPackage, AcquireError> {
        let retry = self.retry.clone();
        self.package_with(&retry)
    }

    fn package_with(&mut self, policy: &RetryPolicy) -> Result<&StagedPackage, AcquireError> {
        if self.package.is_none() {
            let staged = policy.run(|attempt| self.stage_package(attempt))?;
            tracing::info!(
                species = %self.species,
                accession = %staged.catalog.accession,
                "ncbi package staged"
            );
            self.package = Some(staged);
        }
        self.package
            .as_ref()
            .ok_or_else(|| AcquireError::Filesystem("package not staged".to_string()))
    }

    fn stage_package(&self, attempt: u32) -> Result<StagedPackage, AcquireError> {
        fs::create_dir_all(self.staging.as_std_path()).map_err(AcquireError::fs)?;
        let zip_path = self.staging.join(PACKAGE_ZIP);
        let partial = self.staging.join(format!("{PACKAGE_ZIP}.part"));
        let root = self.staging.join(PACKAGE_DIR);
        remove_path(zip_path.as_std_path());
        remove_path(partial.as_std_path());
        remove_path(root.as_std_path());

        tracing::debug!(species = %self.species, attempt, "running datasets download");
        let log_path = self.staging.join(COMMAND_LOG);
        let log = File::create(log_path.as_std_path()).map_err(AcquireError::fs)?;
        let mut command = Command::new(&self.datasets);
        command
            .args(self.download_args(partial.as_std_path()))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::from(log));

        let status = run_with_timeout(&mut command, self.timeout, &self.species)?;
        if !status.success() {
            remove_path(partial.as_std_path());
            let detail = fs::read_to_string(log_path.as_std_path()).unwrap_or_default();
            return Err(AcquireError::TransferFailed {
                file: PACKAGE_ZIP.to_string(),
                message: command_failure(status, &detail),
            });
        }

        fs::rename(partial.as_std_path(), zip_path.as_std_path()).map_err(|err| {
            AcquireError::TransferFailed {
                file: PACKAGE_ZIP.to_string(),
                message: format!("datasets produced no package: {err}"),
            }
        })?;
        let unpacked = fs_util::unpack_package(zip_path.as_std_path(), root.as_std_path());
        remove_path(zip_path.as_std_path());
        if let Err(err) = unpacked {
            remove_path(root.as_std_path());
            return Err(AcquireError::TransferFailed {
                file: PACKAGE_ZIP.to_string(),
                message: err.to_string(),
            });
        }

        let catalog_path = root.join(DATA_DIR).join(CATALOG_FILE);
        let text = fs::read_to_string(catalog_path.as_std_path()).map_err(|err| {
            AcquireError::ResolveFailed {
                path: catalog_path.to_string(),
                message: err.to_string(),
            }
        })?;
        let catalog = parse_catalog(&text)?;
        Ok(StagedPackage { root, catalog })
    }

    fn location(&self, root: &Utf8PathBuf, file_name: impl Into<String>) -> RemoteLocation {
        RemoteLocation::new(root.as_str(), file_name, Source::Ncbi(self.assembly))
    }
}

impl ArchiveSession for NcbiSession {
    fn resolve(&mut self, kind: AssetKind) -> Result<Resolution, AcquireError> {
        let package = self.package()?;
        let root = package.root.clone();
        let Some(file_path) = package.catalog.files.get(&kind).cloned() else {
            return match kind {
                AssetKind::Annotation => Ok(Resolution::NotAvailable),
                AssetKind::Sequence => Err(AcquireError::ResolveFailed {
                    path: format!("{}/{CATALOG_FILE}", self.species),
                    message: "catalog lists no genomic FASTA".to_string(),
                }),
            };
        };

        let manifest = self.list_manifest(kind)?;
        let candidates = vec![self.location(&root, format!("{DATA_DIR}/{file_path}"))];
        let auxiliary = match kind {
            AssetKind::Sequence => vec![
                AuxiliaryArtifact {
                    location: self.location(&root, README_FILE),
                    local_name: README_LOCAL_NAME.to_string(),
                },
                AuxiliaryArtifact {
                    location: self.location(&root, format!("{DATA_DIR}/{CATALOG_FILE}")),
                    local_name: CATALOG_FILE.to_string(),
                },
            ],
            AssetKind::Annotation => Vec::new(),
        };

        Ok(Resolution::Available(RemoteAsset {
            candidates,
            manifest,
            auxiliary,
        }))
    }

    fn list_manifest(&mut self, _kind: AssetKind) -> Result<ChecksumManifest, AcquireError> {
        let package = self.package()?;
        let path = package.root.join(MD5_FILE);
        match fs::read_to_string(path.as_std_path()) {
            Ok(text) => Ok(ChecksumManifest::parse(&text, DigestAlgorithm::Md5)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(path = %path, "package carries no md5sum.txt");
                Ok(ChecksumManifest::empty())
            }
            Err(err) => Err(AcquireError::fs(err)),
        }
    }

    fn fetch(&mut self, location: &RemoteLocation, destination: &Path) -> Result<u64, AcquireError> {
        // the caller's retry loop bounds the attempts; restage at most once here
        self.package_with(&RetryPolicy::immediate(1))?;
        let source = Utf8PathBuf::from(&location.base).join(&location.file_name);
        let destination = Utf8Path::from_path(destination).ok_or_else(|| {
            AcquireError::Filesystem(format!("non UTF-8 path {}", destination.display()))
        })?;
        store::copy_file_atomic(&source, destination).map_err(|err| {
            AcquireError::TransferFailed {
                file: location.file_name.clone(),
                message: err.to_string(),
            }
        })?;
        let bytes = fs::metadata(destination.as_std_path())
            .map_err(AcquireError::fs)?
            .len();
        Ok(bytes)
    }

    fn invalidate(&mut self, _location: &RemoteLocation) {
        if let Some(package) = self.package.take() {
            tracing::debug!(root = %package.root, "dropping staged package");
            remove_path(package.root.as_std_path());
        }
    }

    fn close(&mut self) -> Result<(), AcquireError> {
        self.package = None;
        if self.staging.as_std_path().exists() {
            fs::remove_dir_all(self.staging.as_std_path()).map_err(AcquireError::fs)?;
        }
        Ok(())
    }
}

fn include_label(kind: AssetKind) -> &'static str {
    match kind {
        AssetKind::Sequence => "genome",
        AssetKind::Annotation => "gtf",
    }
}

/// Runs `command` and kills it once `timeout` has elapsed.
pub(crate) fn run_with_timeout(
    command: &mut Command,
    timeout: Duration,
    label: &str,
) -> Result<ExitStatus, AcquireError> {
    let mut child = command.spawn().map_err(|err| {
        if err.kind() == std::io::ErrorKind::NotFound {
            AcquireError::MissingTool(DATASETS_TOOL.to_string())
        } else {
            AcquireError::TransferFailed {
                file: label.to_string(),
                message: err.to_string(),
            }
        }
    })?;
    let started = Instant::now();
    loop {
        if let Some(status) = child.try_wait().map_err(AcquireError::fs)? {
            return Ok(status);
        }
        if started.elapsed() >= timeout {
            let _ = child.kill();
            let _ = child.wait();
            return Err(AcquireError::TransferFailed {
                file: label.to_string(),
                message: format!("timed out after {}s", timeout.as_secs()),
            });
        }
        thread::sleep(POLL_INTERVAL);
    }
}

pub(crate) fn find_in_path(name: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    for path in std::env::split_paths(&path_var) {
        let exe = path.join(format!("{name}.exe"));
        if exe.is_file() {
            return Some(exe);
        }
        let plain = path.join(name);
        if plain.is_file() {
            return Some(plain);
        }
    }
    None
}

fn command_failure(status: ExitStatus, stderr: &str) -> String {
    let last_line = stderr.lines().rev().find(|line| !line.trim().is_empty());
    match last_line {
        Some(line) => format!("datasets exited with {status}: {}", line.trim()),
        None => format!("datasets exited with {status}"),
    }
}

fn remove_path(path: &Path) {
    if path.is_dir() {
        let _ = fs::remove_dir_all(path);
    } else if path.exists() {
        let _ = fs::remove_file(path);
    }
}
