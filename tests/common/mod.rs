#![allow(dead_code)]

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use camino::Utf8PathBuf;
use flate2::Compression;
use flate2::write::GzEncoder;
use md5::{Digest, Md5};

use genome_fetch::acquire::{AcquireOptions, ProgressEvent, ProgressSink};
use genome_fetch::archive::{
    ArchiveConnector, ArchiveSession, RemoteAsset, RemoteLocation, Resolution,
};
use genome_fetch::domain::{AssetKind, AssetRequest, Division, Release, Source};
use genome_fetch::error::AcquireError;
use genome_fetch::fetch::RetryPolicy;
use genome_fetch::manifest::{ChecksumManifest, DigestAlgorithm, ExpectedDigest};
use genome_fetch::store::Layout;

pub const BASE: &str = "https://archive.test/pub";

#[derive(Debug, Clone)]
pub enum MockEntry {
    Available {
        name: String,
        payload: Vec<u8>,
        /// Whether the manifest lists the file.
        listed: bool,
        extra_candidates: Vec<String>,
    },
    NotAvailable,
}

#[derive(Default)]
struct MockState {
    catalog: Mutex<HashMap<(String, AssetKind), MockEntry>>,
    corrupt: Mutex<HashMap<String, usize>>,
    interrupted: Mutex<HashMap<String, usize>>,
    unreachable: Mutex<Vec<String>>,
    panics: Mutex<Vec<String>>,
    transfers: AtomicUsize,
    connects: AtomicUsize,
}

/// In-memory archive. Every fetched byte is counted so tests can prove that a
/// run performed no remote work.
#[derive(Clone, Default)]
pub struct MockArchive {
    state: Arc<MockState>,
}

impl MockArchive {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, species: &str, kind: AssetKind, entry: MockEntry) {
        self.state
            .catalog
            .lock()
            .unwrap()
            .insert((species.to_string(), kind), entry);
    }

    /// Publishes a gzipped FASTA and GTF for `species`, both listed in the manifest.
    pub fn with_standard_species(self, species: &str) -> Self {
        let prefix = capitalize(species);
        self.insert(
            species,
            AssetKind::Sequence,
            MockEntry::Available {
                name: format!("{prefix}.GRCh38.dna_sm.toplevel.fa.gz"),
                payload: gzip(fasta_text(species).as_bytes()),
                listed: true,
                extra_candidates: Vec::new(),
            },
        );
        self.insert(
            species,
            AssetKind::Annotation,
            MockEntry::Available {
                name: format!("{prefix}.GRCh38.113.gtf.gz"),
                payload: gzip(gtf_text(species).as_bytes()),
                listed: true,
                extra_candidates: Vec::new(),
            },
        );
        self
    }

    /// The next `times` transfers of `file` deliver corrupted bytes.
    pub fn corrupt(&self, file: &str, times: usize) {
        self.state
            .corrupt
            .lock()
            .unwrap()
            .insert(file.to_string(), times);
    }

    /// The next `times` transfers of `file` stop halfway and report a
    /// transfer failure.
    pub fn interrupt(&self, file: &str, times: usize) {
        self.state
            .interrupted
            .lock()
            .unwrap()
            .insert(file.to_string(), times);
    }

    /// Drops `kind` from the catalog so its directory cannot be resolved.
    pub fn withdraw(&self, species: &str, kind: AssetKind) {
        self.state
            .catalog
            .lock()
            .unwrap()
            .remove(&(species.to_string(), kind));
    }

    pub fn make_unreachable(&self, species: &str) {
        self.state.unreachable.lock().unwrap().push(species.to_string());
    }

    pub fn panic_on(&self, species: &str) {
        self.state.panics.lock().unwrap().push(species.to_string());
    }

    pub fn transfers(&self) -> usize {
        self.state.transfers.load(Ordering::SeqCst)
    }

    pub fn connects(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    fn entry(&self, species: &str, kind: AssetKind) -> Option<MockEntry> {
        self.state
            .catalog
            .lock()
            .unwrap()
            .get(&(species.to_string(), kind))
            .cloned()
    }
}

impl ArchiveConnector for MockArchive {
    type Session = MockSession;

    fn connect(&self, request: &AssetRequest, _layout: &Layout) -> Result<MockSession, AcquireError> {
        let species = request.species().as_str().to_string();
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        if self.state.panics.lock().unwrap().contains(&species) {
            panic!("mock archive exploded for {species}");
        }
        if self.state.unreachable.lock().unwrap().contains(&species) {
            return Err(AcquireError::ConnectFailed {
                target: "archive.test".to_string(),
                message: "connection refused".to_string(),
            });
        }
        Ok(MockSession {
            archive: self.clone(),
            species,
            source: request.source(),
        })
    }
}

pub struct MockSession {
    archive: MockArchive,
    species: String,
    source: Source,
}

impl MockSession {
    fn manifest_for(&self, kind: AssetKind) -> ChecksumManifest {
        let mut manifest = ChecksumManifest::empty();
        if let Some(MockEntry::Available {
            name,
            payload,
            listed: true,
            ..
        }) = self.archive.entry(&self.species, kind)
        {
            manifest.insert(
                &name,
                ExpectedDigest {
                    algorithm: DigestAlgorithm::Md5,
                    value: md5_hex(&payload),
                },
            );
        }
        manifest
    }
}

impl ArchiveSession for MockSession {
    fn resolve(&mut self, kind: AssetKind) -> Result<Resolution, AcquireError> {
        match self.archive.entry(&self.species, kind) {
            None => Err(AcquireError::ResolveFailed {
                path: format!("{BASE}/{}", self.species),
                message: "HTTP 404 Not Found".to_string(),
            }),
            Some(MockEntry::NotAvailable) => Ok(Resolution::NotAvailable),
            Some(MockEntry::Available {
                name,
                extra_candidates,
                ..
            }) => {
                let candidates = std::iter::once(name)
                    .chain(extra_candidates)
                    .map(|file| RemoteLocation::new(format!("{BASE}/{}", self.species), file, self.source))
                    .collect();
                Ok(Resolution::Available(RemoteAsset {
                    candidates,
                    manifest: self.manifest_for(kind),
                    auxiliary: Vec::new(),
                }))
            }
        }
    }

    fn list_manifest(&mut self, kind: AssetKind) -> Result<ChecksumManifest, AcquireError> {
        Ok(self.manifest_for(kind))
    }

    fn fetch(&mut self, location: &RemoteLocation, destination: &Path) -> Result<u64, AcquireError> {
        self.archive.state.transfers.fetch_add(1, Ordering::SeqCst);
        let payload = AssetKind::ALL
            .into_iter()
            .filter_map(|kind| match self.archive.entry(&self.species, kind) {
                Some(MockEntry::Available { name, payload, .. }) if name == location.file_name => {
                    Some(payload)
                }
                _ => None,
            })
            .next()
            .ok_or_else(|| AcquireError::TransferFailed {
                file: location.file_name.clone(),
                message: "no such file".to_string(),
            })?;

        if let Some(remaining) = self
            .archive
            .state
            .interrupted
            .lock()
            .unwrap()
            .get_mut(&location.file_name)
            && *remaining > 0
        {
            *remaining -= 1;
            fs::write(destination, &payload[..payload.len() / 2]).unwrap();
            return Err(AcquireError::TransferFailed {
                file: location.file_name.clone(),
                message: "connection reset by peer".to_string(),
            });
        }

        let mut corrupt = self.archive.state.corrupt.lock().unwrap();
        let bytes = match corrupt.get_mut(&location.file_name) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                b"garbage bytes from a flaky mirror".to_vec()
            }
            _ => payload,
        };
        fs::write(destination, &bytes).map_err(|err| AcquireError::TransferFailed {
            file: location.file_name.clone(),
            message: err.to_string(),
        })?;
        Ok(bytes.len() as u64)
    }
}

#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<ProgressEvent>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl ProgressSink for RecordingSink {
    fn event(&self, event: ProgressEvent) {
        self.events.lock().unwrap().push(event);
    }
}

pub fn options() -> AcquireOptions {
    AcquireOptions {
        force: false,
        retry: RetryPolicy::immediate(3),
        jitter_min: Duration::ZERO,
        jitter_max: Duration::ZERO,
    }
}

pub fn ensembl_request(species: &str) -> AssetRequest {
    AssetRequest::new(
        species.parse().unwrap(),
        AssetKind::ALL,
        Source::Ensembl(Division::Primates),
        Release::Numbered(113),
    )
}

pub fn temp_root() -> (tempfile::TempDir, Utf8PathBuf) {
    let temp = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(temp.path().join("genomes")).unwrap();
    (temp, root)
}

pub fn fasta_text(species: &str) -> String {
    format!(">chr1 {species}\nACGTACGTNNACGT\n>chr2\nGGGCCCAAATTT\n")
}

pub fn gtf_text(species: &str) -> String {
    format!("chr1\t{species}\tgene\t1\t10\t.\t+\t.\tgene_id \"g1\";\n")
}

pub fn gzip(data: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::fast());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

pub fn md5_hex(data: &[u8]) -> String {
    hex::encode(Md5::digest(data))
}

/// Regular file names directly inside `dir`, sorted.
pub fn file_names(dir: &Utf8PathBuf) -> Vec<String> {
    let mut names = fs::read_dir(dir.as_std_path())
        .map(|entries| {
            entries
                .filter_map(Result::ok)
                .filter(|entry| entry.path().is_file())
                .filter_map(|entry| entry.file_name().into_string().ok())
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();
    names.sort();
    names
}

fn capitalize(species: &str) -> String {
    let mut chars = species.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
