use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use reqwest::StatusCode;
use reqwest::blocking::{Client, Response};
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};

use crate::archive::{
    ArchiveConnector, ArchiveSession, AuxiliaryArtifact, RemoteAsset, RemoteLocation, Resolution,
};
use crate::domain::{AssetKind, AssetRequest, Division, Release, Source};
use crate::error::AcquireError;
use crate::fetch::RetryPolicy;
use crate::manifest::{ChecksumManifest, DigestAlgorithm};
use crate::store::Layout;

pub const MAIN_SITE: &str = "https://ftp.ensembl.org";
pub const GENOMES_SITE: &str = "https://ftp.ensemblgenomes.ebi.ac.uk";
pub const DEFAULT_SEQUENCE_SUFFIX: &str = "dna_sm.toplevel.fa.gz";
const ANNOTATION_SUFFIX: &str = ".gtf.gz";
const CHECKSUMS_FILE: &str = "CHECKSUMS";
const README_FILE: &str = "README";

static HREF: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)href\s*=\s*"([^"]+)""#).expect("href pattern"));

/// Annotation files that are not the primary gene set: ab-initio predictions
/// and region-restricted subsets of the same annotation.
const ANNOTATION_VARIANTS: [&str; 3] = [".abinitio.", ".chr.", ".chr_patch_hapl_scaff."];

#[derive(Debug, Clone)]
pub struct EnsemblConfig {
    pub main_site: String,
    pub genomes_site: String,
    pub sequence_suffix: String,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for EnsemblConfig {
    fn default() -> Self {
        Self {
            main_site: MAIN_SITE.to_string(),
            genomes_site: GENOMES_SITE.to_string(),
            sequence_suffix: DEFAULT_SEQUENCE_SUFFIX.to_string(),
            connect_timeout: Duration::from_secs(30),
            request_timeout: Duration::from_secs(3600),
            retry: RetryPolicy::default(),
        }
    }
}

impl EnsemblConfig {
    pub fn site_for(&self, division: Division) -> String {
        if division.is_main_site() {
            normalize_site(&self.main_site)
        } else {
            normalize_site(&self.genomes_site)
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct EnsemblConnector {
    config: EnsemblConfig,
}

impl EnsemblConnector {
    pub fn new(config: EnsemblConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &EnsemblConfig {
        &self.config
    }
}

impl ArchiveConnector for EnsemblConnector {
    type Session = EnsemblSession;

    fn connect(
        &self,
        request: &AssetRequest,
        _layout: &Layout,
    ) -> Result<EnsemblSession, AcquireError> {
        let Source::Ensembl(division) = request.source() else {
            return Err(AcquireError::ResolveFailed {
                path: request.source().to_string(),
                message: "not an Ensembl source".to_string(),
            });
        };
        let site = self.config.site_for(division);
        let client = build_client(&self.config, &site)?;
        tracing::debug!(site = %site, species = %request.species(), "ensembl session opened");
        Ok(EnsemblSession {
            client,
            site,
            division,
            species: request.species().ensembl_name(),
            release: request.release(),
            sequence_suffix: self.config.sequence_suffix.clone(),
            retry: self.config.retry.clone(),
            listings: HashMap::new(),
        })
    }
}

/// One species on one Ensembl host. Directory listings are cached for the
/// session; checksum manifests are always fetched fresh.
pub struct EnsemblSession {
    client: Client,
    site: String,
    division: Division,
    species: String,
    release: Release,
    sequence_suffix: String,
    retry: RetryPolicy,
    listings: HashMap<AssetKind, Vec<String>>,
}

impl EnsemblSession {
    fn dir_url(&self, kind: AssetKind) -> String {
        format!(
            "{}{}",
            self.site,
            ensembl_dir_path(self.division, self.release, &self.species, kind)
        )
    }

    fn location(&self, kind: AssetKind, file_name: &str) -> RemoteLocation {
        RemoteLocation::new(
            self.dir_url(kind),
            file_name,
            Source::Ensembl(self.division),
        )
    }

    fn listing(&mut self, kind: AssetKind) -> Result<Vec<String>, AcquireError> {
        if let Some(names) = self.listings.get(&kind) {
            return Ok(names.clone());
        }
        let url = self.dir_url(kind);
        let names = self.retry.run(|_| {
            let response = self.get(&url, &url)?;
            let response = ensure_success(response, &url, &url)?;
            let body = response.text().map_err(|err| AcquireError::TransferFailed {
                file: url.clone(),
                message: err.to_string(),
            })?;
            Ok(parse_index(&body))
        })?;
        tracing::debug!(url = %url, entries = names.len(), "directory listed");
        self.listings.insert(kind, names.clone());
        Ok(names)
    }

    fn get(&self, url: &str, file: &str) -> Result<Response, AcquireError> {
        self.client
            .get(url)
            .send()
            .map_err(|err| map_request_error(err, &self.site, file))
    }
}

impl ArchiveSession for EnsemblSession {
    fn resolve(&mut self, kind: AssetKind) -> Result<Resolution, AcquireError> {
        let names = self.listing(kind)?;
        let matches = require_candidates(&names, kind, &self.sequence_suffix, &self.dir_url(kind))?;

        let manifest = self.list_manifest(kind)?;
        let candidates = matches
            .iter()
            .map(|name| self.location(kind, name))
            .collect();
        let auxiliary = [README_FILE, CHECKSUMS_FILE]
            .into_iter()
            .filter(|aux| names.iter().any(|name| name == aux))
            .map(|aux| AuxiliaryArtifact {
                location: self.location(kind, aux),
                local_name: format!("{aux}.{}", kind.label()),
            })
            .collect();

        Ok(Resolution::Available(RemoteAsset {
            candidates,
            manifest,
            auxiliary,
        }))
    }

    fn list_manifest(&mut self, kind: AssetKind) -> Result<ChecksumManifest, AcquireError> {
        let url = self.location(kind, CHECKSUMS_FILE).joined();
        self.retry.run(|_| {
            let response = self.get(&url, CHECKSUMS_FILE)?;
            if response.status() == StatusCode::NOT_FOUND {
                tracing::warn!(url = %url, "no checksum manifest published");
                return Ok(ChecksumManifest::empty());
            }
            let response = ensure_success(response, &url, CHECKSUMS_FILE)?;
            let body = response.text().map_err(|err| AcquireError::TransferFailed {
                file: CHECKSUMS_FILE.to_string(),
                message: err.to_string(),
            })?;
            Ok(ChecksumManifest::parse(&body, DigestAlgorithm::BsdSum))
        })
    }

    fn fetch(&mut self, location: &RemoteLocation, destination: &Path) -> Result<u64, AcquireError> {
        let url = location.joined();
        let file = location.local_name();
        let response = self.get(&url, file)?;
        let mut response = ensure_success(response, &url, file)?;
        let expected_len = response.content_length();

        let output = File::create(destination).map_err(AcquireError::fs)?;
        let mut writer = BufWriter::new(output);
        let written = io::copy(&mut response, &mut writer).map_err(|err| {
            AcquireError::TransferFailed {
                file: file.to_string(),
                message: err.to_string(),
            }
        })?;
        writer.flush().map_err(AcquireError::fs)?;

        if let Some(expected_len) = expected_len
            && expected_len != written
        {
            return Err(AcquireError::TransferFailed {
                file: file.to_string(),
                message: format!("truncated: {written} of {expected_len} bytes"),
            });
        }
        tracing::debug!(url = %url, bytes = written, "transfer complete");
        Ok(written)
    }
}

/// Remote directory holding `kind` for a species, relative to the host.
pub fn ensembl_dir_path(
    division: Division,
    release: Release,
    species: &str,
    kind: AssetKind,
) -> String {
    let (section, leaf) = match kind {
        AssetKind::Sequence => ("fasta", "dna/"),
        AssetKind::Annotation => ("gtf", ""),
    };
    match (release, division.is_main_site()) {
        (Release::Numbered(number), true) => {
            format!("/pub/release-{number}/{section}/{species}/{leaf}")
        }
        (Release::Numbered(number), false) => format!(
            "/pub/release-{number}/{}/{section}/{species}/{leaf}",
            division.label()
        ),
        (Release::Current, true) => format!("/pub/current_{section}/{species}/{leaf}"),
        (Release::Current, false) => format!(
            "/pub/current/{}/{section}/{species}/{leaf}",
            division.label()
        ),
    }
}

/// File names linked from an HTML directory index, in listing order.
/// Parent links, sub-directories and sort links are skipped.
pub fn parse_index(html: &str) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for capture in HREF.captures_iter(html) {
        let target = &capture[1];
        if target.starts_with('?')
            || target.starts_with('/')
            || target.starts_with("..")
            || target.ends_with('/')
            || target.contains("://")
        {
            continue;
        }
        let name = target.trim_start_matches("./").to_string();
        if !names.contains(&name) {
            names.push(name);
        }
    }
    names
}

/// Files of `kind` in listing order.
pub fn select_candidates(names: &[String], kind: AssetKind, sequence_suffix: &str) -> Vec<String> {
    names
        .iter()
        .filter(|name| match kind {
            AssetKind::Sequence => name.ends_with(sequence_suffix),
            AssetKind::Annotation => {
                name.ends_with(ANNOTATION_SUFFIX)
                    && !ANNOTATION_VARIANTS
                        .iter()
                        .any(|variant| name.contains(variant))
            }
        })
        .cloned()
        .collect()
}

/// Like [`select_candidates`], but an empty match is an error for either kind:
/// Ensembl publishes a GTF for every species it lists, so a directory without
/// one is a broken release rather than a missing asset.
pub fn require_candidates(
    names: &[String],
    kind: AssetKind,
    sequence_suffix: &str,
    dir_url: &str,
) -> Result<Vec<String>, AcquireError> {
    let matches = select_candidates(names, kind, sequence_suffix);
    if matches.is_empty() {
        let wanted = match kind {
            AssetKind::Sequence => sequence_suffix,
            AssetKind::Annotation => ANNOTATION_SUFFIX,
        };
        return Err(AcquireError::ResolveFailed {
            path: dir_url.to_string(),
            message: format!("no {kind} file ending in {wanted}"),
        });
    }
    Ok(matches)
}

/// Accepts `ftp://` hosts for compatibility and serves them over HTTPS.
pub fn normalize_site(site: &str) -> String {
    let trimmed = site.trim().trim_end_matches('/');
    match trimmed.strip_prefix("ftp://") {
        Some(rest) => format!("https://{rest}"),
        None if trimmed.contains("://") => trimmed.to_string(),
        None => format!("https://{trimmed}"),
    }
}

fn build_client(config: &EnsemblConfig, site: &str) -> Result<Client, AcquireError> {
    let mut headers = HeaderMap::new();
    headers.insert(
        USER_AGENT,
        HeaderValue::from_str(&format!("genome-fetch/{}", env!("CARGO_PKG_VERSION")))
            .map_err(AcquireError::fs)?,
    );
    Client::builder()
        .default_headers(headers)
        .connect_timeout(config.connect_timeout)
        .timeout(config.request_timeout)
        .build()
        .map_err(|err| AcquireError::ConnectFailed {
            target: site.to_string(),
            message: err.to_string(),
        })
}

fn ensure_success(response: Response, url: &str, file: &str) -> Result<Response, AcquireError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if is_retryable_status(status.as_u16()) {
        return Err(AcquireError::TransferFailed {
            file: file.to_string(),
            message: format!("HTTP {status}"),
        });
    }
    Err(AcquireError::ResolveFailed {
        path: url.to_string(),
        message: format!("HTTP {status}"),
    })
}

fn map_request_error(err: reqwest::Error, site: &str, file: &str) -> AcquireError {
    if err.is_connect() {
        AcquireError::ConnectFailed {
            target: site.to_string(),
            message: err.to_string(),
        }
    } else {
        AcquireError::TransferFailed {
            file: file.to_string(),
            message: err.to_string(),
        }
    }
}

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 408 | 429 | 500 | 502 | 503 | 504)
}
