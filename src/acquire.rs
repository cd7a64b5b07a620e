use std::collections::BTreeMap;
use std::fs;
use std::thread;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use rand::Rng;
use serde::Serialize;

use crate::archive::{ArchiveConnector, ArchiveSession, Resolution};
use crate::domain::{AssetKind, AssetRequest};
use crate::error::{AcquireError, ErrorClass};
use crate::fetch::{self, FetchedFile, Fetcher, RetryPolicy};
use crate::manifest::ExpectedDigest;
use crate::store::{self, Layout, LocalAsset, LocalState};
use crate::verify;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProgressEvent {
    SpeciesStarted {
        species: String,
        source: String,
        release: String,
    },
    AlreadySatisfied {
        species: String,
        kind: AssetKind,
    },
    Delayed {
        species: String,
        delay_ms: u64,
    },
    Resolved {
        species: String,
        kind: AssetKind,
        file: String,
    },
    /// More than one remote file matched; the first in listing order is used.
    MultipleCandidates {
        species: String,
        kind: AssetKind,
        chosen: String,
        candidates: Vec<String>,
    },
    NotAvailable {
        species: String,
        kind: AssetKind,
    },
    TransferAttempt {
        species: String,
        kind: AssetKind,
        file: String,
        attempt: u32,
        max_attempts: u32,
    },
    TransferFailed {
        species: String,
        kind: AssetKind,
        file: String,
        attempt: u32,
        reason: String,
    },
    ChecksumMismatch {
        species: String,
        kind: AssetKind,
        file: String,
        attempt: u32,
    },
    Verified {
        species: String,
        kind: AssetKind,
        file: String,
    },
    Finalized {
        species: String,
        kind: AssetKind,
        path: Utf8PathBuf,
    },
    KindFailed {
        species: String,
        kind: AssetKind,
        class: ErrorClass,
        reason: String,
    },
    SpeciesFinished {
        species: String,
        success: bool,
    },
    DuplicateSkipped {
        species: String,
        directory: Utf8PathBuf,
    },
}

impl ProgressEvent {
    pub fn species(&self) -> &str {
        match self {
            ProgressEvent::SpeciesStarted { species, .. }
            | ProgressEvent::AlreadySatisfied { species, .. }
            | ProgressEvent::Delayed { species, .. }
            | ProgressEvent::Resolved { species, .. }
            | ProgressEvent::MultipleCandidates { species, .. }
            | ProgressEvent::NotAvailable { species, .. }
            | ProgressEvent::TransferAttempt { species, .. }
            | ProgressEvent::TransferFailed { species, .. }
            | ProgressEvent::ChecksumMismatch { species, .. }
            | ProgressEvent::Verified { species, .. }
            | ProgressEvent::Finalized { species, .. }
            | ProgressEvent::KindFailed { species, .. }
            | ProgressEvent::SpeciesFinished { species, .. }
            | ProgressEvent::DuplicateSkipped { species, .. } => species,
        }
    }
}

/// Receives progress from worker threads; implementations must tolerate
/// concurrent calls.
pub trait ProgressSink: Send + Sync {
    fn event(&self, event: ProgressEvent);
}

pub struct NullSink;

impl ProgressSink for NullSink {
    fn event(&self, _event: ProgressEvent) {}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum KindOutcome {
    Obtained { path: Utf8PathBuf },
    /// The archive publishes nothing of this kind; not a failure.
    NotAvailable,
    Failed { error: ErrorClass, reason: String },
}

impl KindOutcome {
    fn failed(err: &AcquireError) -> Self {
        KindOutcome::Failed {
            error: err.class(),
            reason: err.to_string(),
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, KindOutcome::Failed { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AcquisitionResult {
    pub species: String,
    pub directory: Utf8PathBuf,
    pub outcomes: BTreeMap<AssetKind, KindOutcome>,
}

impl AcquisitionResult {
    /// Marks every requested kind as failed with the same cause.
    pub fn failed(request: &AssetRequest, directory: Utf8PathBuf, error: ErrorClass, reason: &str) -> Self {
        let outcomes = request
            .kinds()
            .iter()
            .map(|kind| {
                (
                    *kind,
                    KindOutcome::Failed {
                        error,
                        reason: reason.to_string(),
                    },
                )
            })
            .collect();
        Self {
            species: request.species().to_string(),
            directory,
            outcomes,
        }
    }

    /// True when no requested kind failed.
    pub fn success(&self) -> bool {
        !self.outcomes.values().any(KindOutcome::is_failed)
    }

    pub fn kinds_obtained(&self) -> Vec<AssetKind> {
        self.outcomes
            .iter()
            .filter(|(_, outcome)| matches!(outcome, KindOutcome::Obtained { .. }))
            .map(|(kind, _)| *kind)
            .collect()
    }

    pub fn failure_reason(&self) -> Option<String> {
        let reasons = self
            .outcomes
            .iter()
            .filter_map(|(kind, outcome)| match outcome {
                KindOutcome::Failed { reason, .. } => Some(format!("{kind}: {reason}")),
                _ => None,
            })
            .collect::<Vec<_>>();
        (!reasons.is_empty()).then(|| reasons.join("; "))
    }

    pub fn files(&self) -> Vec<&Utf8Path> {
        self.outcomes
            .values()
            .filter_map(|outcome| match outcome {
                KindOutcome::Obtained { path } => Some(path.as_path()),
                _ => None,
            })
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct AcquireOptions {
    /// Ignore local state and fetch everything again.
    pub force: bool,
    pub retry: RetryPolicy,
    /// Bounds of the random pause taken before any remote work.
    pub jitter_min: Duration,
    pub jitter_max: Duration,
}

impl Default for AcquireOptions {
    fn default() -> Self {
        Self {
            force: false,
            retry: RetryPolicy::default(),
            jitter_min: Duration::from_secs(1),
            jitter_max: Duration::from_secs(5),
        }
    }
}

pub struct Acquirer<C: ArchiveConnector> {
    connector: C,
    layout: Layout,
    options: AcquireOptions,
}

impl<C: ArchiveConnector> Acquirer<C> {
    pub fn new(connector: C, layout: Layout, options: AcquireOptions) -> Self {
        Self {
            connector,
            layout,
            options,
        }
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Brings one species to the requested state. Never fails: every error is
    /// recorded in the outcome of the kind it affected.
    pub fn acquire(&self, request: &AssetRequest, sink: &dyn ProgressSink) -> AcquisitionResult {
        let species = request.species().to_string();
        sink.event(ProgressEvent::SpeciesStarted {
            species: species.clone(),
            source: request.source().to_string(),
            release: request.release().to_string(),
        });

        let release_dir = self.layout.release_dir(request);
        let outcomes = self.run(request, &release_dir, sink);
        if store::remove_if_empty(&release_dir, &self.layout.species_dir(request)) {
            tracing::debug!(species = %species, "removed empty species directory");
        }

        let result = AcquisitionResult {
            species: species.clone(),
            directory: release_dir,
            outcomes,
        };
        sink.event(ProgressEvent::SpeciesFinished {
            species,
            success: result.success(),
        });
        result
    }

    fn run(
        &self,
        request: &AssetRequest,
        release_dir: &Utf8Path,
        sink: &dyn ProgressSink,
    ) -> BTreeMap<AssetKind, KindOutcome> {
        let species = request.species().to_string();
        let mut outcomes = BTreeMap::new();

        let local = match store::remove_partials(release_dir)
            .and_then(|_| store::inspect(release_dir, &species, request.kinds().iter().copied()))
        {
            Ok(local) => local,
            Err(err) => {
                fail_kinds(&species, request.kinds().iter().copied(), &err, &mut outcomes, sink);
                return outcomes;
            }
        };

        let mut pending = Vec::new();
        for (kind, asset) in local {
            if !self.options.force {
                match &asset.state {
                    LocalState::Final(path) => {
                        sink.event(ProgressEvent::AlreadySatisfied {
                            species: species.clone(),
                            kind,
                        });
                        outcomes.insert(kind, KindOutcome::Obtained { path: path.clone() });
                        continue;
                    }
                    LocalState::Unavailable => {
                        sink.event(ProgressEvent::AlreadySatisfied {
                            species: species.clone(),
                            kind,
                        });
                        outcomes.insert(kind, KindOutcome::NotAvailable);
                        continue;
                    }
                    LocalState::Missing | LocalState::Intermediate(_) => {}
                }
            }
            pending.push(asset);
        }
        if pending.is_empty() {
            return outcomes;
        }

        self.pause(&species, sink);
        let pending_kinds = pending.iter().map(|asset| asset.kind).collect::<Vec<_>>();
        let narrowed = request.with_kinds(pending_kinds.iter().copied());
        let session = self
            .layout
            .ensure_release_dir(request)
            .and_then(|_| self.connector.connect(&narrowed, &self.layout));
        let mut session = match session {
            Ok(session) => session,
            Err(err) => {
                fail_kinds(&species, pending_kinds, &err, &mut outcomes, sink);
                return outcomes;
            }
        };

        let mut lost_connection: Option<AcquireError> = None;
        for asset in &pending {
            let result = match &lost_connection {
                Some(err) => Err(clone_connect_error(err)),
                None => self.acquire_kind(&mut session, asset, release_dir, sink),
            };
            let outcome = match result {
                Ok(outcome) => outcome,
                Err(err) => {
                    fail_kinds(&species, [asset.kind], &err, &mut outcomes, sink);
                    if matches!(err, AcquireError::ConnectFailed { .. }) {
                        lost_connection = Some(err);
                    }
                    continue;
                }
            };
            outcomes.insert(asset.kind, outcome);
        }

        if let Err(err) = session.close() {
            tracing::warn!(species = %species, error = %err, "failed to close archive session");
        }
        outcomes
    }

    fn acquire_kind(
        &self,
        session: &mut C::Session,
        local: &LocalAsset,
        dir: &Utf8Path,
        sink: &dyn ProgressSink,
    ) -> Result<KindOutcome, AcquireError> {
        let species = local.species.as_str();
        let kind = local.kind;

        let asset = match session.resolve(kind)? {
            Resolution::Available(asset) => asset,
            Resolution::NotAvailable => {
                store::write_unavailable_marker(dir, kind)?;
                sink.event(ProgressEvent::NotAvailable {
                    species: species.to_string(),
                    kind,
                });
                return Ok(KindOutcome::NotAvailable);
            }
        };
        let location = asset
            .selected()
            .cloned()
            .ok_or_else(|| AcquireError::ResolveFailed {
                path: species.to_string(),
                message: format!("no {kind} candidate listed"),
            })?;
        if asset.candidates.len() > 1 {
            tracing::warn!(
                species,
                kind = %kind,
                chosen = %location.file_name,
                candidates = asset.candidates.len(),
                "several remote files match; using the first"
            );
            sink.event(ProgressEvent::MultipleCandidates {
                species: species.to_string(),
                kind,
                chosen: location.file_name.clone(),
                candidates: asset
                    .candidates
                    .iter()
                    .map(|candidate| candidate.file_name.clone())
                    .collect(),
            });
        }
        sink.event(ProgressEvent::Resolved {
            species: species.to_string(),
            kind,
            file: location.file_name.clone(),
        });

        let expected = asset
            .manifest
            .lookup(&location.file_name)
            .cloned()
            .ok_or_else(|| AcquireError::Unverifiable(location.file_name.clone()))?;

        let fetcher = Fetcher::new(&self.options.retry, sink);
        let fetched = match self.reusable_intermediate(local, location.local_name(), &expected)? {
            Some(fetched) => {
                tracing::debug!(species, path = %fetched.path, "reusing verified intermediate");
                fetched
            }
            None => fetcher.fetch_verified(session, species, kind, &location, dir, &expected)?,
        };

        let final_path = dir.join(fetch::final_name(location.local_name()));
        fetch::finalize(&fetched, &final_path)?;
        store::remove_other_candidates(dir, kind, &final_path)?;
        let marker = dir.join(kind.unavailable_marker());
        if marker.as_std_path().exists() {
            fs::remove_file(marker.as_std_path()).map_err(AcquireError::fs)?;
        }
        sink.event(ProgressEvent::Finalized {
            species: species.to_string(),
            kind,
            path: final_path.clone(),
        });

        for artifact in &asset.auxiliary {
            fetcher.fetch_auxiliary(session, artifact, dir);
        }
        Ok(KindOutcome::Obtained { path: final_path })
    }

    /// A compressed file left by an earlier run is finalized without a new
    /// transfer when it is the selected file and still matches the manifest.
    /// Anything else found there is discarded.
    fn reusable_intermediate(
        &self,
        local: &LocalAsset,
        selected_name: &str,
        expected: &ExpectedDigest,
    ) -> Result<Option<FetchedFile>, AcquireError> {
        let LocalState::Intermediate(path) = &local.state else {
            return Ok(None);
        };
        let reusable = !self.options.force
            && path.file_name() == Some(selected_name)
            && verify::verify(path.as_std_path(), Some(expected));
        if !reusable {
            fs::remove_file(path.as_std_path()).map_err(AcquireError::fs)?;
            return Ok(None);
        }
        let bytes = fs::metadata(path.as_std_path())
            .map_err(AcquireError::fs)?
            .len();
        Ok(Some(FetchedFile {
            path: path.clone(),
            compressed: true,
            bytes,
        }))
    }

    fn pause(&self, species: &str, sink: &dyn ProgressSink) {
        let min = self.options.jitter_min.as_millis() as u64;
        let max = (self.options.jitter_max.as_millis() as u64).max(min);
        if max == 0 {
            return;
        }
        let delay_ms = rand::thread_rng().gen_range(min..=max);
        sink.event(ProgressEvent::Delayed {
            species: species.to_string(),
            delay_ms,
        });
        thread::sleep(Duration::from_millis(delay_ms));
    }
}

fn fail_kinds(
    species: &str,
    kinds: impl IntoIterator<Item = AssetKind>,
    err: &AcquireError,
    outcomes: &mut BTreeMap<AssetKind, KindOutcome>,
    sink: &dyn ProgressSink,
) {
    for kind in kinds {
        sink.event(ProgressEvent::KindFailed {
            species: species.to_string(),
            kind,
            class: err.class(),
            reason: err.to_string(),
        });
        outcomes.insert(kind, KindOutcome::failed(err));
    }
}

fn clone_connect_error(err: &AcquireError) -> AcquireError {
    match err {
        AcquireError::ConnectFailed { target, message } => AcquireError::ConnectFailed {
            target: target.clone(),
            message: message.clone(),
        },
        other => AcquireError::Filesystem(other.to_string()),
    }
}
