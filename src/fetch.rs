use std::fs;
use std::thread;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};

use crate::acquire::{ProgressEvent, ProgressSink};
use crate::archive::{ArchiveSession, AuxiliaryArtifact, RemoteLocation};
use crate::domain::AssetKind;
use crate::error::AcquireError;
use crate::fs_util;
use crate::manifest::ExpectedDigest;
use crate::store::partial_path;
use crate::verify::{self, Verdict};

const COMPRESSED_SUFFIX: &str = ".gz";

/// Bounded retry with exponential backoff. Only errors that report
/// [`AcquireError::is_retryable`] are retried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Pause after the given failed attempt (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = 1u32
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    pub fn run<T, F>(&self, mut operation: F) -> Result<T, AcquireError>
    where
        F: FnMut(u32) -> Result<T, AcquireError>,
    {
        let attempts = self.attempts();
        let mut attempt = 1;
        loop {
            match operation(attempt) {
                Ok(value) => return Ok(value),
                Err(err) if attempt < attempts && err.is_retryable() => {
                    let delay = self.delay_after(attempt);
                    tracing::warn!(
                        attempt,
                        max_attempts = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "attempt failed, retrying"
                    );
                    thread::sleep(delay);
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// A transferred and verified file that has not been finalized yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedFile {
    pub path: Utf8PathBuf,
    pub compressed: bool,
    pub bytes: u64,
}

/// Name of the authoritative file for a downloaded file name.
pub fn final_name(local_name: &str) -> &str {
    local_name
        .strip_suffix(COMPRESSED_SUFFIX)
        .unwrap_or(local_name)
}

pub struct Fetcher<'a> {
    policy: &'a RetryPolicy,
    sink: &'a dyn ProgressSink,
}

impl<'a> Fetcher<'a> {
    pub fn new(policy: &'a RetryPolicy, sink: &'a dyn ProgressSink) -> Self {
        Self { policy, sink }
    }

    /// Transfers `location` into `dir` and checks it against `expected`.
    ///
    /// Every attempt starts from an empty `<name>.part`; a copy that fails
    /// verification is deleted and the session told to drop anything cached.
    /// Compressed files are renamed to their intermediate name only once
    /// verified; uncompressed ones stay under the `.part` name until
    /// [`finalize`] moves them.
    pub fn fetch_verified<S: ArchiveSession + ?Sized>(
        &self,
        session: &mut S,
        species: &str,
        kind: AssetKind,
        location: &RemoteLocation,
        dir: &Utf8Path,
        expected: &ExpectedDigest,
    ) -> Result<FetchedFile, AcquireError> {
        let local_name = location.local_name();
        let landing = dir.join(local_name);
        let staged = partial_path(&landing);
        let attempts = self.policy.attempts();

        let bytes = self.policy.run(|attempt| {
            self.sink.event(ProgressEvent::TransferAttempt {
                species: species.to_string(),
                kind,
                file: local_name.to_string(),
                attempt,
                max_attempts: attempts,
            });
            remove_quietly(&staged);

            let bytes = match session.fetch(location, staged.as_std_path()) {
                Ok(bytes) => bytes,
                Err(err) => {
                    remove_quietly(&staged);
                    self.sink.event(ProgressEvent::TransferFailed {
                        species: species.to_string(),
                        kind,
                        file: local_name.to_string(),
                        attempt,
                        reason: err.to_string(),
                    });
                    return Err(err);
                }
            };

            match verify::check(staged.as_std_path(), Some(expected)) {
                Verdict::Verified => Ok(bytes),
                Verdict::Mismatch { actual } => {
                    remove_quietly(&staged);
                    session.invalidate(location);
                    self.sink.event(ProgressEvent::ChecksumMismatch {
                        species: species.to_string(),
                        kind,
                        file: local_name.to_string(),
                        attempt,
                    });
                    Err(AcquireError::ChecksumMismatch {
                        file: local_name.to_string(),
                        expected: expected.value.clone(),
                        actual,
                    })
                }
                Verdict::Unverifiable => {
                    remove_quietly(&staged);
                    Err(AcquireError::Unverifiable(location.file_name.clone()))
                }
                Verdict::Unreadable { message } => {
                    remove_quietly(&staged);
                    Err(AcquireError::Filesystem(format!("read {staged}: {message}")))
                }
            }
        })?;

        self.sink.event(ProgressEvent::Verified {
            species: species.to_string(),
            kind,
            file: local_name.to_string(),
        });

        if local_name.ends_with(COMPRESSED_SUFFIX) {
            fs::rename(staged.as_std_path(), landing.as_std_path()).map_err(|err| {
                remove_quietly(&staged);
                AcquireError::fs(err)
            })?;
            Ok(FetchedFile {
                path: landing,
                compressed: true,
                bytes,
            })
        } else {
            Ok(FetchedFile {
                path: staged,
                compressed: false,
                bytes,
            })
        }
    }

    /// Best effort: auxiliary files are neither verified nor retried.
    pub fn fetch_auxiliary<S: ArchiveSession + ?Sized>(
        &self,
        session: &mut S,
        artifact: &AuxiliaryArtifact,
        dir: &Utf8Path,
    ) -> bool {
        let target = dir.join(&artifact.local_name);
        let staged = partial_path(&target);
        let result = session
            .fetch(&artifact.location, staged.as_std_path())
            .and_then(|_| {
                fs::rename(staged.as_std_path(), target.as_std_path()).map_err(AcquireError::fs)
            });
        match result {
            Ok(()) => true,
            Err(err) => {
                remove_quietly(&staged);
                tracing::warn!(file = %artifact.local_name, error = %err, "auxiliary file skipped");
                false
            }
        }
    }
}

/// Moves a verified file into its final place.
///
/// Compressed files are decompressed next to the final path and renamed into
/// it; the intermediate is removed afterwards. When decompression fails the
/// intermediate is kept for a later run and no final file is left behind.
pub fn finalize(fetched: &FetchedFile, final_path: &Utf8Path) -> Result<(), AcquireError> {
    if !fetched.compressed {
        return fs::rename(fetched.path.as_std_path(), final_path.as_std_path())
            .map_err(AcquireError::fs);
    }

    let staged = partial_path(final_path);
    if let Err(err) = fs_util::gunzip(fetched.path.as_std_path(), staged.as_std_path()) {
        remove_quietly(&staged);
        return Err(AcquireError::DecompressFailed {
            file: fetched.path.to_string(),
            message: err.to_string(),
        });
    }
    fs::rename(staged.as_std_path(), final_path.as_std_path()).map_err(|err| {
        remove_quietly(&staged);
        AcquireError::fs(err)
    })?;
    fs::remove_file(fetched.path.as_std_path()).map_err(AcquireError::fs)?;
    Ok(())
}

fn remove_quietly(path: &Utf8Path) {
    if path.as_std_path().exists() {
        let _ = fs::remove_file(path.as_std_path());
    }
}
