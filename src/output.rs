use std::io::{self, Write};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::acquire::{AcquisitionResult, KindOutcome, ProgressEvent, ProgressSink};

#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub source: String,
    pub started_at: String,
    pub finished_at: String,
    pub succeeded: usize,
    pub failed: usize,
    pub failed_species: Vec<String>,
    pub results: Vec<AcquisitionResult>,
}

impl BatchReport {
    pub fn new(
        source: impl Into<String>,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        results: Vec<AcquisitionResult>,
    ) -> Self {
        let failed_species = results
            .iter()
            .filter(|result| !result.success())
            .map(|result| result.species.clone())
            .collect::<Vec<_>>();
        Self {
            source: source.into(),
            started_at: started_at.to_rfc3339(),
            finished_at: finished_at.to_rfc3339(),
            succeeded: results.len() - failed_species.len(),
            failed: failed_species.len(),
            failed_species,
            results,
        }
    }

    pub fn all_succeeded(&self) -> bool {
        self.failed == 0
    }

    /// Plain-text summary: totals, then one line per species and kind.
    pub fn render_text(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!(
            "{}: {} succeeded, {} failed\n",
            self.source, self.succeeded, self.failed
        ));
        for result in &self.results {
            let status = if result.success() { "ok" } else { "FAILED" };
            out.push_str(&format!("  {} [{status}] {}\n", result.species, result.directory));
            for (kind, outcome) in &result.outcomes {
                let detail = match outcome {
                    KindOutcome::Obtained { path } => format!("obtained {path}"),
                    KindOutcome::NotAvailable => "not available".to_string(),
                    KindOutcome::Failed { reason, .. } => format!("failed: {reason}"),
                };
                out.push_str(&format!("    {kind}: {detail}\n"));
            }
        }
        if !self.failed_species.is_empty() {
            out.push_str(&format!(
                "failed species: {}\n",
                self.failed_species.join(", ")
            ));
        }
        out
    }
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_report(report: &BatchReport) -> io::Result<()> {
        Self::print_json(report)
    }

    pub fn print_species(names: &[String]) -> io::Result<()> {
        Self::print_json(&names)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

/// Renders progress events as structured log lines.
pub struct LogSink;

impl ProgressSink for LogSink {
    fn event(&self, event: ProgressEvent) {
        match event {
            ProgressEvent::SpeciesStarted {
                species,
                source,
                release,
            } => tracing::info!(species = %species, source = %source, release = %release, phase = "start", "processing species"),
            ProgressEvent::AlreadySatisfied { species, kind } => {
                tracing::info!(species = %species, kind = %kind, phase = "inspect", "already present, skipping")
            }
            ProgressEvent::Delayed { species, delay_ms } => {
                tracing::debug!(species = %species, delay_ms, phase = "delay", "pausing before remote work")
            }
            ProgressEvent::Resolved {
                species,
                kind,
                file,
            } => tracing::info!(species = %species, kind = %kind, file = %file, phase = "resolve", "remote file selected"),
            ProgressEvent::MultipleCandidates {
                species,
                kind,
                chosen,
                candidates,
            } => tracing::warn!(
                species = %species,
                kind = %kind,
                chosen = %chosen,
                candidates = %candidates.join(","),
                phase = "resolve",
                "several files match; first one used"
            ),
            ProgressEvent::NotAvailable { species, kind } => {
                tracing::warn!(species = %species, kind = %kind, phase = "resolve", "not published by the archive")
            }
            ProgressEvent::TransferAttempt {
                species,
                kind,
                file,
                attempt,
                max_attempts,
            } => tracing::info!(species = %species, kind = %kind, file = %file, attempt, max_attempts, phase = "fetch", "downloading"),
            ProgressEvent::TransferFailed {
                species,
                kind,
                file,
                attempt,
                reason,
            } => tracing::warn!(species = %species, kind = %kind, file = %file, attempt, reason = %reason, phase = "fetch", "transfer failed"),
            ProgressEvent::ChecksumMismatch {
                species,
                kind,
                file,
                attempt,
            } => tracing::warn!(species = %species, kind = %kind, file = %file, attempt, phase = "verify", "checksum mismatch"),
            ProgressEvent::Verified {
                species,
                kind,
                file,
            } => tracing::info!(species = %species, kind = %kind, file = %file, phase = "verify", "checksum verified"),
            ProgressEvent::Finalized {
                species,
                kind,
                path,
            } => tracing::info!(species = %species, kind = %kind, path = %path, phase = "finalize", "ready"),
            ProgressEvent::KindFailed {
                species,
                kind,
                class,
                reason,
            } => tracing::error!(species = %species, kind = %kind, class = ?class, reason = %reason, phase = "failed", "asset not obtained"),
            ProgressEvent::SpeciesFinished { species, success } => {
                tracing::info!(species = %species, success, phase = "done", "species finished")
            }
            ProgressEvent::DuplicateSkipped { species, directory } => {
                tracing::warn!(species = %species, directory = %directory, "duplicate species skipped")
            }
        }
    }
}
