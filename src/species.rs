//! Where the batch's species names come from.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use camino::Utf8PathBuf;
use serde::Deserialize;

use crate::archive::ncbi::{DATASETS_TOOL, find_in_path};
use crate::domain::{AssemblySource, SpeciesName};
use crate::error::AcquireError;
use crate::store;

pub trait SpeciesSource {
    fn species(&self) -> Result<Vec<SpeciesName>, AcquireError>;
}

pub struct ExplicitSpecies {
    names: Vec<String>,
}

impl ExplicitSpecies {
    pub fn new(names: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            names: names.into_iter().map(Into::into).collect(),
        }
    }
}

impl SpeciesSource for ExplicitSpecies {
    fn species(&self) -> Result<Vec<SpeciesName>, AcquireError> {
        self.names.iter().map(|name| name.parse::<SpeciesName>()).collect()
    }
}

/// One species per line; blank lines are ignored.
pub struct SpeciesFile {
    path: PathBuf,
}

impl SpeciesFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl SpeciesSource for SpeciesFile {
    fn species(&self) -> Result<Vec<SpeciesName>, AcquireError> {
        let content =
            fs::read_to_string(&self.path).map_err(|err| AcquireError::SpeciesList {
                path: self.path.clone(),
                message: err.to_string(),
            })?;
        content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::parse::<SpeciesName>)
            .collect()
    }
}

/// Asks NCBI Datasets for organisms matching a taxon search term.
pub struct NcbiSpeciesSearch {
    datasets: Option<PathBuf>,
    term: String,
    assembly: AssemblySource,
    reference: bool,
    limit: usize,
    list_file: Option<Utf8PathBuf>,
}

impl NcbiSpeciesSearch {
    pub fn new(term: impl Into<String>, limit: usize) -> Self {
        Self {
            datasets: find_in_path(DATASETS_TOOL),
            term: term.into(),
            assembly: AssemblySource::All,
            reference: true,
            limit: limit.max(1),
            list_file: None,
        }
    }

    pub fn with_datasets(mut self, datasets: Option<PathBuf>) -> Self {
        if datasets.is_some() {
            self.datasets = datasets;
        }
        self
    }

    pub fn with_assembly_source(mut self, assembly: AssemblySource) -> Self {
        self.assembly = assembly;
        self
    }

    pub fn with_reference(mut self, reference: bool) -> Self {
        self.reference = reference;
        self
    }

    /// Also writes the discovered names, one per line, to `path`.
    pub fn with_list_file(mut self, path: Option<Utf8PathBuf>) -> Self {
        self.list_file = path;
        self
    }

    pub fn summary_args(&self) -> Vec<String> {
        let mut args = vec![
            "summary".to_string(),
            "genome".to_string(),
            "taxon".to_string(),
            self.term.clone(),
            "--assembly-source".to_string(),
            self.assembly.datasets_flag().to_string(),
            "--limit".to_string(),
            self.limit.to_string(),
            "--as-json-lines".to_string(),
        ];
        if self.reference {
            args.push("--reference".to_string());
        }
        args
    }

    fn run_summary(&self, datasets: &Path) -> Result<String, AcquireError> {
        let output = Command::new(datasets)
            .args(self.summary_args())
            .output()
            .map_err(|err| AcquireError::ResolveFailed {
                path: self.term.clone(),
                message: err.to_string(),
            })?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let message = if stderr.is_empty() {
                format!("datasets summary exited with {}", output.status)
            } else {
                stderr
            };
            return Err(AcquireError::ResolveFailed {
                path: self.term.clone(),
                message,
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl SpeciesSource for NcbiSpeciesSearch {
    fn species(&self) -> Result<Vec<SpeciesName>, AcquireError> {
        let datasets = self
            .datasets
            .as_deref()
            .ok_or_else(|| AcquireError::MissingTool(DATASETS_TOOL.to_string()))?;
        let stdout = self.run_summary(datasets)?;
        let names = parse_summary_lines(&stdout, self.limit);
        tracing::info!(term = %self.term, found = names.len(), "species search finished");

        if let Some(path) = &self.list_file
            && !names.is_empty()
        {
            let mut content = names.join("\n");
            content.push('\n');
            store::write_bytes_atomic(path, content.as_bytes())?;
        }
        names.iter().map(|name| name.parse::<SpeciesName>()).collect()
    }
}

#[derive(Debug, Deserialize)]
struct SummaryRecord {
    organism: SummaryOrganism,
}

#[derive(Debug, Deserialize)]
struct SummaryOrganism {
    organism_name: String,
}

/// Organism names from `datasets summary --as-json-lines` output, in order,
/// without duplicates and capped at `limit`. Quotes and brackets are removed
/// so the names work as taxon arguments.
pub fn parse_summary_lines(text: &str, limit: usize) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for line in text.lines().filter(|line| !line.trim().is_empty()) {
        let record: SummaryRecord = match serde_json::from_str(line) {
            Ok(record) => record,
            Err(err) => {
                tracing::warn!(error = %err, "skipping unparsable summary line");
                continue;
            }
        };
        let name = record
            .organism
            .organism_name
            .replace(['\'', '[', ']'], "")
            .trim()
            .to_string();
        if name.is_empty() || names.contains(&name) {
            continue;
        }
        names.push(name);
        if names.len() >= limit {
            break;
        }
    }
    names
}
