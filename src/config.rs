use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::domain::{AssemblySource, AssetKind, Division, Release, SpeciesName};
use crate::error::AcquireError;

pub const DEFAULT_CONFIG_FILE: &str = "genome-fetch.json";
pub const DEFAULT_OUTPUT: &str = "genomes";
pub const DEFAULT_PROCESSES: usize = 1;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub output: Option<Utf8PathBuf>,
    #[serde(default)]
    pub processes: Option<usize>,
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub force: Option<bool>,
    #[serde(default)]
    pub kinds: Option<Vec<AssetKind>>,
    #[serde(default)]
    pub species: Vec<SpeciesEntry>,
    #[serde(default)]
    pub ensembl: EnsemblSection,
    #[serde(default)]
    pub ncbi: NcbiSection,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(untagged)]
pub enum SpeciesEntry {
    Shorthand(String),
    Detailed(SpeciesEntryObject),
}

#[derive(Debug, Deserialize, Serialize)]
pub struct SpeciesEntryObject {
    pub name: String,
    #[serde(default)]
    pub release: Option<ReleaseValue>,
    #[serde(default)]
    pub kinds: Option<Vec<AssetKind>>,
}

/// Releases may be written as `113` or `"113"` / `"current"`.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum ReleaseValue {
    Number(u32),
    Text(String),
}

impl ReleaseValue {
    pub fn resolve(&self) -> Result<Release, AcquireError> {
        match self {
            ReleaseValue::Number(number) => number.to_string().parse(),
            ReleaseValue::Text(text) => text.parse(),
        }
    }
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct EnsemblSection {
    #[serde(default)]
    pub release: Option<ReleaseValue>,
    #[serde(default)]
    pub division: Option<Division>,
    #[serde(default)]
    pub sequence_suffix: Option<String>,
    #[serde(default)]
    pub main_site: Option<String>,
    #[serde(default)]
    pub genomes_site: Option<String>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct NcbiSection {
    #[serde(default)]
    pub assembly_source: Option<AssemblySource>,
    #[serde(default)]
    pub reference: Option<bool>,
    #[serde(default)]
    pub datasets: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpeciesTarget {
    pub name: SpeciesName,
    pub release: Option<Release>,
    pub kinds: Option<BTreeSet<AssetKind>>,
}

impl SpeciesTarget {
    pub fn named(name: SpeciesName) -> Self {
        Self {
            name,
            release: None,
            kinds: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct EnsemblSettings {
    pub release: Option<Release>,
    pub division: Option<Division>,
    pub sequence_suffix: Option<String>,
    pub main_site: Option<String>,
    pub genomes_site: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct NcbiSettings {
    pub assembly_source: Option<AssemblySource>,
    pub reference: Option<bool>,
    pub datasets: Option<PathBuf>,
}

/// Validated file contents; every value still optional so command-line flags
/// can take precedence.
#[derive(Debug, Clone, Default)]
pub struct ResolvedConfig {
    pub schema_version: u32,
    pub output: Option<Utf8PathBuf>,
    pub processes: Option<usize>,
    pub max_attempts: Option<u32>,
    pub force: Option<bool>,
    pub kinds: Option<BTreeSet<AssetKind>>,
    pub species: Vec<SpeciesTarget>,
    pub ensembl: EnsemblSettings,
    pub ncbi: NcbiSettings,
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// Loads `path`, or `genome-fetch.json` in the working directory when it
    /// exists. An explicit path that cannot be read is an error.
    pub fn resolve(path: Option<&Path>) -> Result<Option<ResolvedConfig>, AcquireError> {
        let config_path = match path {
            Some(path) => path.to_path_buf(),
            None => PathBuf::from(DEFAULT_CONFIG_FILE),
        };
        if path.is_none() && !config_path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| AcquireError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| AcquireError::ConfigParse(err.to_string()))?;
        tracing::debug!(path = %config_path.display(), "loaded config file");
        Self::resolve_config(config).map(Some)
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, AcquireError> {
        let schema_version = config.schema_version.unwrap_or(1);
        if schema_version != 1 {
            return Err(AcquireError::ConfigParse(format!(
                "unsupported schema_version {schema_version}"
            )));
        }
        if config.processes == Some(0) {
            return Err(AcquireError::ConfigParse(
                "processes must be at least 1".to_string(),
            ));
        }
        if config.max_attempts == Some(0) {
            return Err(AcquireError::ConfigParse(
                "max_attempts must be at least 1".to_string(),
            ));
        }

        let species = config
            .species
            .into_iter()
            .map(|entry| match entry {
                SpeciesEntry::Shorthand(value) => Ok(SpeciesTarget::named(value.parse()?)),
                SpeciesEntry::Detailed(obj) => Ok(SpeciesTarget {
                    name: obj.name.parse()?,
                    release: obj.release.as_ref().map(ReleaseValue::resolve).transpose()?,
                    kinds: obj.kinds.map(|kinds| kinds.into_iter().collect()),
                }),
            })
            .collect::<Result<Vec<_>, AcquireError>>()?;

        let ensembl = EnsemblSettings {
            release: config
                .ensembl
                .release
                .as_ref()
                .map(ReleaseValue::resolve)
                .transpose()?,
            division: config.ensembl.division,
            sequence_suffix: config.ensembl.sequence_suffix,
            main_site: config.ensembl.main_site,
            genomes_site: config.ensembl.genomes_site,
        };
        let ncbi = NcbiSettings {
            assembly_source: config.ncbi.assembly_source,
            reference: config.ncbi.reference,
            datasets: config.ncbi.datasets,
        };

        Ok(ResolvedConfig {
            schema_version,
            output: config.output,
            processes: config.processes,
            max_attempts: config.max_attempts,
            force: config.force,
            kinds: config.kinds.map(|kinds| kinds.into_iter().collect()),
            species,
            ensembl,
            ncbi,
        })
    }
}

/// Values given on the command line; `None` means "not given".
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub output: Option<Utf8PathBuf>,
    pub processes: Option<usize>,
    pub max_attempts: Option<u32>,
    pub force: bool,
    pub kinds: Option<Vec<AssetKind>>,
}

/// Batch-wide settings after layering flags over the file over defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSettings {
    pub output: Utf8PathBuf,
    pub processes: usize,
    pub max_attempts: u32,
    pub force: bool,
    pub kinds: BTreeSet<AssetKind>,
}

impl RunSettings {
    pub fn merge(overrides: &Overrides, config: Option<&ResolvedConfig>) -> Result<Self, AcquireError> {
        let kinds = match (&overrides.kinds, config.and_then(|config| config.kinds.as_ref())) {
            (Some(kinds), _) => kinds.iter().copied().collect(),
            (None, Some(kinds)) => kinds.clone(),
            (None, None) => AssetKind::ALL.into_iter().collect::<BTreeSet<_>>(),
        };
        if kinds.is_empty() {
            return Err(AcquireError::InvalidKind("no asset kinds selected".to_string()));
        }
        let processes = overrides
            .processes
            .or_else(|| config.and_then(|config| config.processes))
            .unwrap_or(DEFAULT_PROCESSES)
            .max(1);
        let max_attempts = overrides
            .max_attempts
            .or_else(|| config.and_then(|config| config.max_attempts))
            .unwrap_or(DEFAULT_MAX_ATTEMPTS)
            .max(1);

        Ok(Self {
            output: overrides
                .output
                .clone()
                .or_else(|| config.and_then(|config| config.output.clone()))
                .unwrap_or_else(|| Utf8PathBuf::from(DEFAULT_OUTPUT)),
            processes,
            max_attempts,
            force: overrides.force || config.and_then(|config| config.force).unwrap_or(false),
            kinds,
        })
    }
}
