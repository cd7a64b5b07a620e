use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::error::AcquireError;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum AssetKind {
    #[value(alias = "genome")]
    #[serde(alias = "genome")]
    Sequence,
    #[value(alias = "gtf")]
    #[serde(alias = "gtf")]
    Annotation,
}

impl AssetKind {
    pub const ALL: [AssetKind; 2] = [AssetKind::Sequence, AssetKind::Annotation];

    pub fn label(self) -> &'static str {
        match self {
            AssetKind::Sequence => "sequence",
            AssetKind::Annotation => "annotation",
        }
    }

    /// Suffixes of the decompressed, authoritative file for this kind.
    pub fn final_suffixes(self) -> &'static [&'static str] {
        match self {
            AssetKind::Sequence => &[".fa", ".fna", ".fasta"],
            AssetKind::Annotation => &[".gtf"],
        }
    }

    pub fn matches_final(self, file_name: &str) -> bool {
        self.final_suffixes()
            .iter()
            .any(|suffix| file_name.ends_with(suffix))
    }

    pub fn matches_intermediate(self, file_name: &str) -> bool {
        file_name
            .strip_suffix(".gz")
            .map(|stem| self.matches_final(stem))
            .unwrap_or(false)
    }

    /// Name of the marker left when the archive has no asset of this kind.
    pub fn unavailable_marker(self) -> String {
        format!("{}.unavailable", self.label())
    }
}

impl fmt::Display for AssetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

impl FromStr for AssetKind {
    type Err = AcquireError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "sequence" | "genome" => Ok(AssetKind::Sequence),
            "annotation" | "gtf" => Ok(AssetKind::Annotation),
            _ => Err(AcquireError::InvalidKind(value.to_string())),
        }
    }
}

/// Ensembl division; selects the host and the path prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Division {
    #[value(alias = "vertebrates")]
    #[serde(alias = "vertebrates")]
    Primates,
    Plants,
    Fungi,
    Bacteria,
    Protists,
    Metazoa,
}

impl Division {
    pub fn label(self) -> &'static str {
        match self {
            Division::Primates => "primates",
            Division::Plants => "plants",
            Division::Fungi => "fungi",
            Division::Bacteria => "bacteria",
            Division::Protists => "protists",
            Division::Metazoa => "metazoa",
        }
    }

    /// Primates live on the main Ensembl site; everything else on Ensembl Genomes.
    pub fn is_main_site(self) -> bool {
        matches!(self, Division::Primates)
    }
}

impl FromStr for Division {
    type Err = AcquireError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        <Division as ValueEnum>::from_str(value.trim(), true)
            .map_err(|_| AcquireError::InvalidDivision(value.to_string()))
    }
}

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum AssemblySource {
    Refseq,
    Genbank,
    #[default]
    All,
}

impl AssemblySource {
    pub fn label(self) -> &'static str {
        match self {
            AssemblySource::Refseq => "refseq",
            AssemblySource::Genbank => "genbank",
            AssemblySource::All => "all",
        }
    }

    /// Value for `datasets --assembly-source`.
    pub fn datasets_flag(self) -> &'static str {
        match self {
            AssemblySource::Refseq => "RefSeq",
            AssemblySource::Genbank => "GenBank",
            AssemblySource::All => "all",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Source {
    Ensembl(Division),
    Ncbi(AssemblySource),
}

impl Source {
    pub fn archive_label(self) -> &'static str {
        match self {
            Source::Ensembl(_) => "ensembl",
            Source::Ncbi(_) => "ncbi",
        }
    }

    /// The division, or for NCBI the assembly-source selector standing in for it.
    pub fn division_label(self) -> &'static str {
        match self {
            Source::Ensembl(division) => division.label(),
            Source::Ncbi(assembly) => assembly.label(),
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.archive_label(), self.division_label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Release {
    Current,
    Numbered(u32),
}

impl fmt::Display for Release {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Release::Current => write!(f, "current"),
            Release::Numbered(value) => write!(f, "{value}"),
        }
    }
}

impl FromStr for Release {
    type Err = AcquireError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if trimmed.eq_ignore_ascii_case("current") {
            return Ok(Release::Current);
        }
        match trimmed.parse::<u32>() {
            Ok(number) if number > 0 => Ok(Release::Numbered(number)),
            _ => Err(AcquireError::InvalidRelease(value.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SpeciesName(String);

impl SpeciesName {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Directory component used in the local layout.
    pub fn dir_name(&self) -> String {
        self.0.replace(' ', "_")
    }

    /// Path component used by Ensembl (`homo_sapiens`).
    pub fn ensembl_name(&self) -> String {
        self.dir_name().to_lowercase()
    }
}

impl fmt::Display for SpeciesName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SpeciesName {
    type Err = AcquireError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.split_whitespace().collect::<Vec<_>>().join(" ");
        let is_valid = !normalized.is_empty()
            && !normalized.contains('/')
            && !normalized.contains('\\')
            && normalized != "."
            && normalized != "..";
        if !is_valid {
            return Err(AcquireError::InvalidSpecies(value.to_string()));
        }
        Ok(Self(normalized))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetRequest {
    species: SpeciesName,
    kinds: BTreeSet<AssetKind>,
    source: Source,
    release: Release,
}

impl AssetRequest {
    pub fn new(
        species: SpeciesName,
        kinds: impl IntoIterator<Item = AssetKind>,
        source: Source,
        release: Release,
    ) -> Self {
        Self {
            species,
            kinds: kinds.into_iter().collect(),
            source,
            release,
        }
    }

    pub fn species(&self) -> &SpeciesName {
        &self.species
    }

    pub fn kinds(&self) -> &BTreeSet<AssetKind> {
        &self.kinds
    }

    pub fn source(&self) -> Source {
        self.source
    }

    pub fn release(&self) -> Release {
        self.release
    }

    pub fn with_kinds(&self, kinds: impl IntoIterator<Item = AssetKind>) -> Self {
        Self {
            species: self.species.clone(),
            kinds: kinds.into_iter().collect(),
            source: self.source,
            release: self.release,
        }
    }
}
