//! Checksum manifests published next to remote assets.
//!
//! Ensembl directories carry a `CHECKSUMS` file produced by BSD `sum`
//! (`"<checksum> <blocks> <file>"`); NCBI Datasets packages carry an
//! `md5sum.txt` (`"<md5>  <path>"`). Both put the digest first and the path
//! last, which is all the parser relies on.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DigestAlgorithm {
    BsdSum,
    Md5,
}

impl DigestAlgorithm {
    pub fn name(self) -> &'static str {
        match self {
            DigestAlgorithm::BsdSum => "bsd-sum",
            DigestAlgorithm::Md5 => "md5",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExpectedDigest {
    pub algorithm: DigestAlgorithm,
    pub value: String,
}

impl fmt::Display for ExpectedDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm.name(), self.value)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChecksumManifest {
    entries: BTreeMap<String, ExpectedDigest>,
}

impl ChecksumManifest {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Parses a line-oriented manifest. Lines with fewer than two fields are skipped.
    pub fn parse(text: &str, algorithm: DigestAlgorithm) -> Self {
        let mut entries = BTreeMap::new();
        for line in text.lines() {
            let fields = line.split_whitespace().collect::<Vec<_>>();
            let Some((path, digest)) = fields.split_last() else {
                continue;
            };
            if digest.is_empty() {
                continue;
            }
            entries.insert(
                normalize_path(path),
                ExpectedDigest {
                    algorithm,
                    value: digest.join(" "),
                },
            );
        }
        Self { entries }
    }

    pub fn insert(&mut self, path: &str, digest: ExpectedDigest) {
        self.entries.insert(normalize_path(path), digest);
    }

    /// Looks up a file by exact relative path, falling back to a match on
    /// trailing path components (`GCF_1/x.fna` finds `ncbi_dataset/data/GCF_1/x.fna`).
    pub fn lookup(&self, file: &str) -> Option<&ExpectedDigest> {
        let wanted = normalize_path(file);
        if let Some(digest) = self.entries.get(&wanted) {
            return Some(digest);
        }
        let suffix = format!("/{wanted}");
        let mut matches = self
            .entries
            .iter()
            .filter(|(path, _)| path.ends_with(&suffix));
        let first = matches.next();
        // two candidates sharing the same tail are ambiguous
        if matches.next().is_some() {
            return None;
        }
        first.map(|(_, digest)| digest)
    }
}

fn normalize_path(path: &str) -> String {
    path.trim()
        .trim_start_matches('*')
        .trim_start_matches("./")
        .to_string()
}
