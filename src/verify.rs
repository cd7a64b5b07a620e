//! Whole-file digests, streamed in fixed-size chunks.

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use md5::{Digest, Md5};

use crate::manifest::{DigestAlgorithm, ExpectedDigest};

/// Chunk size for reading files during hashing (1MB)
const CHUNK_SIZE: usize = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Verified,
    Mismatch { actual: String },
    /// No usable expectation: missing manifest entry or a malformed value.
    Unverifiable,
    Unreadable { message: String },
}

/// True only when `file` exists and its digest equals `expected`.
pub fn verify(file: &Path, expected: Option<&ExpectedDigest>) -> bool {
    matches!(check(file, expected), Verdict::Verified)
}

pub fn check(file: &Path, expected: Option<&ExpectedDigest>) -> Verdict {
    let Some(expected) = expected else {
        return Verdict::Unverifiable;
    };
    let Some(wanted) = normalize_expected(expected) else {
        return Verdict::Unverifiable;
    };
    match digest_file(file, expected.algorithm) {
        Ok(actual) if actual == wanted => Verdict::Verified,
        Ok(actual) => Verdict::Mismatch { actual },
        Err(err) => Verdict::Unreadable {
            message: err.to_string(),
        },
    }
}

/// Computes the digest of a file in the canonical text form of `algorithm`.
pub fn digest_file(file: &Path, algorithm: DigestAlgorithm) -> io::Result<String> {
    let mut reader = File::open(file)?;
    match algorithm {
        DigestAlgorithm::Md5 => md5_hex(&mut reader),
        DigestAlgorithm::BsdSum => bsd_sum(&mut reader),
    }
}

fn md5_hex(reader: &mut impl Read) -> io::Result<String> {
    let mut hasher = Md5::new();
    let mut buffer = vec![0u8; CHUNK_SIZE];
    loop {
        let n = reader.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// BSD `sum`: 16-bit rotating checksum plus the size in 1 KiB blocks.
fn bsd_sum(reader: &mut impl Read) -> io::Result<String> {
    let mut checksum: u32 = 0;
    let mut total: u64 = 0;
    let mut buffer = vec![0u8; CHUNK_SIZE];
    loop {
        let n = reader.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        for &byte in &buffer[..n] {
            checksum = (checksum >> 1) + ((checksum & 1) << 15);
            checksum = (checksum + u32::from(byte)) & 0xffff;
        }
        total += n as u64;
    }
    Ok(format!("{} {}", checksum, total.div_ceil(1024)))
}

fn normalize_expected(expected: &ExpectedDigest) -> Option<String> {
    match expected.algorithm {
        DigestAlgorithm::Md5 => {
            let value = expected.value.trim().to_ascii_lowercase();
            let well_formed =
                value.len() == 32 && value.chars().all(|ch| ch.is_ascii_hexdigit());
            well_formed.then_some(value)
        }
        DigestAlgorithm::BsdSum => {
            let fields = expected.value.split_whitespace().collect::<Vec<_>>();
            let [sum, blocks] = fields.as_slice() else {
                return None;
            };
            let sum = sum.parse::<u32>().ok()?;
            let blocks = blocks.parse::<u64>().ok()?;
            Some(format!("{sum} {blocks}"))
        }
    }
}
