use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::Path;

use flate2::read::MultiGzDecoder;
use zip::ZipArchive;

use crate::error::AcquireError;

/// Unpacks a `datasets` package under `target` and returns the number of files
/// written. Every entry is read once before the first write, so a truncated or
/// corrupt download leaves nothing behind.
pub fn unpack_package(zip_path: &Path, target: &Path) -> Result<usize, AcquireError> {
    let broken =
        |detail: String| AcquireError::Filesystem(format!("package {}: {detail}", zip_path.display()));
    let file = File::open(zip_path).map_err(|err| broken(err.to_string()))?;
    let mut archive = ZipArchive::new(file).map_err(|err| broken(err.to_string()))?;

    let mut files = Vec::new();
    for index in 0..archive.len() {
        let mut entry = archive
            .by_index(index)
            .map_err(|err| broken(err.to_string()))?;
        let relative = entry
            .enclosed_name()
            .ok_or_else(|| broken(format!("entry {} escapes the package", entry.name())))?;
        if entry.is_dir() {
            continue;
        }
        io::copy(&mut entry, &mut io::sink())
            .map_err(|err| broken(format!("{}: {err}", entry.name())))?;
        files.push((index, relative));
    }

    for (index, relative) in &files {
        let mut entry = archive
            .by_index(*index)
            .map_err(|err| broken(err.to_string()))?;
        let path = target.join(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(AcquireError::fs)?;
        }
        let mut output = File::create(&path).map_err(AcquireError::fs)?;
        io::copy(&mut entry, &mut output).map_err(AcquireError::fs)?;
    }
    Ok(files.len())
}

/// Streams a gzip file into `destination`, which is created or truncated.
/// Ensembl files are bgzip-compressed, hence the multi-member decoder.
pub fn gunzip(source: &Path, destination: &Path) -> io::Result<u64> {
    let input = fs::File::open(source)?;
    let mut decoder = MultiGzDecoder::new(BufReader::new(input));
    let output = fs::File::create(destination)?;
    let mut writer = BufWriter::new(output);
    let written = io::copy(&mut decoder, &mut writer)?;
    writer.flush()?;
    writer
        .into_inner()
        .map_err(|err| err.into_error())?
        .sync_all()?;
    Ok(written)
}
