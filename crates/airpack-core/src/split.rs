//! Size-bounded archive splitting
//!
//! ```text
//! airpack-package-demo-amd64-1.0.0.tar.gz.part000   {"sha256sum","bytes","count"}
//! airpack-package-demo-amd64-1.0.0.tar.gz.part001
//! airpack-package-demo-amd64-1.0.0.tar.gz.part002
//! ```
//!
//! The metadata part is written last, so a reader that finds it can trust the
//! data parts are complete.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::error::{CoreError, Result};

/// Highest part number the naming scheme allows
pub const MAX_PARTS: u64 = 999;

const BYTES_PER_MB: u64 = 1000 * 1000;

/// Contents of the `.part000` file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitMetadata {
    /// SHA-256 of the unsplit archive
    pub sha256sum: String,
    /// Size of the unsplit archive
    pub bytes: u64,
    /// Number of data parts
    pub count: u64,
}

/// Name of the n-th part of an archive
pub fn part_path(archive: &Path, index: u64) -> PathBuf {
    let mut name = archive.as_os_str().to_owned();
    name.push(format!(".part{:03}", index));
    PathBuf::from(name)
}

/// Whether `path` names a split metadata part
pub fn is_split_metadata(path: &Path) -> bool {
    path.to_string_lossy().ends_with(".part000")
}

/// Split `archive` into parts of at most `max_mb` megabytes when it is larger
///
/// Returns the produced part paths (metadata part first), or an empty list when
/// no split was needed. The unsplit archive is removed after a successful split.
pub fn split_archive(archive: &Path, max_mb: u64) -> Result<Vec<PathBuf>> {
    if max_mb == 0 {
        return Ok(Vec::new());
    }

    let size = std::fs::metadata(archive)
        .map_err(|e| CoreError::io(archive, e))?
        .len();
    let chunk_size = max_mb * BYTES_PER_MB;
    if size <= chunk_size {
        return Ok(Vec::new());
    }

    let count = size.div_ceil(chunk_size);
    if count > MAX_PARTS {
        return Err(CoreError::Config {
            message: format!(
                "package is {} bytes, which would need {} parts of {} MB (max {})",
                size, count, max_mb, MAX_PARTS
            ),
        });
    }

    tracing::info!(
        archive = %archive.display(),
        parts = count,
        "package exceeds {} MB, splitting",
        max_mb
    );

    let file = File::open(archive).map_err(|e| CoreError::io(archive, e))?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut parts = Vec::with_capacity(count as usize + 1);
    let mut buffer = vec![0u8; 64 * 1024];

    for index in 1..=count {
        let path = part_path(archive, index);
        let out = File::create(&path).map_err(|e| CoreError::io(&path, e))?;
        let mut writer = BufWriter::new(out);
        let mut remaining = chunk_size;

        while remaining > 0 {
            let want = remaining.min(buffer.len() as u64) as usize;
            let read = reader
                .read(&mut buffer[..want])
                .map_err(|e| CoreError::io(archive, e))?;
            if read == 0 {
                break;
            }
            hasher.update(&buffer[..read]);
            writer
                .write_all(&buffer[..read])
                .map_err(|e| CoreError::io(&path, e))?;
            remaining -= read as u64;
        }
        writer.flush().map_err(|e| CoreError::io(&path, e))?;
        parts.push(path);
    }

    let metadata = SplitMetadata {
        sha256sum: hex::encode(hasher.finalize()),
        bytes: size,
        count,
    };
    let meta_path = part_path(archive, 0);
    std::fs::write(&meta_path, serde_json::to_vec(&metadata)?)
        .map_err(|e| CoreError::io(&meta_path, e))?;
    parts.insert(0, meta_path);

    std::fs::remove_file(archive).map_err(|e| CoreError::io(archive, e))?;
    Ok(parts)
}

/// Join the parts described by a `.part000` file into `dest_dir`
///
/// The joined archive must match the recorded byte count and SHA-256.
pub fn reassemble(metadata_part: &Path, dest_dir: &Path) -> Result<PathBuf> {
    let content = std::fs::read(metadata_part).map_err(|e| CoreError::io(metadata_part, e))?;
    let metadata: SplitMetadata = serde_json::from_slice(&content)?;

    let name = metadata_part.to_string_lossy();
    let base = PathBuf::from(name.trim_end_matches(".part000"));
    let file_name = base.file_name().ok_or_else(|| CoreError::Archive {
        message: format!("invalid split archive name {}", metadata_part.display()),
    })?;

    std::fs::create_dir_all(dest_dir).map_err(|e| CoreError::io(dest_dir, e))?;
    let output = dest_dir.join(file_name);
    let out = File::create(&output).map_err(|e| CoreError::io(&output, e))?;
    let mut writer = BufWriter::new(out);
    let mut hasher = Sha256::new();
    let mut total = 0u64;
    let mut buffer = vec![0u8; 64 * 1024];

    for index in 1..=metadata.count {
        let part = part_path(&base, index);
        let file = File::open(&part).map_err(|e| CoreError::io(&part, e))?;
        let mut reader = BufReader::new(file);
        loop {
            let read = reader
                .read(&mut buffer)
                .map_err(|e| CoreError::io(&part, e))?;
            if read == 0 {
                break;
            }
            hasher.update(&buffer[..read]);
            writer
                .write_all(&buffer[..read])
                .map_err(|e| CoreError::io(&output, e))?;
            total += read as u64;
        }
    }
    writer.flush().map_err(|e| CoreError::io(&output, e))?;

    if total != metadata.bytes {
        return Err(CoreError::Archive {
            message: format!(
                "split archive is {} bytes, expected {}",
                total, metadata.bytes
            ),
        });
    }
    let actual = hex::encode(hasher.finalize());
    if actual != metadata.sha256sum {
        return Err(CoreError::ChecksumMismatch {
            path: base.display().to_string(),
            expected: metadata.sha256sum,
            actual,
        });
    }

    Ok(output)
}
