//! Filesystem helpers: atomic writes, digests, directory copies.

use sha2::{Digest, Sha256};
use std::fs;
use std::io::{Read, Write};
use std::path::Path;
use tempfile::NamedTempFile;
use vmci_shared::{VmciError, VmciResult};
use walkdir::WalkDir;

/// Write `data` to `path` atomically: temp file in the same directory, then rename.
pub fn atomic_write(path: &Path, data: &[u8]) -> VmciResult<()> {
    let dir = path
        .parent()
        .ok_or_else(|| VmciError::Storage(format!("{} has no parent directory", path.display())))?;
    fs::create_dir_all(dir)?;

    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(data)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| VmciError::Io(e.error))?;
    Ok(())
}

/// Serialize `value` as pretty JSON and write it atomically.
pub fn atomic_write_json<T: serde::Serialize>(path: &Path, value: &T) -> VmciResult<()> {
    let mut data = serde_json::to_vec_pretty(value)?;
    data.push(b'\n');
    atomic_write(path, &data)
}

/// Hex sha256 of a file, streamed.
pub fn sha256_file(path: &Path) -> VmciResult<String> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 1 << 20];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Copy every regular file under `src` into `dst`, preserving relative paths.
///
/// Returns the number of files copied. A missing `src` copies nothing.
pub fn copy_tree(src: &Path, dst: &Path) -> VmciResult<usize> {
    if !src.exists() {
        return Ok(0);
    }
    let mut copied = 0;
    for entry in WalkDir::new(src) {
        let entry = entry.map_err(|e| VmciError::Storage(e.to_string()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| VmciError::Internal(e.to_string()))?;
        let target = dst.join(relative);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(entry.path(), &target)?;
        copied += 1;
    }
    Ok(copied)
}
