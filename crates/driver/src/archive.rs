//! Tar streams exchanged with runtimes for file transfer.

use crate::DriverError;
use std::io::Read;
use std::path::Path;

/// Extract a tar stream into `dst`, creating it if needed.
pub(crate) fn unpack(bytes: &[u8], dst: &Path) -> Result<(), DriverError> {
    std::fs::create_dir_all(dst)?;
    tar::Archive::new(bytes).unpack(dst)?;
    Ok(())
}

/// Content of the first regular file in a tar stream.
pub(crate) fn first_file(bytes: &[u8], subject: &str) -> Result<String, DriverError> {
    let mut archive = tar::Archive::new(bytes);
    for entry in archive.entries()? {
        let mut entry = entry?;
        if entry.header().entry_type().is_file() {
            let mut content = String::new();
            entry.read_to_string(&mut content)?;
            return Ok(content);
        }
    }
    Err(DriverError::NotFound(format!("{subject}: empty archive")))
}

/// Tar stream holding `local` under the relative name `arcname`.
pub(crate) fn pack_file(local: &Path, arcname: &str) -> Result<Vec<u8>, DriverError> {
    let mut builder = tar::Builder::new(Vec::new());
    builder.append_path_with_name(local, arcname.trim_start_matches('/'))?;
    Ok(builder.into_inner()?)
}

/// Split a remote path into parent directory and final component, ignoring
/// a trailing slash.
pub(crate) fn split_remote(path: &str) -> (&str, &str) {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) => ("/", &trimmed[1..]),
        Some(idx) => (&trimmed[..idx], &trimmed[idx + 1..]),
        None => (".", trimmed),
    }
}
