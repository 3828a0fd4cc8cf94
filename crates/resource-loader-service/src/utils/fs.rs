//! Atomic file writes.

use std::fs;
use std::io::{self, Write};
use std::path::Path;

/// Writes `contents` to `path` through a uniquely named temporary file in the same
/// directory, so that readers observe either the old or the new contents.
///
/// Missing parent directories are created.
pub fn write_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
    let dir = path
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    fs::create_dir_all(dir)?;

    let mut temp_file = tempfile::Builder::new().prefix("tmp").tempfile_in(dir)?;
    temp_file.write_all(contents)?;
    temp_file.persist(path).map_err(|e| e.error)?;
    Ok(())
}
