#![forbid(unsafe_code)]

//! Append-only playlist files: one absolute media path per line.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;

use crate::error::{SyncError, SyncResult};

/// Reads every non-empty line of a playlist file. A missing file is empty.
pub fn load_entries(path: &Path) -> SyncResult<Vec<String>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = fs::read_to_string(path)
        .map_err(|err| SyncError::io(format!("reading playlist {}", path.display()), err))?;
    Ok(content
        .lines()
        .map(|line| line.trim_end_matches('\r'))
        .filter(|line| !line.is_empty())
        .map(str::to_owned)
        .collect())
}

/// Appends `entry` unless an identical line is already present. Returns
/// whether the file was changed.
pub fn append_if_absent(path: &Path, entry: &str) -> SyncResult<bool> {
    if load_entries(path)?.iter().any(|line| line == entry) {
        return Ok(false);
    }

    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .map_err(|err| SyncError::io(format!("creating {}", parent.display()), err))?;
    }

    let needs_newline = fs::read(path)
        .map(|bytes| bytes.last().is_some_and(|last| *last != b'\n'))
        .unwrap_or(false);

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|err| SyncError::io(format!("opening playlist {}", path.display()), err))?;
    let mut line = String::with_capacity(entry.len() + 2);
    if needs_newline {
        line.push('\n');
    }
    line.push_str(entry);
    line.push('\n');
    file.write_all(line.as_bytes())
        .map_err(|err| SyncError::io(format!("writing playlist {}", path.display()), err))?;
    Ok(true)
}
