//! Shell command history: newline separated, last 1,000 entries retained.

use std::io::Read;

use crate::error::{Error, Result};
use crate::paths::McpcHome;
use crate::store::{atomic_write, with_exclusive_lock};

pub const MAX_HISTORY_ENTRIES: usize = 1000;

/// Append one command, trimming the file to the newest
/// [`MAX_HISTORY_ENTRIES`]. Multi-line input is collapsed to a single line so
/// the file stays one-entry-per-line. The read-append-trim-write sequence
/// runs under the same advisory lock the JSON stores use, so concurrent CLI
/// invocations cannot clobber each other's entries.
pub fn append_history(home: &McpcHome, command: &str) -> Result<()> {
    let command = command.replace('\n', " ");
    let command = command.trim();
    if command.is_empty() {
        return Ok(());
    }
    let path = home.history_file();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| Error::client(format!("create {}: {e}", parent.display())))?;
    }

    with_exclusive_lock(&path, || {
        let mut lines = load_history(home)?;
        lines.push(command.to_string());
        let start = lines.len().saturating_sub(MAX_HISTORY_ENTRIES);
        let mut contents = lines[start..].join("\n");
        contents.push('\n');
        atomic_write(&path, contents.as_bytes())
    })
}

pub fn load_history(home: &McpcHome) -> Result<Vec<String>> {
    let path = home.history_file();
    let mut raw = String::new();
    match std::fs::File::open(&path) {
        Ok(mut file) => {
            file.read_to_string(&mut raw)
                .map_err(|e| Error::client(format!("read {}: {e}", path.display())))?;
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(Error::client(format!("open {}: {e}", path.display()))),
    }
    Ok(raw.lines().map(str::to_string).collect())
}
