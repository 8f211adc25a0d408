//! Locked read-modify-write for the JSON state files (`sessions.json`,
//! `profiles.json`).
//!
//! Mutations hold an exclusive advisory lock on a `<file>.lock` sidecar while
//! the data file itself is atomically replaced, so concurrent readers never
//! observe a partial file even if a writer dies mid-write. The lock is on a
//! sidecar because a lock taken on the data file would be tied to the inode
//! that the rename just replaced.

use std::fs::OpenOptions;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{Error, Result};

pub const LOCK_RETRIES: usize = 5;
pub const LOCK_INITIAL_BACKOFF: Duration = Duration::from_millis(100);
pub const LOCK_BACKOFF_CAP: Duration = Duration::from_secs(5);

fn lock_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(".lock");
    PathBuf::from(os)
}

fn open_owner_only(path: &Path, append: bool) -> std::io::Result<std::fs::File> {
    let mut options = OpenOptions::new();
    options.create(true).read(true).write(true);
    if append {
        options.append(true);
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    options.open(path)
}

/// Run `f` while holding the exclusive sidecar lock for `path`, acquired
/// with bounded exponential backoff. A file that stays locked past the retry
/// budget surfaces as the distinct busy error rather than blocking forever.
/// The lock is released on every exit path.
pub(crate) fn with_exclusive_lock<R>(path: &Path, f: impl FnOnce() -> Result<R>) -> Result<R> {
    let lock_file_path = lock_path(path);
    let file = open_owner_only(&lock_file_path, false)
        .map_err(|e| Error::client(format!("open {}: {e}", lock_file_path.display())))?;
    let mut lock = fd_lock::RwLock::new(file);

    let mut delay = LOCK_INITIAL_BACKOFF;
    let mut attempt = 0usize;
    let guard = loop {
        match lock.try_write() {
            Ok(guard) => break guard,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                if attempt >= LOCK_RETRIES {
                    return Err(Error::Busy { path: path.to_path_buf() });
                }
                attempt += 1;
                std::thread::sleep(delay);
                delay = (delay * 2).min(LOCK_BACKOFF_CAP);
            }
            Err(e) => {
                return Err(Error::client(format!(
                    "lock {}: {e}",
                    lock_file_path.display()
                )));
            }
        }
    };

    let result = f();
    drop(guard);
    result
}

/// Write `bytes` to a temp file in the OS temp dir and move it into place.
/// If the rename crosses filesystems, fall back to a sibling temp file in the
/// target directory, which rename can always replace atomically.
pub(crate) fn atomic_write(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = std::env::temp_dir().join(format!("mcpc-{}.tmp", uuid::Uuid::new_v4()));
    write_file(&tmp, bytes)?;
    if std::fs::rename(&tmp, path).is_ok() {
        return Ok(());
    }
    let _ = std::fs::remove_file(&tmp);

    let parent = path
        .parent()
        .ok_or_else(|| Error::client(format!("{} has no parent directory", path.display())))?;
    let sibling = parent.join(format!(".mcpc-{}.tmp", uuid::Uuid::new_v4()));
    write_file(&sibling, bytes)?;
    std::fs::rename(&sibling, path).map_err(|e| {
        let _ = std::fs::remove_file(&sibling);
        Error::client(format!("replace {}: {e}", path.display()))
    })
}

fn write_file(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut file = open_owner_only(path, false)
        .map_err(|e| Error::client(format!("create {}: {e}", path.display())))?;
    file.write_all(bytes)
        .and_then(|_| file.sync_all())
        .map_err(|e| Error::client(format!("write {}: {e}", path.display())))
}

/// Run `f` against the parsed contents of `path` under an exclusive advisory
/// lock, then persist the (possibly mutated) value atomically. The file is
/// seeded with `default()` when absent. The lock is released on every exit
/// path, success or not.
pub fn with_file_lock<T, R, F>(path: &Path, default: impl FnOnce() -> T, f: F) -> Result<R>
where
    T: Serialize + DeserializeOwned,
    F: FnOnce(&mut T) -> Result<R>,
{
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| Error::client(format!("create {}: {e}", parent.display())))?;
    }

    with_exclusive_lock(path, || {
        let mut value: T = match std::fs::File::open(path) {
            Ok(mut file) => {
                let mut raw = String::new();
                file.read_to_string(&mut raw)
                    .map_err(|e| Error::client(format!("read {}: {e}", path.display())))?;
                if raw.trim().is_empty() {
                    default()
                } else {
                    serde_json::from_str(&raw)
                        .map_err(|e| Error::client(format!("parse {}: {e}", path.display())))?
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let value = default();
                let seeded = serde_json::to_vec_pretty(&value)
                    .map_err(|e| Error::client(format!("serialize {}: {e}", path.display())))?;
                atomic_write(path, &seeded)?;
                value
            }
            Err(e) => return Err(Error::client(format!("open {}: {e}", path.display()))),
        };

        let result = f(&mut value)?;

        let bytes = serde_json::to_vec_pretty(&value)
            .map_err(|e| Error::client(format!("serialize {}: {e}", path.display())))?;
        atomic_write(path, &bytes)?;
        Ok(result)
    })
}

/// Lock-free read. Safe against concurrent writers because the data file is
/// only ever replaced atomically; absent or empty files read as `default()`.
pub fn read_or_default<T>(path: &Path, default: impl FnOnce() -> T) -> Result<T>
where
    T: DeserializeOwned,
{
    match std::fs::read_to_string(path) {
        Ok(raw) if raw.trim().is_empty() => Ok(default()),
        Ok(raw) => serde_json::from_str(&raw)
            .map_err(|e| Error::client(format!("parse {}: {e}", path.display()))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(default()),
        Err(e) => Err(Error::client(format!("read {}: {e}", path.display()))),
    }
}
