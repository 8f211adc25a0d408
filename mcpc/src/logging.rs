use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};

pub const DEFAULT_MAX_LOG_SIZE: u64 = 10 * 1024 * 1024;
pub const DEFAULT_MAX_ROTATED: usize = 5;

pub const REDACTED: &str = "<redacted>";

/// Header names whose values never reach a log line or a state file.
pub const SENSITIVE_HEADERS: &[&str] =
    &["authorization", "cookie", "proxy-authorization", "x-api-key"];

pub fn is_sensitive_header(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    SENSITIVE_HEADERS.iter().any(|h| *h == lower)
}

pub fn redact_headers(headers: &HashMap<String, String>) -> HashMap<String, String> {
    headers
        .iter()
        .map(|(k, v)| {
            let value = if is_sensitive_header(k) { REDACTED.to_string() } else { v.clone() };
            (k.clone(), value)
        })
        .collect()
}

/// Append-only log file with size-based rotation: when a write would push the
/// file past `max_size`, the current file becomes `.1`, `.1` becomes `.2` and
/// so on, keeping at most `max_rotated` old files.
pub struct RotatingWriter {
    path: PathBuf,
    file: File,
    written: u64,
    max_size: u64,
    max_rotated: usize,
}

impl RotatingWriter {
    pub fn open(path: PathBuf) -> io::Result<Self> {
        Self::with_limits(path, DEFAULT_MAX_LOG_SIZE, DEFAULT_MAX_ROTATED)
    }

    pub fn with_limits(path: PathBuf, max_size: u64, max_rotated: usize) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = open_append(&path)?;
        let written = file.metadata().map(|m| m.len()).unwrap_or(0);
        Ok(Self { path, file, written, max_size, max_rotated })
    }

    fn rotated_path(&self, index: usize) -> PathBuf {
        let mut os = self.path.as_os_str().to_os_string();
        os.push(format!(".{index}"));
        PathBuf::from(os)
    }

    fn rotate(&mut self) -> io::Result<()> {
        self.file.flush()?;
        let _ = std::fs::remove_file(self.rotated_path(self.max_rotated));
        for index in (1..self.max_rotated).rev() {
            let from = self.rotated_path(index);
            if from.exists() {
                let _ = std::fs::rename(&from, self.rotated_path(index + 1));
            }
        }
        std::fs::rename(&self.path, self.rotated_path(1))?;
        self.file = open_append(&self.path)?;
        self.written = 0;
        Ok(())
    }
}

fn open_append(path: &std::path::Path) -> io::Result<File> {
    let mut options = std::fs::OpenOptions::new();
    options.create(true).append(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    options.open(path)
}

impl Write for RotatingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.written + buf.len() as u64 > self.max_size {
            self.rotate()?;
        }
        let n = self.file.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

/// Cloneable handle for use as a `tracing` writer; every clone appends to the
/// same rotating file.
#[derive(Clone)]
pub struct SharedWriter(Arc<Mutex<RotatingWriter>>);

impl SharedWriter {
    pub fn new(inner: RotatingWriter) -> Self {
        Self(Arc::new(Mutex::new(inner)))
    }

    pub fn flush(&self) {
        if let Ok(mut guard) = self.0.lock() {
            let _ = guard.flush();
        }
    }
}

impl Write for SharedWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.0.lock() {
            Ok(mut guard) => guard.write(buf),
            Err(_) => Err(io::Error::other("log writer poisoned")),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.0.lock() {
            Ok(mut guard) => guard.flush(),
            Err(_) => Ok(()),
        }
    }
}

/// Initialize tracing for a bridge daemon: rotating per-session log file,
/// `RUST_LOG`-style filtering, debug level when verbose.
pub fn init_bridge_tracing(log_path: PathBuf, verbose: bool) -> Result<SharedWriter> {
    let writer = SharedWriter::new(
        RotatingWriter::open(log_path.clone())
            .map_err(|e| Error::client(format!("open log {}: {e}", log_path.display())))?,
    );
    let default_filter = if verbose { "debug" } else { "info" };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(default_filter))
        .map_err(|e| Error::client(format!("log filter: {e}")))?;
    let make_writer = {
        let writer = writer.clone();
        move || writer.clone()
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_ansi(false)
        .with_writer(make_writer)
        .try_init();
    Ok(writer)
}
