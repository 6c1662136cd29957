//! Tracing subscriber configuration for ethermesh nodes.
//!
//! Log levels follow these conventions:
//! - ERROR: unrecoverable failures
//! - WARN: recoverable errors inside a service-loop cycle
//! - INFO: lifecycle events (identity generated, port bound, termination)
//! - DEBUG: per-subsystem state changes
//! - TRACE: per-datagram detail

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing_subscriber::EnvFilter;

/// Initialize logging to stdout.
///
/// Log level can be controlled via `RUST_LOG`; defaults to `info`. Safe to
/// call more than once; later calls are no-ops.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Initialize logging to a rotating file.
///
/// When the file would exceed `budget` bytes it is renamed to
/// `<name>.old` and restarted, so at most two budget-sized files exist.
pub fn init_file(path: &Path, budget: u64) -> std::io::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let writer = Mutex::new(RotatingWriter::open(path.to_path_buf(), budget)?);
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(false)
        .with_writer(writer)
        .try_init();
    Ok(())
}

/// Initialize logging for tests; never panics on repeat calls.
pub fn init_for_tests() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

/// A log writer that rotates the file once it would exceed its byte budget.
pub struct RotatingWriter {
    file: File,
    path: PathBuf,
    budget: u64,
    written: u64,
}

impl RotatingWriter {
    /// Open (or append to) `path`, tracking its current size against `budget`.
    pub fn open(path: PathBuf, budget: u64) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let written = file.metadata()?.len();
        Ok(Self {
            file,
            path,
            budget,
            written,
        })
    }

    fn rotate(&mut self) -> std::io::Result<()> {
        self.file.flush()?;
        let mut old = self.path.clone().into_os_string();
        old.push(".old");
        std::fs::rename(&self.path, &old)?;
        self.file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        self.written = 0;
        Ok(())
    }
}

impl Write for RotatingWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if self.written + buf.len() as u64 > self.budget {
            self.rotate()?;
        }
        let n = self.file.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.file.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_accumulate_in_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.log");
        let mut w = RotatingWriter::open(path.clone(), 1024).unwrap();
        w.write_all(b"hello log\n").unwrap();
        w.flush().unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "hello log\n");
    }

    #[test]
    fn rotation_moves_full_file_aside() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.log");
        let mut w = RotatingWriter::open(path.clone(), 16).unwrap();
        w.write_all(b"0123456789").unwrap();
        // This write would exceed the budget, forcing a rotation first.
        w.write_all(b"abcdefghij").unwrap();
        w.flush().unwrap();

        let old: PathBuf = {
            let mut s = path.clone().into_os_string();
            s.push(".old");
            s.into()
        };
        assert_eq!(std::fs::read_to_string(&old).unwrap(), "0123456789");
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "abcdefghij");
    }

    #[test]
    fn reopen_resumes_size_accounting() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.log");
        {
            let mut w = RotatingWriter::open(path.clone(), 16).unwrap();
            w.write_all(b"0123456789").unwrap();
            w.flush().unwrap();
        }
        let mut w = RotatingWriter::open(path.clone(), 16).unwrap();
        assert_eq!(w.written, 10);
        w.write_all(b"abcdefghij").unwrap();
        assert!(path.exists());
    }
}
