use std::ffi::OsStr;
use std::io;
use std::path::Path;
use std::thread;
use std::time::Duration;

use anyhow::Result;
use once_cell::sync::OnceCell;
use sha2::{Digest, Sha256};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub mod filesystem;

pub use filesystem::{DirEntry, FileSystem, FsMetadata, RealFileSystem, VirtualFileSystem};

/// Guard for the non-blocking file writer so it is not dropped early.
static FILE_GUARD: OnceCell<WorkerGuard> = OnceCell::new();
/// Ensures logging is only initialized once.
static LOG_INIT: OnceCell<()> = OnceCell::new();

/// Initialize tracing-based logging with both console and file output.
///
/// `default_filter` applies when `RUST_LOG` is unset. Subsequent calls are
/// no-ops so every entry point can call this helper confidently.
pub fn init_logging(log_path: &Path, fs: &dyn FileSystem, default_filter: &str) -> Result<()> {
    LOG_INIT
        .get_or_try_init(|| configure_logging(log_path, fs, default_filter))
        .map(|_| ())
}

/// Lowercase hex SHA-256 digest of a byte slice.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Read a whole file with retries to tolerate transient IO errors.
pub fn read_file_with_retry(
    fs: &dyn FileSystem,
    path: &Path,
    attempts: usize,
    delay_ms: u64,
) -> io::Result<Vec<u8>> {
    retry_io(path, attempts, delay_ms, || fs.read(path))
}

/// Generic retry helper for IO operations against `path`.
pub fn retry_io<T, F>(path: &Path, attempts: usize, delay_ms: u64, mut op: F) -> io::Result<T>
where
    F: FnMut() -> io::Result<T>,
{
    let mut last_err = None;
    for attempt in 1..=attempts {
        match op() {
            Ok(v) => return Ok(v),
            Err(e) => {
                last_err = Some(e);
                if attempt < attempts {
                    thread::sleep(Duration::from_millis(delay_ms));
                    continue;
                }
            }
        }
    }
    Err(last_err.unwrap_or_else(|| {
        io::Error::new(
            io::ErrorKind::Other,
            format!("operation failed on {}", path.display()),
        )
    }))
}

fn configure_logging(log_path: &Path, fs: &dyn FileSystem, default_filter: &str) -> Result<()> {
    let log_dir = log_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let _ = fs.create_dir_all(log_dir);
    let file_name = log_path
        .file_name()
        .unwrap_or_else(|| OsStr::new("agent.log"));

    let file_appender = tracing_appender::rolling::never(log_dir, file_name);
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    // Keep guard alive for the process lifetime.
    let _ = FILE_GUARD.set(guard);

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let console_layer = fmt::layer().with_writer(std::io::stdout);
    let file_layer = fmt::layer().with_ansi(false).with_writer(file_writer);

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{read_file_with_retry, retry_io, sha256_hex};
    use crate::{FileSystem, VirtualFileSystem};
    use std::io;
    use std::path::Path;

    #[test]
    fn sha256_hex_matches_known_vector() {
        // sha256("abc")
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn retry_io_succeeds_after_transient_failures() {
        let mut calls = 0;
        let out = retry_io(Path::new("/x"), 3, 0, || {
            calls += 1;
            if calls < 3 {
                Err(io::Error::new(io::ErrorKind::Other, "busy"))
            } else {
                Ok(calls)
            }
        })
        .unwrap();
        assert_eq!(out, 3);
    }

    #[test]
    fn retry_io_surfaces_the_last_error() {
        let err = retry_io::<(), _>(Path::new("/x"), 2, 0, || {
            Err(io::Error::new(io::ErrorKind::PermissionDenied, "nope"))
        })
        .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::PermissionDenied);
    }

    #[test]
    fn read_file_with_retry_reads_virtual_files() {
        let fs = VirtualFileSystem::new();
        fs.write(Path::new("/a/data.bin"), b"payload").unwrap();
        let data = read_file_with_retry(&fs, Path::new("/a/data.bin"), 3, 0).unwrap();
        assert_eq!(data, b"payload");
    }
}
