use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::Path;
use std::thread::sleep;
use std::time::Duration;
use tracing::warn;

use crate::cancel::CancelToken;
use crate::error::UpdateError;

/// Files at or above this size are copied in chunks.
pub const LARGE_FILE_THRESHOLD: u64 = 32 * 1024 * 1024;
pub const COPY_CHUNK: usize = 1024 * 1024;

/// Exponential backoff for lock/permission failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            attempts: 4,
            base_delay: Duration::from_millis(250),
        }
    }
}

impl RetryPolicy {
    /// Run `op`, retrying only errors for which [`UpdateError::is_retryable`] holds.
    pub fn run<T>(&self, mut op: impl FnMut() -> Result<T, UpdateError>) -> Result<T, UpdateError> {
        let mut delay = self.base_delay;
        let mut attempt = 1;
        loop {
            match op() {
                Ok(v) => return Ok(v),
                Err(e) if e.is_retryable() && attempt < self.attempts => {
                    warn!("attempt {}/{} failed: {}; retrying", attempt, self.attempts, e);
                    sleep(delay);
                    delay *= 2;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Copy `src` onto `dest` through a sibling temp file and confirm the sizes match.
///
/// The bytes land in a hidden temp file next to `dest`, which is renamed over
/// `dest` only once its size is right, so `dest` is either the old file or
/// the complete new one. Files at or above `threshold` are copied in
/// [`COPY_CHUNK`] pieces with `on_bytes(copied_so_far)` after each chunk and
/// a cancellation check in between. The temp file is removed on every error.
pub fn copy_file(
    src: &Path,
    dest: &Path,
    threshold: u64,
    on_bytes: &mut dyn FnMut(u64),
    cancel: &CancelToken,
) -> Result<u64, UpdateError> {
    let meta = fs::metadata(src).map_err(|e| UpdateError::from_io(src, e))?;
    let expected = meta.len();
    let dir = dest.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::Builder::new()
        .prefix(".updraft_copy")
        .tempfile_in(dir)
        .map_err(|e| UpdateError::from_io(dest, e))?;

    let mut input = File::open(src).map_err(|e| UpdateError::from_io(src, e))?;
    if expected < threshold {
        io::copy(&mut input, tmp.as_file_mut()).map_err(|e| UpdateError::from_io(dest, e))?;
    } else {
        copy_chunked(&mut input, src, tmp.as_file_mut(), dest, on_bytes, cancel)?;
    }
    tmp.as_file_mut()
        .flush()
        .map_err(|e| UpdateError::from_io(dest, e))?;

    let actual = tmp
        .as_file()
        .metadata()
        .map_err(|e| UpdateError::from_io(dest, e))?
        .len();
    if actual != expected {
        return Err(UpdateError::IncompletePayload {
            path: dest.to_path_buf(),
            expected,
            actual,
        });
    }
    fs::set_permissions(tmp.path(), meta.permissions())
        .map_err(|e| UpdateError::from_io(dest, e))?;
    tmp.persist(dest)
        .map_err(|e| UpdateError::from_io(dest, e.error))?;
    Ok(actual)
}

fn copy_chunked(
    input: &mut File,
    src: &Path,
    output: &mut File,
    dest: &Path,
    on_bytes: &mut dyn FnMut(u64),
    cancel: &CancelToken,
) -> Result<(), UpdateError> {
    let mut buf = vec![0u8; COPY_CHUNK];
    let mut copied = 0u64;
    loop {
        cancel.check()?;
        let n = input.read(&mut buf).map_err(|e| UpdateError::from_io(src, e))?;
        if n == 0 {
            return Ok(());
        }
        output
            .write_all(&buf[..n])
            .map_err(|e| UpdateError::from_io(dest, e))?;
        copied += n as u64;
        on_bytes(copied);
    }
}

#[cfg(unix)]
pub fn make_executable(p: &Path) -> Result<(), UpdateError> {
    use std::os::unix::fs::PermissionsExt;
    let mut perm = fs::metadata(p)
        .map_err(|e| UpdateError::from_io(p, e))?
        .permissions();
    perm.set_mode(perm.mode() | 0o755);
    fs::set_permissions(p, perm).map_err(|e| UpdateError::from_io(p, e))?;
    Ok(())
}

#[cfg(not(unix))]
pub fn make_executable(_p: &Path) -> Result<(), UpdateError> {
    Ok(())
}
