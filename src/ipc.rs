//! The four filesystem artifacts shared with the producer process.
//!
//! Presence is the signal: the readiness marker exists while the broker is
//! polling, the completion marker exists once the response body is fully
//! written. Publish order (body, fsync, then marker) is the only cross-process
//! synchronization.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use log::{debug, warn};
use vision_broker_config::IpcPaths;

#[derive(Debug, Clone)]
pub struct IpcFiles {
    paths: IpcPaths,
}

impl IpcFiles {
    pub fn new(paths: IpcPaths) -> Self {
        Self { paths }
    }

    pub fn paths(&self) -> &IpcPaths {
        &self.paths
    }

    /// Consume the pending request, if any.
    ///
    /// The request file is deleted before this returns, so whatever happens to
    /// the request afterwards it is never picked up twice. Returns the first
    /// line with surrounding whitespace removed, taken as raw path bytes; it
    /// may be empty.
    ///
    /// A request file that exists but cannot be read is discarded as well, and
    /// the read error returned.
    pub fn take_request(&self) -> io::Result<Option<PathBuf>> {
        let path = &self.paths.request_file;
        let contents = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                discard(path);
                return Err(e);
            }
        };
        if let Err(e) = remove_if_exists(path) {
            // One retry; an undeletable request would be served on every poll.
            if remove_if_exists(path).is_err() {
                return Err(e);
            }
        }
        Ok(Some(path_from_bytes(first_line(&contents))))
    }

    /// Write the response body, then create the completion marker.
    pub fn publish_response(&self, text: &str) -> io::Result<()> {
        // A leftover marker must never describe a body that is still being written.
        remove_if_exists(&self.paths.completion_marker)?;

        let mut body = File::create(&self.paths.response_file)?;
        body.write_all(text.as_bytes())?;
        body.sync_all()?;
        drop(body);

        touch(&self.paths.completion_marker)?;
        debug!(
            "Published {} bytes to {}",
            text.len(),
            self.paths.response_file.display()
        );
        Ok(())
    }

    pub fn signal_ready(&self) -> io::Result<()> {
        touch(&self.paths.ready_marker)
    }

    pub fn is_ready(&self) -> bool {
        self.paths.ready_marker.exists()
    }

    /// Remove all four artifacts. Missing files are fine; other failures are
    /// logged and the rest are still attempted. Returns the first error.
    pub fn cleanup(&self) -> io::Result<()> {
        let mut first_err = None;
        for path in self.paths.all() {
            if let Err(e) = remove_if_exists(path) {
                warn!("Cannot remove {}: {e}", path.display());
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

/// Delete `path`, treating "already gone" as success.
pub fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Best-effort removal of an unreadable request, including an empty directory
/// squatting on the name.
fn discard(path: &Path) {
    let result = match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir(path),
        Ok(_) => fs::remove_file(path),
        Err(_) => return,
    };
    if let Err(e) = result {
        warn!("Cannot discard unreadable request {}: {e}", path.display());
    }
}

/// First line of `bytes`, without surrounding ASCII whitespace (`\r` included).
fn first_line(bytes: &[u8]) -> &[u8] {
    let line = bytes.split(|&b| b == b'\n').next().unwrap_or_default();
    let start = line
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(line.len());
    let end = line
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |i| i + 1);
    &line[start..end]
}

#[cfg(unix)]
fn path_from_bytes(bytes: &[u8]) -> PathBuf {
    use std::ffi::OsStr;
    use std::os::unix::ffi::OsStrExt;
    PathBuf::from(OsStr::from_bytes(bytes))
}

#[cfg(not(unix))]
fn path_from_bytes(bytes: &[u8]) -> PathBuf {
    PathBuf::from(String::from_utf8_lossy(bytes).into_owned())
}

/// Create (or truncate) a zero-byte marker file.
pub fn touch(path: &Path) -> io::Result<()> {
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)?;
    file.sync_all()
}
