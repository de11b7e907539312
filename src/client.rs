//! Producer side of the file protocol, used by `vision_broker describe`.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use uuid::Uuid;
use vision_broker_config::IpcPaths;

use crate::ipc::{remove_if_exists, IpcFiles};

const READ_ATTEMPTS: usize = 3;
const READ_RETRY_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("broker not ready after {0:?}")]
    NotReady(Duration),
    #[error("no response within {0:?}")]
    Timeout(Duration),
    #[error("image path is empty")]
    EmptyPath,
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub struct BrokerClient {
    files: IpcFiles,
    poll_interval: Duration,
}

impl BrokerClient {
    pub fn new(paths: IpcPaths, poll_interval: Duration) -> Self {
        Self {
            files: IpcFiles::new(paths),
            poll_interval,
        }
    }

    fn paths(&self) -> &IpcPaths {
        self.files.paths()
    }

    pub fn wait_until_ready(&self, timeout: Duration) -> Result<(), ClientError> {
        let started = Instant::now();
        while !self.files.is_ready() {
            if started.elapsed() >= timeout {
                return Err(ClientError::NotReady(timeout));
            }
            thread::sleep(self.poll_interval);
        }
        Ok(())
    }

    /// Drop the request file in place with a same-directory rename, so the
    /// broker never sees a partial path.
    pub fn submit(&self, image: &Path) -> Result<(), ClientError> {
        let resolved = resolve(image)?;
        let request = &self.paths().request_file;
        let staged = staging_path(request);
        let mut line = path_bytes(&resolved);
        line.push(b'\n');
        fs::write(&staged, line)?;
        if let Err(e) = fs::rename(&staged, request) {
            let _ = fs::remove_file(&staged);
            return Err(e.into());
        }
        debug!("Submitted {}", resolved.display());
        Ok(())
    }

    /// Submit `image` and wait up to `timeout` for its description.
    pub fn describe(&self, image: &Path, timeout: Duration) -> Result<String, ClientError> {
        remove_if_exists(&self.paths().response_file)?;
        remove_if_exists(&self.paths().completion_marker)?;
        self.submit(image)?;

        let started = Instant::now();
        while !self.paths().completion_marker.exists() {
            if started.elapsed() >= timeout {
                // Withdraw the request if the broker never picked it up.
                remove_if_exists(&self.paths().request_file)?;
                return Err(ClientError::Timeout(timeout));
            }
            thread::sleep(self.poll_interval);
        }

        let body = self.read_body()?;
        remove_if_exists(&self.paths().response_file)?;
        remove_if_exists(&self.paths().completion_marker)?;
        info!("Response after {:?}", started.elapsed());
        Ok(body.trim().to_string())
    }

    fn read_body(&self) -> io::Result<String> {
        let path = &self.paths().response_file;
        let mut attempt = 1;
        loop {
            match fs::read_to_string(path) {
                Ok(body) => return Ok(body),
                Err(e) if attempt < READ_ATTEMPTS => {
                    warn!("Reading {} failed ({e}); retrying", path.display());
                    attempt += 1;
                    thread::sleep(READ_RETRY_DELAY);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn resolve(image: &Path) -> Result<PathBuf, ClientError> {
    if image.as_os_str().is_empty() {
        return Err(ClientError::EmptyPath);
    }
    // The broker may run from another directory.
    Ok(fs::canonicalize(image).unwrap_or_else(|_| image.to_path_buf()))
}

#[cfg(unix)]
fn path_bytes(path: &Path) -> Vec<u8> {
    use std::os::unix::ffi::OsStrExt;
    path.as_os_str().as_bytes().to_vec()
}

#[cfg(not(unix))]
fn path_bytes(path: &Path) -> Vec<u8> {
    path.to_string_lossy().into_owned().into_bytes()
}

fn staging_path(request: &Path) -> PathBuf {
    let name = request
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    request.with_file_name(format!(".{name}.{}.tmp", Uuid::new_v4()))
}
