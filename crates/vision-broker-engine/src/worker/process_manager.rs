//! Engine worker child process lifecycle.
//!
//! Each engine runs in its own child process. Killing the child releases
//! everything the engine held (NPU contexts, mapped model files).

use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use vision_broker_types::EngineError;

/// How long a worker gets to exit on its own after `Shutdown`.
pub const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

pub struct WorkerProcess {
    label: &'static str,
    child: Option<Child>,
}

impl WorkerProcess {
    /// Spawn `command args...` with piped stdin/stdout. Worker logs go to our stderr.
    pub fn spawn(label: &'static str, command: &str, args: &[String]) -> Result<Self, EngineError> {
        info!("Spawning {label} worker: {command} {}", args.join(" "));
        let child = Command::new(command)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| EngineError::Init(format!("cannot spawn {label} worker `{command}`: {e}")))?;
        debug!("{label} worker pid {}", child.id());
        Ok(Self {
            label,
            child: Some(child),
        })
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    pub fn take_stdin(&mut self) -> Option<ChildStdin> {
        self.child.as_mut().and_then(|c| c.stdin.take())
    }

    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.child.as_mut().and_then(|c| c.stdout.take())
    }

    /// Wait up to `grace` for the child to exit, then kill it. Always reaps.
    pub fn stop(&mut self, grace: Duration) {
        let Some(mut child) = self.child.take() else {
            return;
        };
        let started = Instant::now();
        loop {
            match child.try_wait() {
                Ok(Some(status)) => {
                    debug!("{} worker exited: {status}", self.label);
                    return;
                }
                Ok(None) if started.elapsed() < grace => thread::sleep(Duration::from_millis(10)),
                Ok(None) => break,
                Err(e) => {
                    warn!("Cannot poll {} worker: {e}", self.label);
                    break;
                }
            }
        }
        info!("Killing {} worker process", self.label);
        let _ = child.kill();
        let _ = child.wait();
    }
}

impl Drop for WorkerProcess {
    fn drop(&mut self) {
        self.stop(Duration::ZERO);
    }
}
