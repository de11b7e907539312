//! Request/response plumbing over a worker's pipes.
//!
//! A reader thread parses stdout line by line. Each response is first offered
//! to a `route` hook (the text engine uses it to stream tokens straight into
//! the generation callback); whatever the hook hands back is queued for
//! `wait_for`.

use std::io::{BufRead, BufReader, Write};
use std::process::ChildStdin;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError};
use log::{debug, info, warn};
use vision_broker_types::EngineError;

use super::ipc_types::{WorkerCommand, WorkerPayload, WorkerRequest, WorkerResponse};
use super::process_manager::{WorkerProcess, SHUTDOWN_GRACE};

pub struct WorkerConnection {
    process: WorkerProcess,
    stdin: ChildStdin,
    next_id: u64,
    responses: Receiver<WorkerResponse>,
    reader: Option<JoinHandle<()>>,
}

impl WorkerConnection {
    pub fn open<R, E>(
        label: &'static str,
        command: &str,
        args: &[String],
        mut route: R,
        on_eof: E,
    ) -> Result<Self, EngineError>
    where
        R: FnMut(WorkerResponse) -> Option<WorkerResponse> + Send + 'static,
        E: FnOnce() + Send + 'static,
    {
        let mut process = WorkerProcess::spawn(label, command, args)?;
        let stdin = process
            .take_stdin()
            .ok_or_else(|| EngineError::Init(format!("{label} worker stdin not available")))?;
        let stdout = process
            .take_stdout()
            .ok_or_else(|| EngineError::Init(format!("{label} worker stdout not available")))?;

        let (tx, responses) = crossbeam_channel::unbounded();
        let reader = thread::Builder::new()
            .name(format!("{label}-worker-reader"))
            .spawn(move || {
                for line in BufReader::new(stdout).lines() {
                    let line = match line {
                        Ok(l) => l,
                        Err(e) => {
                            warn!("{label} worker stdout read error: {e}");
                            break;
                        }
                    };
                    if line.trim().is_empty() {
                        continue;
                    }
                    let response: WorkerResponse = match serde_json::from_str(&line) {
                        Ok(r) => r,
                        Err(e) => {
                            warn!("Ignoring unparseable {label} worker line: {e}");
                            continue;
                        }
                    };
                    if let Some(response) = route(response) {
                        // Receiver is gone only while the connection is dropping.
                        let _ = tx.send(response);
                    }
                }
                debug!("{label} worker stdout closed");
                on_eof();
            })?;

        Ok(Self {
            process,
            stdin,
            next_id: 1,
            responses,
            reader: Some(reader),
        })
    }

    pub fn label(&self) -> &'static str {
        self.process.label()
    }

    pub fn reserve_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Write `command` with a fresh request id and return the id.
    pub fn send(&mut self, command: WorkerCommand) -> Result<u64, EngineError> {
        let id = self.reserve_id();
        self.send_as(id, command)?;
        Ok(id)
    }

    /// Write a fire-and-forget command (id 0).
    pub fn notify(&mut self, command: WorkerCommand) -> Result<(), EngineError> {
        self.send_as(0, command)
    }

    /// Write `command` under an id obtained from [`reserve_id`](Self::reserve_id).
    pub fn send_as(&mut self, id: u64, command: WorkerCommand) -> Result<(), EngineError> {
        let kind = command.kind();
        let mut line = serde_json::to_string(&WorkerRequest { id, command })
            .map_err(|e| EngineError::Protocol(format!("cannot serialize {kind}: {e}")))?;
        line.push('\n');
        self.stdin.write_all(line.as_bytes())?;
        self.stdin.flush()?;
        debug!("-> {} worker #{id} {kind}", self.label());
        Ok(())
    }

    /// Block until the response for `id` arrives. Responses to other ids are discarded.
    pub fn wait_for(&self, id: u64, timeout: Duration) -> Result<WorkerPayload, EngineError> {
        let started = Instant::now();
        loop {
            let remaining = timeout.saturating_sub(started.elapsed());
            match self.responses.recv_timeout(remaining) {
                Ok(response) if response.id == id => return Ok(response.payload),
                Ok(response) => debug!(
                    "Discarding {} worker response #{} while waiting for #{id}",
                    self.label(),
                    response.id
                ),
                Err(RecvTimeoutError::Timeout) => return Err(EngineError::Timeout(timeout)),
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(EngineError::Protocol(format!(
                        "{} worker exited",
                        self.label()
                    )))
                }
            }
        }
    }

    pub fn request(
        &mut self,
        command: WorkerCommand,
        timeout: Duration,
    ) -> Result<WorkerPayload, EngineError> {
        let id = self.send(command)?;
        self.wait_for(id, timeout)
    }

    /// Drop queued responses nobody is waiting for.
    pub fn drain(&self) {
        for response in self.responses.try_iter() {
            debug!(
                "Dropping unclaimed {} worker response #{}",
                self.label(),
                response.id
            );
        }
    }
}

impl Drop for WorkerConnection {
    fn drop(&mut self) {
        if let Err(e) = self.notify(WorkerCommand::Shutdown) {
            debug!("{} worker did not take Shutdown: {e}", self.label());
        }
        self.process.stop(SHUTDOWN_GRACE);
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
    }
}

/// Interpret the answer to a load command.
pub fn expect_ready(label: &str, payload: Result<WorkerPayload, EngineError>) -> Result<(), EngineError> {
    match payload {
        Ok(WorkerPayload::Ready { backend }) => {
            info!(
                "{label} worker ready{}",
                backend.map(|b| format!(" ({b})")).unwrap_or_default()
            );
            Ok(())
        }
        Ok(WorkerPayload::Error { message }) => Err(EngineError::Init(message)),
        Ok(other) => Err(EngineError::Init(format!(
            "{label} worker answered load with {other:?}"
        ))),
        Err(EngineError::Timeout(limit)) => Err(EngineError::Init(format!(
            "{label} worker did not load within {limit:?}"
        ))),
        Err(e) => Err(EngineError::Init(e.to_string())),
    }
}
