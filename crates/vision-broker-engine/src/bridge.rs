//! Blocking adapter over the text engine's streaming callback.
//!
//! One `run` call submits one generation and parks the caller on a condition
//! variable until the engine reports a terminal state. Fragments are appended
//! under the same mutex that guards the completion flag, so the text returned
//! is exactly the fragments in callback order.
//!
//! Each call gets a run id. Callbacks carrying an older id (a generation that
//! timed out or was interrupted) are dropped, so they can never complete or
//! pollute the next request.

use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use log::{debug, warn};
use vision_broker_types::{EngineError, ImageEmbedding, StreamCallback, StreamEvent, TextEngine};

/// Appended to the response when the engine ends in its error state.
pub const ERROR_SENTINEL: &str = "LLM_RUN_ERROR";

#[derive(Debug, Default)]
struct CompletionState {
    run_id: u64,
    finished: bool,
    interrupted: bool,
    text: String,
}

#[derive(Debug, Default)]
struct Completion {
    state: Mutex<CompletionState>,
    cond: Condvar,
}

impl Completion {
    fn lock(&self) -> MutexGuard<'_, CompletionState> {
        // A panicking engine thread must not wedge the control thread.
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn deliver(&self, run_id: u64, event: StreamEvent) {
        let mut state = self.lock();
        if state.run_id != run_id || state.finished {
            debug!("Dropping stale stream event for run {run_id}");
            return;
        }
        match event {
            StreamEvent::Text(fragment) => state.text.push_str(&fragment),
            StreamEvent::Finish => {
                state.finished = true;
                self.cond.notify_one();
            }
            StreamEvent::Error => {
                state.text.push_str(ERROR_SENTINEL);
                state.finished = true;
                self.cond.notify_one();
            }
        }
    }
}

/// Wakes a caller blocked in [`InferenceBridge::run`] and makes later calls
/// fail fast. Used by the shutdown path.
#[derive(Debug, Clone)]
pub struct Interrupter {
    completion: Arc<Completion>,
}

impl Interrupter {
    pub fn interrupt(&self) {
        let mut state = self.completion.lock();
        state.interrupted = true;
        self.completion.cond.notify_all();
    }
}

#[derive(Debug)]
pub struct InferenceBridge {
    completion: Arc<Completion>,
    timeout: Option<Duration>,
}

impl InferenceBridge {
    /// `timeout` of `None` waits for the terminal state indefinitely.
    pub fn new(timeout: Option<Duration>) -> Self {
        Self {
            completion: Arc::new(Completion::default()),
            timeout,
        }
    }

    pub fn interrupter(&self) -> Interrupter {
        Interrupter {
            completion: self.completion.clone(),
        }
    }

    /// Run one generation to its terminal state and return the full text.
    ///
    /// An engine-side error state is not an `Err`: the text ends with
    /// [`ERROR_SENTINEL`] instead. `Err` means the call never completed
    /// (rejected, timed out, or interrupted).
    pub fn run(
        &self,
        engine: &mut dyn TextEngine,
        prompt: &str,
        embedding: Option<&ImageEmbedding>,
    ) -> Result<String, EngineError> {
        let run_id = {
            let mut state = self.completion.lock();
            if state.interrupted {
                return Err(EngineError::Interrupted);
            }
            state.run_id += 1;
            state.finished = false;
            state.text.clear();
            state.run_id
        };

        let completion = self.completion.clone();
        let callback: StreamCallback = Arc::new(move |event| completion.deliver(run_id, event));
        engine.generate(prompt, embedding, callback)?;

        let started = Instant::now();
        let state = self.completion.lock();
        let (mut state, timed_out) = match self.timeout {
            None => {
                let state = self
                    .completion
                    .cond
                    .wait_while(state, |s| !s.finished && !s.interrupted)
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                (state, false)
            }
            Some(limit) => {
                let (state, result) = self
                    .completion
                    .cond
                    .wait_timeout_while(state, limit, |s| !s.finished && !s.interrupted)
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                (state, result.timed_out())
            }
        };

        if state.finished {
            debug!(
                "Run {run_id} finished in {:?} ({} chars)",
                started.elapsed(),
                state.text.len()
            );
            return Ok(std::mem::take(&mut state.text));
        }

        // Retire this run so late callbacks are ignored.
        state.run_id += 1;
        state.text.clear();
        let interrupted = state.interrupted;
        drop(state);

        if interrupted {
            return Err(EngineError::Interrupted);
        }
        debug_assert!(timed_out);
        let limit = self.timeout.unwrap_or_default();
        warn!("Run {run_id} produced no terminal state within {limit:?}; aborting");
        if let Err(e) = engine.abort() {
            warn!("Engine abort failed: {e}");
        }
        Err(EngineError::Timeout(limit))
    }
}
