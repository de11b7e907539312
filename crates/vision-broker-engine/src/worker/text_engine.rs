//! Text engine hosted in a worker process.
//!
//! Tokens are pushed into the generation callback from the stdout reader
//! thread, so the callback runs on a thread the broker does not own. If the
//! worker dies mid-generation the callback gets a final `Error`.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::warn;
use vision_broker_config::EngineConfig;
use vision_broker_types::{EngineError, ImageEmbedding, StreamCallback, StreamEvent, TextEngine};

use super::connection::{expect_ready, WorkerConnection};
use super::ipc_types::{EmbeddingData, WorkerCommand, WorkerPayload, WorkerResponse};

struct ActiveGeneration {
    request_id: u64,
    callback: StreamCallback,
}

type SharedActive = Arc<Mutex<Option<ActiveGeneration>>>;

fn lock(active: &SharedActive) -> MutexGuard<'_, Option<ActiveGeneration>> {
    active.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct WorkerTextEngine {
    connection: WorkerConnection,
    active: SharedActive,
}

impl WorkerTextEngine {
    /// Spawn the worker and load the language model. Blocks until the worker
    /// reports `Ready` or `worker_timeout` passes.
    pub fn spawn(command: &str, args: &[String], config: &EngineConfig) -> Result<Self, EngineError> {
        let active: SharedActive = Arc::new(Mutex::new(None));
        let route_active = active.clone();
        let exit_active = active.clone();
        let mut connection = WorkerConnection::open(
            "text",
            command,
            args,
            move |response| route_stream(&route_active, response),
            move || fail_active(&exit_active),
        )?;

        let load = WorkerCommand::LoadTextModel {
            model_path: config.llm_model_path.clone(),
            max_new_tokens: config.max_new_tokens,
            max_context_len: config.max_context_len,
            top_k: config.top_k,
            skip_special_token: config.skip_special_token,
            img_start: config.img_start.clone(),
            img_end: config.img_end.clone(),
            img_content: config.img_content.clone(),
        };
        expect_ready("text", connection.request(load, config.worker_timeout()))?;
        Ok(Self { connection, active })
    }
}

/// Deliver stream payloads for the active generation; pass everything else on.
fn route_stream(active: &SharedActive, response: WorkerResponse) -> Option<WorkerResponse> {
    let id = response.id;
    let mut guard = lock(active);
    let current = guard.as_ref().is_some_and(|a| a.request_id == id);
    if !current {
        return Some(response);
    }
    match response.payload {
        WorkerPayload::Token { text } => {
            let callback = guard.as_ref().map(|a| a.callback.clone());
            drop(guard);
            if let Some(callback) = callback {
                callback(StreamEvent::Text(text));
            }
            None
        }
        WorkerPayload::Finish => {
            let finished = guard.take();
            drop(guard);
            if let Some(generation) = finished {
                (generation.callback)(StreamEvent::Finish);
            }
            None
        }
        WorkerPayload::Error { message } => {
            let failed = guard.take();
            drop(guard);
            warn!("Generation #{id} failed in text worker: {message}");
            if let Some(generation) = failed {
                (generation.callback)(StreamEvent::Error);
            }
            None
        }
        payload => Some(WorkerResponse { id, payload }),
    }
}

fn fail_active(active: &SharedActive) {
    let orphaned = lock(active).take();
    if let Some(generation) = orphaned {
        warn!(
            "Text worker exited during generation #{}",
            generation.request_id
        );
        (generation.callback)(StreamEvent::Error);
    }
}

impl TextEngine for WorkerTextEngine {
    fn generate(
        &mut self,
        prompt: &str,
        embedding: Option<&ImageEmbedding>,
        callback: StreamCallback,
    ) -> Result<(), EngineError> {
        self.connection.drain();
        let id = self.connection.reserve_id();
        // Registered before the write so the first token cannot race past it.
        *lock(&self.active) = Some(ActiveGeneration {
            request_id: id,
            callback,
        });
        let command = WorkerCommand::Generate {
            prompt: prompt.to_string(),
            embedding: embedding.map(EmbeddingData::from_embedding),
        };
        if let Err(e) = self.connection.send_as(id, command) {
            lock(&self.active).take();
            return Err(EngineError::Generate(e.to_string()));
        }
        Ok(())
    }

    fn abort(&mut self) -> Result<(), EngineError> {
        lock(&self.active).take();
        self.connection.notify(WorkerCommand::Abort)
    }

    fn name(&self) -> &str {
        "worker"
    }
}
