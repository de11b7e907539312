use std::time::Duration;

use vision_broker_config::EngineConfig;
use vision_broker_types::{EngineError, ImageEmbedding, PixelTensor, VisionEncoder};

use super::connection::{expect_ready, WorkerConnection};
use super::ipc_types::{EmbeddingData, WorkerCommand, WorkerPayload};

/// Vision encoder hosted in a worker process. Each `encode` is one
/// request/response round trip.
pub struct WorkerVisionEncoder {
    connection: WorkerConnection,
    n_tokens: usize,
    dim: usize,
    timeout: Duration,
}

impl WorkerVisionEncoder {
    pub fn spawn(command: &str, args: &[String], config: &EngineConfig) -> Result<Self, EngineError> {
        let mut connection = WorkerConnection::open("vision", command, args, Some, || {})?;
        let load = WorkerCommand::LoadVisionModel {
            model_path: config.encoder_model_path.clone(),
            image_size: config.image_size,
            n_image_tokens: config.n_image_tokens,
            embed_dim: config.image_embed_len,
        };
        expect_ready("vision", connection.request(load, config.worker_timeout()))?;
        Ok(Self {
            connection,
            n_tokens: config.n_image_tokens,
            dim: config.image_embed_len,
            timeout: config.worker_timeout(),
        })
    }
}

impl VisionEncoder for WorkerVisionEncoder {
    fn encode(&mut self, pixels: &PixelTensor) -> Result<ImageEmbedding, EngineError> {
        self.connection.drain();
        let payload = self
            .connection
            .request(WorkerCommand::encode(pixels), self.timeout)
            .map_err(|e| EngineError::Encode(e.to_string()))?;
        match payload {
            WorkerPayload::Embedding { n_tokens, dim, data } => {
                if (n_tokens, dim) != (self.n_tokens, self.dim) {
                    return Err(EngineError::Encode(format!(
                        "worker returned a {n_tokens}x{dim} embedding, expected {}x{}",
                        self.n_tokens, self.dim
                    )));
                }
                EmbeddingData { n_tokens, dim, data }.into_embedding()
            }
            WorkerPayload::Error { message } => Err(EngineError::Encode(message)),
            other => Err(EngineError::Protocol(format!(
                "vision worker answered Encode with {other:?}"
            ))),
        }
    }

    fn name(&self) -> &str {
        "worker"
    }
}
