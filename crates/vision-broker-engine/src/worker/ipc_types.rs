//! Wire types for broker ↔ engine worker communication.
//!
//! JSON Lines (one JSON object per line) over the worker's stdin/stdout.
//! Binary payloads (pixels, embeddings) travel as standard base64; embeddings
//! are little-endian `f32`.

use std::path::PathBuf;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use vision_broker_types::{EngineError, ImageEmbedding, PixelTensor};

/// Request written to the worker's stdin.
#[derive(Serialize, Deserialize, Debug)]
pub struct WorkerRequest {
    /// Correlates responses. 0 = fire-and-forget.
    pub id: u64,
    pub command: WorkerCommand,
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(tag = "type")]
pub enum WorkerCommand {
    /// Load the language model. Answered with `Ready` or `Error`.
    LoadTextModel {
        model_path: PathBuf,
        max_new_tokens: i32,
        max_context_len: i32,
        top_k: i32,
        skip_special_token: bool,
        img_start: String,
        img_end: String,
        img_content: String,
    },
    /// Load the vision encoder. Answered with `Ready` or `Error`.
    LoadVisionModel {
        model_path: PathBuf,
        image_size: u32,
        n_image_tokens: usize,
        embed_dim: usize,
    },
    /// Encode one packed RGB image. Answered with `Embedding` or `Error`.
    Encode {
        width: u32,
        height: u32,
        pixels: String,
    },
    /// Start a generation. Answered with zero or more `Token`, then `Finish` or `Error`.
    Generate {
        prompt: String,
        #[serde(default)]
        embedding: Option<EmbeddingData>,
    },
    /// Stop the in-progress generation.
    Abort,
    /// Release the model and exit.
    Shutdown,
}

/// Base64 embedding body shared by `Generate` and `Embedding`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct EmbeddingData {
    pub n_tokens: usize,
    pub dim: usize,
    pub data: String,
}

impl EmbeddingData {
    pub fn from_embedding(embedding: &ImageEmbedding) -> Self {
        Self {
            n_tokens: embedding.n_tokens(),
            dim: embedding.dim(),
            data: encode_f32(embedding.as_slice()),
        }
    }

    pub fn into_embedding(self) -> Result<ImageEmbedding, EngineError> {
        let values = decode_f32(&self.data)?;
        ImageEmbedding::new(self.n_tokens, self.dim, values)
    }
}

/// Response read from the worker's stdout.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct WorkerResponse {
    /// Matches the request id. 0 for unsolicited messages.
    pub id: u64,
    pub payload: WorkerPayload,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "type")]
pub enum WorkerPayload {
    /// Model loaded.
    Ready {
        #[serde(default)]
        backend: Option<String>,
    },
    Embedding {
        n_tokens: usize,
        dim: usize,
        data: String,
    },
    /// Streaming text fragment.
    Token { text: String },
    /// Generation completed.
    Finish,
    Error { message: String },
}

impl WorkerCommand {
    pub fn encode(pixels: &PixelTensor) -> Self {
        WorkerCommand::Encode {
            width: pixels.width(),
            height: pixels.height(),
            pixels: STANDARD.encode(pixels.as_bytes()),
        }
    }

    /// Tag used in log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            WorkerCommand::LoadTextModel { .. } => "LoadTextModel",
            WorkerCommand::LoadVisionModel { .. } => "LoadVisionModel",
            WorkerCommand::Encode { .. } => "Encode",
            WorkerCommand::Generate { .. } => "Generate",
            WorkerCommand::Abort => "Abort",
            WorkerCommand::Shutdown => "Shutdown",
        }
    }
}

pub fn encode_f32(values: &[f32]) -> String {
    let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
    STANDARD.encode(bytes)
}

pub fn decode_f32(data: &str) -> Result<Vec<f32>, EngineError> {
    let bytes = STANDARD
        .decode(data)
        .map_err(|e| EngineError::Protocol(format!("bad base64 embedding: {e}")))?;
    if bytes.len() % 4 != 0 {
        return Err(EngineError::Protocol(format!(
            "embedding byte length {} is not a multiple of 4",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_wire_shape() {
        let request = WorkerRequest {
            id: 3,
            command: WorkerCommand::Generate {
                prompt: "hi".into(),
                embedding: None,
            },
        };
        let json = serde_json::to_string(&request).unwrap();
        assert_eq!(
            json,
            r#"{"id":3,"command":{"type":"Generate","prompt":"hi","embedding":null}}"#
        );
    }

    #[test]
    fn test_generate_without_embedding_field_parses() {
        let request: WorkerRequest =
            serde_json::from_str(r#"{"id":1,"command":{"type":"Generate","prompt":"p"}}"#)
                .unwrap();
        assert!(matches!(
            request.command,
            WorkerCommand::Generate { embedding: None, .. }
        ));
    }

    #[test]
    fn test_response_payloads_parse() {
        let ready: WorkerResponse =
            serde_json::from_str(r#"{"id":1,"payload":{"type":"Ready"}}"#).unwrap();
        assert!(matches!(ready.payload, WorkerPayload::Ready { backend: None }));

        let token: WorkerResponse =
            serde_json::from_str(r#"{"id":2,"payload":{"type":"Token","text":"路面"}}"#).unwrap();
        assert!(matches!(token.payload, WorkerPayload::Token { ref text } if text == "路面"));

        let finish: WorkerResponse =
            serde_json::from_str(r#"{"id":2,"payload":{"type":"Finish"}}"#).unwrap();
        assert!(matches!(finish.payload, WorkerPayload::Finish));
    }

    #[test]
    fn test_embedding_data_restores_values() {
        let embedding = ImageEmbedding::new(2, 2, vec![0.5, -1.25, 3.0, f32::MIN_POSITIVE]).unwrap();
        let restored = EmbeddingData::from_embedding(&embedding)
            .into_embedding()
            .unwrap();
        assert_eq!(restored.as_slice(), embedding.as_slice());
        assert_eq!(restored.n_tokens(), 2);
    }

    #[test]
    fn test_embedding_data_with_wrong_count_is_rejected() {
        let data = EmbeddingData {
            n_tokens: 2,
            dim: 2,
            data: encode_f32(&[1.0, 2.0, 3.0]),
        };
        assert!(data.into_embedding().is_err());
    }

    #[test]
    fn test_decode_rejects_truncated_bytes() {
        let truncated = STANDARD.encode([0u8, 0, 128]);
        assert!(matches!(decode_f32(&truncated), Err(EngineError::Protocol(_))));
        assert!(matches!(decode_f32("@@@"), Err(EngineError::Protocol(_))));
    }
}
