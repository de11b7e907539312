//! Collaborator contracts for the two inference engines.
//!
//! Both engines are opaque to the broker. The vision encoder is a plain
//! request/response call; the text engine is push-style and reports its output
//! through a callback that may run on a thread the broker does not own.
//!
//! Resources are released by dropping the engine. Implementations must make
//! `Drop` safe to run while a generation is still in flight.

use std::sync::Arc;

use crate::{EngineError, ImageEmbedding, PixelTensor};

/// One callback invocation from the text engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// Incremental text fragment (the engine's "normal" state).
    Text(String),
    /// Terminal state: generation completed.
    Finish,
    /// Terminal state: the engine failed mid-generation.
    Error,
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Finish | StreamEvent::Error)
    }
}

/// Callback registered for one generation call.
///
/// Invoked zero or more times with `Text`, then exactly once with `Finish` or `Error`.
pub type StreamCallback = Arc<dyn Fn(StreamEvent) + Send + Sync>;

/// Converts a fixed-size pixel buffer into a fixed-length embedding.
pub trait VisionEncoder: Send {
    fn encode(&mut self, pixels: &PixelTensor) -> Result<ImageEmbedding, EngineError>;

    /// Short backend label for logs.
    fn name(&self) -> &str;
}

/// Streams text for a prompt plus an optional image embedding.
pub trait TextEngine: Send {
    /// Submit one generation. Returning `Ok` means the engine accepted the call
    /// and will eventually deliver a terminal event through `callback`.
    fn generate(
        &mut self,
        prompt: &str,
        embedding: Option<&ImageEmbedding>,
        callback: StreamCallback,
    ) -> Result<(), EngineError>;

    /// Best-effort request to stop the in-flight generation.
    fn abort(&mut self) -> Result<(), EngineError> {
        Ok(())
    }

    /// Short backend label for logs.
    fn name(&self) -> &str;
}
