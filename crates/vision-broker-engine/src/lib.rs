//! Inference side of the vision broker.
//!
//! - [`preprocess`]: letterbox + resize to the encoder's input resolution
//! - [`prompt`]: ChatML prompt assembly
//! - [`bridge`]: blocking wait over the text engine's streaming callback
//! - [`backend`]: construction of the configured engines (worker processes,
//!   ONNX Runtime, or scripted mocks)

pub mod backend;
pub mod bridge;
pub mod preprocess;
pub mod prompt;
pub mod worker;

#[cfg(feature = "mock")]
pub mod mock;
#[cfg(feature = "onnx")]
pub mod onnx;

pub use backend::{open_text_engine, open_vision_encoder};
pub use bridge::{InferenceBridge, Interrupter, ERROR_SENTINEL};
pub use preprocess::{ImagePreprocessor, PreprocessError};
pub use prompt::PromptTemplate;
pub use vision_broker_types::{
    EngineError, ImageEmbedding, PixelTensor, StreamCallback, StreamEvent, TextEngine,
    VisionEncoder,
};
