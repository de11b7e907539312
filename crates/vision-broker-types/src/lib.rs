//! Types shared by every crate of the vision broker.
//!
//! - `tensor`: the pixel buffer handed to the vision encoder and the embedding it returns.
//! - `engine`: the collaborator traits the broker drives (`VisionEncoder`, `TextEngine`).
//! - `error`: `EngineError`, the failure type of every engine call.

pub mod engine;
pub mod error;
pub mod tensor;

pub use engine::{StreamCallback, StreamEvent, TextEngine, VisionEncoder};
pub use error::EngineError;
pub use tensor::{ImageEmbedding, PixelTensor};
