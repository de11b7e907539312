//! Construct the configured engine backends.

use log::info;
use vision_broker_config::{EngineConfig, TextBackend, VisionBackend};
use vision_broker_types::{EngineError, TextEngine, VisionEncoder};

use crate::worker::{WorkerTextEngine, WorkerVisionEncoder};

/// Bring up the language model. Blocks until it is loaded.
pub fn open_text_engine(config: &EngineConfig) -> Result<Box<dyn TextEngine>, EngineError> {
    let engine: Box<dyn TextEngine> = match &config.text_backend {
        TextBackend::Worker { command, args } => {
            Box::new(WorkerTextEngine::spawn(command, args, config)?)
        }
        TextBackend::Mock { reply } => mock_text(reply)?,
    };
    info!(
        "Text engine initialized ({}, model {})",
        engine.name(),
        config.llm_model_path.display()
    );
    Ok(engine)
}

/// Bring up the vision encoder. Blocks until it is loaded.
pub fn open_vision_encoder(config: &EngineConfig) -> Result<Box<dyn VisionEncoder>, EngineError> {
    let encoder: Box<dyn VisionEncoder> = match &config.vision_backend {
        VisionBackend::Worker { command, args } => {
            Box::new(WorkerVisionEncoder::spawn(command, args, config)?)
        }
        VisionBackend::Onnx => onnx_vision(config)?,
        VisionBackend::Mock => mock_vision(config)?,
    };
    info!(
        "Vision encoder initialized ({}, model {})",
        encoder.name(),
        config.encoder_model_path.display()
    );
    Ok(encoder)
}

#[cfg(feature = "mock")]
fn mock_text(reply: &[String]) -> Result<Box<dyn TextEngine>, EngineError> {
    Ok(Box::new(crate::mock::ScriptedTextEngine::new(
        reply.iter().cloned(),
    )))
}

#[cfg(not(feature = "mock"))]
fn mock_text(_reply: &[String]) -> Result<Box<dyn TextEngine>, EngineError> {
    Err(EngineError::Unavailable(
        "mock text backend (build with --features mock)".into(),
    ))
}

#[cfg(feature = "mock")]
fn mock_vision(config: &EngineConfig) -> Result<Box<dyn VisionEncoder>, EngineError> {
    Ok(Box::new(crate::mock::FixedVisionEncoder::new(
        config.n_image_tokens,
        config.image_embed_len,
    )))
}

#[cfg(not(feature = "mock"))]
fn mock_vision(_config: &EngineConfig) -> Result<Box<dyn VisionEncoder>, EngineError> {
    Err(EngineError::Unavailable(
        "mock vision backend (build with --features mock)".into(),
    ))
}

#[cfg(feature = "onnx")]
fn onnx_vision(config: &EngineConfig) -> Result<Box<dyn VisionEncoder>, EngineError> {
    Ok(Box::new(crate::onnx::OnnxVisionEncoder::load(config)?))
}

#[cfg(not(feature = "onnx"))]
fn onnx_vision(_config: &EngineConfig) -> Result<Box<dyn VisionEncoder>, EngineError> {
    Err(EngineError::Unavailable(
        "onnx vision backend (build with --features onnx)".into(),
    ))
}
