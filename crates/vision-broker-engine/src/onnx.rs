//! In-process vision encoder on ONNX Runtime.
//!
//! Input is `[1, 3, H, W]` f32, CLIP-normalized. The first output must hold
//! exactly `n_image_tokens * image_embed_len` values.

use std::path::Path;

use log::info;
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::Tensor;
use vision_broker_config::EngineConfig;
use vision_broker_types::{EngineError, ImageEmbedding, PixelTensor, VisionEncoder};

const CLIP_MEAN: [f32; 3] = [0.481_454_66, 0.457_827_5, 0.408_210_73];
const CLIP_STD: [f32; 3] = [0.268_629_54, 0.261_302_58, 0.275_777_11];

pub struct OnnxVisionEncoder {
    session: Session,
    n_tokens: usize,
    dim: usize,
}

impl OnnxVisionEncoder {
    pub fn load(config: &EngineConfig) -> Result<Self, EngineError> {
        let path = config.encoder_model_path.as_path();
        let session = open_session(path)?;
        info!("ONNX vision encoder loaded from {}", path.display());
        Ok(Self {
            session,
            n_tokens: config.n_image_tokens,
            dim: config.image_embed_len,
        })
    }
}

fn open_session(path: &Path) -> Result<Session, EngineError> {
    Session::builder()
        .map_err(|e| EngineError::Init(e.to_string()))?
        .with_optimization_level(GraphOptimizationLevel::Level3)
        .map_err(|e| EngineError::Init(e.to_string()))?
        .commit_from_file(path)
        .map_err(|e| EngineError::Init(format!("{}: {e}", path.display())))
}

/// Packed HWC bytes to planar CHW floats.
pub fn to_planar(pixels: &PixelTensor) -> Vec<f32> {
    let plane = pixels.width() as usize * pixels.height() as usize;
    let mut out = vec![0.0f32; plane * 3];
    for (i, rgb) in pixels.as_bytes().chunks_exact(3).enumerate() {
        for c in 0..3 {
            out[c * plane + i] = (f32::from(rgb[c]) / 255.0 - CLIP_MEAN[c]) / CLIP_STD[c];
        }
    }
    out
}

impl VisionEncoder for OnnxVisionEncoder {
    fn encode(&mut self, pixels: &PixelTensor) -> Result<ImageEmbedding, EngineError> {
        let shape = [
            1usize,
            3,
            pixels.height() as usize,
            pixels.width() as usize,
        ];
        let input = Tensor::from_array((shape, to_planar(pixels)))
            .map_err(|e| EngineError::Encode(e.to_string()))?;
        let outputs = self
            .session
            .run(ort::inputs![input])
            .map_err(|e| EngineError::Encode(e.to_string()))?;
        let (_, data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| EngineError::Encode(e.to_string()))?;
        ImageEmbedding::new(self.n_tokens, self.dim, data.to_vec())
    }

    fn name(&self) -> &str {
        "onnx"
    }
}
