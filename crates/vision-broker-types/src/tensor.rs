use crate::EngineError;

/// Contiguous RGB pixel buffer, row-major, 3 bytes per pixel (HWC).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PixelTensor {
    width: u32,
    height: u32,
    data: Vec<u8>,
}

impl PixelTensor {
    pub fn new(width: u32, height: u32, data: Vec<u8>) -> Result<Self, EngineError> {
        let expected = width as usize * height as usize * 3;
        if data.len() != expected {
            return Err(EngineError::Encode(format!(
                "pixel buffer holds {} bytes, expected {expected} for {width}x{height}x3",
                data.len()
            )));
        }
        Ok(Self {
            width,
            height,
            data,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// RGB triple at (x, y).
    pub fn pixel(&self, x: u32, y: u32) -> [u8; 3] {
        let idx = (y as usize * self.width as usize + x as usize) * 3;
        [self.data[idx], self.data[idx + 1], self.data[idx + 2]]
    }
}

/// Encoder output: `n_tokens` rows of `dim` floats, flattened row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageEmbedding {
    n_tokens: usize,
    dim: usize,
    data: Vec<f32>,
}

impl ImageEmbedding {
    pub fn new(n_tokens: usize, dim: usize, data: Vec<f32>) -> Result<Self, EngineError> {
        if data.len() != n_tokens * dim {
            return Err(EngineError::Encode(format!(
                "embedding holds {} values, expected {n_tokens}x{dim}",
                data.len()
            )));
        }
        Ok(Self {
            n_tokens,
            dim,
            data,
        })
    }

    pub fn zeros(n_tokens: usize, dim: usize) -> Self {
        Self {
            n_tokens,
            dim,
            data: vec![0.0; n_tokens * dim],
        }
    }

    pub fn n_tokens(&self) -> usize {
        self.n_tokens
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pixel_tensor_rejects_wrong_length() {
        assert!(PixelTensor::new(2, 2, vec![0; 11]).is_err());
        assert!(PixelTensor::new(2, 2, vec![0; 12]).is_ok());
    }

    #[test]
    fn test_pixel_lookup_is_row_major() {
        let mut data = vec![0u8; 2 * 2 * 3];
        // (x=1, y=1) is the last pixel
        data[9..12].copy_from_slice(&[10, 20, 30]);
        let tensor = PixelTensor::new(2, 2, data).unwrap();
        assert_eq!(tensor.pixel(1, 1), [10, 20, 30]);
        assert_eq!(tensor.pixel(0, 1), [0, 0, 0]);
    }

    #[test]
    fn test_embedding_shape_check() {
        assert!(ImageEmbedding::new(196, 1536, vec![0.0; 196 * 1536]).is_ok());
        assert!(ImageEmbedding::new(196, 1536, vec![0.0; 10]).is_err());
        assert_eq!(ImageEmbedding::zeros(4, 8).as_slice().len(), 32);
    }
}
