//! Frame embedders
//!
//! The perception backbone is an external collaborator; the training loop
//! only needs `embed(frame) -> vector` of a fixed size.

use crate::error::{FgzError, Result};

pub trait Embedder: Send + Sync + 'static {
    fn embedding_size(&self) -> usize;

    fn embed(&self, frame: &[f32]) -> Result<Vec<f32>>;
}

/// Treats pre-extracted frame features as the embedding
#[derive(Debug, Clone, Copy)]
pub struct PassthroughEmbedder {
    size: usize,
}

impl PassthroughEmbedder {
    pub fn new(size: usize) -> Self {
        Self { size }
    }
}

impl Embedder for PassthroughEmbedder {
    fn embedding_size(&self) -> usize {
        self.size
    }

    fn embed(&self, frame: &[f32]) -> Result<Vec<f32>> {
        if frame.len() != self.size {
            return Err(FgzError::DimensionMismatch {
                expected: self.size,
                actual: frame.len(),
            });
        }
        if frame.iter().any(|v| !v.is_finite()) {
            return Err(FgzError::TensorData("non-finite frame value".to_string()));
        }
        Ok(frame.to_vec())
    }
}

/// Embed one trajectory frame, reporting any failure as a corrupt frame
pub fn embed_frame<E: Embedder + ?Sized>(
    embedder: &E,
    uid: &str,
    index: usize,
    frame: &[f32],
) -> Result<Vec<f32>> {
    embedder.embed(frame).map_err(|err| {
        tracing::debug!("Embedding frame {} of {} failed: {}", index, uid, err);
        FgzError::CorruptFrame {
            uid: uid.to_string(),
            index,
        }
    })
}
