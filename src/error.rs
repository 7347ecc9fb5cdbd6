//! Error taxonomy for training, search and data handling

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum FgzError {
    /// Action refers to a button the action space does not know about
    #[error("unknown button `{0}`")]
    UnknownButton(String),

    /// Two keys of one action name the same button in different case
    #[error("button `{0}` is given more than once")]
    DuplicateButton(String),

    /// Search environment stepped or reset before `set_all_states`
    #[error("search environment states are uninitialized, call set_all_states first")]
    UninitializedState,

    /// Tree sampled before any transition was recorded
    #[error("search tree is empty, simulate at least one step before sampling")]
    EmptyTree,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("expected a vector of size {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("expected {expected} walker entries, got {actual}")]
    WalkerCount { expected: usize, actual: usize },

    #[error("walker {index} has out of range clone partner {partner}")]
    InvalidPartner { index: usize, partner: usize },

    /// Frame could not be embedded; recovered inside the data layer
    #[error("corrupt frame {index} in trajectory {uid}")]
    CorruptFrame { uid: String, index: usize },

    #[error("unknown trajectory `{0}`")]
    UnknownTrajectory(String),

    #[error("unknown task `{0}`")]
    UnknownTask(String),

    #[error("no checkpoints found in {0}")]
    NoCheckpoint(PathBuf),

    #[error("prefetch worker {0} failed")]
    WorkerFailed(usize),

    #[error("recorder error: {0}")]
    Recorder(String),

    #[error("tensor data error: {0}")]
    TensorData(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl FgzError {
    pub fn config(message: impl Into<String>) -> Self {
        FgzError::Config(message.into())
    }

    /// True for data-layer errors that are recovered by resampling
    pub fn is_recoverable_data_error(&self) -> bool {
        matches!(
            self,
            FgzError::CorruptFrame { .. } | FgzError::Io(_) | FgzError::Json(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, FgzError>;

/// Read a tensor back to host memory as `f32`
pub fn tensor_to_vec<B: burn::tensor::backend::Backend, const D: usize>(
    tensor: burn::tensor::Tensor<B, D>,
) -> Result<Vec<f32>> {
    tensor
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|err| FgzError::TensorData(format!("{err:?}")))
}
