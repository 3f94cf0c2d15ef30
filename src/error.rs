use thiserror::Error;

/// Errors surfaced by the diffusion core. None of them are recovered locally:
/// a failed `noise_images` or `sample` call has to be restarted from scratch.
#[derive(Debug, Error)]
pub enum DiffusionError {
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("timestep {timestep} is out of range for a schedule of {steps} steps")]
    IndexOutOfRange { timestep: i64, steps: usize },

    #[error("shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch { expected: Vec<i64>, got: Vec<i64> },

    #[error("noise predictor failed: {0}")]
    PredictorError(String),

    #[error("sampling was cancelled")]
    Cancelled,

    #[error(transparent)]
    Torch(#[from] tch::TchError),
}

pub type Result<T> = std::result::Result<T, DiffusionError>;
