pub mod cancel;
pub mod config;
pub mod data;
pub mod diffusion;
pub mod entropy;
pub mod eps_net;
pub mod error;
pub mod predictor;
pub mod schedule;
pub mod train;
pub mod utils;

pub use cancel::CancelToken;
pub use config::{DeviceKind, DiffusionConfig, TrainConfig};
pub use diffusion::{to_image_range, Diffusion};
pub use entropy::{EntropySource, SeededEntropy};
pub use error::{DiffusionError, Result};
pub use predictor::NoisePredictor;
pub use schedule::{BetaSchedule, NoiseSchedule};
