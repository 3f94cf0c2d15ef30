use std::{fs, path::PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::schedule::BetaSchedule;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DiffusionConfig {
    pub noise_steps: usize,
    pub beta_start: f64,
    pub beta_end: f64,
    pub beta_schedule: BetaSchedule,
    pub img_size: i64,
    pub channels: i64,
}

impl Default for DiffusionConfig {
    fn default() -> Self {
        Self {
            noise_steps: 1000,
            beta_start: 1e-4,
            beta_end: 0.02,
            beta_schedule: BetaSchedule::Linear,
            img_size: 256,
            channels: 3,
        }
    }
}

impl DiffusionConfig {
    pub fn from_file<T: AsRef<std::path::Path>>(path: T) -> anyhow::Result<Self> {
        let file = fs::read_to_string(path.as_ref())
            .with_context(|| format!("error opening {:?}", path.as_ref().to_string_lossy()))?;
        let cfg: DiffusionConfig = toml::from_str(&file)?;
        Ok(cfg)
    }
}

/// Where the tensors live.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    #[default]
    Auto,
    Cpu,
    Cuda,
    Mps,
}

impl std::str::FromStr for DeviceKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(DeviceKind::Auto),
            "cpu" => Ok(DeviceKind::Cpu),
            "cuda" => Ok(DeviceKind::Cuda),
            "mps" => Ok(DeviceKind::Mps),
            _ => anyhow::bail!("unknown device '{s}', expected one of auto, cpu, cuda, mps"),
        }
    }
}

/// Settings of a training run. Built once at startup and then only read.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TrainConfig {
    pub run_name: String,
    pub epochs: usize,
    pub batch_size: usize,
    pub seed: u64,
    pub img_size: i64,
    pub dataset_path: PathBuf,
    pub device: DeviceKind,
    pub lr: f64,
    pub noise_steps: usize,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            run_name: "DDPM_Unconditional".to_string(),
            epochs: 100,
            batch_size: 12,
            seed: 43,
            img_size: 32,
            dataset_path: PathBuf::from("data/train"),
            device: DeviceKind::Auto,
            lr: 3e-4,
            noise_steps: 1000,
        }
    }
}

impl TrainConfig {
    pub fn from_file<T: AsRef<std::path::Path>>(path: T) -> anyhow::Result<Self> {
        let file = fs::read_to_string(path.as_ref())
            .with_context(|| format!("error opening {:?}", path.as_ref().to_string_lossy()))?;
        let cfg: TrainConfig = toml::from_str(&file)?;
        Ok(cfg)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(!self.run_name.is_empty(), "run_name must not be empty");
        anyhow::ensure!(self.epochs > 0, "epochs must be positive");
        anyhow::ensure!(self.batch_size > 0, "batch_size must be positive");
        anyhow::ensure!(self.img_size > 0, "img_size must be positive");
        anyhow::ensure!(self.lr > 0., "lr must be positive, got {}", self.lr);
        anyhow::ensure!(self.noise_steps > 1, "noise_steps must be at least 2");
        Ok(())
    }

    /// The diffusion settings implied by this run, the beta bounds keep their defaults.
    pub fn diffusion(&self) -> DiffusionConfig {
        DiffusionConfig {
            noise_steps: self.noise_steps,
            img_size: self.img_size,
            ..Default::default()
        }
    }
}
