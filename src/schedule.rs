//! Variance schedules for the forward noising process.
use serde::{Deserialize, Serialize};

use crate::error::{DiffusionError, Result};

/// This represents how beta ranges from its minimum value to the maximum
/// during training.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum BetaSchedule {
    /// Linear interpolation.
    #[default]
    Linear,
    /// Linear interpolation of the square root of beta.
    ScaledLinear,
}

impl BetaSchedule {
    pub fn betas(&self, steps: usize, beta_start: f64, beta_end: f64) -> Result<Vec<f64>> {
        check_bounds(steps, beta_start, beta_end)?;
        let betas = match self {
            BetaSchedule::Linear => linspace(beta_start, beta_end, steps),
            BetaSchedule::ScaledLinear => linspace(beta_start.sqrt(), beta_end.sqrt(), steps)
                .into_iter()
                .map(|b| b * b)
                .collect(),
        };
        Ok(betas)
    }
}

/// `steps` evenly spaced betas from `beta_start` to `beta_end`, both included.
pub fn build(steps: usize, beta_start: f64, beta_end: f64) -> Result<Vec<f64>> {
    BetaSchedule::Linear.betas(steps, beta_start, beta_end)
}

fn check_bounds(steps: usize, beta_start: f64, beta_end: f64) -> Result<()> {
    if steps < 1 {
        return Err(DiffusionError::InvalidConfiguration(
            "the number of noise steps must be at least 1".to_string(),
        ));
    }
    if !(beta_start > 0.) || !(beta_end > 0.) {
        return Err(DiffusionError::InvalidConfiguration(format!(
            "beta bounds must be positive, got start={beta_start} end={beta_end}"
        )));
    }
    if beta_start >= beta_end {
        return Err(DiffusionError::InvalidConfiguration(format!(
            "beta_start ({beta_start}) must be smaller than beta_end ({beta_end})"
        )));
    }
    if beta_end >= 1. {
        return Err(DiffusionError::InvalidConfiguration(format!(
            "beta_end must be below 1, got {beta_end}"
        )));
    }
    Ok(())
}

// Walks in from both ends like torch.linspace so that the endpoints are exact.
fn linspace(start: f64, end: f64, steps: usize) -> Vec<f64> {
    if steps == 1 {
        return vec![start];
    }
    let step = (end - start) / (steps - 1) as f64;
    let halfway = steps / 2;
    (0..steps)
        .map(|i| {
            if i < halfway {
                start + step * i as f64
            } else {
                end - step * (steps - 1 - i) as f64
            }
        })
        .collect()
}

/// The betas of a diffusion process together with the sequences derived from
/// them. Built once, read-only afterwards.
#[derive(Debug, Clone)]
pub struct NoiseSchedule {
    betas: Vec<f64>,
    alphas: Vec<f64>,
    alphas_cumprod: Vec<f64>,
}

impl NoiseSchedule {
    pub fn new(steps: usize, beta_start: f64, beta_end: f64, schedule: BetaSchedule) -> Result<Self> {
        let betas = schedule.betas(steps, beta_start, beta_end)?;
        let alphas: Vec<f64> = betas.iter().map(|b| 1. - b).collect();
        let alphas_cumprod = alphas
            .iter()
            .scan(1.0, |acc, a| {
                *acc *= a;
                Some(*acc)
            })
            .collect();
        Ok(Self { betas, alphas, alphas_cumprod })
    }

    pub fn len(&self) -> usize {
        self.betas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.betas.is_empty()
    }

    pub fn betas(&self) -> &[f64] {
        &self.betas
    }

    pub fn alphas(&self) -> &[f64] {
        &self.alphas
    }

    pub fn alphas_cumprod(&self) -> &[f64] {
        &self.alphas_cumprod
    }
}
