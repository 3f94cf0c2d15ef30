//! A small time-conditioned convolutional noise predictor.
//!
//! Timesteps go through a sinusoidal embedding and an MLP, the result is added
//! per channel inside every residual block.
use serde::{Deserialize, Serialize};
use tch::{
    nn::{self, Module},
    Kind, Tensor,
};

use crate::predictor::NoisePredictor;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct EpsNetConfig {
    pub channels: i64,
    pub hidden: i64,
    pub time_dim: i64,
    pub num_blocks: usize,
    pub norm_num_groups: i64,
}

impl Default for EpsNetConfig {
    fn default() -> Self {
        Self { channels: 3, hidden: 64, time_dim: 128, num_blocks: 4, norm_num_groups: 8 }
    }
}

/// Sinusoidal embedding of integer timesteps, shape `[n, dim]`.
pub fn timestep_embedding(timesteps: &Tensor, dim: i64) -> Tensor {
    let half_dim = dim / 2;
    let exponent = Tensor::arange(half_dim, (Kind::Float, timesteps.device()))
        * (-(10000f64.ln()) / half_dim as f64);
    let args = timesteps.to_kind(Kind::Float).unsqueeze(-1) * exponent.exp().unsqueeze(0);
    Tensor::cat(&[args.sin(), args.cos()], -1)
}

#[derive(Debug)]
struct ResidualBlock {
    norm1: nn::GroupNorm,
    conv1: nn::Conv2D,
    time_proj: nn::Linear,
    norm2: nn::GroupNorm,
    conv2: nn::Conv2D,
}

impl ResidualBlock {
    fn new(vs: nn::Path, channels: i64, time_dim: i64, groups: i64) -> Self {
        let conv_cfg = nn::ConvConfig { padding: 1, ..Default::default() };
        Self {
            norm1: nn::group_norm(&vs / "norm1", groups, channels, Default::default()),
            conv1: nn::conv2d(&vs / "conv1", channels, channels, 3, conv_cfg),
            time_proj: nn::linear(&vs / "time_proj", time_dim, channels, Default::default()),
            norm2: nn::group_norm(&vs / "norm2", groups, channels, Default::default()),
            conv2: nn::conv2d(&vs / "conv2", channels, channels, 3, conv_cfg),
        }
    }

    fn forward(&self, xs: &Tensor, temb: &Tensor) -> Tensor {
        let h = xs.apply(&self.norm1).silu().apply(&self.conv1);
        let t = temb.silu().apply(&self.time_proj).unsqueeze(-1).unsqueeze(-1);
        let h = (h + t).apply(&self.norm2).silu().apply(&self.conv2);
        xs + h
    }
}

#[derive(Debug)]
pub struct EpsNet {
    time_mlp1: nn::Linear,
    time_mlp2: nn::Linear,
    conv_in: nn::Conv2D,
    blocks: Vec<ResidualBlock>,
    norm_out: nn::GroupNorm,
    conv_out: nn::Conv2D,
    pub config: EpsNetConfig,
}

impl EpsNet {
    pub fn new(vs: nn::Path, config: EpsNetConfig) -> Self {
        let conv_cfg = nn::ConvConfig { padding: 1, ..Default::default() };
        let EpsNetConfig { channels, hidden, time_dim, num_blocks, norm_num_groups } = config;
        let blocks = (0..num_blocks)
            .map(|i| ResidualBlock::new(&vs / "blocks" / i, hidden, time_dim, norm_num_groups))
            .collect();
        Self {
            time_mlp1: nn::linear(&vs / "time_mlp1", time_dim, time_dim, Default::default()),
            time_mlp2: nn::linear(&vs / "time_mlp2", time_dim, time_dim, Default::default()),
            conv_in: nn::conv2d(&vs / "conv_in", channels, hidden, 3, conv_cfg),
            blocks,
            norm_out: nn::group_norm(&vs / "norm_out", norm_num_groups, hidden, Default::default()),
            conv_out: nn::conv2d(&vs / "conv_out", hidden, channels, 3, conv_cfg),
            config,
        }
    }

    pub fn forward(&self, xs: &Tensor, timesteps: &Tensor) -> Tensor {
        let temb = timestep_embedding(timesteps, self.config.time_dim);
        let temb = self.time_mlp1.forward(&temb).silu().apply(&self.time_mlp2);
        let mut h = xs.apply(&self.conv_in);
        for block in self.blocks.iter() {
            h = block.forward(&h, &temb);
        }
        h.apply(&self.norm_out).silu().apply(&self.conv_out)
    }
}

// Group norm has no running statistics, both modes run the same graph.
impl NoisePredictor for EpsNet {
    fn forward_t(&self, xs: &Tensor, timesteps: &Tensor, _train: bool) -> anyhow::Result<Tensor> {
        Ok(self.forward(xs, timesteps))
    }
}
