//! Injectable randomness.
//!
//! Every random draw made by the diffusion core goes through an `EntropySource`
//! so that a run is reproducible given a seed and the same call sequence.
use rand::{rngs::StdRng, seq::SliceRandom, Rng, SeedableRng};
use rand_distr::StandardNormal;
use tch::{Device, Tensor};

pub trait EntropySource {
    /// A float tensor of the given size with elements drawn from N(0, 1).
    fn randn(&mut self, size: &[i64], device: Device) -> Tensor;

    /// `n` integers drawn uniformly from `[low, high)`.
    fn randint(&mut self, low: i64, high: i64, n: usize) -> Vec<i64>;

    /// Permutes `values` in place, every ordering being equally likely.
    fn shuffle(&mut self, values: &mut [i64]);
}

/// Host side generator, the values are copied over to the target device.
#[derive(Debug, Clone)]
pub struct SeededEntropy {
    rng: StdRng,
}

impl SeededEntropy {
    pub fn new(seed: u64) -> Self {
        Self { rng: StdRng::seed_from_u64(seed) }
    }
}

impl EntropySource for SeededEntropy {
    fn randn(&mut self, size: &[i64], device: Device) -> Tensor {
        let numel: i64 = size.iter().product();
        let values: Vec<f32> =
            (0..numel).map(|_| self.rng.sample::<f32, _>(StandardNormal)).collect();
        Tensor::from_slice(&values).view(size).to_device(device)
    }

    fn randint(&mut self, low: i64, high: i64, n: usize) -> Vec<i64> {
        (0..n).map(|_| self.rng.gen_range(low..high)).collect()
    }

    fn shuffle(&mut self, values: &mut [i64]) {
        values.shuffle(&mut self.rng);
    }
}
