use tch::Tensor;

/// Estimates the noise component of a noisy batch.
///
/// `xs` has shape `[n, c, h, w]`, `timesteps` is an int64 tensor of shape `[n]`,
/// and the result must have the same shape as `xs`. `train` selects between the
/// training mode (gradients tracked) and the inference mode used when sampling.
pub trait NoisePredictor {
    fn forward_t(&self, xs: &Tensor, timesteps: &Tensor, train: bool) -> anyhow::Result<Tensor>;
}

impl<F> NoisePredictor for F
where
    F: Fn(&Tensor, &Tensor) -> anyhow::Result<Tensor>,
{
    fn forward_t(&self, xs: &Tensor, timesteps: &Tensor, _train: bool) -> anyhow::Result<Tensor> {
        self(xs, timesteps)
    }
}
