//! # Denoising Diffusion Probabilistic Models
//!
//! The forward process corrupts a clean batch in closed form at arbitrary
//! timesteps, the reverse process starts from pure noise and walks the schedule
//! backwards with a trained noise predictor.
//!
//! https://arxiv.org/abs/2006.11239
use tch::{Device, Kind, Tensor};

use crate::{
    cancel::CancelToken,
    config::DiffusionConfig,
    entropy::EntropySource,
    error::{DiffusionError, Result},
    predictor::NoisePredictor,
    schedule::NoiseSchedule,
};

#[derive(Debug)]
pub struct Diffusion {
    schedule: NoiseSchedule,
    sqrt_alphas_cumprod: Tensor,
    sqrt_one_minus_alphas_cumprod: Tensor,
    img_size: i64,
    channels: i64,
    device: Device,
}

impl Diffusion {
    pub fn new(config: &DiffusionConfig, device: Device) -> Result<Self> {
        if config.noise_steps < 2 {
            return Err(DiffusionError::InvalidConfiguration(format!(
                "at least 2 noise steps are required, got {}",
                config.noise_steps
            )));
        }
        if config.img_size < 1 || config.channels < 1 {
            return Err(DiffusionError::InvalidConfiguration(format!(
                "image size and channels must be positive, got {} and {}",
                config.img_size, config.channels
            )));
        }
        let schedule = NoiseSchedule::new(
            config.noise_steps,
            config.beta_start,
            config.beta_end,
            config.beta_schedule,
        )?;
        let to_device = |values: Vec<f64>| {
            Tensor::from_slice(&values).to_kind(Kind::Float).to_device(device)
        };
        let sqrt_alphas_cumprod =
            to_device(schedule.alphas_cumprod().iter().map(|a| a.sqrt()).collect());
        let sqrt_one_minus_alphas_cumprod =
            to_device(schedule.alphas_cumprod().iter().map(|a| (1. - a).sqrt()).collect());
        Ok(Self {
            schedule,
            sqrt_alphas_cumprod,
            sqrt_one_minus_alphas_cumprod,
            img_size: config.img_size,
            channels: config.channels,
            device,
        })
    }

    pub fn schedule(&self) -> &NoiseSchedule {
        &self.schedule
    }

    pub fn noise_steps(&self) -> usize {
        self.schedule.len()
    }

    pub fn img_size(&self) -> i64 {
        self.img_size
    }

    pub fn channels(&self) -> i64 {
        self.channels
    }

    pub fn device(&self) -> Device {
        self.device
    }

    /// Draws one training timestep per sample, uniformly in `[1, T-1]`.
    pub fn sample_timesteps<R: EntropySource + ?Sized>(&self, n: usize, rng: &mut R) -> Tensor {
        let timesteps = rng.randint(1, self.noise_steps() as i64, n);
        Tensor::from_slice(&timesteps).to_device(self.device)
    }

    /// `sqrt(alpha_cumprod[t]) * x + sqrt(1 - alpha_cumprod[t]) * noise`, one `t` per sample.
    pub fn add_noise(&self, xs: &Tensor, noise: &Tensor, timesteps: &Tensor) -> Result<Tensor> {
        if noise.size() != xs.size() {
            return Err(DiffusionError::ShapeMismatch { expected: xs.size(), got: noise.size() });
        }
        let timesteps = self.check_timesteps(xs, timesteps)?;
        Ok(self.blend(xs, noise, &timesteps))
    }

    /// Noises `xs` at `timesteps` in a single step. Returns the noisy batch and the
    /// noise that was used, the latter being the regression target when training.
    /// Nothing is drawn from `rng` when the timesteps are rejected.
    pub fn noise_images<R: EntropySource + ?Sized>(
        &self,
        xs: &Tensor,
        timesteps: &Tensor,
        rng: &mut R,
    ) -> Result<(Tensor, Tensor)> {
        let timesteps = self.check_timesteps(xs, timesteps)?;
        let noise = rng.randn(&xs.size(), xs.device());
        let noisy = self.blend(xs, &noise, &timesteps);
        Ok((noisy, noise))
    }

    // `timesteps` must already have gone through `check_timesteps`.
    fn blend(&self, xs: &Tensor, noise: &Tensor, timesteps: &Tensor) -> Tensor {
        let mut coeff_shape = vec![1i64; xs.dim()];
        coeff_shape[0] = -1;
        let sqrt_alpha_hat = self
            .sqrt_alphas_cumprod
            .index_select(0, timesteps)
            .view(coeff_shape.as_slice())
            .to_device(xs.device());
        let sqrt_one_minus_alpha_hat = self
            .sqrt_one_minus_alphas_cumprod
            .index_select(0, timesteps)
            .view(coeff_shape.as_slice())
            .to_device(xs.device());
        sqrt_alpha_hat * xs + sqrt_one_minus_alpha_hat * noise
    }

    // Returns the timesteps as int64 on the schedule device once they are known to be valid.
    fn check_timesteps(&self, xs: &Tensor, timesteps: &Tensor) -> Result<Tensor> {
        if xs.dim() == 0 {
            return Err(DiffusionError::ShapeMismatch { expected: timesteps.size(), got: xs.size() });
        }
        let batch = xs.size()[0];
        if timesteps.size() != [batch] {
            return Err(DiffusionError::ShapeMismatch { expected: vec![batch], got: timesteps.size() });
        }
        let values = Vec::<i64>::try_from(&timesteps.to_kind(Kind::Int64).to_device(Device::Cpu))?;
        let steps = self.noise_steps();
        if let Some(&timestep) = values.iter().find(|&&t| t < 0 || t as usize >= steps) {
            return Err(DiffusionError::IndexOutOfRange { timestep, steps });
        }
        Ok(timesteps.to_kind(Kind::Int64).to_device(self.device))
    }

    /// Runs the reverse process from `T-1` down to `1` and returns the batch in the
    /// normalized range, before any clamping.
    pub fn denoise<P, R>(
        &self,
        predictor: &P,
        n: usize,
        rng: &mut R,
        cancel: &CancelToken,
    ) -> Result<Tensor>
    where
        P: NoisePredictor + ?Sized,
        R: EntropySource + ?Sized,
    {
        tracing::info!("Sampling {n} new images....");
        let _no_grad = tch::no_grad_guard();
        let size = [n as i64, self.channels, self.img_size, self.img_size];
        let mut xs = rng.randn(&size, self.device);
        for i in (1..self.noise_steps()).rev() {
            if cancel.is_cancelled() {
                tracing::info!("sampling cancelled at timestep {i}");
                return Err(DiffusionError::Cancelled);
            }
            let timesteps = Tensor::full([n as i64], i as i64, (Kind::Int64, self.device));
            let predicted_noise = predictor
                .forward_t(&xs, &timesteps, false)
                .map_err(|e| DiffusionError::PredictorError(format!("{e:#}")))?;
            check_prediction(&xs, &predicted_noise)?;
            let alpha = self.schedule.alphas()[i];
            let alpha_hat = self.schedule.alphas_cumprod()[i];
            let beta = self.schedule.betas()[i];
            let noise = if i > 1 { rng.randn(&size, self.device) } else { xs.zeros_like() };
            xs = (&xs - predicted_noise * ((1. - alpha) / (1. - alpha_hat).sqrt()))
                * (1. / alpha.sqrt())
                + noise * beta.sqrt();
            tracing::trace!(timestep = i, "denoising step");
        }
        Ok(xs)
    }

    /// Generates `n` images as a uint8 tensor of shape `[n, channels, img_size, img_size]`.
    pub fn sample<P, R>(
        &self,
        predictor: &P,
        n: usize,
        rng: &mut R,
        cancel: &CancelToken,
    ) -> Result<Tensor>
    where
        P: NoisePredictor + ?Sized,
        R: EntropySource + ?Sized,
    {
        let xs = self.denoise(predictor, n, rng, cancel)?;
        Ok(to_image_range(&xs))
    }
}

/// A prediction has to match the noisy batch in both shape and kind.
pub(crate) fn check_prediction(xs: &Tensor, predicted_noise: &Tensor) -> Result<()> {
    if predicted_noise.size() != xs.size() || predicted_noise.kind() != xs.kind() {
        return Err(DiffusionError::PredictorError(format!(
            "expected a {:?} prediction of shape {:?}, got {:?} of shape {:?}",
            xs.kind(),
            xs.size(),
            predicted_noise.kind(),
            predicted_noise.size()
        )));
    }
    Ok(())
}

/// Maps `[-1, 1]` to `[0, 255]`, clamping first and truncating to uint8.
pub fn to_image_range(xs: &Tensor) -> Tensor {
    let xs = (xs.clamp(-1., 1.) + 1.) / 2.;
    (xs * 255.).to_kind(Kind::Uint8)
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use super::*;
    use crate::entropy::SeededEntropy;

    fn small_config(noise_steps: usize) -> DiffusionConfig {
        DiffusionConfig { noise_steps, img_size: 4, channels: 1, ..Default::default() }
    }

    fn to_vec(xs: &Tensor) -> Vec<f64> {
        Vec::<f64>::try_from(&xs.flatten(0, -1)).unwrap()
    }

    #[test]
    fn test_rejects_invalid_config() {
        let bad = [
            small_config(1),
            DiffusionConfig { beta_start: 0.03, ..small_config(10) },
            DiffusionConfig { img_size: 0, ..small_config(10) },
            DiffusionConfig { channels: 0, ..small_config(10) },
        ];
        for cfg in bad {
            let err = Diffusion::new(&cfg, Device::Cpu).unwrap_err();
            assert!(matches!(err, DiffusionError::InvalidConfiguration(_)), "{err}");
        }
    }

    #[test]
    fn test_sample_timesteps_range() {
        let diffusion = Diffusion::new(&small_config(10), Device::Cpu).unwrap();
        let mut rng = SeededEntropy::new(1);
        let t = diffusion.sample_timesteps(500, &mut rng);
        assert_eq!(t.size(), vec![500]);
        assert_eq!(t.kind(), Kind::Int64);
        let values = Vec::<i64>::try_from(&t).unwrap();
        assert!(values.iter().all(|&v| (1..10).contains(&v)));
    }

    #[test]
    fn test_sample_timesteps_two_steps() {
        let diffusion = Diffusion::new(&small_config(2), Device::Cpu).unwrap();
        let mut rng = SeededEntropy::new(2);
        let values = Vec::<i64>::try_from(&diffusion.sample_timesteps(64, &mut rng)).unwrap();
        assert!(values.iter().all(|&v| v == 1));
    }

    #[test]
    fn test_noise_images_closed_form() {
        let diffusion = Diffusion::new(&small_config(1000), Device::Cpu).unwrap();
        let mut rng = SeededEntropy::new(3);
        let xs = rng.randn(&[3, 1, 4, 4], Device::Cpu);
        let t = Tensor::from_slice(&[0i64, 500, 999]);
        let (noisy, noise) = diffusion.noise_images(&xs, &t, &mut rng).unwrap();
        assert_eq!(noisy.size(), xs.size());
        assert_eq!(noise.size(), xs.size());
        let cumprod = diffusion.schedule().alphas_cumprod();
        for (i, &step) in [0usize, 500, 999].iter().enumerate() {
            let x = to_vec(&xs.get(i as i64));
            let eps = to_vec(&noise.get(i as i64));
            let got = to_vec(&noisy.get(i as i64));
            for k in 0..x.len() {
                let expected = cumprod[step].sqrt() * x[k] + (1. - cumprod[step]).sqrt() * eps[k];
                assert!((got[k] - expected).abs() < 1e-5, "{step} {k}: {} {}", got[k], expected);
            }
        }
    }

    #[test]
    fn test_noise_images_is_reproducible() {
        let diffusion = Diffusion::new(&small_config(100), Device::Cpu).unwrap();
        let xs = SeededEntropy::new(4).randn(&[2, 1, 4, 4], Device::Cpu);
        let t = Tensor::from_slice(&[10i64, 90]);
        let (noisy_a, eps_a) = diffusion.noise_images(&xs, &t, &mut SeededEntropy::new(5)).unwrap();
        let (noisy_b, eps_b) = diffusion.noise_images(&xs, &t, &mut SeededEntropy::new(5)).unwrap();
        assert!(noisy_a.equal(&noisy_b));
        assert!(eps_a.equal(&eps_b));
    }

    #[test]
    fn test_first_timestep_barely_changes_input() {
        let cfg = DiffusionConfig { beta_start: 1e-12, ..small_config(10) };
        let diffusion = Diffusion::new(&cfg, Device::Cpu).unwrap();
        let mut rng = SeededEntropy::new(6);
        let xs = rng.randn(&[2, 1, 4, 4], Device::Cpu);
        let (noisy, _) = diffusion.noise_images(&xs, &Tensor::from_slice(&[0i64, 0]), &mut rng).unwrap();
        assert!(noisy.allclose(&xs, 1e-5, 1e-5, false));
    }

    #[test]
    fn test_noise_images_out_of_range() {
        let diffusion = Diffusion::new(&small_config(10), Device::Cpu).unwrap();
        let mut rng = SeededEntropy::new(7);
        let xs = rng.randn(&[2, 1, 4, 4], Device::Cpu);
        for bad in [10i64, -1] {
            let t = Tensor::from_slice(&[1i64, bad]);
            match diffusion.noise_images(&xs, &t, &mut rng) {
                Err(DiffusionError::IndexOutOfRange { timestep, steps }) => {
                    assert_eq!(timestep, bad);
                    assert_eq!(steps, 10);
                }
                other => panic!("unexpected result {other:?}"),
            }
        }
    }

    #[test]
    fn test_rejected_timesteps_leave_entropy_untouched() {
        let diffusion = Diffusion::new(&small_config(10), Device::Cpu).unwrap();
        let xs = SeededEntropy::new(20).randn(&[2, 1, 4, 4], Device::Cpu);
        let t = Tensor::from_slice(&[3i64, 7]);

        let mut rng = SeededEntropy::new(21);
        let bad = Tensor::from_slice(&[3i64, 10]);
        assert!(diffusion.noise_images(&xs, &bad, &mut rng).is_err());
        assert!(diffusion.noise_images(&xs, &Tensor::from_slice(&[3i64]), &mut rng).is_err());
        let (noisy, noise) = diffusion.noise_images(&xs, &t, &mut rng).unwrap();

        let (fresh_noisy, fresh_noise) = diffusion.noise_images(&xs, &t, &mut SeededEntropy::new(21)).unwrap();
        assert!(noisy.equal(&fresh_noisy));
        assert!(noise.equal(&fresh_noise));
    }

    #[test]
    fn test_scalar_input_is_a_shape_mismatch() {
        let diffusion = Diffusion::new(&small_config(10), Device::Cpu).unwrap();
        let xs = Tensor::from_slice(&[0.5f32]).squeeze();
        let t = Tensor::zeros([0], (Kind::Int64, Device::Cpu));
        let err = diffusion.noise_images(&xs, &t, &mut SeededEntropy::new(22)).unwrap_err();
        assert!(matches!(err, DiffusionError::ShapeMismatch { .. }), "{err}");
        let err = diffusion.add_noise(&xs, &xs, &t).unwrap_err();
        assert!(matches!(err, DiffusionError::ShapeMismatch { .. }), "{err}");
    }

    #[test]
    fn test_noise_images_timestep_count_mismatch() {
        let diffusion = Diffusion::new(&small_config(10), Device::Cpu).unwrap();
        let mut rng = SeededEntropy::new(8);
        let xs = rng.randn(&[3, 1, 4, 4], Device::Cpu);
        let err = diffusion.noise_images(&xs, &Tensor::from_slice(&[1i64, 2]), &mut rng).unwrap_err();
        assert!(matches!(err, DiffusionError::ShapeMismatch { .. }), "{err}");
    }

    #[test]
    fn test_sample_calls_predictor_once_per_step() {
        let diffusion = Diffusion::new(&small_config(6), Device::Cpu).unwrap();
        let seen = RefCell::new(Vec::new());
        let predictor = |xs: &Tensor, t: &Tensor| -> anyhow::Result<Tensor> {
            let t = Vec::<i64>::try_from(t)?;
            assert_eq!(t.len(), 3);
            assert!(t.iter().all(|&v| v == t[0]));
            seen.borrow_mut().push(t[0]);
            Ok(xs * 0.1)
        };
        let images = diffusion
            .sample(&predictor, 3, &mut SeededEntropy::new(9), &CancelToken::new())
            .unwrap();
        assert_eq!(images.size(), vec![3, 1, 4, 4]);
        assert_eq!(images.kind(), Kind::Uint8);
        assert_eq!(*seen.borrow(), vec![5, 4, 3, 2, 1]);
    }

    #[test]
    fn test_zero_predictor_matches_reference() {
        let steps = 5;
        let diffusion = Diffusion::new(&small_config(steps), Device::Cpu).unwrap();
        let zero = |xs: &Tensor, _t: &Tensor| -> anyhow::Result<Tensor> { Ok(xs.zeros_like()) };
        let got = diffusion
            .denoise(&zero, 2, &mut SeededEntropy::new(10), &CancelToken::new())
            .unwrap();

        let size = [2, 1, 4, 4];
        let mut rng = SeededEntropy::new(10);
        let mut expected = to_vec(&rng.randn(&size, Device::Cpu));
        let schedule = diffusion.schedule();
        for i in (1..steps).rev() {
            let z = if i > 1 { to_vec(&rng.randn(&size, Device::Cpu)) } else { vec![0.; expected.len()] };
            let (a, b) = (schedule.alphas()[i], schedule.betas()[i]);
            for (x, z) in expected.iter_mut().zip(z) {
                *x = *x / a.sqrt() + b.sqrt() * z;
            }
        }
        let got = to_vec(&got);
        assert_eq!(got.len(), expected.len());
        for (g, e) in got.iter().zip(expected.iter()) {
            assert!((g - e).abs() < 1e-4, "{g} {e}");
        }
    }

    #[test]
    fn test_predictor_failure() {
        let diffusion = Diffusion::new(&small_config(5), Device::Cpu).unwrap();
        let failing = |_xs: &Tensor, _t: &Tensor| -> anyhow::Result<Tensor> { anyhow::bail!("out of memory") };
        let err = diffusion
            .sample(&failing, 2, &mut SeededEntropy::new(11), &CancelToken::new())
            .unwrap_err();
        assert!(matches!(err, DiffusionError::PredictorError(ref msg) if msg.contains("out of memory")), "{err}");

        let misshaped = |xs: &Tensor, _t: &Tensor| -> anyhow::Result<Tensor> { Ok(xs.narrow(1, 0, 1).repeat([1, 2, 1, 1])) };
        let err = diffusion
            .sample(&misshaped, 2, &mut SeededEntropy::new(11), &CancelToken::new())
            .unwrap_err();
        assert!(matches!(err, DiffusionError::PredictorError(_)), "{err}");

        let double = |xs: &Tensor, _t: &Tensor| -> anyhow::Result<Tensor> { Ok(xs.to_kind(Kind::Double)) };
        let err = diffusion
            .sample(&double, 2, &mut SeededEntropy::new(11), &CancelToken::new())
            .unwrap_err();
        assert!(matches!(err, DiffusionError::PredictorError(ref msg) if msg.contains("Double")), "{err}");
    }

    #[test]
    fn test_cancel_mid_sampling() {
        let diffusion = Diffusion::new(&small_config(10), Device::Cpu).unwrap();
        let cancel = CancelToken::new();
        let calls = RefCell::new(0);
        let predictor = |xs: &Tensor, _t: &Tensor| -> anyhow::Result<Tensor> {
            *calls.borrow_mut() += 1;
            if *calls.borrow() == 2 {
                cancel.cancel();
            }
            Ok(xs.zeros_like())
        };
        let err = diffusion.sample(&predictor, 1, &mut SeededEntropy::new(12), &cancel).unwrap_err();
        assert!(matches!(err, DiffusionError::Cancelled));
        assert_eq!(*calls.borrow(), 2);
    }

    #[test]
    fn test_to_image_range() {
        let xs = Tensor::from_slice(&[-3f32, -1., 0., 0.5, 1., 7.]);
        let images = Vec::<u8>::try_from(&to_image_range(&xs)).unwrap();
        assert_eq!(images, vec![0, 0, 127, 191, 255, 255]);
    }
}
