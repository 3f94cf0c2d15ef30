//! Fitting a noise predictor to the forward process.
use std::path::{Path, PathBuf};

use anyhow::Context;
use tch::{
    nn::{self, OptimizerConfig},
    Reduction, Tensor,
};

use crate::{
    cancel::CancelToken,
    config::TrainConfig,
    data::shuffled_batches,
    diffusion::{check_prediction, Diffusion},
    entropy::EntropySource,
    error::{DiffusionError, Result},
    predictor::NoisePredictor,
    utils::{has_nan, save_images},
};

/// Mean squared error between the noise added at random timesteps and the
/// noise the predictor recovers from the noisy batch.
pub fn training_loss<P, R>(
    diffusion: &Diffusion,
    predictor: &P,
    images: &Tensor,
    rng: &mut R,
) -> Result<Tensor>
where
    P: NoisePredictor + ?Sized,
    R: EntropySource + ?Sized,
{
    let batch = images.size().first().copied().unwrap_or(0) as usize;
    let timesteps = diffusion.sample_timesteps(batch, rng);
    let (x_t, noise) = diffusion.noise_images(images, &timesteps, rng)?;
    let predicted_noise = predictor
        .forward_t(&x_t, &timesteps, true)
        .map_err(|e| DiffusionError::PredictorError(format!("{e:#}")))?;
    check_prediction(&noise, &predicted_noise)?;
    Ok(noise.mse_loss(&predicted_noise, Reduction::Mean))
}

pub struct Trainer<'a, P: NoisePredictor> {
    config: &'a TrainConfig,
    diffusion: &'a Diffusion,
    predictor: &'a P,
    vs: &'a nn::VarStore,
    opt: nn::Optimizer,
    out_dir: PathBuf,
    cancel: CancelToken,
}

impl<'a, P: NoisePredictor> Trainer<'a, P> {
    /// `vs` must hold the parameters of `predictor`. Samples are written to
    /// `<out_dir>/results/<run_name>` and checkpoints to `<out_dir>/models/<run_name>`.
    pub fn new<T: AsRef<Path>>(
        config: &'a TrainConfig,
        diffusion: &'a Diffusion,
        predictor: &'a P,
        vs: &'a nn::VarStore,
        out_dir: T,
    ) -> anyhow::Result<Self> {
        let opt = nn::AdamW::default().build(vs, config.lr)?;
        Ok(Self {
            config,
            diffusion,
            predictor,
            vs,
            opt,
            out_dir: out_dir.as_ref().to_path_buf(),
            cancel: CancelToken::new(),
        })
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn results_dir(&self) -> PathBuf {
        self.out_dir.join("results").join(&self.config.run_name)
    }

    pub fn models_dir(&self) -> PathBuf {
        self.out_dir.join("models").join(&self.config.run_name)
    }

    /// One optimisation step on `images`, returns the loss before the update.
    pub fn train_step<R: EntropySource + ?Sized>(
        &mut self,
        images: &Tensor,
        rng: &mut R,
    ) -> anyhow::Result<f64> {
        let loss = training_loss(self.diffusion, self.predictor, images, rng)?;
        if has_nan(&loss) {
            anyhow::bail!("the training loss is NaN");
        }
        self.opt.backward_step(&loss);
        Ok(loss.double_value(&[]))
    }

    /// Runs every epoch over `images`, sampling a batch and saving a checkpoint after each one.
    pub fn fit<R: EntropySource + ?Sized>(&mut self, images: &Tensor, rng: &mut R) -> anyhow::Result<()> {
        let results_dir = self.results_dir();
        let models_dir = self.models_dir();
        std::fs::create_dir_all(&results_dir)
            .with_context(|| format!("error creating {:?}", results_dir.to_string_lossy()))?;
        std::fs::create_dir_all(&models_dir)
            .with_context(|| format!("error creating {:?}", models_dir.to_string_lossy()))?;

        let num_images = images.size().first().copied().unwrap_or(0) as usize;
        anyhow::ensure!(num_images > 0, "the training set is empty");
        let batches_per_epoch = (num_images + self.config.batch_size - 1) / self.config.batch_size;
        let num_samples = self.config.batch_size.min(num_images);

        for epoch in 0..self.config.epochs {
            if self.cancel.is_cancelled() {
                return Err(DiffusionError::Cancelled.into());
            }
            tracing::info!("Starting epoch {epoch}:");
            let batches = shuffled_batches(images, self.config.batch_size, rng);
            for (i, batch) in batches.iter().enumerate() {
                let loss = self.train_step(batch, rng)?;
                tracing::info!(step = epoch * batches_per_epoch + i, mse = loss, "MSE");
            }

            let sampled = self.diffusion.sample(self.predictor, num_samples, rng, &self.cancel)?;
            let basename = results_dir.join(format!("{epoch}.png"));
            save_images(&sampled, &basename.to_string_lossy())?;
            let ckpt = models_dir.join("ckpt.ot");
            self.vs
                .save(&ckpt)
                .with_context(|| format!("error saving {:?}", ckpt.to_string_lossy()))?;
        }
        Ok(())
    }
}
