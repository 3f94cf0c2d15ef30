use std::path::PathBuf;

use clap::{Parser, Subcommand};
use ddpm_rs::{
    data::load_image_folder,
    eps_net::{EpsNet, EpsNetConfig},
    train::Trainer,
    utils::{get_device, save_images},
    CancelToken, DeviceKind, Diffusion, SeededEntropy, TrainConfig,
};
use tracing_chrome::ChromeLayerBuilder;
use tracing_subscriber::{filter::LevelFilter, prelude::*};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Enable tracing (generates a trace-timestamp.json file).
    #[arg(long)]
    tracing: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Train a noise predictor on a folder of images.
    Train(TrainArgs),
    /// Generate images from a trained checkpoint.
    Sample(SampleArgs),
}

#[derive(clap::Args)]
struct TrainArgs {
    /// A TOML file with the run settings, the flags below take precedence.
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    run_name: Option<String>,

    #[arg(long)]
    epochs: Option<usize>,

    #[arg(long)]
    batch_size: Option<usize>,

    #[arg(long)]
    seed: Option<u64>,

    #[arg(long)]
    img_size: Option<i64>,

    #[arg(long)]
    dataset_path: Option<PathBuf>,

    #[arg(long)]
    device: Option<DeviceKind>,

    #[arg(long)]
    lr: Option<f64>,

    #[arg(long)]
    noise_steps: Option<usize>,

    /// Where the results/ and models/ directories are created.
    #[arg(long, default_value = ".")]
    out_dir: PathBuf,
}

impl TrainArgs {
    fn train_config(&self) -> anyhow::Result<TrainConfig> {
        let base = match &self.config {
            Some(path) => TrainConfig::from_file(path)?,
            None => TrainConfig::default(),
        };
        let cfg = TrainConfig {
            run_name: self.run_name.clone().unwrap_or(base.run_name),
            epochs: self.epochs.unwrap_or(base.epochs),
            batch_size: self.batch_size.unwrap_or(base.batch_size),
            seed: self.seed.unwrap_or(base.seed),
            img_size: self.img_size.unwrap_or(base.img_size),
            dataset_path: self.dataset_path.clone().unwrap_or(base.dataset_path),
            device: self.device.unwrap_or(base.device),
            lr: self.lr.unwrap_or(base.lr),
            noise_steps: self.noise_steps.unwrap_or(base.noise_steps),
        };
        cfg.validate()?;
        Ok(cfg)
    }
}

#[derive(clap::Args)]
struct SampleArgs {
    /// The weights saved by `train`.
    #[arg(long)]
    checkpoint: PathBuf,

    /// The TOML settings the checkpoint was trained with.
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long, default_value = "1")]
    num_samples: usize,

    #[arg(long, default_value = "./ddpm_sample.png")]
    output: String,

    #[arg(long, default_value = "9527")]
    seed: u64,

    #[arg(long)]
    device: Option<DeviceKind>,
}

fn train(args: TrainArgs) -> anyhow::Result<()> {
    let cfg = args.train_config()?;
    let device = get_device(cfg.device);
    tracing::info!(?device, run_name = %cfg.run_name, "starting training");

    let diffusion = Diffusion::new(&cfg.diffusion(), device)?;
    let images = load_image_folder(&cfg.dataset_path, cfg.img_size)?.to_device(device);
    tracing::info!("loaded {} training images", images.size()[0]);

    let vs = tch::nn::VarStore::new(device);
    let net = EpsNet::new(vs.root(), EpsNetConfig { channels: diffusion.channels(), ..Default::default() });
    let mut rng = SeededEntropy::new(cfg.seed);
    let mut trainer = Trainer::new(&cfg, &diffusion, &net, &vs, &args.out_dir)?;
    trainer.fit(&images, &mut rng)
}

fn sample(args: SampleArgs) -> anyhow::Result<()> {
    let cfg = match &args.config {
        Some(path) => TrainConfig::from_file(path)?,
        None => TrainConfig::default(),
    };
    let device = get_device(args.device.unwrap_or(cfg.device));
    let diffusion = Diffusion::new(&cfg.diffusion(), device)?;

    let mut vs = tch::nn::VarStore::new(device);
    let net = EpsNet::new(vs.root(), EpsNetConfig { channels: diffusion.channels(), ..Default::default() });
    vs.load(&args.checkpoint)?;

    let mut rng = SeededEntropy::new(args.seed);
    let images = diffusion.sample(&net, args.num_samples, &mut rng, &CancelToken::new())?;
    save_images(&images, &args.output)?;
    tracing::info!("saved {} images to {}", args.num_samples, args.output);
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let (chrome_layer, _guard) = if args.tracing {
        let (chrome_layer, guard) = ChromeLayerBuilder::new().build();
        (Some(chrome_layer), Some(guard))
    } else {
        (None, None)
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_filter(LevelFilter::INFO))
        .with(chrome_layer)
        .init();

    match args.command {
        Command::Train(args) => train(args),
        Command::Sample(args) => sample(args),
    }
}
