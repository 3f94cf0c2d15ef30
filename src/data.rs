use std::path::Path;

use anyhow::Context;
use tch::{Kind, Tensor};

use crate::entropy::EntropySource;

/// Loads every image of a directory, resized to `img_size` and scaled to `[-1, 1]`.
/// The result has shape `[n, 3, img_size, img_size]`.
pub fn load_image_folder<T: AsRef<Path>>(path: T, img_size: i64) -> anyhow::Result<Tensor> {
    let images = tch::vision::image::load_dir(path.as_ref(), img_size, img_size)
        .with_context(|| format!("error loading images from {:?}", path.as_ref().to_string_lossy()))?;
    Ok(images.to_kind(Kind::Float) / 127.5 - 1.)
}

/// Splits `images` into batches along the first dimension after shuffling it.
/// The last batch is smaller when the sizes do not divide evenly.
pub fn shuffled_batches<R: EntropySource + ?Sized>(
    images: &Tensor,
    batch_size: usize,
    rng: &mut R,
) -> Vec<Tensor> {
    let n = images.size().first().copied().unwrap_or(0);
    let mut order: Vec<i64> = (0..n).collect();
    rng.shuffle(&mut order);
    let index = Tensor::from_slice(&order).to_device(images.device());
    images.index_select(0, &index).split(batch_size as i64, 0)
}
