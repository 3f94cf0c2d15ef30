use anyhow::Context;
use tch::{Device, Kind, Tensor};

use crate::config::DeviceKind;

pub fn get_device(kind: DeviceKind) -> Device {
    match kind {
        DeviceKind::Cpu => Device::Cpu,
        DeviceKind::Cuda => Device::Cuda(0),
        DeviceKind::Mps => Device::Mps,
        DeviceKind::Auto => {
            if tch::utils::has_mps() {
                Device::Mps
            } else {
                Device::cuda_if_available()
            }
        }
    }
}

/// `samples.png` becomes `samples.3.png` for the third of several samples.
pub fn output_filename(basename: &str, sample_idx: i64, num_samples: i64) -> String {
    if num_samples > 1 {
        match basename.rsplit_once('.') {
            None => format!("{basename}.{sample_idx}.png"),
            Some((filename_no_extension, extension)) => {
                format!("{filename_no_extension}.{sample_idx}.{extension}")
            }
        }
    } else {
        basename.to_string()
    }
}

/// Writes each image of a `[n, c, h, w]` uint8 batch to its own file.
pub fn save_images(images: &Tensor, basename: &str) -> anyhow::Result<()> {
    let images = images.to_device(Device::Cpu);
    let num_samples = images.size()[0];
    for idx in 0..num_samples {
        let filename = output_filename(basename, idx + 1, num_samples);
        tch::vision::image::save(&images.get(idx), &filename)
            .with_context(|| format!("error saving {filename}"))?;
    }
    Ok(())
}

pub fn has_nan(xs: &Tensor) -> bool {
    xs.isnan().any().to_kind(Kind::Int64).int64_value(&[]) != 0
}
