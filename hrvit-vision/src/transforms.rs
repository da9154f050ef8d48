use candle_core::{Device, Result, Tensor};
use image::{imageops::FilterType, DynamicImage, GenericImageView};
use tracing::debug;

use crate::{
    utils::image_to_pixels, ApplyTransforms, ImageTransform, Transforms, RESIZE_DEN, RESIZE_NUM,
};

/// Convert an image to a tensor. This converts the data from being in `[0, 255]` to `[0.0, 1.0]`.
/// The tensor's shape is (channels, height, width).
pub struct ToTensor;

impl ImageTransform for ToTensor {
    type Input = DynamicImage;
    type Output = Tensor;
    fn map(&self, x: &Self::Input, device: &Device) -> Result<Self::Output> {
        image_to_pixels(x, device)? / 255.0f64
    }
}

/// Normalize the image data based on the mean and standard deviation.
/// The value is computed as follows:
/// `
/// x[channel]=(x[channel] - mean[channel]) / std[channel]
/// `
///
/// Expects an input tensor of shape (channels, height, width).
pub struct Normalize {
    pub mean: Vec<f64>,
    pub std: Vec<f64>,
}

impl ImageTransform for Normalize {
    type Input = Tensor;
    type Output = Self::Input;

    fn map(&self, x: &Self::Input, _: &Device) -> Result<Self::Output> {
        let num_channels = x.dim(0)?;
        if self.mean.len() != num_channels || self.std.len() != num_channels {
            candle_core::bail!("Num channels must match number of mean and std.");
        }
        let mut accum = Vec::new();
        for (i, channel) in x.chunk(num_channels, 0)?.iter().enumerate() {
            accum.push(((channel - self.mean[i])? / self.std[i])?);
        }
        Tensor::cat(&accum, 0)
    }
}

/// Crop the central `(target_h, target_w)` window of a (channels, height, width) tensor.
pub struct CenterCrop {
    pub target_w: usize,
    pub target_h: usize,
}

impl ImageTransform for CenterCrop {
    type Input = Tensor;
    type Output = Self::Input;

    fn map(&self, x: &Self::Input, _: &Device) -> Result<Self::Output> {
        let (_, h, w) = x.dims3()?;
        if self.target_h > h || self.target_w > w {
            candle_core::bail!(
                "Cannot crop {}x{} out of a {h}x{w} image",
                self.target_h,
                self.target_w
            );
        }
        let top = (h - self.target_h) / 2;
        let left = (w - self.target_w) / 2;
        x.narrow(1, top, self.target_h)?
            .narrow(2, left, self.target_w)
    }
}

/// Resize so the shorter side is `shortest`, keeping the aspect ratio.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn resize_shortest(image: &DynamicImage, shortest: usize) -> DynamicImage {
    let (w, h) = image.dimensions();
    let scale = shortest as f64 / f64::from(w.min(h));
    let new_w = ((f64::from(w) * scale).round() as u32).max(shortest as u32);
    let new_h = ((f64::from(h) * scale).round() as u32).max(shortest as u32);
    image.resize_exact(new_w, new_h, FilterType::Triangle)
}

/// Evaluation preprocessing: resize the shorter side to `size * 256 / 224`,
/// center-crop to `size` and normalize. Output is (3, size, size).
pub fn preprocess(
    image: &DynamicImage,
    size: usize,
    mean: &[f64],
    std: &[f64],
    device: &Device,
) -> Result<Tensor> {
    if size == 0 {
        candle_core::bail!("Image size must be non-zero");
    }
    let shortest = size * RESIZE_NUM / RESIZE_DEN;
    let resized = resize_shortest(image, shortest);
    debug!(
        "Resized {:?} to {:?} before cropping to {size}.",
        image.dimensions(),
        resized.dimensions()
    );
    let crop = CenterCrop {
        target_w: size,
        target_h: size,
    };
    let normalize = Normalize {
        mean: mean.to_vec(),
        std: std.to_vec(),
    };
    resized.apply(
        Transforms {
            input: &ToTensor,
            inner_transforms: &[&crop, &normalize],
        },
        device,
    )
}

#[cfg(test)]
mod tests {
    use candle_core::{DType, Device, Tensor};
    use image::{ColorType, DynamicImage};

    use super::*;

    #[test]
    fn test_to_tensor() {
        let image = DynamicImage::new(4, 5, ColorType::Rgb8);
        let res = ToTensor.map(&image, &Device::Cpu).unwrap();
        assert_eq!(res.dims(), &[3, 5, 4])
    }

    #[test]
    fn rgba_drops_alpha() {
        let image = DynamicImage::new(4, 5, ColorType::Rgba8);
        let res = ToTensor.map(&image, &Device::Cpu).unwrap();
        assert_eq!(res.dims(), &[3, 5, 4])
    }

    #[test]
    fn test_normalize() {
        let image = Tensor::zeros((3, 5, 4), DType::F32, &Device::Cpu).unwrap();
        let res = Normalize {
            mean: vec![0.5, 0.5, 0.5],
            std: vec![0.5, 0.5, 0.5],
        }
        .map(&image, &Device::Cpu)
        .unwrap();
        assert_eq!(res.dims(), &[3, 5, 4]);
        let values = res.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(values.iter().all(|v| (v + 1.0).abs() < 1e-6));

        let wrong = Normalize {
            mean: vec![0.5],
            std: vec![0.5],
        };
        assert!(wrong.map(&image, &Device::Cpu).is_err());
    }

    #[test]
    fn center_crop_takes_middle() {
        let x = Tensor::arange(0f32, 25., &Device::Cpu)
            .unwrap()
            .reshape((1, 5, 5))
            .unwrap();
        let crop = CenterCrop {
            target_w: 3,
            target_h: 1,
        };
        let res = crop.map(&x, &Device::Cpu).unwrap();
        assert_eq!(res.to_vec3::<f32>().unwrap(), vec![vec![vec![11., 12., 13.]]]);

        let too_big = CenterCrop {
            target_w: 6,
            target_h: 1,
        };
        assert!(too_big.map(&x, &Device::Cpu).is_err());
    }

    #[test]
    fn resize_keeps_aspect() {
        let image = DynamicImage::new(400, 200, ColorType::Rgb8);
        let resized = resize_shortest(&image, 100);
        assert_eq!(resized.dimensions(), (200, 100));
    }
}
