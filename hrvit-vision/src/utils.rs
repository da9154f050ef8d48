use candle_core::{DType, Device, Result, Tensor};
use image::{DynamicImage, GenericImageView};

/// RGB pixels as f32 in `[0, 255]`. Output is (3, h, w); alpha is dropped
/// and grayscale is expanded.
pub(crate) fn image_to_pixels(image: &DynamicImage, device: &Device) -> Result<Tensor> {
    let (w, h) = image.dimensions();
    let data = image.to_rgb8().into_raw();
    let data = Tensor::from_vec(data, (h as usize, w as usize, 3), device)?;
    data.permute((2, 0, 1))?.to_dtype(DType::F32)
}
