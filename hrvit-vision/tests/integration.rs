use candle_core::Device;
use image::{ColorType, DynamicImage, Rgb, RgbImage};
use hrvit_vision::{preprocess, ApplyTransforms, CenterCrop, Normalize, ToTensor, Transforms};

#[test]
fn normalize() {
    let image = DynamicImage::new(3, 4, ColorType::Rgb8);
    let transforms = Transforms {
        input: &ToTensor,
        inner_transforms: &[&Normalize {
            mean: vec![0.5, 0.5, 0.5],
            std: vec![0.5, 0.5, 0.5],
        }],
    };
    let transformed = image.apply(transforms, &Device::Cpu).unwrap();
    assert_eq!(transformed.dims(), &[3, 4, 3]);
}

#[test]
fn crop_after_to_tensor() {
    let image = DynamicImage::new(6, 4, ColorType::Rgb8);
    let transforms = Transforms {
        input: &ToTensor,
        inner_transforms: &[&CenterCrop {
            target_w: 2,
            target_h: 2,
        }],
    };
    let transformed = image.apply(transforms, &Device::Cpu).unwrap();
    assert_eq!(transformed.dims(), &[3, 2, 2]);
}

#[test]
fn preprocess_wide_image() {
    let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(320, 240, Rgb([255, 0, 128])));
    let mean = [0.485, 0.456, 0.406];
    let std = [0.229, 0.224, 0.225];
    let pixels = preprocess(&image, 224, &mean, &std, &Device::Cpu).unwrap();
    assert_eq!(pixels.dims(), &[3, 224, 224]);

    // A constant image stays constant per channel.
    let green = pixels.get(1).unwrap().flatten_all().unwrap().to_vec1::<f32>().unwrap();
    let expected = -0.456 / 0.224;
    assert!(green.iter().all(|v| (f64::from(*v) - expected).abs() < 1e-4));
}

#[test]
fn preprocess_rejects_zero_size() {
    let image = DynamicImage::new(8, 8, ColorType::Rgb8);
    assert!(preprocess(&image, 0, &[0.5; 3], &[0.5; 3], &Device::Cpu).is_err());
}
