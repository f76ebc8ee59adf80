use image::DynamicImage;
use image::imageops::FilterType;
use ndarray::{Array3, Array4, Axis};
use shared::PreprocessedOn;

pub const INPUT_SIZE: u32 = 224;
pub const EXPECTED_SHAPE: [usize; 4] = [1, 224, 224, 3];

#[derive(Debug, thiserror::Error)]
pub enum PreprocessError {
    #[error("image decoding failed: {0}")]
    Decode(String),
    #[error("final input tensor has invalid shape {actual:?}, expected {expected:?}")]
    ShapeMismatch {
        actual: Vec<usize>,
        expected: [usize; 4],
    },
}

/// Heuristic check for inputs a mobile client already normalized: the decoded
/// pixel grid is exactly 224x224, carries 32-bit float samples, and every RGB
/// value sits in [0, 1]. A raw photo could coincidentally pass; accepted risk,
/// kept for wire compatibility with deployed clients.
pub fn is_preprocessed(image: &DynamicImage) -> bool {
    if image.width() != INPUT_SIZE || image.height() != INPUT_SIZE {
        return false;
    }
    match image {
        DynamicImage::ImageRgb32F(_) | DynamicImage::ImageRgba32F(_) => image
            .to_rgb32f()
            .as_raw()
            .iter()
            .all(|value| (0.0..=1.0).contains(value)),
        _ => false,
    }
}

/// Converts raw upload bytes into the canonical `(1, 224, 224, 3)` float32
/// RGB tensor, reporting where normalization happened.
pub fn normalize(bytes: &[u8]) -> Result<(Array4<f32>, PreprocessedOn), PreprocessError> {
    if bytes.is_empty() {
        return Err(PreprocessError::Decode("empty image payload".to_string()));
    }
    let decoded =
        image::load_from_memory(bytes).map_err(|e| PreprocessError::Decode(e.to_string()))?;
    normalize_image(decoded)
}

pub fn normalize_image(
    decoded: DynamicImage,
) -> Result<(Array4<f32>, PreprocessedOn), PreprocessError> {
    let (width, height, data, provenance) = if is_preprocessed(&decoded) {
        // Already resized and scaled client-side; only the batch axis is missing.
        let pixels = decoded.to_rgb32f();
        (
            pixels.width(),
            pixels.height(),
            pixels.into_raw(),
            PreprocessedOn::Mobile,
        )
    } else {
        let resized = decoded
            .resize_exact(INPUT_SIZE, INPUT_SIZE, FilterType::CatmullRom)
            .to_rgb8();
        let data = resized
            .as_raw()
            .iter()
            .map(|&value| f32::from(value) / 255.0)
            .collect();
        (
            resized.width(),
            resized.height(),
            data,
            PreprocessedOn::Backend,
        )
    };

    let pixels = Array3::from_shape_vec((height as usize, width as usize, 3), data).map_err(
        |_| PreprocessError::ShapeMismatch {
            actual: vec![height as usize, width as usize, 3],
            expected: EXPECTED_SHAPE,
        },
    )?;
    let tensor = pixels.insert_axis(Axis(0));
    if tensor.shape() != &EXPECTED_SHAPE[..] {
        return Err(PreprocessError::ShapeMismatch {
            actual: tensor.shape().to_vec(),
            expected: EXPECTED_SHAPE,
        });
    }
    Ok((tensor, provenance))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, Rgb32FImage, RgbImage, RgbaImage};
    use std::io::Cursor;

    fn png_bytes(image: DynamicImage) -> Vec<u8> {
        let mut bytes = Vec::new();
        image
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .unwrap();
        bytes
    }

    #[test]
    fn raw_rgb_image_normalizes_to_canonical_shape() {
        let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(
            640,
            480,
            image::Rgb([10, 200, 255]),
        ));
        let (tensor, provenance) = normalize(&png_bytes(image)).unwrap();
        assert_eq!(tensor.shape(), &[1, 224, 224, 3]);
        assert!(tensor.iter().all(|v| (0.0..=1.0).contains(v)));
        assert_eq!(provenance, PreprocessedOn::Backend);
    }

    #[test]
    fn grayscale_input_expands_to_three_channels() {
        let image = DynamicImage::ImageLuma8(image::GrayImage::from_pixel(
            100,
            300,
            image::Luma([127]),
        ));
        let (tensor, _) = normalize(&png_bytes(image)).unwrap();
        assert_eq!(tensor.shape(), &[1, 224, 224, 3]);
    }

    #[test]
    fn alpha_channel_is_discarded() {
        let image = DynamicImage::ImageRgba8(RgbaImage::from_pixel(
            50,
            50,
            image::Rgba([0, 128, 255, 7]),
        ));
        let (tensor, _) = normalize(&png_bytes(image)).unwrap();
        assert_eq!(tensor.shape(), &[1, 224, 224, 3]);
    }

    #[test]
    fn byte_values_scale_by_255() {
        let mut pixels = RgbImage::new(224, 224);
        for pixel in pixels.pixels_mut() {
            *pixel = image::Rgb([255, 0, 51]);
        }
        let (tensor, _) = normalize(&png_bytes(DynamicImage::ImageRgb8(pixels))).unwrap();
        let first = tensor.index_axis(Axis(0), 0);
        assert!((first[[0, 0, 0]] - 1.0).abs() < 1e-6);
        assert!(first[[0, 0, 1]].abs() < 1e-6);
        assert!((first[[0, 0, 2]] - 0.2).abs() < 1e-6);
    }

    #[test]
    fn corrupt_bytes_fail_with_decode_error() {
        let result = normalize(b"definitely not an image");
        assert!(matches!(result, Err(PreprocessError::Decode(_))));
    }

    #[test]
    fn empty_payload_fails_with_decode_error() {
        let result = normalize(&[]);
        assert!(matches!(result, Err(PreprocessError::Decode(_))));
    }

    #[test]
    fn truncated_png_fails_with_decode_error() {
        let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(64, 64, image::Rgb([1, 2, 3])));
        let bytes = png_bytes(image);
        let result = normalize(&bytes[..bytes.len() / 2]);
        assert!(matches!(result, Err(PreprocessError::Decode(_))));
    }

    #[test]
    fn float_224_image_in_unit_range_counts_as_preprocessed() {
        let pixels = Rgb32FImage::from_pixel(224, 224, image::Rgb([0.0, 0.5, 1.0]));
        assert!(is_preprocessed(&DynamicImage::ImageRgb32F(pixels)));
    }

    #[test]
    fn wrong_size_float_image_is_not_preprocessed() {
        let pixels = Rgb32FImage::from_pixel(100, 100, image::Rgb([0.5, 0.5, 0.5]));
        assert!(!is_preprocessed(&DynamicImage::ImageRgb32F(pixels)));
    }

    #[test]
    fn out_of_range_float_image_is_not_preprocessed() {
        let pixels = Rgb32FImage::from_pixel(224, 224, image::Rgb([0.5, 1.5, 0.5]));
        assert!(!is_preprocessed(&DynamicImage::ImageRgb32F(pixels)));
    }

    #[test]
    fn byte_image_at_target_size_is_not_preprocessed() {
        let pixels = RgbImage::from_pixel(224, 224, image::Rgb([5, 5, 5]));
        assert!(!is_preprocessed(&DynamicImage::ImageRgb8(pixels)));
    }

    #[test]
    fn preprocessed_input_passes_through_unchanged() {
        let mut pixels = Rgb32FImage::new(224, 224);
        for (x, y, pixel) in pixels.enumerate_pixels_mut() {
            let v = ((x + y) % 255) as f32 / 255.0;
            *pixel = image::Rgb([v, v / 2.0, 1.0 - v]);
        }
        let expected = pixels.clone();
        let (tensor, provenance) =
            normalize_image(DynamicImage::ImageRgb32F(pixels)).unwrap();
        assert_eq!(provenance, PreprocessedOn::Mobile);
        let view = tensor.index_axis(Axis(0), 0);
        for (x, y, pixel) in expected.enumerate_pixels() {
            for channel in 0..3 {
                assert_eq!(view[[y as usize, x as usize, channel]], pixel.0[channel]);
            }
        }
    }
}
