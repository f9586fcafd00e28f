use std::path::Path;

use burn::tensor::backend::AutodiffBackend;
use image::{imageops::FilterType, DynamicImage};

use crate::data::Cifar10Item;
use crate::dataset::{HEIGHT, IMAGE_SIZE, WIDTH};
use crate::error::{InferenceError, Result};
use crate::session::{Prediction, TrainingSession};

/// Decodes any image file supported by `image`, resized to 32x32 RGB and normalized like a
/// dataset sample.
pub fn load_image<P: AsRef<Path>>(path: P) -> Result<Vec<f32>, InferenceError> {
    let path = path.as_ref();
    let image = image::open(path).map_err(|source| InferenceError::Image {
        path: path.to_path_buf(),
        source,
    })?;

    Ok(Cifar10Item::from_pixels(&image_to_pixels(&image), 0).image)
}

/// Raw channel-first bytes: the red plane, then green, then blue.
pub fn image_to_pixels(image: &DynamicImage) -> Vec<u8> {
    let rgb = image
        .resize_exact(WIDTH as u32, HEIGHT as u32, FilterType::Triangle)
        .to_rgb8();

    let mut pixels = vec![0u8; IMAGE_SIZE];
    let plane = WIDTH * HEIGHT;
    for (x, y, pixel) in rgb.enumerate_pixels() {
        let offset = y as usize * WIDTH + x as usize;
        for channel in 0..3 {
            pixels[channel * plane + offset] = pixel.0[channel];
        }
    }
    pixels
}

/// Loads the session saved in `artifact_dir` and classifies the image at `image_path`.
pub fn infer<B: AutodiffBackend, P: AsRef<Path>, Q: AsRef<Path>>(
    artifact_dir: P,
    image_path: Q,
    device: B::Device,
) -> Result<Prediction> {
    let session = TrainingSession::<B>::load(artifact_dir, device)?;
    let image = load_image(image_path.as_ref())?;
    let prediction = session.predict(&image)?;

    log::info!(
        "Predicted {} ({:.1}%) for {}",
        prediction.class_name,
        100.0 * prediction.probabilities[prediction.class_index],
        image_path.as_ref().display()
    );

    Ok(prediction)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    #[test]
    fn image_is_resized_and_laid_out_channel_first() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("red.png");
        RgbImage::from_pixel(64, 48, Rgb([255, 0, 51])).save(&path).unwrap();

        let image = load_image(&path).unwrap();

        assert_eq!(image.len(), IMAGE_SIZE);
        let plane = WIDTH * HEIGHT;
        assert!(image[..plane].iter().all(|&v| v == 1.0));
        assert!(image[plane..2 * plane].iter().all(|&v| v == 0.0));
        assert!(image[2 * plane..].iter().all(|&v| v == 51.0 / 255.0));
    }

    #[test]
    fn unreadable_image_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.png");
        std::fs::write(&path, b"not an image").unwrap();

        let err = load_image(&path).unwrap_err();

        assert!(matches!(err, InferenceError::Image { .. }));
    }

    #[test]
    fn saved_model_classifies_an_image_file() {
        use crate::{config::TrainingConfig, TestAutodiffBackend};

        let dir = tempfile::tempdir().unwrap();
        let image_path = dir.path().join("upload.png");
        RgbImage::from_pixel(32, 32, Rgb([10, 120, 200]))
            .save(&image_path)
            .unwrap();
        TrainingSession::<TestAutodiffBackend>::new(TrainingConfig::default(), Default::default())
            .unwrap()
            .save(dir.path().join("artifacts"))
            .unwrap();

        let prediction = infer::<TestAutodiffBackend, _, _>(
            dir.path().join("artifacts"),
            &image_path,
            Default::default(),
        )
        .unwrap();

        assert!(prediction.class_index < 10);
    }
}
