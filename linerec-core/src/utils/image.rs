//! Line image loading and conversion.
//!
//! Models consume single-channel images whose height equals the configured
//! input height. These helpers load images from disk, rescale them to that
//! height and flatten a batch into a `(B, 1, H, W)` buffer.

use crate::core::validation::validate_non_empty;
use crate::core::{RecResult, RecognitionError};
use image::GrayImage;
use image::imageops::FilterType;
use std::path::Path;

/// Loads an image from disk and converts it to grayscale.
pub fn load_line_image(path: &Path) -> RecResult<GrayImage> {
    let img = image::open(path)?;
    Ok(img.to_luma8())
}

/// Loads several images, failing on the first one that cannot be read.
pub fn load_line_images<P: AsRef<Path>>(paths: &[P]) -> RecResult<Vec<GrayImage>> {
    paths
        .iter()
        .map(|p| load_line_image(p.as_ref()))
        .collect()
}

/// Resizes an image to `height` rows, keeping its aspect ratio.
///
/// The width is rounded and never drops below one column.
pub fn resize_to_height(img: &GrayImage, height: u32) -> GrayImage {
    if img.height() == height {
        return img.clone();
    }
    let scale = height as f64 / img.height().max(1) as f64;
    let width = ((img.width() as f64 * scale).round() as u32).max(1);
    image::imageops::resize(img, width, height, FilterType::Triangle)
}

/// Flattens a batch of same-sized grayscale images into a row-major
/// `(B, 1, H, W)` buffer with values in `[0, 1]`.
///
/// # Returns
///
/// The buffer and its shape `[B, 1, H, W]`.
///
/// # Errors
///
/// `InvalidInput` when the batch is empty or the images differ in size.
pub fn gray_to_chw(images: &[GrayImage]) -> RecResult<(Vec<f32>, [usize; 4])> {
    validate_non_empty(images, "images")?;
    let (width, height) = images[0].dimensions();

    let mut data = Vec::with_capacity(images.len() * (width * height) as usize);
    for (i, img) in images.iter().enumerate() {
        if img.dimensions() != (width, height) {
            return Err(RecognitionError::invalid_input(format!(
                "image {} is {}x{}, expected {}x{}",
                i,
                img.width(),
                img.height(),
                width,
                height
            )));
        }
        data.extend(img.as_raw().iter().map(|&p| p as f32 / 255.0));
    }

    Ok((
        data,
        [images.len(), 1, height as usize, width as usize],
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    #[test]
    fn test_gray_to_chw_layout() {
        let mut img = GrayImage::new(3, 2);
        img.put_pixel(2, 1, Luma([255]));
        let (data, shape) = gray_to_chw(&[img.clone(), img]).unwrap();
        assert_eq!(shape, [2, 1, 2, 3]);
        assert_eq!(data.len(), 12);
        // Row-major: last pixel of each image
        assert_eq!(data[5], 1.0);
        assert_eq!(data[11], 1.0);
        assert_eq!(data[0], 0.0);
    }

    #[test]
    fn test_gray_to_chw_rejects_mixed_sizes() {
        let a = GrayImage::new(3, 2);
        let b = GrayImage::new(4, 2);
        assert!(gray_to_chw(&[a, b]).is_err());
        assert!(gray_to_chw(&[]).is_err());
    }

    #[test]
    fn test_resize_to_height_keeps_aspect_ratio() {
        let img = GrayImage::new(112, 56);
        let resized = resize_to_height(&img, 28);
        assert_eq!(resized.dimensions(), (56, 28));
    }

    #[test]
    fn test_load_line_image_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("line.png");
        GrayImage::from_pixel(10, 4, Luma([128])).save(&path).unwrap();
        let loaded = load_line_images(&[&path]).unwrap();
        assert_eq!(loaded[0].dimensions(), (10, 4));
        assert_eq!(loaded[0].get_pixel(3, 3), &Luma([128]));
    }
}
