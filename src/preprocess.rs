//! Image file -> model input tensor.
//!
//! Tensors are channel-last `(N, H, W, 3)` with raw pixel values in
//! `[0, 255]`; rescaling happens inside the model graph.

use std::path::Path;

use image::{imageops::FilterType, DynamicImage, RgbImage};
use tch::{Kind, Tensor};
use tracing::warn;

use crate::config::IMG_SIZE;

/// Decodes `path` and stretches it to `size`×`size` RGB.
///
/// Grayscale is promoted and alpha dropped by the RGB conversion.
/// Returns `None` (after logging) if the file cannot be decoded.
pub fn decode_rgb(path: &Path, size: u32) -> Option<RgbImage> {
    match image::open(path) {
        Ok(img) => Some(resize_rgb(img, size)),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to load image");
            None
        }
    }
}

pub fn resize_rgb(img: DynamicImage, size: u32) -> RgbImage {
    img.resize_exact(size, size, FilterType::Triangle).to_rgb8()
}

/// `(N, H, W, 3)` float tensor from equally sized RGB images.
///
/// # Panics
/// If `images` is empty or the images differ in size.
pub fn stack_images(images: &[RgbImage]) -> Tensor {
    let (w, h) = images[0].dimensions();
    let mut raw = Vec::with_capacity(images.len() * (w * h * 3) as usize);
    for img in images {
        assert_eq!(img.dimensions(), (w, h), "images in a batch must share one size");
        raw.extend_from_slice(img.as_raw());
    }
    Tensor::from_slice(&raw)
        .reshape([images.len() as i64, h as i64, w as i64, 3])
        .to_kind(Kind::Float)
}

/// Single-image inference input of shape `(1, 224, 224, 3)`.
pub fn load_image(path: &Path) -> Option<Tensor> {
    load_image_sized(path, IMG_SIZE)
}

pub fn load_image_sized(path: &Path, size: u32) -> Option<Tensor> {
    let img = decode_rgb(path, size)?;
    Some(stack_images(std::slice::from_ref(&img)))
}
