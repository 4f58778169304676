//! Random geometric augmentation for training images.

use image::{imageops, Rgb, RgbImage};
use imageproc::geometric_transformations::{warp, Interpolation, Projection};
use rand::Rng;

use crate::config::AugmentConfig;

/// One draw of augmentation parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Affine {
    pub angle_deg: f32,
    /// Shift in pixels.
    pub tx: f32,
    pub ty: f32,
    /// Zoom factors; values below 1 zoom in.
    pub zx: f32,
    pub zy: f32,
    pub flip: bool,
}

impl Affine {
    pub fn identity() -> Self {
        Self { angle_deg: 0.0, tx: 0.0, ty: 0.0, zx: 1.0, zy: 1.0, flip: false }
    }

    pub fn sample<R: Rng + ?Sized>(cfg: &AugmentConfig, width: u32, height: u32, rng: &mut R) -> Self {
        let sym = |rng: &mut R, r: f32| if r > 0.0 { rng.gen_range(-r..=r) } else { 0.0 };
        let angle_deg = sym(rng, cfg.rotation_deg);
        let tx = sym(rng, cfg.width_shift) * width as f32;
        let ty = sym(rng, cfg.height_shift) * height as f32;
        let zx = 1.0 + sym(rng, cfg.zoom);
        let zy = 1.0 + sym(rng, cfg.zoom);
        let flip = cfg.horizontal_flip && rng.gen_bool(0.5);
        Self { angle_deg, tx, ty, zx, zy, flip }
    }

    fn is_identity(&self) -> bool {
        self.angle_deg == 0.0 && self.tx == 0.0 && self.ty == 0.0 && self.zx == 1.0 && self.zy == 1.0
    }

    /// Rotation and zoom about the image centre, then the shift.
    fn projection(&self, width: u32, height: u32) -> Projection {
        let (cx, cy) = (width as f32 / 2.0, height as f32 / 2.0);
        Projection::translate(cx + self.tx, cy + self.ty)
            * Projection::rotate(self.angle_deg.to_radians())
            * Projection::scale(1.0 / self.zx, 1.0 / self.zy)
            * Projection::translate(-cx, -cy)
    }

    pub fn apply(&self, img: &RgbImage) -> RgbImage {
        let (w, h) = img.dimensions();
        let mut out = if self.is_identity() {
            img.clone()
        } else {
            warp(img, &self.projection(w, h), Interpolation::Bilinear, Rgb([0, 0, 0]))
        };
        if self.flip {
            imageops::flip_horizontal_in_place(&mut out);
        }
        out
    }
}

/// Applies a freshly drawn transform.
pub fn augment_image<R: Rng + ?Sized>(img: &RgbImage, cfg: &AugmentConfig, rng: &mut R) -> RgbImage {
    let (w, h) = img.dimensions();
    Affine::sample(cfg, w, h, rng).apply(img)
}
