//! Training directory layout, validation and loading.

use std::fs;
use std::path::{Path, PathBuf};

use image::RgbImage;
use rayon::prelude::*;
use tracing::{info, warn};

use crate::config::ClassDirs;
use crate::error::{DetectError, Result};
use crate::label::{ClassMap, Label};
use crate::preprocess::decode_rgb;

pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp", "gif"];

// Soft thresholds on the total image count
const MIN_READY: usize = 20;
const LIMITED: usize = 50;
const DECENT: usize = 100;
const MAX_BALANCE_RATIO: f64 = 3.0;

pub fn is_image_file(path: &Path) -> bool {
    path.is_file()
        && path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
            .unwrap_or(false)
}

/// Image files directly inside `dir`, sorted by path.
pub fn list_images(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut paths: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| is_image_file(p))
        .collect();
    paths.sort();
    Ok(paths)
}

/// Creates `root/<lights_on>` and `root/<lights_off>`.
pub fn create_layout(root: &Path, classes: &ClassDirs) -> Result<[PathBuf; 2]> {
    let on = root.join(&classes.lights_on);
    let off = root.join(&classes.lights_off);
    fs::create_dir_all(&on)?;
    fs::create_dir_all(&off)?;
    info!(on = %on.display(), off = %off.display(), "created dataset layout");
    Ok([on, off])
}

/// How much data there is, on the soft scale used before training.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Empty,
    VeryFew,
    Limited,
    Decent,
    Plenty,
}

impl Verdict {
    pub fn for_total(total: usize) -> Self {
        match total {
            0 => Verdict::Empty,
            n if n < MIN_READY => Verdict::VeryFew,
            n if n < LIMITED => Verdict::Limited,
            n if n < DECENT => Verdict::Decent,
            _ => Verdict::Plenty,
        }
    }

    pub fn advice(self) -> &'static str {
        match self {
            Verdict::Empty => "no images found; add images to both class folders",
            Verdict::VeryFew => "very few images (< 20); aim for 50-100 per class",
            Verdict::Limited => "limited images (< 50); more images will improve accuracy",
            Verdict::Decent => "decent amount of images; training can proceed",
            Verdict::Plenty => "plenty of images; dataset looks ready",
        }
    }
}

/// Per-class image inventory of a training directory.
#[derive(Debug, Clone)]
pub struct DatasetReport {
    pub root: PathBuf,
    pub on_dir: PathBuf,
    pub off_dir: PathBuf,
    pub on: Vec<PathBuf>,
    pub off: Vec<PathBuf>,
}

impl DatasetReport {
    /// Fails if the root or a class directory is missing; empty classes are
    /// reported, not rejected (see [`DatasetReport::require_trainable`]).
    pub fn scan(root: &Path, classes: &ClassDirs) -> Result<Self> {
        if !root.is_dir() {
            return Err(DetectError::DataDirMissing(root.to_path_buf()));
        }
        let on_dir = root.join(&classes.lights_on);
        let off_dir = root.join(&classes.lights_off);
        for dir in [&on_dir, &off_dir] {
            if !dir.is_dir() {
                return Err(DetectError::ClassDirMissing(dir.clone()));
            }
        }
        Ok(Self {
            root: root.to_path_buf(),
            on: list_images(&on_dir)?,
            off: list_images(&off_dir)?,
            on_dir,
            off_dir,
        })
    }

    pub fn total(&self) -> usize {
        self.on.len() + self.off.len()
    }

    pub fn verdict(&self) -> Verdict {
        Verdict::for_total(self.total())
    }

    /// larger / smaller class count; `None` while a class is empty.
    pub fn balance_ratio(&self) -> Option<f64> {
        let (a, b) = (self.on.len(), self.off.len());
        if a == 0 || b == 0 {
            return None;
        }
        Some(a.max(b) as f64 / a.min(b) as f64)
    }

    pub fn is_balanced(&self) -> bool {
        self.balance_ratio().map_or(false, |r| r <= MAX_BALANCE_RATIO)
    }

    pub fn is_ready(&self) -> bool {
        self.total() >= MIN_READY && !self.on.is_empty() && !self.off.is_empty()
    }

    /// Hard precondition for training: both classes hold at least one image.
    pub fn require_trainable(&self) -> Result<()> {
        if self.off.is_empty() {
            return Err(DetectError::EmptyClass(self.off_dir.clone()));
        }
        if self.on.is_empty() {
            return Err(DetectError::EmptyClass(self.on_dir.clone()));
        }
        Ok(())
    }

    /// Logs the soft warnings about size and balance.
    pub fn log_warnings(&self) {
        let verdict = self.verdict();
        match verdict {
            Verdict::Empty | Verdict::VeryFew | Verdict::Limited => {
                warn!(total = self.total(), "{}", verdict.advice())
            }
            _ => info!(total = self.total(), "{}", verdict.advice()),
        }
        if let Some(ratio) = self.balance_ratio() {
            if ratio > MAX_BALANCE_RATIO {
                warn!("unbalanced dataset, ratio {ratio:.1}:1; try roughly equal class sizes");
            }
        }
    }

    /// File names of the first `n` images of each class (on, off).
    pub fn samples(&self, n: usize) -> (Vec<String>, Vec<String>) {
        let names = |v: &[PathBuf]| {
            v.iter()
                .take(n)
                .filter_map(|p| p.file_name().and_then(|s| s.to_str()).map(str::to_string))
                .collect()
        };
        (names(&self.on), names(&self.off))
    }

    /// Deterministic per-class split: the last `floor(n · fraction)` files of
    /// each class (sorted by name) go to validation.
    pub fn split(&self, class_map: &ClassMap, fraction: f64) -> Split {
        let mut split = Split::default();
        for (label, files) in [(Label::LightsOff, &self.off), (Label::LightsOn, &self.on)] {
            let target = class_map.target(label);
            let n_val = (files.len() as f64 * fraction).floor() as usize;
            let n_train = files.len() - n_val.min(files.len());
            for (i, path) in files.iter().enumerate() {
                let sample = Sample { path: path.clone(), target };
                if i < n_train {
                    split.train.push(sample);
                } else {
                    split.valid.push(sample);
                }
            }
        }
        split
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub path: PathBuf,
    pub target: f32,
}

#[derive(Debug, Clone, Default)]
pub struct Split {
    pub train: Vec<Sample>,
    pub valid: Vec<Sample>,
}

/// Samples decoded and resized once, kept in memory for every epoch.
pub struct LoadedSet {
    pub images: Vec<RgbImage>,
    pub targets: Vec<f32>,
}

impl LoadedSet {
    /// Decodes in parallel; undecodable files are dropped with a warning.
    pub fn load(samples: &[Sample], size: u32) -> Self {
        let results: Vec<(RgbImage, f32)> = samples
            .par_iter()
            .filter_map(|s| decode_rgb(&s.path, size).map(|img| (img, s.target)))
            .collect();
        let (images, targets) = results.into_iter().unzip();
        Self { images, targets }
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    pub fn count_target(&self, target: f32) -> usize {
        self.targets.iter().filter(|&&t| t == target).count()
    }
}
