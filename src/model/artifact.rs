//! On-disk model: safetensors weights plus a JSON manifest with the same stem.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tch::nn;
use tracing::info;

use crate::config::{IMG_SIZE, WIDTH_MULT};
use crate::error::{DetectError, Result};
use crate::label::ClassMap;

const MANIFEST_VERSION: u32 = 1;

/// Everything needed to rebuild the network before loading its weights.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelManifest {
    pub version: u32,
    pub img_size: u32,
    pub width_mult: f64,
    pub class_map: ClassMap,
}

impl Default for ModelManifest {
    fn default() -> Self {
        Self {
            version: MANIFEST_VERSION,
            img_size: IMG_SIZE,
            width_mult: WIDTH_MULT,
            class_map: ClassMap::default(),
        }
    }
}

impl ModelManifest {
    pub fn new(img_size: u32, width_mult: f64, class_map: ClassMap) -> Self {
        Self { version: MANIFEST_VERSION, img_size, width_mult, class_map }
    }

    /// `light_detection_model.safetensors` -> `light_detection_model.json`
    pub fn path_for(weights: &Path) -> PathBuf {
        weights.with_extension("json")
    }

    /// `Ok(None)` if there is no manifest next to `weights`.
    pub fn read_for(weights: &Path) -> Result<Option<Self>> {
        let path = Self::path_for(weights);
        if !path.exists() {
            return Ok(None);
        }
        let manifest: ModelManifest = serde_json::from_str(&fs::read_to_string(&path)?)
            .map_err(|e| DetectError::Manifest { path: path.clone(), reason: e.to_string() })?;
        manifest.check(&path)?;
        Ok(Some(manifest))
    }

    fn check(&self, path: &Path) -> Result<()> {
        let reason = if self.version > MANIFEST_VERSION {
            format!("unsupported version {}", self.version)
        } else if !self.class_map.is_consistent() {
            "both outputs map to the same label".to_string()
        } else if self.img_size == 0 || self.width_mult <= 0.0 {
            "invalid input size or width multiplier".to_string()
        } else {
            return Ok(());
        };
        Err(DetectError::Manifest { path: path.to_path_buf(), reason })
    }

    pub fn write_for(&self, weights: &Path) -> Result<()> {
        fs::write(Self::path_for(weights), serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

/// Writes weights and manifest, creating the parent directory.
pub fn save_model(vs: &nn::VarStore, path: &Path, manifest: &ModelManifest) -> Result<()> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        fs::create_dir_all(dir)?;
    }
    vs.save(path)?;
    manifest.write_for(path)?;
    info!(path = %path.display(), "model saved");
    Ok(())
}
