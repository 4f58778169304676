//! Hyperparameters, paths and the serializable training configuration.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{DetectError, Result};

// =============== HYPERPARAM & PATH ===============
pub const IMG_SIZE: u32 = 224;
pub const BATCH_SIZE: usize = 32;
pub const LEARNING_RATE: f64 = 1e-3;
pub const HEAD_EPOCHS: usize = 20;
pub const FINE_TUNE_EPOCHS: usize = 10;
pub const VALIDATION_SPLIT: f64 = 0.2;

// MobileNetV2 width multiplier
pub const WIDTH_MULT: f64 = 1.0;

// Backbone layers left trainable while fine-tuning
pub const FINE_TUNE_LAYERS: usize = 20;

pub const DEFAULT_DATA_DIR: &str = "data/train";
pub const DEFAULT_MODEL_PATH: &str = "light_detection_model.safetensors";
pub const DEFAULT_PRETRAINED_PATH: &str = "weights/mobilenet_v2_1_0_imagenet.safetensors";
pub const DEFAULT_THRESHOLD: f64 = 0.5;

/// Directory names of the two classes under the training root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassDirs {
    pub lights_on: String,
    pub lights_off: String,
}

impl Default for ClassDirs {
    fn default() -> Self {
        Self {
            lights_on: "lights_on".into(),
            lights_off: "lights_off".into(),
        }
    }
}

/// Online augmentation ranges applied to training images.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AugmentConfig {
    /// Max rotation in degrees, both directions.
    pub rotation_deg: f32,
    /// Max horizontal shift as a fraction of the width.
    pub width_shift: f32,
    /// Max vertical shift as a fraction of the height.
    pub height_shift: f32,
    /// Zoom factor is drawn from `[1 - zoom, 1 + zoom]` per axis.
    pub zoom: f32,
    pub horizontal_flip: bool,
}

impl Default for AugmentConfig {
    fn default() -> Self {
        Self {
            rotation_deg: 20.0,
            width_shift: 0.2,
            height_shift: 0.2,
            zoom: 0.2,
            horizontal_flip: true,
        }
    }
}

/// Early stopping, plateau decay and checkpoint settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallbackConfig {
    pub early_stop_patience: usize,
    pub plateau_patience: usize,
    pub plateau_factor: f64,
    /// Validation-loss drop smaller than this still counts as a plateau.
    pub plateau_min_delta: f64,
    pub min_lr: f64,
}

impl Default for CallbackConfig {
    fn default() -> Self {
        Self {
            early_stop_patience: 5,
            plateau_patience: 3,
            plateau_factor: 0.5,
            plateau_min_delta: 1e-4,
            min_lr: 1e-7,
        }
    }
}

/// Hyperparameters of one training phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseConfig {
    pub epochs: usize,
    pub learning_rate: f64,
    /// `None` keeps the whole backbone frozen; `Some(n)` trains its last `n` layers.
    pub trainable_backbone_layers: Option<usize>,
}

impl PhaseConfig {
    pub fn head_only() -> Self {
        Self {
            epochs: HEAD_EPOCHS,
            learning_rate: LEARNING_RATE,
            trainable_backbone_layers: None,
        }
    }

    pub fn fine_tune() -> Self {
        Self {
            epochs: FINE_TUNE_EPOCHS,
            learning_rate: LEARNING_RATE / 10.0,
            trainable_backbone_layers: Some(FINE_TUNE_LAYERS),
        }
    }
}

/// Everything the training run needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    pub data_dir: PathBuf,
    pub model_path: PathBuf,
    pub pretrained_path: Option<PathBuf>,
    pub img_size: u32,
    pub batch_size: usize,
    pub validation_split: f64,
    pub width_mult: f64,
    pub seed: u64,
    pub classes: ClassDirs,
    pub augment: AugmentConfig,
    pub callbacks: CallbackConfig,
    pub head: PhaseConfig,
    pub fine_tune: PhaseConfig,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            model_path: PathBuf::from(DEFAULT_MODEL_PATH),
            pretrained_path: Some(PathBuf::from(DEFAULT_PRETRAINED_PATH)),
            img_size: IMG_SIZE,
            batch_size: BATCH_SIZE,
            validation_split: VALIDATION_SPLIT,
            width_mult: WIDTH_MULT,
            seed: 42,
            classes: ClassDirs::default(),
            augment: AugmentConfig::default(),
            callbacks: CallbackConfig::default(),
            head: PhaseConfig::head_only(),
            fine_tune: PhaseConfig::fine_tune(),
        }
    }
}

impl TrainConfig {
    /// Reads a JSON config; missing fields take their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        let cfg: TrainConfig = serde_json::from_str(&text)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(DetectError::Config("batch_size must be positive".into()));
        }
        if !(0.0..1.0).contains(&self.validation_split) {
            return Err(DetectError::Config(format!(
                "validation_split must be in [0, 1), got {}",
                self.validation_split
            )));
        }
        if self.classes.lights_on == self.classes.lights_off {
            return Err(DetectError::Config(
                "class directories must have different names".into(),
            ));
        }
        if self.img_size < 32 {
            return Err(DetectError::Config(format!("img_size {} is too small", self.img_size)));
        }
        Ok(())
    }

    /// Path of the best-validation-accuracy checkpoint.
    pub fn best_checkpoint_path(&self) -> PathBuf {
        with_stem_suffix(&self.model_path, "_best")
    }

    pub fn history_path(&self) -> PathBuf {
        self.model_path.with_file_name("training_history.json")
    }

    pub fn chart_path(&self) -> PathBuf {
        self.model_path.with_file_name("training_history.svg")
    }
}

/// `dir/name.ext` -> `dir/name{suffix}.ext`
pub(crate) fn with_stem_suffix(path: &Path, suffix: &str) -> PathBuf {
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("model");
    let name = match path.extension().and_then(|e| e.to_str()) {
        Some(ext) => format!("{stem}{suffix}.{ext}"),
        None => format!("{stem}{suffix}"),
    };
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_training_recipe() {
        let cfg = TrainConfig::default();
        assert_eq!(cfg.head.epochs, 20);
        assert_eq!(cfg.fine_tune.epochs, 10);
        assert!((cfg.fine_tune.learning_rate - cfg.head.learning_rate / 10.0).abs() < 1e-12);
        assert_eq!(cfg.fine_tune.trainable_backbone_layers, Some(20));
        assert_eq!(cfg.head.trainable_backbone_layers, None);
        assert_eq!(cfg.callbacks.early_stop_patience, 5);
        assert_eq!(cfg.callbacks.plateau_patience, 3);
        assert_eq!(cfg.callbacks.plateau_min_delta, 1e-4);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn partial_json_fills_defaults() {
        let cfg: TrainConfig =
            serde_json::from_str(r#"{ "batch_size": 8, "classes": { "lights_on": "on" } }"#).unwrap();
        assert_eq!(cfg.batch_size, 8);
        assert_eq!(cfg.classes.lights_on, "on");
        assert_eq!(cfg.classes.lights_off, "lights_off");
        assert_eq!(cfg.img_size, IMG_SIZE);
    }

    #[test]
    fn rejects_bad_split() {
        let cfg = TrainConfig { validation_split: 1.5, ..Default::default() };
        assert!(matches!(cfg.validate(), Err(DetectError::Config(_))));
    }

    #[test]
    fn best_checkpoint_sits_next_to_model() {
        let cfg = TrainConfig {
            model_path: PathBuf::from("models/light_detection_model.safetensors"),
            ..Default::default()
        };
        assert_eq!(
            cfg.best_checkpoint_path(),
            PathBuf::from("models/light_detection_model_best.safetensors")
        );
        assert_eq!(cfg.history_path(), PathBuf::from("models/training_history.json"));
    }
}
