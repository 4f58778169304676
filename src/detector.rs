//! Loads a trained model once and classifies image files with it.

use std::path::{Path, PathBuf};

use serde::Serialize;
use tch::{nn, Device};
use tracing::{info, warn};

use crate::error::{DetectError, Result};
use crate::label::{ClassMap, Decision, Label};
use crate::model::artifact::ModelManifest;
use crate::model::LightNet;
use crate::preprocess::load_image_sized;

/// Outcome for one image.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Prediction {
    pub label: Label,
    /// Percentage in `[0, 100]`.
    pub confidence: f64,
    /// Probability of lights being on, `[0, 1]`.
    pub raw_score: f64,
    pub image_path: PathBuf,
}

impl Prediction {
    pub fn from_score(image_path: &Path, raw_score: f64, threshold: f64) -> Self {
        let Decision { label, confidence } = Decision::from_score(raw_score, threshold);
        Self { label, confidence, raw_score, image_path: image_path.to_path_buf() }
    }
}

/// A loaded classifier, read-only after [`LightDetector::load`].
///
/// `Send` but not `Sync`: the network holds boxed tch modules. Move it into
/// one worker, or wrap it in a `Mutex` (or load one per worker) when several
/// threads predict.
pub struct LightDetector {
    // keeps the weights alive for `net`
    _vs: nn::VarStore,
    net: LightNet,
    manifest: ModelManifest,
    device: Device,
}

impl LightDetector {
    pub fn load(model_path: impl AsRef<Path>) -> Result<Self> {
        Self::load_on(model_path, Device::cuda_if_available())
    }

    pub fn load_on(model_path: impl AsRef<Path>, device: Device) -> Result<Self> {
        let path = model_path.as_ref();
        if !path.is_file() {
            return Err(DetectError::ModelNotFound(path.to_path_buf()));
        }
        let manifest = match ModelManifest::read_for(path)? {
            Some(m) => m,
            None => {
                warn!(
                    manifest = %ModelManifest::path_for(path).display(),
                    "no manifest found, assuming lights_off=0 / lights_on=1"
                );
                ModelManifest::default()
            }
        };

        let mut vs = nn::VarStore::new(device);
        let net = LightNet::new(&vs.root(), manifest.width_mult);
        vs.load(path)?;
        vs.freeze();
        info!(path = %path.display(), ?device, "model loaded");

        Ok(Self { _vs: vs, net, manifest, device })
    }

    pub fn class_map(&self) -> &ClassMap {
        &self.manifest.class_map
    }

    /// `None` if the image cannot be read or decoded.
    pub fn predict(&self, image_path: impl AsRef<Path>, threshold: f64) -> Option<Prediction> {
        let path = image_path.as_ref();
        let xs = load_image_sized(path, self.manifest.img_size)?.to_device(self.device);
        let output = tch::no_grad(|| self.net.probabilities(&xs)).double_value(&[0, 0]);
        let score = self.class_map().lights_on_score(output);
        Some(Prediction::from_score(path, score, threshold))
    }

    /// Predicts each path on its own; unreadable images are left out and
    /// the rest keep their input order.
    pub fn predict_batch<P: AsRef<Path>>(&self, image_paths: &[P], threshold: f64) -> Vec<Prediction> {
        image_paths
            .iter()
            .filter_map(|p| self.predict(p, threshold))
            .collect()
    }
}
