//! Lights ON / OFF photo classifier.
//!
//! A MobileNetV2 backbone with a small binary head, trained in two phases
//! (head only, then the top of the backbone) and served through
//! [`LightDetector`].

pub mod augment;
pub mod config;
pub mod dataset;
pub mod detector;
pub mod error;
pub mod label;
pub mod logging;
pub mod model;
pub mod preprocess;
pub mod train;

pub use config::TrainConfig;
pub use detector::{LightDetector, Prediction};
pub use error::{DetectError, Result};
pub use label::{ClassMap, Label};
pub use train::{Phase, TrainReport, Trainer};
