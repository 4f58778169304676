//! Subcommands and their flags.

use std::path::PathBuf;

use clap::{Args, Subcommand};

use light_detect::config::{DEFAULT_DATA_DIR, DEFAULT_MODEL_PATH, DEFAULT_THRESHOLD};
use light_detect::TrainConfig;

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Train the classifier on data/train/{lights_on,lights_off}
    Train(TrainArgs),

    /// Classify one image, or every image in a directory with --batch
    Predict(PredictArgs),

    /// Create or check the training directory layout
    Prepare(PrepareArgs),
}

#[derive(Args, Debug)]
pub struct TrainArgs {
    /// Directory holding one sub-directory per class
    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    /// Where the final model is written
    #[arg(long)]
    pub model: Option<PathBuf>,

    /// JSON file with a full or partial training configuration
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// ImageNet MobileNetV2 weights (safetensors)
    #[arg(long)]
    pub pretrained: Option<PathBuf>,

    /// Epochs with the backbone frozen
    #[arg(long)]
    pub epochs_head: Option<usize>,

    /// Epochs with the top of the backbone unfrozen
    #[arg(long)]
    pub epochs_fine: Option<usize>,

    #[arg(long)]
    pub batch_size: Option<usize>,

    #[arg(long)]
    pub seed: Option<u64>,
}

impl TrainArgs {
    /// Flags override whatever the config file (or the defaults) set.
    pub fn apply(self, mut cfg: TrainConfig) -> TrainConfig {
        if let Some(v) = self.data_dir {
            cfg.data_dir = v;
        }
        if let Some(v) = self.model {
            cfg.model_path = v;
        }
        if let Some(v) = self.pretrained {
            cfg.pretrained_path = Some(v);
        }
        if let Some(v) = self.epochs_head {
            cfg.head.epochs = v;
        }
        if let Some(v) = self.epochs_fine {
            cfg.fine_tune.epochs = v;
        }
        if let Some(v) = self.batch_size {
            cfg.batch_size = v;
        }
        if let Some(v) = self.seed {
            cfg.seed = v;
        }
        cfg
    }
}

#[derive(Args, Debug)]
pub struct PredictArgs {
    /// Image file, or a directory together with --batch
    pub path: PathBuf,

    #[arg(long, default_value = DEFAULT_MODEL_PATH)]
    pub model: PathBuf,

    /// Scores at or above this are LIGHTS ON
    #[arg(long, default_value_t = DEFAULT_THRESHOLD)]
    pub threshold: f64,

    /// Predict every image in the directory
    #[arg(long)]
    pub batch: bool,

    /// Print predictions as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug)]
#[group(required = true, multiple = false)]
pub struct PrepareArgs {
    /// Create the class directories
    #[arg(long)]
    pub create: bool,

    /// Count images and report whether training can start
    #[arg(long)]
    pub validate: bool,

    #[arg(long, default_value = DEFAULT_DATA_DIR)]
    pub data_dir: PathBuf,
}
