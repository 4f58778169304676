//! Two-phase transfer-learning run: head only, then partial fine-tuning.

pub mod callbacks;
pub mod chart;
pub mod metrics;

use std::fs;
use std::path::PathBuf;
use std::time::Instant;

use indicatif::{ProgressBar, ProgressStyle};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use tch::{nn, nn::ModuleT, nn::OptimizerConfig, Device, Reduction, Tensor};
use tracing::{info, warn};

use crate::augment::augment_image;
use crate::config::{CallbackConfig, PhaseConfig, TrainConfig};
use crate::dataset::{DatasetReport, LoadedSet};
use crate::error::{DetectError, Result};
use crate::label::{ClassMap, Label};
use crate::model::artifact::{save_model, ModelManifest};
use crate::model::{pretrained, set_trainable_backbone, LightNet, WeightSnapshot};
use crate::preprocess::stack_images;

use callbacks::{BestCheckpoint, EarlyStopping, Monitor, ReduceLrOnPlateau};
use metrics::{BinaryCounts, EpochMetrics, EpochRecord, History};

/// Training state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    HeadOnly,
    FineTune,
    Done,
}

impl Phase {
    pub fn next(self) -> Phase {
        match self {
            Phase::HeadOnly => Phase::FineTune,
            Phase::FineTune | Phase::Done => Phase::Done,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Phase::HeadOnly => "head_only",
            Phase::FineTune => "fine_tune",
            Phase::Done => "done",
        }
    }

    /// Hyperparameters of this phase; `None` once done.
    pub fn config(self, cfg: &TrainConfig) -> Option<&PhaseConfig> {
        match self {
            Phase::HeadOnly => Some(&cfg.head),
            Phase::FineTune => Some(&cfg.fine_tune),
            Phase::Done => None,
        }
    }
}

/// What a finished run produced.
#[derive(Debug, Clone)]
pub struct TrainReport {
    pub model_path: PathBuf,
    pub best_checkpoint: Option<PathBuf>,
    pub best_val_accuracy: Option<f64>,
    pub final_valid: EpochMetrics,
    pub history: History,
}

pub struct Trainer {
    cfg: TrainConfig,
    device: Device,
}

impl Trainer {
    pub fn new(cfg: TrainConfig) -> Result<Self> {
        cfg.validate()?;
        Ok(Self { cfg, device: Device::cuda_if_available() })
    }

    pub fn with_device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    pub fn run(&self) -> Result<TrainReport> {
        let cfg = &self.cfg;
        let start_time = Instant::now();

        // preconditions before any model is built
        let report = DatasetReport::scan(&cfg.data_dir, &cfg.classes)?;
        report.require_trainable()?;
        report.log_warnings();

        tch::set_num_threads(num_cpus::get() as i32);
        tch::manual_seed(cfg.seed as i64);
        let mut rng = StdRng::seed_from_u64(cfg.seed);

        let class_map = ClassMap::from_dirs(&cfg.classes);
        let split = report.split(&class_map, cfg.validation_split);
        let train_set = LoadedSet::load(&split.train, cfg.img_size);
        let mut valid_set = LoadedSet::load(&split.valid, cfg.img_size);
        // decode failures can still leave a class without training images
        for (label, dir) in [(Label::LightsOn, &report.on_dir), (Label::LightsOff, &report.off_dir)] {
            if train_set.count_target(class_map.target(label)) == 0 {
                return Err(DetectError::EmptyClass(dir.clone()));
            }
        }
        if valid_set.is_empty() {
            warn!("validation split is empty, validating on the training images");
            valid_set = LoadedSet { images: train_set.images.clone(), targets: train_set.targets.clone() };
        }
        info!(
            train = train_set.len(),
            valid = valid_set.len(),
            device = ?self.device,
            "dataset loaded"
        );

        let vs = nn::VarStore::new(self.device);
        let net = LightNet::new(&vs.root(), cfg.width_mult);
        self.load_pretrained(&vs);

        let manifest = ModelManifest::new(cfg.img_size, cfg.width_mult, class_map);
        let mut run = Run {
            cfg,
            vs: &vs,
            net: &net,
            manifest: &manifest,
            device: self.device,
            checkpoint: BestCheckpoint::default(),
            history: History::default(),
            saved_best: false,
        };

        let mut phase = Phase::HeadOnly;
        while let Some(phase_cfg) = phase.config(cfg) {
            run.phase(phase, phase_cfg, &train_set, &valid_set, &mut rng)?;
            phase = phase.next();
        }

        save_model(&vs, &cfg.model_path, &manifest)?;
        let final_valid = evaluate(&net, &valid_set, cfg.batch_size, self.device);

        if let Some(dir) = cfg.history_path().parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)?;
        }
        fs::write(cfg.history_path(), serde_json::to_string_pretty(&run.history)?)?;
        chart::write_svg(&run.history, &cfg.chart_path())?;

        info!(
            val_acc = format!("{:.2}%", final_valid.accuracy * 100.0),
            elapsed = format!("{:.1}s", start_time.elapsed().as_secs_f64()),
            "training complete"
        );

        Ok(TrainReport {
            model_path: cfg.model_path.clone(),
            best_checkpoint: run.saved_best.then(|| cfg.best_checkpoint_path()),
            best_val_accuracy: run.checkpoint.best(),
            final_valid,
            history: run.history,
        })
    }

    fn load_pretrained(&self, vs: &nn::VarStore) {
        let Some(path) = &self.cfg.pretrained_path else {
            warn!("no pretrained weights configured, backbone starts from random init");
            return;
        };
        if !path.exists() {
            warn!(path = %path.display(), "pretrained file not found, backbone starts from random init");
            return;
        }
        match pretrained::load_backbone_weights(vs, self.cfg.width_mult, path) {
            Ok(copied) => info!(copied, path = %path.display(), "loaded pretrained backbone"),
            Err(e) => warn!("pretrained load failed: {e}"),
        }
    }
}

/// Mutable state shared by both phases.
struct Run<'a> {
    cfg: &'a TrainConfig,
    vs: &'a nn::VarStore,
    net: &'a LightNet,
    manifest: &'a ModelManifest,
    device: Device,
    checkpoint: BestCheckpoint,
    history: History,
    saved_best: bool,
}

impl Run<'_> {
    fn phase(
        &mut self,
        phase: Phase,
        phase_cfg: &PhaseConfig,
        train: &LoadedSet,
        valid: &LoadedSet,
        rng: &mut StdRng,
    ) -> Result<()> {
        let cfg = self.cfg;
        let frozen = set_trainable_backbone(self.vs, self.net.backbone_layers(), phase_cfg.trainable_backbone_layers);
        info!(
            phase = phase.name(),
            epochs = phase_cfg.epochs,
            lr = phase_cfg.learning_rate,
            trainable_backbone = frozen.trainable_backbone,
            frozen_backbone = frozen.frozen_backbone,
            "starting phase"
        );

        let mut opt = nn::Adam::default().build(self.vs, phase_cfg.learning_rate)?;
        let mut callbacks = PhaseCallbacks::new(&cfg.callbacks, phase_cfg.learning_rate);

        let epoch_pb = ProgressBar::new(phase_cfg.epochs as u64);
        epoch_pb.set_style(
            ProgressStyle::with_template(" {spinner:.yellow} [{prefix} {pos}/{len}] {wide_msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏"),
        );
        epoch_pb.set_prefix(phase.name());

        for epoch in 1..=phase_cfg.epochs {
            let train_metrics = self.train_epoch(&mut opt, train, rng, epoch)?;
            let valid_metrics = evaluate(self.net, valid, cfg.batch_size, self.device);

            epoch_pb.set_message(format!(
                "loss {:.4} • acc {:.2}% • val_loss {:.4} • val_acc {:.2}%",
                train_metrics.loss,
                train_metrics.accuracy * 100.0,
                valid_metrics.loss,
                valid_metrics.accuracy * 100.0
            ));
            epoch_pb.inc(1);
            self.history.push(EpochRecord {
                phase: phase.name().to_string(),
                epoch,
                learning_rate: callbacks.lr(),
                train: train_metrics,
                valid: valid_metrics,
            });

            if self.checkpoint.improved(valid_metrics.accuracy) {
                save_model(self.vs, &cfg.best_checkpoint_path(), self.manifest)?;
                self.saved_best = true;
                epoch_pb.println(format!(
                    "Saved best model (val acc: {:.2}%)",
                    valid_metrics.accuracy * 100.0
                ));
            }

            if callbacks.after_epoch(self.vs, &mut opt, epoch, valid_metrics.loss) {
                info!(phase = phase.name(), epoch, "early stopping");
                break;
            }
        }
        epoch_pb.finish_with_message(format!("{} done", phase.name()));
        Ok(())
    }

    fn train_epoch(
        &self,
        opt: &mut nn::Optimizer,
        set: &LoadedSet,
        rng: &mut StdRng,
        epoch: usize,
    ) -> Result<EpochMetrics> {
        let cfg = self.cfg;
        let mut indices: Vec<usize> = (0..set.len()).collect();
        indices.shuffle(rng);

        let batch_pb = ProgressBar::new(indices.len() as u64);
        batch_pb.set_style(
            ProgressStyle::with_template(
                "  [ep {prefix}] {elapsed_precise} │{bar:48.magenta/blue}│ {percent:>3}% {pos}/{len} • eta {eta_precise} • {msg}",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("█▓░"),
        );
        batch_pb.set_prefix(epoch.to_string());

        let mut counts = BinaryCounts::default();
        for chunk in indices.chunks(cfg.batch_size) {
            // one seed per sample keeps the parallel augmentation reproducible
            let seeds: Vec<u64> = chunk.iter().map(|_| rng.gen()).collect();
            let images: Vec<_> = chunk
                .par_iter()
                .zip(seeds.par_iter())
                .map(|(&i, &seed)| {
                    let mut local = StdRng::seed_from_u64(seed);
                    augment_image(&set.images[i], &cfg.augment, &mut local)
                })
                .collect();
            let targets: Vec<f32> = chunk.iter().map(|&i| set.targets[i]).collect();

            let xs = stack_images(&images).to_device(self.device);
            let ys = Tensor::from_slice(&targets).view([-1, 1]).to_device(self.device);

            let logits = self.net.forward_t(&xs, true);
            let loss = bce_loss(&logits, &ys);
            opt.backward_step(&loss);

            let probs: Vec<f32> = Vec::try_from(logits.detach().sigmoid().flatten(0, -1).to_device(Device::Cpu))?;
            counts.update(&probs, &targets, loss.double_value(&[]));

            batch_pb.set_message(format!(
                "loss {:.4} • acc {:.2}%",
                counts.loss(),
                counts.accuracy() * 100.0
            ));
            batch_pb.inc(chunk.len() as u64);
        }
        batch_pb.finish_and_clear();
        Ok(counts.summary())
    }
}

/// Early stopping and plateau decay of one phase, applied to the var store
/// and optimizer after each epoch.
struct PhaseCallbacks {
    early: EarlyStopping,
    plateau: ReduceLrOnPlateau,
    best_weights: Option<WeightSnapshot>,
    lr: f64,
}

impl PhaseCallbacks {
    fn new(cfg: &CallbackConfig, lr: f64) -> Self {
        Self {
            early: EarlyStopping::new(cfg.early_stop_patience),
            plateau: ReduceLrOnPlateau::new(
                cfg.plateau_patience,
                cfg.plateau_factor,
                cfg.min_lr,
                cfg.plateau_min_delta,
            ),
            best_weights: None,
            lr,
        }
    }

    fn lr(&self) -> f64 {
        self.lr
    }

    /// True when the phase must stop; the best weights are back in `vs` by then.
    fn after_epoch(&mut self, vs: &nn::VarStore, opt: &mut nn::Optimizer, epoch: usize, val_loss: f64) -> bool {
        match self.early.update(epoch, val_loss) {
            Monitor::Improved => self.best_weights = Some(WeightSnapshot::capture(vs)),
            Monitor::Waiting => {}
            Monitor::Stop => {
                if let Some(snapshot) = &self.best_weights {
                    snapshot.restore(vs);
                }
                info!(best_epoch = ?self.early.best_epoch(), "restored best weights");
                return true;
            }
        }
        if let Some(new_lr) = self.plateau.update(val_loss, self.lr) {
            info!(from = self.lr, to = new_lr, "reducing learning rate");
            self.lr = new_lr;
            opt.set_lr(new_lr);
        }
        false
    }
}

fn bce_loss(logits: &Tensor, targets: &Tensor) -> Tensor {
    logits.binary_cross_entropy_with_logits::<Tensor>(targets, None, None, Reduction::Mean)
}

/// Loss, accuracy, precision and recall without augmentation or dropout.
pub fn evaluate(net: &LightNet, set: &LoadedSet, batch_size: usize, device: Device) -> EpochMetrics {
    let mut counts = BinaryCounts::default();
    tch::no_grad(|| {
        for chunk in (0..set.len()).collect::<Vec<_>>().chunks(batch_size) {
            let images: Vec<_> = chunk.iter().map(|&i| set.images[i].clone()).collect();
            let targets: Vec<f32> = chunk.iter().map(|&i| set.targets[i]).collect();
            let xs = stack_images(&images).to_device(device);
            let ys = Tensor::from_slice(&targets).view([-1, 1]).to_device(device);

            let logits = net.forward_t(&xs, false);
            let loss = bce_loss(&logits, &ys).double_value(&[]);
            let probs: Vec<f32> = logits
                .sigmoid()
                .flatten(0, -1)
                .to_device(Device::Cpu)
                .try_into()
                .unwrap_or_default();
            counts.update(&probs, &targets, loss);
        }
    });
    counts.summary()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::Kind;

    #[test]
    fn phases_run_in_order() {
        let cfg = TrainConfig::default();
        let mut seen = Vec::new();
        let mut phase = Phase::HeadOnly;
        while let Some(p) = phase.config(&cfg) {
            seen.push((phase, p.epochs, p.trainable_backbone_layers));
            phase = phase.next();
        }
        assert_eq!(
            seen,
            vec![(Phase::HeadOnly, 20, None), (Phase::FineTune, 10, Some(20))]
        );
        assert_eq!(Phase::Done.next(), Phase::Done);
    }

    fn callbacks(early: usize, plateau: usize, lr: f64) -> PhaseCallbacks {
        let cfg = CallbackConfig {
            early_stop_patience: early,
            plateau_patience: plateau,
            ..CallbackConfig::default()
        };
        PhaseCallbacks::new(&cfg, lr)
    }

    #[test]
    fn early_stop_restores_best_epoch_weights() {
        let vs = nn::VarStore::new(Device::Cpu);
        let w = vs.root().zeros("w", &[3]);
        let mut opt = nn::Adam::default().build(&vs, 1e-3).unwrap();
        let mut cb = callbacks(2, 10, 1e-3);

        let _ = tch::no_grad(|| w.shallow_clone().fill_(1.0));
        assert!(!cb.after_epoch(&vs, &mut opt, 1, 0.4));
        let _ = tch::no_grad(|| w.shallow_clone().fill_(2.0));
        assert!(!cb.after_epoch(&vs, &mut opt, 2, 0.5));
        let _ = tch::no_grad(|| w.shallow_clone().fill_(3.0));
        assert!(cb.after_epoch(&vs, &mut opt, 3, 0.6));

        assert_eq!(Vec::<f32>::try_from(w.detach()).unwrap(), vec![1.0, 1.0, 1.0]);
    }

    #[test]
    fn plateau_reaches_the_optimizer() {
        let vs = nn::VarStore::new(Device::Cpu);
        let w = vs.root().zeros("w", &[1]);
        let mut opt = nn::Adam::default().build(&vs, 1.0).unwrap();
        let mut cb = callbacks(10, 1, 1.0);

        assert!(!cb.after_epoch(&vs, &mut opt, 1, 0.5));
        assert_eq!(cb.lr(), 1.0);
        assert!(!cb.after_epoch(&vs, &mut opt, 2, 0.5));
        assert_eq!(cb.lr(), 0.5);

        // Adam's first step moves each weight by exactly the learning rate
        opt.backward_step(&w.sum(Kind::Float));
        let moved = w.double_value(&[0]);
        assert!((moved + 0.5).abs() < 1e-4, "moved by {moved}");
    }

    #[test]
    fn bce_matches_closed_form() {
        let logits = Tensor::from_slice(&[0f32, 2.0]).view([-1, 1]);
        let ys = Tensor::from_slice(&[1f32, 0.0]).view([-1, 1]);
        let got = bce_loss(&logits, &ys).double_value(&[]);
        let p1 = 0.5f64;
        let p2 = 1.0 / (1.0 + (-2.0f64).exp());
        let want = (-(p1.ln()) - (1.0 - p2).ln()) / 2.0;
        assert!((got - want).abs() < 1e-5, "{got} vs {want}");
    }
}
