//! End-to-end: train a tiny model on synthetic rooms, then serve it.

use std::fs;
use std::path::{Path, PathBuf};

use image::{Rgb, RgbImage};
use tch::{nn, Device};

use light_detect::config::{CallbackConfig, PhaseConfig};
use light_detect::dataset::{DatasetReport, LoadedSet};
use light_detect::model::artifact::ModelManifest;
use light_detect::model::LightNet;
use light_detect::train::evaluate;
use light_detect::train::metrics::History;
use light_detect::{ClassMap, DetectError, Label, LightDetector, TrainConfig, Trainer};

const SIZE: u32 = 64;

fn room(bright: bool, seed: u32) -> RgbImage {
    RgbImage::from_fn(SIZE, SIZE, |x, y| {
        let base: u32 = if bright { 200 } else { 20 };
        let v = (base + (x * 3 + y * 5 + seed * 7) % 40).min(255) as u8;
        Rgb([v, v, v.saturating_sub(10)])
    })
}

fn write_dataset(root: &Path, per_class: u32) {
    for (dir, bright) in [("lights_on", true), ("lights_off", false)] {
        let d = root.join(dir);
        fs::create_dir_all(&d).unwrap();
        for i in 0..per_class {
            room(bright, i).save(d.join(format!("img_{i:02}.png"))).unwrap();
        }
    }
}

fn tiny_config(root: &Path) -> TrainConfig {
    TrainConfig {
        data_dir: root.join("train"),
        model_path: root.join("out/model.safetensors"),
        pretrained_path: None,
        img_size: SIZE,
        batch_size: 4,
        width_mult: 0.35,
        head: PhaseConfig { epochs: 1, ..PhaseConfig::head_only() },
        fine_tune: PhaseConfig { epochs: 1, ..PhaseConfig::fine_tune() },
        ..TrainConfig::default()
    }
}

/// Trains once and returns the scratch dir plus the model path.
fn trained_model() -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    write_dataset(&dir.path().join("train"), 5);
    let cfg = tiny_config(dir.path());
    let report = Trainer::new(cfg).unwrap().with_device(Device::Cpu).run().unwrap();
    (dir, report.model_path)
}

#[test]
fn training_writes_every_artifact() {
    let dir = tempfile::tempdir().unwrap();
    write_dataset(&dir.path().join("train"), 5);
    let cfg = tiny_config(dir.path());
    let report = Trainer::new(cfg.clone()).unwrap().with_device(Device::Cpu).run().unwrap();

    assert!(cfg.model_path.is_file());
    assert!(report.best_checkpoint.as_ref().is_some_and(|p| p.is_file()));
    assert!(report.best_val_accuracy.is_some());

    let manifest = ModelManifest::read_for(&cfg.model_path).unwrap().unwrap();
    assert_eq!(manifest.img_size, SIZE);
    assert_eq!(manifest.width_mult, 0.35);

    let history: History =
        serde_json::from_str(&fs::read_to_string(cfg.history_path()).unwrap()).unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history.phase("head_only").count(), 1);
    assert_eq!(history.phase("fine_tune").count(), 1);
    assert!(fs::read_to_string(cfg.chart_path()).unwrap().contains("<svg"));
}

#[test]
fn missing_class_dir_fails_before_training() {
    let dir = tempfile::tempdir().unwrap();
    fs::create_dir_all(dir.path().join("train/lights_on")).unwrap();
    let cfg = tiny_config(dir.path());
    let err = Trainer::new(cfg.clone()).unwrap().run().unwrap_err();
    assert!(matches!(err, DetectError::ClassDirMissing(_)), "{err}");
    assert!(!cfg.model_path.exists());
}

#[test]
fn empty_class_fails_before_training() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("train");
    write_dataset(&root, 3);
    for entry in fs::read_dir(root.join("lights_off")).unwrap() {
        fs::remove_file(entry.unwrap().path()).unwrap();
    }
    let err = Trainer::new(tiny_config(dir.path())).unwrap().run().unwrap_err();
    assert!(matches!(err, DetectError::EmptyClass(_)), "{err}");
}

#[test]
fn undecodable_class_fails_before_training() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("train");
    write_dataset(&root, 5);
    for entry in fs::read_dir(root.join("lights_off")).unwrap() {
        fs::write(entry.unwrap().path(), b"garbage").unwrap();
    }
    let cfg = tiny_config(dir.path());
    let err = Trainer::new(cfg.clone()).unwrap().with_device(Device::Cpu).run().unwrap_err();
    match err {
        DetectError::EmptyClass(path) => assert!(path.ends_with("lights_off")),
        other => panic!("unexpected error: {other}"),
    }
    assert!(!cfg.model_path.exists());
}

#[test]
fn early_stopping_keeps_the_best_weights() {
    let dir = tempfile::tempdir().unwrap();
    write_dataset(&dir.path().join("train"), 5);
    let mut cfg = tiny_config(dir.path());
    // no learning: validation loss stays flat, so patience 1 stops at epoch 2
    cfg.head = PhaseConfig { epochs: 4, learning_rate: 0.0, ..PhaseConfig::head_only() };
    cfg.fine_tune = PhaseConfig { epochs: 0, ..PhaseConfig::fine_tune() };
    cfg.callbacks = CallbackConfig { early_stop_patience: 1, ..CallbackConfig::default() };
    let report = Trainer::new(cfg.clone()).unwrap().with_device(Device::Cpu).run().unwrap();

    assert_eq!(report.history.len(), 2);
    let best = report.history.series(|r| r.valid.loss).into_iter().fold(f64::INFINITY, f64::min);

    let mut vs = nn::VarStore::new(Device::Cpu);
    let net = LightNet::new(&vs.root(), cfg.width_mult);
    vs.load(&report.model_path).unwrap();
    let data = DatasetReport::scan(&cfg.data_dir, &cfg.classes).unwrap();
    let split = data.split(&ClassMap::default(), cfg.validation_split);
    let valid = LoadedSet::load(&split.valid, SIZE);
    let reloaded = evaluate(&net, &valid, cfg.batch_size, Device::Cpu);
    assert!((reloaded.loss - best).abs() < 1e-5, "{} vs {best}", reloaded.loss);
}

#[test]
fn plateau_halves_the_recorded_learning_rate() {
    let dir = tempfile::tempdir().unwrap();
    write_dataset(&dir.path().join("train"), 5);
    let mut cfg = tiny_config(dir.path());
    cfg.head = PhaseConfig { epochs: 3, ..PhaseConfig::head_only() };
    cfg.fine_tune = PhaseConfig { epochs: 0, ..PhaseConfig::fine_tune() };
    // any drop below 10 is a plateau, so every epoch after the first decays
    cfg.callbacks = CallbackConfig {
        plateau_patience: 1,
        plateau_min_delta: 10.0,
        ..CallbackConfig::default()
    };
    let report = Trainer::new(cfg).unwrap().with_device(Device::Cpu).run().unwrap();

    let lrs = report.history.series(|r| r.learning_rate);
    assert_eq!(lrs.len(), 3);
    for (got, want) in lrs.iter().zip([1e-3, 1e-3, 5e-4]) {
        assert!((got - want).abs() < 1e-12, "{lrs:?}");
    }
}

#[test]
fn detector_serves_the_trained_model() {
    let (dir, model) = trained_model();
    let detector = LightDetector::load_on(&model, Device::Cpu).unwrap();
    let on = dir.path().join("train/lights_on/img_00.png");
    let off = dir.path().join("train/lights_off/img_00.png");

    // idempotent
    let a = detector.predict(&on, 0.5).unwrap();
    let b = detector.predict(&on, 0.5).unwrap();
    assert_eq!(a.raw_score.to_bits(), b.raw_score.to_bits());
    assert_eq!(a.label, b.label);
    assert!((0.0..=1.0).contains(&a.raw_score));
    assert!((50.0..=100.0).contains(&a.confidence));

    // the label flips exactly once as the threshold passes the score
    let s = a.raw_score;
    let below = detector.predict(&on, (s - 0.01).max(0.0)).unwrap();
    let at = detector.predict(&on, s).unwrap();
    assert_eq!(below.label, Label::LightsOn);
    assert_eq!(at.label, Label::LightsOn);
    if s + 0.01 <= 1.0 {
        assert_eq!(detector.predict(&on, s + 0.01).unwrap().label, Label::LightsOff);
    }

    // unreadable files are skipped, order is kept
    let corrupt = dir.path().join("broken.jpg");
    fs::write(&corrupt, b"not an image").unwrap();
    let batch = detector.predict_batch(&[corrupt.clone(), on.clone(), off.clone()], 0.5);
    assert_eq!(batch.len(), 2);
    assert_eq!(batch[0].image_path, on);
    assert_eq!(batch[1].image_path, off);
    assert!(detector.predict(&corrupt, 0.5).is_none());
}

#[test]
fn missing_model_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = LightDetector::load(dir.path().join("nope.safetensors")).err().unwrap();
    assert!(matches!(err, DetectError::ModelNotFound(_)));
}
