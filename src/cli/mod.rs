//! Thin command-line layer: parses flags and hands off to the library.

pub mod commands;

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use commands::{Commands, PredictArgs, PrepareArgs, TrainArgs};

use light_detect::config::ClassDirs;
use light_detect::dataset::{create_layout, list_images, DatasetReport};
use light_detect::{LightDetector, Prediction, TrainConfig, Trainer};

#[derive(Parser, Debug)]
#[command(
    name = "light-detect",
    version,
    about = "Classify photos of a room as LIGHTS ON or LIGHTS OFF."
)]
pub struct Cli {
    /// Debug-level logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    pub fn run(self) -> Result<()> {
        match self.command {
            Commands::Train(args) => run_train(args),
            Commands::Predict(args) => run_predict(args),
            Commands::Prepare(args) => run_prepare(args),
        }
    }
}

fn run_train(args: TrainArgs) -> Result<()> {
    let base = match &args.config {
        Some(path) => TrainConfig::from_file(path)
            .with_context(|| format!("reading config {}", path.display()))?,
        None => TrainConfig::default(),
    };
    let cfg = args.apply(base);
    tracing::info!("training on {}", cfg.data_dir.display());

    let trainer = Trainer::new(cfg).context("invalid training configuration")?;
    let report = trainer.run().context("training failed")?;

    println!("Model saved to {}", report.model_path.display());
    if let Some(best) = &report.best_checkpoint {
        println!(
            "Best checkpoint: {} (val acc {:.2}%)",
            best.display(),
            report.best_val_accuracy.unwrap_or(0.0) * 100.0
        );
    }
    let v = report.final_valid;
    println!(
        "Validation: loss {:.4} | accuracy {:.2}% | precision {:.2}% | recall {:.2}%",
        v.loss,
        v.accuracy * 100.0,
        v.precision * 100.0,
        v.recall * 100.0
    );
    Ok(())
}

fn run_predict(args: PredictArgs) -> Result<()> {
    let detector = LightDetector::load(&args.model)
        .with_context(|| format!("loading model {}", args.model.display()))?;

    let predictions: Vec<Prediction> = if args.batch {
        if !args.path.is_dir() {
            bail!("--batch expects a directory, got {}", args.path.display());
        }
        let paths: Vec<PathBuf> = list_images(&args.path)
            .with_context(|| format!("listing {}", args.path.display()))?;
        detector.predict_batch(&paths, args.threshold)
    } else {
        match detector.predict(&args.path, args.threshold) {
            Some(p) => vec![p],
            None => bail!("could not read image {}", args.path.display()),
        }
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&predictions)?);
        return Ok(());
    }
    for p in &predictions {
        println!("{}", p.image_path.display());
        println!("  Prediction: {}", p.label);
        println!("  Confidence: {:.2}%", p.confidence);
        println!("  Raw score:  {:.4}", p.raw_score);
    }
    if args.batch {
        let on = predictions.iter().filter(|p| p.label == light_detect::Label::LightsOn).count();
        println!("\n{} images: {} on, {} off", predictions.len(), on, predictions.len() - on);
    }
    Ok(())
}

fn run_prepare(args: PrepareArgs) -> Result<()> {
    let classes = ClassDirs::default();
    if args.create {
        let [on, off] = create_layout(&args.data_dir, &classes)
            .with_context(|| format!("creating {}", args.data_dir.display()))?;
        println!("Created:\n  {}\n  {}", on.display(), off.display());
        println!("Add photos with the lights on and off, then run `light-detect prepare --validate`.");
        return Ok(());
    }

    let report = DatasetReport::scan(&args.data_dir, &classes)?;
    println!("Lights ON:  {} images", report.on.len());
    println!("Lights OFF: {} images", report.off.len());
    println!("Total:      {} images", report.total());
    println!("{}", report.verdict().advice());
    match report.balance_ratio() {
        Some(ratio) if !report.is_balanced() => {
            println!("Unbalanced dataset (ratio {ratio:.1}:1); aim for roughly equal classes.")
        }
        Some(_) => println!("Classes are balanced."),
        None => {}
    }
    let (on, off) = report.samples(5);
    if !on.is_empty() {
        println!("Sample ON files:  {}", on.join(", "));
    }
    if !off.is_empty() {
        println!("Sample OFF files: {}", off.join(", "));
    }
    if report.is_ready() {
        println!("Dataset is ready. Run `light-detect train`.");
        Ok(())
    } else {
        bail!("dataset in {} is not ready for training", args.data_dir.display())
    }
}
