use std::path::PathBuf;

use clap::{Parser, ValueEnum};

use crate::driver::DriverConfig;

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelKind {
    /// Fully connected network on non-overlapping 32x32 patches.
    #[value(name = "simple")]
    Simple,
    /// Convolutional network on non-overlapping 32x32 patches.
    #[cfg(feature = "torch")]
    #[value(name = "chuah_et_al")]
    ChuahEtAl,
}

impl ModelKind {
    pub fn name(self) -> &'static str {
        match self {
            ModelKind::Simple => "simple",
            #[cfg(feature = "torch")]
            ModelKind::ChuahEtAl => "chuah_et_al",
        }
    }

    /// Patch size and stride the model is trained on.
    pub fn geometry(self) -> (usize, usize) {
        match self {
            ModelKind::Simple => (32, 32),
            #[cfg(feature = "torch")]
            ModelKind::ChuahEtAl => (32, 32),
        }
    }
}

#[derive(Parser, Debug, Clone)]
#[command(name = "noise-estimation", about = "Noise estimation DNN training script")]
pub struct Args {
    /// Path to a log file.
    #[arg(long)]
    pub log: Option<PathBuf>,
    /// Validate model based on image separate from training or testing data.
    #[arg(long)]
    pub validate: bool,
    /// Directory holding the source images.
    #[arg(long, default_value = "../coco/2017/train/")]
    pub corpus: PathBuf,
    /// Directory holding the train.txt and test.txt manifests.
    #[arg(long, default_value = "dataset")]
    pub dataset_dir: PathBuf,
    /// Directory trained models are stored under, one subdirectory per model.
    #[arg(long, default_value = "trained_models")]
    pub models_dir: PathBuf,
    /// Image used by --validate (defaults to one outside both manifests).
    #[arg(long)]
    pub validation_image: Option<PathBuf>,
    /// Model configurations to try, in order.
    #[arg(long = "model", value_enum, default_values_t = [ModelKind::Simple])]
    pub models: Vec<ModelKind>,
    /// Seed for noise synthesis and training.
    #[arg(long)]
    pub seed: Option<u64>,
    /// Training epochs.
    #[arg(long, default_value_t = 30)]
    pub epochs: usize,
}

impl Args {
    pub fn driver_config(&self) -> DriverConfig {
        DriverConfig {
            validation_image: self
                .validation_image
                .clone()
                .unwrap_or_else(|| self.corpus.join("000000001955.jpg")),
            corpus_dir: self.corpus.clone(),
            dataset_dir: self.dataset_dir.clone(),
            models_dir: self.models_dir.clone(),
            validate: self.validate,
            seed: self.seed,
            epochs: self.epochs,
        }
    }
}
