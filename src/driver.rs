//! Runs the train-or-evaluate procedure for each model configuration.

use std::path::PathBuf;

use anyhow::Context;
use log::{error, info};
use rand::{rngs::StdRng, SeedableRng};

use crate::{
    cli::ModelKind,
    dataset, imaging,
    model::{LoadOutcome, ModelTrainer, SimpleTrainer, SimpleTrainerConfig},
    noise::{self, NoiseLevel},
    NoiseEstimator, Prediction,
};

/// Width of the terminal rendering shown during validation.
const RENDER_COLUMNS: usize = 120;

#[derive(Debug, Clone, PartialEq)]
pub struct DriverConfig {
    pub corpus_dir: PathBuf,
    pub dataset_dir: PathBuf,
    pub models_dir: PathBuf,
    pub validation_image: PathBuf,
    pub validate: bool,
    pub seed: Option<u64>,
    pub epochs: usize,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Outcome {
    /// A stored model was found and scored on the test split.
    Evaluated { accuracy: f64 },
    /// No stored model existed, so one was trained and saved. Scoring it is
    /// left to the next run.
    Trained,
}

pub struct Driver {
    config: DriverConfig,
    rng: StdRng,
}

impl Driver {
    pub fn new(config: DriverConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };

        Self { config, rng }
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    /// Tries every configuration in turn. A failing configuration is logged
    /// and does not stop the others. Returns how many failed.
    pub fn run(&mut self, models: &[ModelKind]) -> usize {
        let mut failures = 0;

        for &kind in models {
            if let Err(err) = self.try_kind(kind) {
                error!("{} model failed: {err:#}", kind.name());
                failures += 1;
            }
        }

        failures
    }

    fn try_kind(&mut self, kind: ModelKind) -> anyhow::Result<Outcome> {
        let (patch_size, patch_stride) = kind.geometry();

        match kind {
            ModelKind::Simple => {
                let trainer = SimpleTrainer::new(SimpleTrainerConfig {
                    epochs: self.config.epochs,
                    seed: self.config.seed,
                    ..Default::default()
                });
                self.try_model(kind.name(), patch_size, patch_stride, trainer)
            }
            #[cfg(feature = "torch")]
            ModelKind::ChuahEtAl => {
                let trainer = crate::torch_model::ConvTrainer::new(crate::torch_model::ConvTrainerConfig {
                    patch_size: patch_size as i64,
                    epochs: self.config.epochs,
                    seed: self.config.seed,
                    ..Default::default()
                });
                self.try_model(kind.name(), patch_size, patch_stride, trainer)
            }
        }
    }

    /// Loads the model stored under `name` and scores it on the test split,
    /// or trains and stores one when none exists yet.
    pub fn try_model<T: ModelTrainer>(
        &mut self,
        name: &str,
        patch_size: usize,
        patch_stride: usize,
        trainer: T,
    ) -> anyhow::Result<Outcome> {
        info!("Trying {name} model");

        let model_path = self.config.models_dir.join(name);
        let mut estimator = NoiseEstimator::new(patch_size, patch_stride, trainer);

        let outcome = match estimator.load(&model_path)? {
            LoadOutcome::Found(()) => {
                let testing = dataset::build(
                    &self.config.corpus_dir,
                    self.config.dataset_dir.join("test.txt"),
                    patch_size,
                    patch_stride,
                    &mut self.rng,
                )
                .context("failed to build testing data")?;
                info!("Testing data size {}", testing.len());

                let accuracy = estimator.evaluate(&testing)?;
                info!("Accuracy is {:.1}%", 100. * accuracy);

                Outcome::Evaluated { accuracy }
            }
            LoadOutcome::NotFound => {
                // datasets live in host memory, the trainer decides where batches go
                let training = dataset::build(
                    &self.config.corpus_dir,
                    self.config.dataset_dir.join("train.txt"),
                    patch_size,
                    patch_stride,
                    &mut self.rng,
                )
                .context("failed to build training data")?;
                info!("Training data size {}", training.len());

                estimator
                    .train(&training, &model_path)
                    .with_context(|| format!("failed to train {name} model"))?;

                Outcome::Trained
            }
        };

        if self.config.validate {
            self.validate(&estimator)?;
        }

        Ok(outcome)
    }

    /// Corrupts the validation image at a random level, shows both versions
    /// and logs what the estimator makes of it.
    pub fn validate<T: ModelTrainer>(&mut self, estimator: &NoiseEstimator<T>) -> anyhow::Result<Prediction> {
        let noise_level = NoiseLevel::random(&mut self.rng);
        let clean = imaging::load_image(&self.config.validation_image)?;
        let validation = noise::synthesize(&clean, noise_level, &mut self.rng);
        info!("Actual noise level is {noise_level}");

        println!(
            "{}",
            imaging::render_side_by_side(&clean, &validation, RENDER_COLUMNS, 0.5)
        );

        let prediction = estimator.predict(&validation)?;
        for (level, confidence) in &prediction.ranked {
            info!("Estimated confidence in noise level {level}: {confidence:.3}");
        }

        Ok(prediction)
    }
}
