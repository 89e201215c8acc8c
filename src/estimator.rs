use std::{fs, path::Path};

use log::info;
use thiserror::Error;

use crate::{
    dataset::LabeledDataset,
    imaging::{self, Image},
    model::{Classifier, LoadOutcome, ModelError, ModelTrainer},
    noise::NoiseLevel,
};

#[derive(Debug, Error)]
pub enum EstimatorError {
    #[error("no model loaded, load or train one first")]
    NotLoaded,
    #[error("cannot evaluate on an empty dataset")]
    EmptyDataset,
    #[error("image of {height}x{width} is smaller than a {patch_size}x{patch_size} patch")]
    ImageTooSmall {
        height: usize,
        width: usize,
        patch_size: usize,
    },
    #[error("model returned {actual} predictions for {expected} patches")]
    PredictionCount { expected: usize, actual: usize },
    #[error("model returned {actual} confidences, one per noise level ({expected}) expected")]
    ConfidenceCount { expected: usize, actual: usize },
    #[error("failed to create model directory {path}: {source}")]
    CreateDir {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Model(#[from] ModelError),
}

/// Noise levels ordered from most to least confident.
#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub ranked: Vec<(NoiseLevel, f32)>,
}

impl Prediction {
    /// Ranks one confidence per noise level. Ties keep the lower level first.
    pub fn from_confidences(confidences: &[f32]) -> Result<Self, EstimatorError> {
        check_levels(confidences)?;

        let mut ranked: Vec<(NoiseLevel, f32)> = NoiseLevel::all()
            .zip(confidences.iter().copied())
            .collect();
        ranked.sort_by(|(a_level, a), (b_level, b)| b.total_cmp(a).then(a_level.cmp(b_level)));

        Ok(Self { ranked })
    }

    pub fn best(&self) -> Option<NoiseLevel> {
        self.ranked.first().map(|(level, _)| *level)
    }

    pub fn classes(&self) -> impl Iterator<Item = NoiseLevel> + '_ {
        self.ranked.iter().map(|(level, _)| *level)
    }

    pub fn confidences(&self) -> impl Iterator<Item = f32> + '_ {
        self.ranked.iter().map(|(_, confidence)| *confidence)
    }
}

fn check_levels(confidences: &[f32]) -> Result<(), EstimatorError> {
    if confidences.len() != NoiseLevel::COUNT {
        return Err(EstimatorError::ConfidenceCount {
            expected: NoiseLevel::COUNT,
            actual: confidences.len(),
        });
    }
    Ok(())
}

/// Estimates the noise level of images by classifying patches cut with a
/// fixed geometry. Starts without a model; [`load`](Self::load) or
/// [`train`](Self::train) provides one.
pub struct NoiseEstimator<T: ModelTrainer> {
    patch_size: usize,
    patch_stride: usize,
    trainer: T,
    model: Option<T::Model>,
}

impl<T: ModelTrainer> NoiseEstimator<T> {
    pub fn new(patch_size: usize, patch_stride: usize, trainer: T) -> Self {
        Self {
            patch_size,
            patch_stride,
            trainer,
            model: None,
        }
    }

    pub fn patch_size(&self) -> usize {
        self.patch_size
    }

    pub fn patch_stride(&self) -> usize {
        self.patch_stride
    }

    pub fn is_loaded(&self) -> bool {
        self.model.is_some()
    }

    pub fn load(&mut self, path: impl AsRef<Path>) -> Result<LoadOutcome<()>, EstimatorError> {
        let path = path.as_ref();
        let outcome = self.trainer.load(path)?;

        Ok(match outcome {
            LoadOutcome::Found(model) => {
                info!("Loaded model from {}", path.display());
                self.model = Some(model);
                LoadOutcome::Found(())
            }
            LoadOutcome::NotFound => LoadOutcome::NotFound,
        })
    }

    pub fn train(&mut self, dataset: &LabeledDataset, save_path: impl AsRef<Path>) -> Result<(), EstimatorError> {
        let save_path = save_path.as_ref();
        let model = self.trainer.train(dataset)?;

        fs::create_dir_all(save_path).map_err(|source| EstimatorError::CreateDir {
            path: save_path.display().to_string(),
            source,
        })?;
        model.save(save_path)?;
        info!("Saved model to {}", save_path.display());

        self.model = Some(model);
        Ok(())
    }

    /// Fraction of patches whose most confident level matches the label.
    pub fn evaluate(&self, dataset: &LabeledDataset) -> Result<f64, EstimatorError> {
        let model = self.model.as_ref().ok_or(EstimatorError::NotLoaded)?;
        if dataset.is_empty() {
            return Err(EstimatorError::EmptyDataset);
        }

        let predictions = model.predict(dataset.patches())?;
        if predictions.len() != dataset.len() {
            return Err(EstimatorError::PredictionCount {
                expected: dataset.len(),
                actual: predictions.len(),
            });
        }

        let mut correct = 0;
        for (confidences, label) in predictions.iter().zip(dataset.labels()) {
            if Prediction::from_confidences(confidences)?.best() == Some(*label) {
                correct += 1;
            }
        }

        Ok(correct as f64 / dataset.len() as f64)
    }

    /// Classifies every patch of `image` and ranks the averaged confidences.
    pub fn predict(&self, image: &Image) -> Result<Prediction, EstimatorError> {
        let model = self.model.as_ref().ok_or(EstimatorError::NotLoaded)?;

        let patches = imaging::extract_patches(image.view(), self.patch_size, self.patch_stride);
        if patches.is_empty() {
            let (height, width, _) = image.dim();
            return Err(EstimatorError::ImageTooSmall {
                height,
                width,
                patch_size: self.patch_size,
            });
        }

        let predictions = model.predict(&patches)?;
        if predictions.len() != patches.len() {
            return Err(EstimatorError::PredictionCount {
                expected: patches.len(),
                actual: predictions.len(),
            });
        }

        let mut mean = vec![0f32; NoiseLevel::COUNT];
        for confidences in &predictions {
            check_levels(confidences)?;
            for (sum, c) in mean.iter_mut().zip(confidences) {
                *sum += c;
            }
        }
        mean.iter_mut().for_each(|sum| *sum /= predictions.len() as f32);

        Prediction::from_confidences(&mean)
    }
}
