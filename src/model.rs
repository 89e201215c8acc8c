//! The model capability the noise estimator is built around.
//!
//! A [`ModelTrainer`] knows how to fit a [`Classifier`] to a labeled dataset
//! and how to restore one from disk. The estimator never looks inside the
//! model; it only asks it for per-level confidences.

use std::path::{Path, PathBuf};

use log::info;
use nalgebra::DVector;
use rand::{rngs::StdRng, seq::SliceRandom, Rng, SeedableRng};
use rand_distr::StandardNormal;
use rayon::prelude::*;
use thiserror::Error;

use crate::{
    dataset::LabeledDataset,
    imaging::{self, Patch},
    nn_f32::{Network, Sample},
    noise::NoiseLevel,
    Activation,
};

/// One score per noise level, non-negative and summing to one.
pub type Confidences = Vec<f32>;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("failed to access model at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot train on an empty dataset")]
    EmptyDataset,
    #[error("model expects {expected} inputs per patch, got {actual}")]
    InputSize { expected: usize, actual: usize },
    #[cfg(feature = "torch")]
    #[error(transparent)]
    Torch(#[from] tch::TchError),
}

/// Result of looking for a persisted model. A missing model is an expected
/// outcome that sends the caller down the training path.
#[derive(Debug)]
pub enum LoadOutcome<M> {
    Found(M),
    NotFound,
}

impl<M> LoadOutcome<M> {
    pub fn is_found(&self) -> bool {
        matches!(self, LoadOutcome::Found(_))
    }

    pub fn map<N>(self, f: impl FnOnce(M) -> N) -> LoadOutcome<N> {
        match self {
            LoadOutcome::Found(model) => LoadOutcome::Found(f(model)),
            LoadOutcome::NotFound => LoadOutcome::NotFound,
        }
    }
}

pub trait Classifier {
    /// Confidences for every patch, in input order.
    fn predict(&self, patches: &[Patch]) -> Result<Vec<Confidences>, ModelError>;

    /// Persists the model inside `dir`, which already exists.
    fn save(&self, dir: &Path) -> Result<(), ModelError>;
}

pub trait ModelTrainer {
    type Model: Classifier;

    fn train(&self, dataset: &LabeledDataset) -> Result<Self::Model, ModelError>;

    fn load(&self, dir: &Path) -> Result<LoadOutcome<Self::Model>, ModelError>;
}

/// Clamps negative scores to zero and rescales so they sum to one. An all-zero
/// input becomes the uniform distribution.
pub fn normalize(scores: impl IntoIterator<Item = f32>) -> Confidences {
    let mut scores: Vec<f32> = scores.into_iter().map(|s| s.max(0.)).collect();
    let total: f32 = scores.iter().sum();

    if total > 0. && total.is_finite() {
        scores.iter_mut().for_each(|s| *s /= total);
    } else if !scores.is_empty() {
        let uniform = 1. / scores.len() as f32;
        scores.iter_mut().for_each(|s| *s = uniform);
    }

    scores
}

pub fn one_hot(level: NoiseLevel) -> DVector<f32> {
    let mut v = DVector::zeros(NoiseLevel::COUNT);
    v[level.index()] = 1.;
    v
}

#[derive(Debug, Clone, PartialEq)]
pub struct SimpleTrainerConfig {
    pub hidden: Vec<usize>,
    pub epochs: usize,
    pub mini_batch_size: usize,
    pub learning_rate: f32,
    /// Share of the samples kept out of training and scored after each epoch.
    pub validation_fraction: f32,
    pub seed: Option<u64>,
}

impl Default for SimpleTrainerConfig {
    fn default() -> Self {
        Self {
            hidden: vec![64, 32],
            epochs: 30,
            mini_batch_size: 32,
            learning_rate: 0.5,
            validation_fraction: 0.1,
            seed: None,
        }
    }
}

/// Fully connected network over the grayscale pixels of a patch.
#[derive(Debug, Clone, Default)]
pub struct SimpleTrainer {
    pub config: SimpleTrainerConfig,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SimpleModel {
    network: Network,
}

impl SimpleTrainer {
    pub const MODEL_FILE: &'static str = "model.json";

    pub fn new(config: SimpleTrainerConfig) -> Self {
        Self { config }
    }
}

/// Shuffles `samples` and moves `fraction` of them into a second set. At
/// least one sample always stays in the first.
fn split_held_out<R: Rng + ?Sized>(
    mut samples: Vec<Sample>,
    fraction: f32,
    rng: &mut R,
) -> (Vec<Sample>, Vec<Sample>) {
    samples.shuffle(rng);
    let held = ((samples.len() as f32 * fraction.clamp(0., 1.)) as usize)
        .min(samples.len().saturating_sub(1));
    let held_out = samples.split_off(samples.len() - held);
    (samples, held_out)
}

impl SimpleModel {
    pub fn network(&self) -> &Network {
        &self.network
    }

    fn input(&self, patch: &Patch) -> Result<DVector<f32>, ModelError> {
        let pixels = imaging::grayscale(patch);
        if pixels.len() != self.network.inputs() {
            return Err(ModelError::InputSize {
                expected: self.network.inputs(),
                actual: pixels.len(),
            });
        }
        Ok(DVector::from_vec(pixels))
    }
}

impl ModelTrainer for SimpleTrainer {
    type Model = SimpleModel;

    fn train(&self, dataset: &LabeledDataset) -> Result<SimpleModel, ModelError> {
        let Some(first) = dataset.patches().first() else {
            return Err(ModelError::EmptyDataset);
        };

        let inputs = imaging::grayscale(first).len();
        let mut sizes = vec![inputs];
        sizes.extend(&self.config.hidden);
        sizes.push(NoiseLevel::COUNT);

        let mut rng = match self.config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };

        let mut network = Network::new(
            &sizes,
            Activation::Sigmoid,
            Activation::Sigmoid,
            StandardNormal,
            &mut rng,
        );

        let samples = dataset
            .iter()
            .map(|(patch, level)| {
                let pixels = imaging::grayscale(patch);
                if pixels.len() != inputs {
                    return Err(ModelError::InputSize {
                        expected: inputs,
                        actual: pixels.len(),
                    });
                }
                Ok((DVector::from_vec(pixels), one_hot(level)))
            })
            .collect::<Result<Vec<Sample>, _>>()?;

        let (training_data, held_out) =
            split_held_out(samples, self.config.validation_fraction, &mut rng);

        info!(
            "Network layout {:?}, {} patches held out for epoch accuracy",
            sizes,
            held_out.len()
        );
        network.sgd(
            training_data,
            self.config.epochs,
            self.config.mini_batch_size,
            self.config.learning_rate,
            Some(held_out.as_slice()),
            &mut rng,
        );

        Ok(SimpleModel { network })
    }

    fn load(&self, dir: &Path) -> Result<LoadOutcome<SimpleModel>, ModelError> {
        let path = dir.join(Self::MODEL_FILE);
        if !path.is_file() {
            return Ok(LoadOutcome::NotFound);
        }

        let network = Network::load(&path).map_err(|source| ModelError::Io { path, source })?;
        Ok(LoadOutcome::Found(SimpleModel { network }))
    }
}

impl Classifier for SimpleModel {
    fn predict(&self, patches: &[Patch]) -> Result<Vec<Confidences>, ModelError> {
        patches
            .par_iter()
            .map(|patch| -> Result<Confidences, ModelError> {
                let output = self.network.feedforward(self.input(patch)?);
                Ok(normalize(output.iter().copied()))
            })
            .collect()
    }

    fn save(&self, dir: &Path) -> Result<(), ModelError> {
        let path = dir.join(SimpleTrainer::MODEL_FILE);
        self.network
            .save(&path)
            .map_err(|source| ModelError::Io { path, source })
    }
}

#[cfg(test)]
mod tests {
    use ndarray::Array3;

    use super::*;

    // patches whose brightness encodes the label
    fn brightness_dataset(per_level: usize) -> LabeledDataset {
        NoiseLevel::all()
            .flat_map(|level| {
                (0..per_level).map(move |i| {
                    let v = level.value() as f32 / 9. + (i % 3) as f32 * 0.002;
                    (Array3::from_elem((4, 4, 3), v), level)
                })
            })
            .collect()
    }

    fn config(seed: u64) -> SimpleTrainerConfig {
        SimpleTrainerConfig {
            hidden: vec![16],
            epochs: 5,
            mini_batch_size: 10,
            learning_rate: 1.0,
            validation_fraction: 0.1,
            seed: Some(seed),
        }
    }

    #[test]
    fn normalize_sums_to_one() {
        let c = normalize([0.2, 0.6, -1.0, 0.2]);
        assert!((c.iter().sum::<f32>() - 1.).abs() < 1e-6);
        assert_eq!(c[2], 0.);
        assert_eq!(normalize([0., 0.]), vec![0.5, 0.5]);
    }

    #[test]
    fn empty_dataset_is_rejected() {
        let trainer = SimpleTrainer::new(config(1));
        assert!(matches!(
            trainer.train(&LabeledDataset::new()),
            Err(ModelError::EmptyDataset)
        ));
    }

    #[test]
    fn predicts_one_distribution_per_patch() {
        let dataset = brightness_dataset(3);
        let model = SimpleTrainer::new(config(2)).train(&dataset).unwrap();

        let confidences = model.predict(dataset.patches()).unwrap();
        assert_eq!(confidences.len(), dataset.len());
        for c in confidences {
            assert_eq!(c.len(), NoiseLevel::COUNT);
            assert!((c.iter().sum::<f32>() - 1.).abs() < 1e-4);
        }
    }

    #[test]
    fn wrong_patch_size_is_an_error() {
        let model = SimpleTrainer::new(config(3)).train(&brightness_dataset(1)).unwrap();
        let big = vec![Array3::from_elem((8, 8, 3), 0.5f32)];

        assert!(matches!(
            model.predict(&big),
            Err(ModelError::InputSize { expected: 16, actual: 64 })
        ));
    }

    #[test]
    fn missing_model_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let outcome = SimpleTrainer::default().load(dir.path()).unwrap();
        assert!(!outcome.is_found());
    }

    #[test]
    fn save_then_load_gives_same_model() {
        let dir = tempfile::tempdir().unwrap();
        let trainer = SimpleTrainer::new(config(4));
        let model = trainer.train(&brightness_dataset(2)).unwrap();
        model.save(dir.path()).unwrap();

        match trainer.load(dir.path()).unwrap() {
            LoadOutcome::Found(loaded) => assert_eq!(loaded, model),
            LoadOutcome::NotFound => panic!("model was saved"),
        }
    }

    #[test]
    fn corrupt_model_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(SimpleTrainer::MODEL_FILE), "garbage").unwrap();

        assert!(matches!(
            SimpleTrainer::default().load(dir.path()),
            Err(ModelError::Io { .. })
        ));
    }

    #[test]
    fn held_out_split_is_disjoint_and_sized() {
        let samples: Vec<Sample> = (0..30)
            .map(|i| (DVector::from_element(1, i as f32), one_hot(NoiseLevel::new(0).unwrap())))
            .collect();
        let mut rng = StdRng::seed_from_u64(6);

        let (train, held_out) = split_held_out(samples, 0.1, &mut rng);
        assert_eq!((train.len(), held_out.len()), (27, 3));

        let mut seen: Vec<f32> = train.iter().chain(&held_out).map(|(x, _)| x[0]).collect();
        seen.sort_by(f32::total_cmp);
        assert_eq!(seen, (0..30).map(|i| i as f32).collect::<Vec<_>>());
    }

    #[test]
    fn held_out_split_leaves_a_training_sample() {
        let mut rng = StdRng::seed_from_u64(7);
        let one = vec![(DVector::from_element(1, 0.), one_hot(NoiseLevel::new(3).unwrap()))];

        let (train, held_out) = split_held_out(one.clone(), 1.0, &mut rng);
        assert_eq!((train.len(), held_out.len()), (1, 0));

        let (train, held_out) = split_held_out(one, 0.0, &mut rng);
        assert_eq!((train.len(), held_out.len()), (1, 0));
    }

    #[test]
    fn trains_with_everything_held_out_but_one() {
        let trainer = SimpleTrainer::new(SimpleTrainerConfig {
            validation_fraction: 1.0,
            ..config(10)
        });
        let dataset = brightness_dataset(1);

        let model = trainer.train(&dataset).unwrap();
        assert_eq!(model.predict(dataset.patches()).unwrap().len(), dataset.len());
    }

    #[test]
    fn same_seed_same_model() {
        let dataset = brightness_dataset(2);
        let a = SimpleTrainer::new(config(9)).train(&dataset).unwrap();
        let b = SimpleTrainer::new(config(9)).train(&dataset).unwrap();
        assert_eq!(a, b);
    }
}
