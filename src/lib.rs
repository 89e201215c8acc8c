pub mod cli;
pub mod dataset;
pub mod driver;
pub mod estimator;
pub mod imaging;
pub mod logging;
pub mod model;
pub mod nn_f32;
pub mod noise;
#[cfg(feature = "torch")]
pub mod torch_model;

use serde::{Deserialize, Serialize};

pub use dataset::LabeledDataset;
pub use estimator::{NoiseEstimator, Prediction};
pub use model::{Classifier, LoadOutcome, ModelTrainer};
pub use noise::NoiseLevel;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Activation {
    Sigmoid,
    ReLU,
    Tanh,
    Identity,
}

impl Activation {
    pub fn get_fun32(&self) -> fn(&mut f32) {
        match self {
            Activation::Sigmoid => |val: &mut f32| *val = sigmoid(*val),
            Activation::ReLU => |val: &mut f32| *val = val.max(0.),
            Activation::Tanh => |val: &mut f32| *val = val.tanh(),
            Activation::Identity => |_: &mut f32| {},
        }
    }

    /// Derivative, evaluated at the pre-activation value.
    pub fn get_dir32(&self) -> fn(&mut f32) {
        match self {
            Activation::Sigmoid => |val: &mut f32| *val = sigmoid(*val) * (1. - sigmoid(*val)),
            Activation::ReLU => |val: &mut f32| *val = if *val >= 0. { 1. } else { 0. },
            Activation::Tanh => |val: &mut f32| *val = 1. - val.tanh().powi(2),
            Activation::Identity => |val: &mut f32| *val = 1.,
        }
    }
}

/// The sigmoid function.
pub fn sigmoid(z: f32) -> f32 {
    1. / (1. + (-z).exp())
}
