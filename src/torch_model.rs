//! Convolutional noise classifier on libtorch.

use std::path::Path;

use log::info;
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use tch::{
    nn::{self, ModuleT, OptimizerConfig},
    Device, Kind, Tensor,
};

use crate::{
    dataset::LabeledDataset,
    imaging::Patch,
    model::{normalize, Classifier, Confidences, LoadOutcome, ModelError, ModelTrainer},
    noise::NoiseLevel,
};

const CHANNELS: i64 = 3;

#[derive(Debug, Clone, PartialEq)]
pub struct ConvTrainerConfig {
    pub patch_size: i64,
    pub epochs: usize,
    pub batch_size: usize,
    pub learning_rate: f64,
    pub seed: Option<u64>,
}

impl Default for ConvTrainerConfig {
    fn default() -> Self {
        Self {
            patch_size: 32,
            epochs: 30,
            batch_size: 64,
            learning_rate: 1e-3,
            seed: None,
        }
    }
}

#[derive(Debug)]
struct ConvNet {
    conv1: nn::Conv2D,
    conv2: nn::Conv2D,
    fc1: nn::Linear,
    fc2: nn::Linear,
    patch_size: i64,
}

impl ConvNet {
    fn new(vs: &nn::Path, patch_size: i64) -> Self {
        let padded = nn::ConvConfig {
            padding: 1,
            ..Default::default()
        };
        // two 2x2 poolings
        let side = patch_size / 4;

        Self {
            conv1: nn::conv2d(vs / "conv1", CHANNELS, 16, 3, padded),
            conv2: nn::conv2d(vs / "conv2", 16, 32, 3, padded),
            fc1: nn::linear(vs / "fc1", 32 * side * side, 64, Default::default()),
            fc2: nn::linear(vs / "fc2", 64, NoiseLevel::COUNT as i64, Default::default()),
            patch_size,
        }
    }
}

impl ModuleT for ConvNet {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        xs.view([-1, CHANNELS, self.patch_size, self.patch_size])
            .apply(&self.conv1)
            .relu()
            .max_pool2d_default(2)
            .apply(&self.conv2)
            .relu()
            .max_pool2d_default(2)
            .flat_view()
            .apply(&self.fc1)
            .relu()
            .dropout(0.3, train)
            .apply(&self.fc2)
    }
}

/// Stacks patches into an `N x C x H x W` float tensor on the CPU.
fn to_tensor(patches: &[&Patch], patch_size: i64) -> Result<Tensor, ModelError> {
    let side = patch_size as usize;
    let mut buffer = Vec::with_capacity(patches.len() * side * side * CHANNELS as usize);

    for patch in patches {
        let (height, width, channels) = patch.dim();
        if height != side || width != side || channels != CHANNELS as usize {
            return Err(ModelError::InputSize {
                expected: side * side * CHANNELS as usize,
                actual: height * width * channels,
            });
        }
        // HWC -> CHW
        for c in 0..channels {
            for y in 0..height {
                for x in 0..width {
                    buffer.push(patch[[y, x, c]]);
                }
            }
        }
    }

    Ok(Tensor::from_slice(&buffer).view([patches.len() as i64, CHANNELS, patch_size, patch_size]))
}

pub struct ConvTrainer {
    pub config: ConvTrainerConfig,
}

pub struct ConvModel {
    vs: nn::VarStore,
    net: ConvNet,
}

impl ConvTrainer {
    pub const MODEL_FILE: &'static str = "model.ot";

    pub fn new(config: ConvTrainerConfig) -> Self {
        Self { config }
    }

    fn empty_model(&self) -> ConvModel {
        let vs = nn::VarStore::new(Device::cuda_if_available());
        let net = ConvNet::new(&vs.root(), self.config.patch_size);
        ConvModel { vs, net }
    }
}

impl ModelTrainer for ConvTrainer {
    type Model = ConvModel;

    fn train(&self, dataset: &LabeledDataset) -> Result<ConvModel, ModelError> {
        if dataset.is_empty() {
            return Err(ModelError::EmptyDataset);
        }

        let mut rng = match self.config.seed {
            Some(seed) => {
                tch::manual_seed(seed as i64);
                StdRng::seed_from_u64(seed)
            }
            None => StdRng::from_os_rng(),
        };

        let model = self.empty_model();
        let device = model.vs.device();
        info!("Training convolutional model on {device:?}");

        let mut optimizer = nn::Adam::default().build(&model.vs, self.config.learning_rate)?;
        let mut order: Vec<usize> = (0..dataset.len()).collect();

        for epoch in 0..self.config.epochs {
            order.shuffle(&mut rng);
            let mut total_loss = 0.;
            let mut batches = 0;

            for batch in order.chunks(self.config.batch_size.max(1)) {
                let patches: Vec<&Patch> = batch.iter().map(|&i| &dataset.patches()[i]).collect();
                let labels: Vec<i64> = batch
                    .iter()
                    .map(|&i| dataset.labels()[i].value() as i64)
                    .collect();

                let xs = to_tensor(&patches, self.config.patch_size)?.to_device(device);
                let ys = Tensor::from_slice(&labels).to_device(device);

                let loss = model.net.forward_t(&xs, true).cross_entropy_for_logits(&ys);
                optimizer.backward_step(&loss);

                total_loss += loss.double_value(&[]);
                batches += 1;
            }

            info!("epoch {:>3}: loss {:.5}", epoch, total_loss / batches.max(1) as f64);
        }

        Ok(model)
    }

    fn load(&self, dir: &Path) -> Result<LoadOutcome<ConvModel>, ModelError> {
        let path = dir.join(Self::MODEL_FILE);
        if !path.is_file() {
            return Ok(LoadOutcome::NotFound);
        }

        let mut model = self.empty_model();
        model.vs.load(&path)?;
        Ok(LoadOutcome::Found(model))
    }
}

impl Classifier for ConvModel {
    fn predict(&self, patches: &[Patch]) -> Result<Vec<Confidences>, ModelError> {
        let device = self.vs.device();
        let mut confidences = Vec::with_capacity(patches.len());

        for chunk in patches.chunks(256) {
            let refs: Vec<&Patch> = chunk.iter().collect();
            let xs = to_tensor(&refs, self.net.patch_size)?.to_device(device);

            let probabilities = tch::no_grad(|| self.net.forward_t(&xs, false).softmax(-1, Kind::Float));
            let flat = Vec::<f32>::try_from(probabilities.to_device(Device::Cpu).flatten(0, -1))?;

            confidences.extend(
                flat.chunks(NoiseLevel::COUNT)
                    .map(|scores| normalize(scores.iter().copied())),
            );
        }

        Ok(confidences)
    }

    fn save(&self, dir: &Path) -> Result<(), ModelError> {
        self.vs.save(dir.join(ConvTrainer::MODEL_FILE))?;
        Ok(())
    }
}
