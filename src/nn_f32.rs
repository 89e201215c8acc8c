use indicatif::ProgressIterator;
use log::info;
use nalgebra::{DMatrix, DVector};
use rand::{seq::SliceRandom, Rng};
use rand_distr::Distribution;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::{fs, io, iter::zip, path::Path, time::Instant};

use crate::Activation;

pub type Sample = (DVector<f32>, DVector<f32>);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Network {
    num_layers: usize,
    sizes: Vec<usize>,
    biases: Vec<DVector<f32>>,
    weights: Vec<DMatrix<f32>>,
    #[serde(skip)]
    weight_grad: Vec<DMatrix<f32>>,
    #[serde(skip)]
    bias_grad: Vec<DVector<f32>>,
    activation: Activation,
    output_activation: Activation,
}

impl Network {
    /// The list ``sizes`` contains the number of neurons in the
    /// respective layers of the network.  For example, if the list
    /// was [2, 3, 1] then it would be a three-layer network, with the
    /// first layer containing 2 neurons, the second layer 3 neurons,
    /// and the third layer 1 neuron.  Biases and weights are drawn from
    /// ``distr``. The first layer is the input layer and has no biases.
    pub fn new<D, R>(
        sizes: &[usize],
        activation: Activation,
        output_activation: Activation,
        distr: D,
        rng: &mut R,
    ) -> Self
    where
        D: Distribution<f32> + Copy,
        R: Rng + ?Sized,
    {
        let biases = sizes
            .iter()
            .skip(1)
            .map(|y| DVector::from_fn(*y, |_, _| distr.sample(rng)))
            .collect();

        // scale by fan-in so wide patch inputs don't saturate the first layer
        let weights = zip(sizes, sizes.iter().skip(1))
            .map(|(x, y)| {
                let scale = 1. / (*x as f32).sqrt();
                DMatrix::from_fn(*y, *x, |_, _| distr.sample(rng) * scale)
            })
            .collect();

        Self {
            num_layers: sizes.len(),
            sizes: sizes.to_vec(),
            biases,
            weights,
            bias_grad: Vec::new(),
            weight_grad: Vec::new(),
            activation,
            output_activation,
        }
    }

    pub fn sizes(&self) -> &[usize] {
        &self.sizes
    }

    pub fn inputs(&self) -> usize {
        self.sizes.first().copied().unwrap_or(0)
    }

    pub fn outputs(&self) -> usize {
        self.sizes.last().copied().unwrap_or(0)
    }

    /// Return the output of the network if ``a`` is input.
    pub fn feedforward(&self, mut a: DVector<f32>) -> DVector<f32> {
        let last = self.biases.len().saturating_sub(1);
        for (i, (b, w)) in zip(self.biases.as_slice(), self.weights.as_slice()).enumerate() {
            a = w * a;
            a += b;

            if i == last {
                a.apply(self.output_activation.get_fun32());
            } else {
                a.apply(self.activation.get_fun32());
            }
        }

        a
    }

    /// Train the neural network using mini-batch stochastic
    /// gradient descent.  The ``training_data`` is a list of tuples
    /// ``(x, y)`` representing the training inputs and the desired
    /// outputs.  If ``test_data`` is provided then the network will be
    /// evaluated against it after each epoch and the progress logged.
    pub fn sgd<R: Rng + ?Sized>(
        &mut self,
        mut training_data: Vec<Sample>,
        epochs: usize,
        mini_batch_size: usize,
        eta: f32,
        test_data: Option<&[Sample]>,
        rng: &mut R,
    ) {
        let style = indicatif::ProgressStyle::with_template(
            "[{elapsed:.green}] [{wide_bar:.cyan/red}] {pos:.red}/{len:.green} ({eta})",
        )
        .unwrap_or_else(|_| indicatif::ProgressStyle::default_bar())
        .progress_chars("=> ");

        let n = training_data.len();
        let mini_batch_size = mini_batch_size.max(1);

        info!(
            "Starting training: epochs: {}, mini_batch: {}, examples: {}",
            epochs, mini_batch_size, n
        );

        self.zero_gradients();

        for j in 0..epochs {
            training_data.shuffle(rng);
            let start = Instant::now();
            let mini_batches = training_data.chunks(mini_batch_size);

            for mini_batch in mini_batches.into_iter().progress_with_style(style.clone()) {
                self.update_mini_batch(mini_batch, eta);
            }

            match test_data {
                Some(test_data) if !test_data.is_empty() => {
                    let (correct, loss) = self.evaluate(test_data);
                    let len = test_data.len();

                    info!(
                        "epoch {:>3}: {} / {}: {:#.3}%  loss: {:#.10}  time: {:#?}",
                        j,
                        correct,
                        len,
                        ((correct as f32) / (len as f32)) * 100.0,
                        loss,
                        start.elapsed()
                    );
                }
                _ => info!("epoch {} complete in {:#?}", j, start.elapsed()),
            }
        }

        self.bias_grad.clear();
        self.weight_grad.clear();
    }

    fn zero_gradients(&mut self) {
        self.bias_grad = self
            .sizes
            .iter()
            .skip(1)
            .map(|y| DVector::zeros(*y))
            .collect();

        self.weight_grad = zip(&self.sizes, self.sizes.iter().skip(1))
            .map(|(x, y)| DMatrix::zeros(*y, *x))
            .collect();
    }

    /// Update the network's weights and biases by applying
    /// gradient descent using backpropagation to a single mini batch.
    /// The ``mini_batch`` is a list of tuples ``(x, y)``, and ``eta``
    /// is the learning rate. Outside of ``sgd`` the gradient buffers start
    /// from zero.
    pub fn update_mini_batch(&mut self, mini_batch: &[Sample], eta: f32) {
        if mini_batch.is_empty() {
            return;
        }
        if self.bias_grad.len() != self.biases.len() || self.weight_grad.len() != self.weights.len() {
            self.zero_gradients();
        }

        // a small remnant of the previous batch's gradient is kept as momentum
        self.bias_grad.iter_mut().for_each(|layer| *layer *= 0.1);
        self.weight_grad.iter_mut().for_each(|layer| *layer *= 0.1);

        mini_batch
            .iter()
            .for_each(|(x, y)| self.backprop(x.clone(), y));

        let lr_bs = eta / mini_batch.len() as f32;

        self.weights
            .iter_mut()
            .zip(self.weight_grad.iter())
            .for_each(|(w, nw)| {
                *w -= lr_bs * nw;
            });

        self.biases
            .iter_mut()
            .zip(self.bias_grad.iter())
            .for_each(|(b, nb)| {
                *b -= lr_bs * nb;
            });
    }

    /// Accumulate the gradient of the quadratic cost for one example into
    /// ``bias_grad`` and ``weight_grad``, which must already be allocated.
    fn backprop(&mut self, x: DVector<f32>, y: &DVector<f32>) {
        let Some(last) = self.biases.len().checked_sub(1) else {
            return;
        };
        let mut activations = vec![x]; // list to store all the activations, layer by layer
        let mut zs = Vec::with_capacity(self.biases.len()); // list to store all the z vectors, layer by layer

        for (i, (b, w)) in zip(self.biases.iter(), self.weights.iter()).enumerate() {
            let mut z = w * &activations[i] + b;
            zs.push(z.clone());

            if i == last {
                z.apply(self.output_activation.get_fun32());
            } else {
                z.apply(self.activation.get_fun32())
            }
            activations.push(z);
        }

        // backward pass
        let (Some(output), Some(z_out)) = (activations.pop(), zs.pop()) else {
            return;
        };

        let mut delta = Self::cost_derivative(&output, y)
            .component_mul(&z_out.apply_into(self.output_activation.get_dir32()));

        self.bias_grad[last] += &delta;
        if let Some(previous) = activations.pop() {
            self.weight_grad[last] += &delta * previous.transpose();
        }

        // l = 1 is the last layer, l = 2 the second-last and so on
        for l in 2..self.num_layers {
            let (Some(z), Some(previous)) = (zs.pop(), activations.pop()) else {
                break;
            };
            let sp = z.apply_into(self.activation.get_dir32());
            let layer = self.num_layers - 1 - l;

            delta = self.weights[layer + 1].tr_mul(&delta).component_mul(&sp);

            self.bias_grad[layer] += &delta;
            self.weight_grad[layer] += &delta * previous.transpose();
        }
    }

    /// Return the vector of partial derivatives \partial C_x /
    /// \partial a for the output activations.
    pub fn cost_derivative(output_activations: &DVector<f32>, y: &DVector<f32>) -> DVector<f32> {
        output_activations - y
    }

    /// Return the number of test inputs for which the neural
    /// network outputs the correct result, and the mean quadratic loss.
    /// The network's output is the index of whichever neuron in the
    /// final layer has the highest activation.
    pub fn evaluate(&self, test_data: &[Sample]) -> (usize, f32) {
        let len = test_data.len().max(1);
        let values: Vec<_> = test_data
            .par_iter()
            .map(|(x, y)| (self.feedforward(x.clone()), y))
            .collect();

        let loss = values
            .par_iter()
            .map(|(x, y)| (x - *y).map(|z| z.powi(2)).sum())
            .sum::<f32>()
            / (len as f32);

        let correct = values
            .par_iter()
            .filter(|(x, y)| argmax(x) == argmax(y))
            .count();

        (correct, loss)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> io::Result<()> {
        let json = serde_json::to_string(self)?;
        fs::write(path, json)
    }

    pub fn load(path: impl AsRef<Path>) -> io::Result<Self> {
        let json = fs::read_to_string(path)?;
        let network: Self = serde_json::from_str(&json)?;

        let consistent = network.num_layers == network.sizes.len()
            && network.weights.len() + 1 == network.num_layers
            && network.biases.len() + 1 == network.num_layers
            && zip(&network.weights, network.sizes.windows(2))
                .all(|(w, pair)| w.ncols() == pair[0] && w.nrows() == pair[1]);

        if !consistent {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "layer shapes do not match the recorded sizes",
            ));
        }

        Ok(network)
    }
}

pub fn argmax(v: &DVector<f32>) -> usize {
    v.iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| a.total_cmp(b))
        .map(|(i, _)| i)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use rand::{rngs::StdRng, SeedableRng};
    use rand_distr::StandardNormal;

    use super::*;

    fn one_hot(label: usize, outputs: usize) -> DVector<f32> {
        let mut v = DVector::zeros(outputs);
        v[label] = 1.;
        v
    }

    // two clusters, one bright and one dark
    fn clusters(rng: &mut StdRng) -> Vec<Sample> {
        (0..200)
            .map(|i| {
                let label = i % 2;
                let base: f32 = if label == 0 { 0.1 } else { 0.9 };
                let x = DVector::from_fn(4, |_, _| base + rng.random_range(-0.05..0.05));
                (x, one_hot(label, 2))
            })
            .collect()
    }

    #[test]
    fn feedforward_shape() {
        let mut rng = StdRng::seed_from_u64(0);
        let net = Network::new(&[6, 5, 3], Activation::Sigmoid, Activation::Sigmoid, StandardNormal, &mut rng);

        let out = net.feedforward(DVector::from_element(6, 0.5));
        assert_eq!(out.len(), 3);
        assert!(out.iter().all(|v| (0.0..=1.0).contains(v)));
        assert_eq!((net.inputs(), net.outputs()), (6, 3));
    }

    #[test]
    fn learns_separable_clusters() {
        let mut rng = StdRng::seed_from_u64(21);
        let data = clusters(&mut rng);
        let mut net = Network::new(&[4, 8, 2], Activation::Sigmoid, Activation::Sigmoid, StandardNormal, &mut rng);

        net.sgd(data.clone(), 30, 10, 3.0, None, &mut rng);
        let (correct, _) = net.evaluate(&data);

        assert!(correct >= 190, "{correct} / {}", data.len());
    }

    #[test]
    fn training_reduces_loss() {
        let mut rng = StdRng::seed_from_u64(5);
        let data = clusters(&mut rng);
        let mut net = Network::new(&[4, 6, 6, 2], Activation::Sigmoid, Activation::Sigmoid, StandardNormal, &mut rng);

        let (_, before) = net.evaluate(&data);
        net.sgd(data.clone(), 10, 10, 2.0, Some(data.as_slice()), &mut rng);
        let (_, after) = net.evaluate(&data);

        assert!(after < before, "before {before}, after {after}");
    }

    #[test]
    fn save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("net.json");
        let mut rng = StdRng::seed_from_u64(8);
        let net = Network::new(&[3, 4, 2], Activation::ReLU, Activation::Sigmoid, StandardNormal, &mut rng);

        net.save(&path).unwrap();
        let loaded = Network::load(&path).unwrap();

        let input = DVector::from_vec(vec![0.2, 0.4, 0.6]);
        assert_eq!(net.feedforward(input.clone()), loaded.feedforward(input));
    }

    #[test]
    fn load_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("net.json");
        fs::write(&path, "{\"sizes\": 3}").unwrap();

        assert!(Network::load(&path).is_err());
    }

    #[test]
    fn single_batch_update_on_fresh_network() {
        let mut rng = StdRng::seed_from_u64(13);
        let mut net = Network::new(&[2, 3, 2], Activation::Sigmoid, Activation::Sigmoid, StandardNormal, &mut rng);
        let before = net.clone();
        let batch = vec![
            (DVector::from_vec(vec![0.1, 0.9]), one_hot(0, 2)),
            (DVector::from_vec(vec![0.8, 0.2]), one_hot(1, 2)),
        ];

        net.update_mini_batch(&batch, 0.5);
        assert_ne!(net.weights, before.weights);
        assert_ne!(net.biases, before.biases);

        // still usable after a full training run released the buffers
        net.sgd(batch.clone(), 1, 2, 0.5, None, &mut rng);
        net.update_mini_batch(&batch, 0.5);
        net.update_mini_batch(&[], 0.5);
    }

    #[test]
    fn argmax_picks_largest() {
        assert_eq!(argmax(&DVector::from_vec(vec![0.1, 0.7, 0.2])), 1);
    }
}
