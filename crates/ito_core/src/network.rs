//! Feed-forward function approximator.
//!
//! A network maps its input expressions to a scalar through hidden dense
//! layers with a smooth activation and a linear output layer:
//!
//!   a_0 = x,   a_{l+1} = act(a_l W_l^T + b_l),   y = a_L W_L^T + b_L
//!
//! Weights are stored as `[out, in]` matrices. The forward pass is generic over
//! `Scalar` so the differential operators can push hyper-dual numbers through
//! it; fitting uses a batched `f64` forward/backward pass and an Adam update.

use crate::error::{EngineError, Result};
use crate::expr::Expr;
use crate::traits::{lift, Scalar};
use nalgebra::{DMatrix, DVector};
use rand::Rng;
use rand_distr::{Distribution, Uniform};
use serde::{Deserialize, Serialize};

/// Hidden-layer activation. All variants are twice differentiable, which the
/// drift operator needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    #[default]
    Tanh,
    Sigmoid,
    Softplus,
}

impl Activation {
    pub fn apply<T: Scalar>(self, z: T) -> T {
        match self {
            Activation::Tanh => z.tanh(),
            Activation::Sigmoid => T::one() / (T::one() + (-z).exp()),
            // Split at 0 so neither branch overflows and both carry z's derivatives.
            Activation::Softplus => {
                if z >= T::zero() {
                    z + (T::one() + (-z).exp()).ln()
                } else {
                    (T::one() + z.exp()).ln()
                }
            }
        }
    }

    fn derivative(self, z: f64) -> f64 {
        let sigmoid = |v: f64| 1.0 / (1.0 + (-v).exp());
        match self {
            Activation::Tanh => {
                let t = z.tanh();
                1.0 - t * t
            }
            Activation::Sigmoid => {
                let s = sigmoid(z);
                s * (1.0 - s)
            }
            Activation::Softplus => sigmoid(z),
        }
    }
}

/// Settings of the Adam optimizer used by `fit`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AdamSettings {
    pub learning_rate: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub epsilon: f64,
}

impl Default for AdamSettings {
    fn default() -> Self {
        Self {
            learning_rate: 1e-3,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
        }
    }
}

impl AdamSettings {
    pub fn validate(&self) -> Result<()> {
        if !(self.learning_rate > 0.0 && self.learning_rate.is_finite()) {
            return Err(EngineError::Config(
                "learning_rate must be positive and finite.".to_string(),
            ));
        }
        if !(0.0..1.0).contains(&self.beta1) || !(0.0..1.0).contains(&self.beta2) {
            return Err(EngineError::Config(
                "beta1 and beta2 must lie in [0, 1).".to_string(),
            ));
        }
        if self.epsilon <= 0.0 {
            return Err(EngineError::Config("epsilon must be positive.".to_string()));
        }
        Ok(())
    }
}

/// Dense layer parameters; also used for gradients and Adam moments.
#[derive(Debug, Clone, PartialEq)]
struct Dense {
    weights: DMatrix<f64>,
    bias: DVector<f64>,
}

impl Dense {
    fn zeros(rows: usize, cols: usize) -> Self {
        Self {
            weights: DMatrix::zeros(rows, cols),
            bias: DVector::zeros(rows),
        }
    }

    /// Glorot uniform weights, zero bias.
    fn glorot<R: Rng>(rows: usize, cols: usize, rng: &mut R) -> Self {
        let limit = (6.0 / (rows + cols) as f64).sqrt();
        let dist = Uniform::new_inclusive(-limit, limit);
        Self {
            weights: DMatrix::from_fn(rows, cols, |_, _| dist.sample(rng)),
            bias: DVector::zeros(rows),
        }
    }

    fn is_finite(&self) -> bool {
        self.weights.iter().chain(self.bias.iter()).all(|v| v.is_finite())
    }

    fn to_snapshot(&self) -> LayerSnapshot {
        LayerSnapshot {
            rows: self.weights.nrows(),
            cols: self.weights.ncols(),
            // transpose so the column-major storage reads row-major
            weights: self.weights.transpose().as_slice().to_vec(),
            bias: self.bias.as_slice().to_vec(),
        }
    }

    fn from_snapshot(snapshot: &LayerSnapshot, rows: usize, cols: usize) -> Result<Self> {
        if snapshot.rows != rows
            || snapshot.cols != cols
            || snapshot.weights.len() != rows * cols
            || snapshot.bias.len() != rows
        {
            return Err(EngineError::Checkpoint(format!(
                "layer shape mismatch: expected {rows}x{cols}, found {}x{} with {} weights and {} biases",
                snapshot.rows,
                snapshot.cols,
                snapshot.weights.len(),
                snapshot.bias.len()
            )));
        }
        Ok(Self {
            weights: DMatrix::from_row_slice(rows, cols, &snapshot.weights),
            bias: DVector::from_column_slice(&snapshot.bias),
        })
    }
}

#[derive(Debug, Clone)]
struct Adam {
    settings: AdamSettings,
    step: u64,
    first: Vec<Dense>,
    second: Vec<Dense>,
}

impl Adam {
    fn new(settings: AdamSettings, layers: &[Dense]) -> Self {
        let zeros: Vec<Dense> = layers
            .iter()
            .map(|l| Dense::zeros(l.weights.nrows(), l.weights.ncols()))
            .collect();
        Self {
            settings,
            step: 0,
            first: zeros.clone(),
            second: zeros,
        }
    }

    fn update(&mut self, layers: &mut [Dense], gradients: &[Dense]) {
        self.step += 1;
        let s = self.settings;
        let t = self.step as f64;
        let bc1 = 1.0 - s.beta1.powf(t);
        let bc2 = 1.0 - s.beta2.powf(t);

        let moments = self.first.iter_mut().zip(self.second.iter_mut());
        for ((layer, grad), (m, v)) in layers.iter_mut().zip(gradients).zip(moments) {
            adam_update(
                layer.weights.as_mut_slice(),
                grad.weights.as_slice(),
                m.weights.as_mut_slice(),
                v.weights.as_mut_slice(),
                &s,
                bc1,
                bc2,
            );
            adam_update(
                layer.bias.as_mut_slice(),
                grad.bias.as_slice(),
                m.bias.as_mut_slice(),
                v.bias.as_mut_slice(),
                &s,
                bc1,
                bc2,
            );
        }
    }
}

fn adam_update(
    params: &mut [f64],
    grads: &[f64],
    first: &mut [f64],
    second: &mut [f64],
    s: &AdamSettings,
    bc1: f64,
    bc2: f64,
) {
    let iter = params
        .iter_mut()
        .zip(grads)
        .zip(first.iter_mut().zip(second.iter_mut()));
    for ((p, &g), (m, v)) in iter {
        *m = s.beta1 * *m + (1.0 - s.beta1) * g;
        *v = s.beta2 * *v + (1.0 - s.beta2) * g * g;
        let m_hat = *m / bc1;
        let v_hat = *v / bc2;
        *p -= s.learning_rate * m_hat / (v_hat.sqrt() + s.epsilon);
    }
}

/// Serialized form of one dense layer. Weights are row-major `[rows, cols]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerSnapshot {
    pub rows: usize,
    pub cols: usize,
    pub weights: Vec<f64>,
    pub bias: Vec<f64>,
}

/// Serialized form of a network: architecture, parameters and optimizer state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkSnapshot {
    pub name: String,
    pub input_count: usize,
    pub hidden: Vec<usize>,
    pub activation: Activation,
    pub layers: Vec<LayerSnapshot>,
    pub optimizer_step: u64,
    pub first_moments: Vec<LayerSnapshot>,
    pub second_moments: Vec<LayerSnapshot>,
}

struct ForwardCache {
    /// `activations[l]` is the input of layer `l`; the last entry is the output.
    activations: Vec<DMatrix<f64>>,
    pre_activations: Vec<DMatrix<f64>>,
}

#[derive(Debug, Clone)]
pub struct Network {
    name: String,
    inputs: Vec<Expr>,
    hidden: Vec<usize>,
    activation: Activation,
    layers: Vec<Dense>,
    optimizer: Adam,
    last_loss: Option<f64>,
}

impl Network {
    pub fn new<R: Rng>(
        name: &str,
        inputs: Vec<Expr>,
        hidden: &[usize],
        activation: Activation,
        settings: AdamSettings,
        rng: &mut R,
    ) -> Result<Self> {
        if name.is_empty() {
            return Err(EngineError::Config("network name must not be empty.".to_string()));
        }
        if inputs.is_empty() {
            return Err(EngineError::Config(format!(
                "network '{name}' needs at least one input expression."
            )));
        }
        if hidden.iter().any(|&w| w == 0) {
            return Err(EngineError::Config(format!(
                "hidden layer widths of network '{name}' must be positive, got {hidden:?}."
            )));
        }
        settings.validate()?;

        let widths = layer_widths(inputs.len(), hidden);
        let layers: Vec<Dense> = widths
            .windows(2)
            .map(|w| Dense::glorot(w[1], w[0], rng))
            .collect();
        let optimizer = Adam::new(settings, &layers);

        Ok(Self {
            name: name.to_string(),
            inputs,
            hidden: hidden.to_vec(),
            activation,
            layers,
            optimizer,
            last_loss: None,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn inputs(&self) -> &[Expr] {
        &self.inputs
    }

    pub fn hidden(&self) -> &[usize] {
        &self.hidden
    }

    pub fn activation(&self) -> Activation {
        self.activation
    }

    pub fn parameter_count(&self) -> usize {
        self.layers
            .iter()
            .map(|l| l.weights.len() + l.bias.len())
            .sum()
    }

    pub fn optimizer_steps(&self) -> u64 {
        self.optimizer.step
    }

    /// Mean squared residual of the most recent fit step.
    pub fn last_loss(&self) -> Option<f64> {
        self.last_loss
    }

    /// Evaluates the network at a single point.
    pub fn forward<T: Scalar>(&self, inputs: &[T]) -> T {
        let mut current: Vec<T> = inputs.to_vec();
        let last = self.layers.len().saturating_sub(1);
        for (l, layer) in self.layers.iter().enumerate() {
            let mut next = Vec::with_capacity(layer.weights.nrows());
            for r in 0..layer.weights.nrows() {
                let mut acc: T = lift(layer.bias[r]);
                for (c, &a) in current.iter().enumerate() {
                    acc = acc + lift::<T>(layer.weights[(r, c)]) * a;
                }
                next.push(if l == last { acc } else { self.activation.apply(acc) });
            }
            current = next;
        }
        current.first().copied().unwrap_or_else(T::nan)
    }

    /// Evaluates the network on a `[batch, inputs]` feature matrix.
    pub fn predict(&self, features: &DMatrix<f64>) -> Vec<f64> {
        let cache = self.forward_batch(features);
        cache
            .activations
            .last()
            .map(|out| out.column(0).iter().copied().collect())
            .unwrap_or_default()
    }

    fn forward_batch(&self, features: &DMatrix<f64>) -> ForwardCache {
        let mut activations = vec![features.clone()];
        let mut pre_activations = Vec::with_capacity(self.layers.len());
        let last = self.layers.len().saturating_sub(1);
        for (l, layer) in self.layers.iter().enumerate() {
            let mut z = &activations[l] * layer.weights.transpose();
            for (mut column, b) in z.column_iter_mut().zip(layer.bias.iter()) {
                column.add_scalar_mut(*b);
            }
            let a = if l == last {
                z.clone()
            } else {
                z.map(|v| self.activation.apply(v))
            };
            pre_activations.push(z);
            activations.push(a);
        }
        ForwardCache {
            activations,
            pre_activations,
        }
    }

    /// Mean squared residual against `target` and its parameter gradients.
    fn loss_and_gradients(
        &self,
        features: &DMatrix<f64>,
        target: &[f64],
    ) -> Result<(f64, Vec<Dense>)> {
        let n = features.nrows();
        if n == 0 {
            return Err(EngineError::Config(format!(
                "cannot fit network '{}' on an empty batch.",
                self.name
            )));
        }
        if features.ncols() != self.inputs.len() || target.len() != n {
            return Err(EngineError::Config(format!(
                "network '{}' expects {} inputs and {} targets, got {} and {}.",
                self.name,
                self.inputs.len(),
                n,
                features.ncols(),
                target.len()
            )));
        }

        let cache = self.forward_batch(features);
        let output = &cache.activations[self.layers.len()];
        let residual: Vec<f64> = (0..n).map(|i| output[(i, 0)] - target[i]).collect();
        let loss = residual.iter().map(|r| r * r).sum::<f64>() / n as f64;

        let scale = 2.0 / n as f64;
        let mut delta = DMatrix::from_fn(n, 1, |i, _| scale * residual[i]);
        let mut gradients = Vec::with_capacity(self.layers.len());
        for l in (0..self.layers.len()).rev() {
            let weights = delta.transpose() * &cache.activations[l];
            let bias = DVector::from_iterator(delta.ncols(), delta.column_iter().map(|c| c.sum()));
            if l > 0 {
                let upstream = &delta * &self.layers[l].weights;
                delta = upstream.zip_map(&cache.pre_activations[l - 1], |g, z| {
                    g * self.activation.derivative(z)
                });
            }
            gradients.push(Dense { weights, bias });
        }
        gradients.reverse();
        Ok((loss, gradients))
    }

    /// One Adam step on the mean squared residual. Returns the loss before the step.
    pub(crate) fn train_step(&mut self, features: &DMatrix<f64>, target: &[f64]) -> Result<f64> {
        let (loss, gradients) = self.loss_and_gradients(features, target)?;
        if !loss.is_finite() {
            return Err(EngineError::Numerical(format!(
                "loss of network '{}' is {loss}",
                self.name
            )));
        }
        self.optimizer.update(&mut self.layers, &gradients);
        if !self.layers.iter().all(Dense::is_finite) {
            return Err(EngineError::Numerical(format!(
                "parameters of network '{}' became non-finite after optimizer step {}",
                self.name, self.optimizer.step
            )));
        }
        self.last_loss = Some(loss);
        Ok(loss)
    }

    pub fn snapshot(&self) -> NetworkSnapshot {
        NetworkSnapshot {
            name: self.name.clone(),
            input_count: self.inputs.len(),
            hidden: self.hidden.clone(),
            activation: self.activation,
            layers: self.layers.iter().map(Dense::to_snapshot).collect(),
            optimizer_step: self.optimizer.step,
            first_moments: self.optimizer.first.iter().map(Dense::to_snapshot).collect(),
            second_moments: self.optimizer.second.iter().map(Dense::to_snapshot).collect(),
        }
    }

    /// Replaces parameters and optimizer state. The snapshot must describe the
    /// same architecture; nothing is modified when validation fails.
    pub fn restore(&mut self, snapshot: &NetworkSnapshot) -> Result<()> {
        if snapshot.name != self.name
            || snapshot.input_count != self.inputs.len()
            || snapshot.hidden != self.hidden
            || snapshot.activation != self.activation
        {
            return Err(EngineError::Checkpoint(format!(
                "architecture mismatch for network '{}': checkpoint has '{}' with {} inputs, hidden {:?}, {:?}",
                self.name,
                snapshot.name,
                snapshot.input_count,
                snapshot.hidden,
                snapshot.activation
            )));
        }
        let widths = layer_widths(self.inputs.len(), &self.hidden);
        let rebuild = |layers: &[LayerSnapshot]| -> Result<Vec<Dense>> {
            if layers.len() != widths.len() - 1 {
                return Err(EngineError::Checkpoint(format!(
                    "network '{}' expects {} layers, checkpoint has {}",
                    self.name,
                    widths.len() - 1,
                    layers.len()
                )));
            }
            layers
                .iter()
                .zip(widths.windows(2))
                .map(|(s, w)| Dense::from_snapshot(s, w[1], w[0]))
                .collect()
        };
        let layers = rebuild(&snapshot.layers)?;
        let first = rebuild(&snapshot.first_moments)?;
        let second = rebuild(&snapshot.second_moments)?;

        self.layers = layers;
        self.optimizer.first = first;
        self.optimizer.second = second;
        self.optimizer.step = snapshot.optimizer_step;
        Ok(())
    }
}

fn layer_widths(input_count: usize, hidden: &[usize]) -> Vec<usize> {
    let mut widths = Vec::with_capacity(hidden.len() + 2);
    widths.push(input_count);
    widths.extend_from_slice(hidden);
    widths.push(1);
    widths
}

#[cfg(test)]
mod tests {
    use super::{Activation, AdamSettings, Network};
    use crate::autodiff::HyperDual;
    use crate::expr::Var;
    use nalgebra::DMatrix;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn network(hidden: &[usize], activation: Activation) -> Network {
        let mut rng = StdRng::seed_from_u64(7);
        let inputs = vec![Var::from_index(0).expr(), Var::from_index(1).expr()];
        Network::new("VF", inputs, hidden, activation, AdamSettings::default(), &mut rng)
            .expect("network should build")
    }

    #[test]
    fn rejects_invalid_architecture() {
        let mut rng = StdRng::seed_from_u64(1);
        let x = vec![Var::from_index(0).expr()];
        let adam = AdamSettings::default();
        let tanh = Activation::Tanh;
        assert!(Network::new("", x.clone(), &[4], tanh, adam, &mut rng).is_err());
        assert!(Network::new("n", vec![], &[4], tanh, adam, &mut rng).is_err());
        assert!(Network::new("n", x, &[4, 0], tanh, adam, &mut rng).is_err());
    }

    #[test]
    fn pointwise_forward_matches_batched_predict() {
        let net = network(&[8, 4], Activation::Softplus);
        let features = DMatrix::from_row_slice(3, 2, &[0.1, 0.2, -1.0, 3.0, 2.5, -0.5]);
        let batched = net.predict(&features);
        for i in 0..3 {
            let point = net.forward(&[features[(i, 0)], features[(i, 1)]]);
            assert!((point - batched[i]).abs() < 1e-12);
        }
        assert_eq!(net.parameter_count(), 2 * 8 + 8 + 8 * 4 + 4 + 4 + 1);
    }

    #[test]
    fn hyperdual_forward_matches_finite_differences() {
        let net = network(&[6], Activation::Tanh);
        let (x, y) = (0.4, -0.3);
        let h = 1e-4;
        let out = net.forward(&[
            HyperDual::seeded(x, true, false),
            HyperDual::seeded(y, false, true),
        ]);
        let f = |a: f64, b: f64| net.forward(&[a, b]);
        let dx = (f(x + h, y) - f(x - h, y)) / (2.0 * h);
        let dxy = (f(x + h, y + h) - f(x + h, y - h) - f(x - h, y + h) + f(x - h, y - h))
            / (4.0 * h * h);
        assert!((out.e1 - dx).abs() < 1e-6);
        assert!((out.e12 - dxy).abs() < 1e-4);
    }

    #[test]
    fn activations_differentiate_through_zero() {
        for activation in [Activation::Tanh, Activation::Sigmoid, Activation::Softplus] {
            let h = 1e-5_f64;
            let at = |v: f64| activation.apply(v);
            let second = (at(h) - 2.0 * at(0.0) + at(-h)) / (h * h);
            for z in [HyperDual::seeded(0.0, true, true), -HyperDual::seeded(0.0, true, true)] {
                let out = activation.apply(z);
                assert!((out.e1 - z.e1 * activation.derivative(0.0)).abs() < 1e-12);
                assert!((out.e12 - second).abs() < 1e-4, "{activation:?}");
            }
        }
    }

    #[test]
    fn backprop_gradient_matches_finite_difference() {
        let net = network(&[5], Activation::Sigmoid);
        let features = DMatrix::from_row_slice(4, 2, &[0.1, 0.2, 0.3, -0.4, 1.0, 0.5, -0.7, 0.9]);
        let target = [0.5, -0.2, 0.3, 1.0];
        let (_, gradients) = net.loss_and_gradients(&features, &target).expect("gradients");

        let h = 1e-6;
        let mut bumped = net.clone();
        bumped.layers[0].weights[(2, 1)] += h;
        let (up, _) = bumped.loss_and_gradients(&features, &target).expect("loss");
        bumped.layers[0].weights[(2, 1)] -= 2.0 * h;
        let (down, _) = bumped.loss_and_gradients(&features, &target).expect("loss");
        let numeric = (up - down) / (2.0 * h);
        assert!((gradients[0].weights[(2, 1)] - numeric).abs() < 1e-6);
    }

    #[test]
    fn restore_rejects_other_architecture_and_keeps_parameters() {
        let mut net = network(&[4], Activation::Tanh);
        let before = net.snapshot();
        let other = network(&[3], Activation::Tanh).snapshot();
        assert!(net.restore(&other).is_err());
        assert_eq!(net.snapshot(), before);
    }
}
