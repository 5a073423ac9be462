//! Actor-critic network with manual forward + backward pass.
//!
//! ```text
//!  input(4) → hidden₁ → … → hiddenₙ ─┬─→ actor head  → softmax(2)
//!                         (trunk)     └─→ critic head → value
//! ```
//!
//! The trunk output is consumed by both heads. During backprop each head
//! pushes its contribution into one trunk-gradient buffer, and only the
//! summed buffer continues down through the hidden layers.

use super::activation;
use super::env;
use super::tensor::Matrix;
use anyhow::{ensure, Context, Result};
use cartpole_protocol::{
    Action, Activation, Hyperparameters, LayerSnapshot, NetworkSnapshot, Observation, Policy,
    N_ACTIONS, OBS_DIM,
};
use rand::Rng;

pub const MAX_DEPTH: usize = 3;
const LOG_EPS: f64 = 1e-10;

/// Weight matrix (fan_in × fan_out) plus a 1 × fan_out bias.
#[derive(Debug, Clone, PartialEq)]
pub struct Dense {
    pub w: Matrix,
    pub b: Matrix,
}

impl Dense {
    /// Uniform ±sqrt(6 / fan_in) weights, zero biases.
    fn init(fan_in: usize, fan_out: usize, rng: &mut impl Rng) -> Self {
        let scale = (6.0 / fan_in as f64).sqrt();
        Dense {
            w: Matrix::from_fn(fan_in, fan_out, |_, _| rng.gen_range(-scale..scale)),
            b: Matrix::zeros(1, fan_out),
        }
    }

    fn zeros_like(&self) -> Self {
        Dense { w: Matrix::zeros_like(&self.w), b: Matrix::zeros_like(&self.b) }
    }

    fn fan_in(&self) -> usize {
        self.w.rows()
    }

    fn fan_out(&self) -> usize {
        self.w.cols()
    }

    fn snapshot(&self) -> LayerSnapshot {
        LayerSnapshot { weights: self.w.to_nested(), biases: self.b.as_slice().to_vec() }
    }

    fn from_snapshot(snap: &LayerSnapshot) -> Result<Self> {
        let w = Matrix::from_nested(&snap.weights)?;
        ensure!(
            snap.biases.len() == w.cols(),
            "{} biases for a layer with {} outputs",
            snap.biases.len(),
            w.cols()
        );
        Ok(Dense { w, b: Matrix::from_vec(1, snap.biases.len(), snap.biases.clone()) })
    }
}

fn dense_tensors(d: &Dense) -> [&Matrix; 2] {
    [&d.w, &d.b]
}

fn dense_tensors_mut(d: &mut Dense) -> [&mut Matrix; 2] {
    [&mut d.w, &mut d.b]
}

/// Gradient accumulators, shaped exactly like the network's parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct Gradients {
    pub hidden: Vec<Dense>,
    pub actor: Dense,
    pub critic: Dense,
}

impl Gradients {
    pub fn zeros_for(net: &ActorCritic) -> Self {
        Gradients {
            hidden: net.hidden.iter().map(Dense::zeros_like).collect(),
            actor: net.actor.zeros_like(),
            critic: net.critic.zeros_like(),
        }
    }

    /// Every tensor, in the same order as [`ActorCritic::parameters_mut`].
    pub fn tensors(&self) -> impl Iterator<Item = &Matrix> {
        self.hidden
            .iter()
            .chain([&self.actor, &self.critic])
            .flat_map(dense_tensors)
    }

    pub fn tensors_mut(&mut self) -> impl Iterator<Item = &mut Matrix> {
        self.hidden
            .iter_mut()
            .chain([&mut self.actor, &mut self.critic])
            .flat_map(dense_tensors_mut)
    }

    /// L2 norm over all tensors taken together.
    pub fn global_norm(&self) -> f64 {
        self.tensors().map(Matrix::sum_squares).sum::<f64>().sqrt()
    }

    pub fn scale(&mut self, k: f64) {
        for t in self.tensors_mut() {
            t.scale(k);
        }
    }

    /// Rescale so the global norm does not exceed `max_norm`.
    /// Returns the norm measured before clipping.
    pub fn clip_global_norm(&mut self, max_norm: f64) -> f64 {
        let norm = self.global_norm();
        if norm > max_norm {
            self.scale(max_norm / (norm + LOG_EPS));
        }
        norm
    }
}

/// Outputs of one forward pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Output {
    pub policy: Policy,
    pub value: f64,
}

/// Activations recorded by `forward`, consumed by the next `backward`.
#[derive(Debug, Clone)]
struct ForwardCache {
    input: Observation,
    /// z = xW + b per hidden layer
    pre: Vec<Vec<f64>>,
    /// a = act(z) per hidden layer
    post: Vec<Vec<f64>>,
    output: Output,
}

#[derive(Debug, Clone)]
pub struct ActorCritic {
    activation: Activation,
    hidden: Vec<Dense>,
    actor: Dense,
    critic: Dense,
    cache: Option<ForwardCache>,
}

impl ActorCritic {
    /// Build a network with one hidden layer per entry of `hidden_sizes`.
    pub fn new(hidden_sizes: &[usize], activation: Activation, rng: &mut impl Rng) -> Self {
        assert!(
            (1..=MAX_DEPTH).contains(&hidden_sizes.len()),
            "network needs 1..={MAX_DEPTH} hidden layers, got {}",
            hidden_sizes.len()
        );
        assert!(hidden_sizes.iter().all(|&h| h > 0), "hidden layers must be non-empty");

        let mut hidden = Vec::with_capacity(hidden_sizes.len());
        let mut prev = OBS_DIM;
        for &h in hidden_sizes {
            hidden.push(Dense::init(prev, h, rng));
            prev = h;
        }

        ActorCritic {
            activation,
            hidden,
            actor: Dense::init(prev, N_ACTIONS, rng),
            critic: Dense::init(prev, 1, rng),
            cache: None,
        }
    }

    pub fn from_hyperparameters(hp: &Hyperparameters, rng: &mut impl Rng) -> Self {
        Self::new(&vec![hp.hidden_size; hp.depth], hp.activation, rng)
    }

    pub fn activation(&self) -> Activation {
        self.activation
    }

    pub fn hidden_sizes(&self) -> Vec<usize> {
        self.hidden.iter().map(Dense::fan_out).collect()
    }

    pub fn n_params(&self) -> usize {
        self.hidden
            .iter()
            .chain([&self.actor, &self.critic])
            .map(|d| d.fan_in() * d.fan_out() + d.fan_out())
            .sum()
    }

    /// Format network architecture as string.
    pub fn arch_string(&self) -> String {
        let mut parts = vec![OBS_DIM.to_string()];
        parts.extend(self.hidden_sizes().iter().map(|h| h.to_string()));
        format!("{} → {} (actor) + 1 (critic)", parts.join(" → "), N_ACTIONS)
    }

    /// Parameter tensors in a fixed order: hidden (w, b)…, actor (w, b), critic (w, b).
    pub fn parameters(&self) -> impl Iterator<Item = &Matrix> {
        self.hidden
            .iter()
            .chain([&self.actor, &self.critic])
            .flat_map(dense_tensors)
    }

    pub fn parameters_mut(&mut self) -> impl Iterator<Item = &mut Matrix> {
        self.cache = None;
        self.hidden
            .iter_mut()
            .chain([&mut self.actor, &mut self.critic])
            .flat_map(dense_tensors_mut)
    }

    fn run(&self, state: &Observation) -> ForwardCache {
        let mut pre = Vec::with_capacity(self.hidden.len());
        let mut post = Vec::with_capacity(self.hidden.len());
        let mut x: Vec<f64> = state.to_vec();

        for layer in &self.hidden {
            let z = layer.w.affine(&x, &layer.b);
            let a: Vec<f64> = z.iter().map(|&v| activation::apply(self.activation, v)).collect();
            pre.push(z);
            post.push(a.clone());
            x = a;
        }

        let logits = self.actor.w.affine(&x, &self.actor.b);
        let value = self.critic.w.affine(&x, &self.critic.b)[0];

        ForwardCache {
            input: *state,
            pre,
            post,
            output: Output { policy: softmax(&[logits[0], logits[1]]), value },
        }
    }

    /// Forward pass. Caches activations for the next [`ActorCritic::backward`].
    pub fn forward(&mut self, state: &Observation) -> Output {
        let cache = self.run(state);
        let output = cache.output;
        self.cache = Some(cache);
        output
    }

    /// Forward pass that leaves the cache untouched.
    pub fn evaluate(&self, state: &Observation) -> Output {
        self.run(state).output
    }

    /// Accumulate parameter gradients for the input of the last `forward`.
    ///
    /// `d_logits` is dL/d(actor logits), `d_value` is dL/d(value).
    pub fn backward(&self, d_logits: &Policy, d_value: f64, grads: &mut Gradients) {
        let cache = self.cache.as_ref().expect("backward called without a preceding forward");
        let n_layers = self.hidden.len();
        let trunk = &cache.post[n_layers - 1];

        // Heads
        grads.actor.w.add_outer(trunk, d_logits);
        grads.actor.b.add_assign_slice(d_logits);
        grads.critic.w.add_outer(trunk, &[d_value]);
        grads.critic.b.add_assign_slice(&[d_value]);

        // Join: both heads feed one accumulation buffer.
        let mut delta = self.actor.w.mul_transposed(d_logits);
        for (d, c) in delta.iter_mut().zip(self.critic.w.mul_transposed(&[d_value])) {
            *d += c;
        }

        for layer_idx in (0..n_layers).rev() {
            let z = &cache.pre[layer_idx];
            for (d, &zj) in delta.iter_mut().zip(z) {
                *d *= activation::derivative(self.activation, zj);
            }

            let a_prev: &[f64] = if layer_idx > 0 { &cache.post[layer_idx - 1] } else { &cache.input };
            grads.hidden[layer_idx].w.add_outer(a_prev, &delta);
            grads.hidden[layer_idx].b.add_assign_slice(&delta);

            if layer_idx > 0 {
                delta = self.hidden[layer_idx].w.mul_transposed(&delta);
            }
        }
    }

    /// ε-random action, otherwise a sample from the policy.
    ///
    /// With `exploration == 0` this still samples; it never takes the argmax.
    pub fn select_action(&mut self, state: &Observation, exploration: f64, rng: &mut impl Rng) -> Action {
        let out = self.forward(state);
        explore_or_sample(&out.policy, exploration, rng)
    }

    /// Weight-magnitude saliency: |stateᵢ| · Σⱼ |W₁[i][j]|.
    ///
    /// A cheap proxy for how much each input can move the first layer. It
    /// ignores everything after the first layer, so it is not a gradient
    /// saliency.
    pub fn input_importance(&self, state: &Observation) -> Observation {
        let w = &self.hidden[0].w;
        let mut out = [0.0; OBS_DIM];
        for (i, o) in out.iter_mut().enumerate() {
            *o = state[i].abs() * w.row(i).iter().map(|v| v.abs()).sum::<f64>();
        }
        out
    }

    /// Critic value over a (position, angle) grid with zero velocities.
    ///
    /// `surface[i][j]` is the value at position step `i`, angle step `j`,
    /// sampled left-closed over the termination box.
    pub fn value_surface(&self, resolution: usize) -> Vec<Vec<f64>> {
        let n = resolution as f64;
        (0..resolution)
            .map(|i| {
                let x = -env::X_THRESHOLD + 2.0 * env::X_THRESHOLD * (i as f64 / n);
                (0..resolution)
                    .map(|j| {
                        let theta = -env::THETA_THRESHOLD + 2.0 * env::THETA_THRESHOLD * (j as f64 / n);
                        self.evaluate(&env::normalize(&[x, 0.0, theta, 0.0])).value
                    })
                    .collect()
            })
            .collect()
    }

    /// Mean |w| per layer, hidden layers first, then actor and critic heads.
    pub fn mean_abs_weight(&self) -> Vec<f64> {
        self.hidden
            .iter()
            .chain([&self.actor, &self.critic])
            .map(|d| d.w.mean_abs())
            .collect()
    }

    pub fn snapshot(&self) -> NetworkSnapshot {
        NetworkSnapshot {
            activation: self.activation,
            hidden: self.hidden.iter().map(Dense::snapshot).collect(),
            actor_head: self.actor.snapshot(),
            critic_head: self.critic.snapshot(),
        }
    }

    /// Rebuild a network, architecture included, from a snapshot.
    pub fn from_snapshot(snap: &NetworkSnapshot) -> Result<Self> {
        ensure!(
            (1..=MAX_DEPTH).contains(&snap.hidden.len()),
            "snapshot has {} hidden layers",
            snap.hidden.len()
        );
        let hidden = snap
            .hidden
            .iter()
            .enumerate()
            .map(|(i, l)| Dense::from_snapshot(l).with_context(|| format!("hidden layer {i}")))
            .collect::<Result<Vec<_>>>()?;
        let net = ActorCritic {
            activation: snap.activation,
            hidden,
            actor: Dense::from_snapshot(&snap.actor_head).context("actor head")?,
            critic: Dense::from_snapshot(&snap.critic_head).context("critic head")?,
            cache: None,
        };
        net.check_wiring()?;
        Ok(net)
    }

    /// Load parameters into this network. The snapshot must match the current shape
    /// and activation exactly.
    pub fn restore(&mut self, snap: &NetworkSnapshot) -> Result<()> {
        let restored = Self::from_snapshot(snap)?;
        ensure!(
            restored.activation == self.activation,
            "snapshot activation {} does not match network activation {}",
            restored.activation,
            self.activation
        );
        ensure!(
            restored.hidden_sizes() == self.hidden_sizes(),
            "snapshot layers {:?} do not match network layers {:?}",
            restored.hidden_sizes(),
            self.hidden_sizes()
        );
        *self = restored;
        Ok(())
    }

    fn check_wiring(&self) -> Result<()> {
        let mut prev = OBS_DIM;
        for (i, layer) in self.hidden.iter().enumerate() {
            ensure!(layer.fan_in() == prev, "hidden layer {i} expects {} inputs, got {prev}", layer.fan_in());
            prev = layer.fan_out();
        }
        ensure!(
            self.actor.w.shape() == (prev, N_ACTIONS),
            "actor head is {:?}, expected ({prev}, {N_ACTIONS})",
            self.actor.w.shape()
        );
        ensure!(
            self.critic.w.shape() == (prev, 1),
            "critic head is {:?}, expected ({prev}, 1)",
            self.critic.w.shape()
        );
        Ok(())
    }
}

/// Softmax with max subtraction.
pub fn softmax(logits: &Policy) -> Policy {
    let max_v = logits.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let mut out = [0.0; N_ACTIONS];
    let mut sum = 0.0;
    for (o, &l) in out.iter_mut().zip(logits) {
        *o = (l - max_v).exp();
        sum += *o;
    }
    for o in &mut out {
        *o /= sum;
    }
    out
}

/// H = −Σ p·ln(p + 1e-10).
pub fn entropy(policy: &[f64]) -> f64 {
    -policy.iter().map(|&p| p * (p + LOG_EPS).ln()).sum::<f64>()
}

/// Uniform random action with probability `exploration`, otherwise a policy sample.
pub fn explore_or_sample(policy: &Policy, exploration: f64, rng: &mut impl Rng) -> Action {
    if exploration > 0.0 && rng.gen::<f64>() < exploration {
        return if rng.gen_bool(0.5) { Action::Right } else { Action::Left };
    }
    sample_action(policy, rng.gen())
}

/// Inverse-CDF sample against a single uniform draw `u ∈ [0, 1)`.
pub fn sample_action(policy: &Policy, u: f64) -> Action {
    let mut cumsum = 0.0;
    for (i, &p) in policy.iter().enumerate() {
        cumsum += p;
        if u < cumsum {
            return Action::ALL[i];
        }
    }
    Action::ALL[N_ACTIONS - 1]
}
