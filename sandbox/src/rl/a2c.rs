//! Advantage actor-critic trainer with GAE.
//!
//! One update per finished episode: recompute values, estimate
//! advantages, replay forward + backward for every step, clip the summed
//! gradient, average it over the episode and hand it to Adam.

use super::network::{entropy, ActorCritic, Gradients};
use super::optim::OptimizerSet;
use super::trajectory::Trajectory;
use cartpole_protocol::{Hyperparameters, Policy, UpdateDiagnostics, N_ACTIONS};
use rand::Rng;

const LOG_EPS: f64 = 1e-10;
const NORM_EPS: f64 = 1e-8;

pub const INITIAL_EXPLORATION: f64 = 0.2;
pub const EXPLORATION_DECAY: f64 = 0.998;
pub const MIN_EXPLORATION: f64 = 0.05;

/// GAE advantages and returns, before any normalization.
///
/// `values[t]` is V(s_t); the value past the last step is taken as 0.
pub fn compute_gae(rewards: &[f64], values: &[f64], gamma: f64, lambda: f64) -> (Vec<f64>, Vec<f64>) {
    assert_eq!(rewards.len(), values.len(), "one value per reward");
    let n = rewards.len();
    let mut advantages = vec![0.0; n];
    let mut returns = vec![0.0; n];
    let mut gae = 0.0;

    for t in (0..n).rev() {
        let next_value = if t + 1 < n { values[t + 1] } else { 0.0 };
        let delta = rewards[t] + gamma * next_value - values[t];
        gae = delta + gamma * lambda * gae;
        advantages[t] = gae;
        returns[t] = gae + values[t];
    }

    (advantages, returns)
}

/// Shift to zero mean and scale by the population std (+1e-8).
pub fn normalize_advantages(advantages: &[f64]) -> Vec<f64> {
    if advantages.is_empty() {
        return Vec::new();
    }
    let n = advantages.len() as f64;
    let mean = advantages.iter().sum::<f64>() / n;
    let std = (advantages.iter().map(|a| (a - mean).powi(2)).sum::<f64>() / n).sqrt();
    advantages.iter().map(|a| (a - mean) / (std + NORM_EPS)).collect()
}

/// dL/d(logits) for the actor loss −ln π(a)·A − β·H.
pub fn actor_logit_grad(policy: &Policy, action: usize, advantage: f64, entropy_coef: f64) -> Policy {
    let h = entropy(policy);
    let mut g = *policy;
    g[action] -= 1.0;
    for i in 0..N_ACTIONS {
        g[i] *= advantage;
        g[i] += entropy_coef * policy[i] * ((policy[i] + LOG_EPS).ln() + h);
    }
    g
}

/// ε-greedy rate, decayed once per trained episode.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExplorationSchedule {
    rate: f64,
    initial: f64,
    decay: f64,
    floor: f64,
}

impl Default for ExplorationSchedule {
    fn default() -> Self {
        Self::new(INITIAL_EXPLORATION, EXPLORATION_DECAY, MIN_EXPLORATION)
    }
}

impl ExplorationSchedule {
    pub fn new(initial: f64, decay: f64, floor: f64) -> Self {
        ExplorationSchedule { rate: initial, initial, decay, floor }
    }

    /// A schedule that never moves off `rate`.
    pub fn frozen(rate: f64) -> Self {
        Self::new(rate, 1.0, rate)
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn step(&mut self) {
        self.rate = (self.rate * self.decay).max(self.floor);
    }

    pub fn reset(&mut self) {
        self.rate = self.initial;
    }
}

pub struct Trainer {
    network: ActorCritic,
    optimizers: OptimizerSet,
    hyper: Hyperparameters,
    exploration: ExplorationSchedule,
    /// Learning rate before decay; replaced by live changes.
    base_lr: f64,
    updates: usize,
}

impl Trainer {
    pub fn new(hyper: Hyperparameters, rng: &mut impl Rng) -> Self {
        let network = ActorCritic::from_hyperparameters(&hyper, rng);
        Self::with_network(network, hyper)
    }

    /// Wrap an existing network. Optimizer state starts fresh.
    pub fn with_network(network: ActorCritic, hyper: Hyperparameters) -> Self {
        let optimizers = OptimizerSet::for_network(&network, hyper.learning_rate);
        Trainer {
            network,
            optimizers,
            base_lr: hyper.learning_rate,
            hyper,
            exploration: ExplorationSchedule::default(),
            updates: 0,
        }
    }

    pub fn with_exploration(mut self, schedule: ExplorationSchedule) -> Self {
        self.exploration = schedule;
        self
    }

    pub fn network(&self) -> &ActorCritic {
        &self.network
    }

    pub fn network_mut(&mut self) -> &mut ActorCritic {
        &mut self.network
    }

    pub fn hyperparameters(&self) -> &Hyperparameters {
        &self.hyper
    }

    pub fn exploration(&self) -> f64 {
        self.exploration.rate()
    }

    pub fn decay_exploration(&mut self) {
        self.exploration.step();
    }

    /// Number of updates applied since construction or the last reinitialization.
    pub fn updates(&self) -> usize {
        self.updates
    }

    pub fn learning_rate(&self) -> f64 {
        self.optimizers.learning_rate()
    }

    /// Live learning-rate change; takes effect on every optimizer now.
    pub fn set_learning_rate(&mut self, lr: f64) {
        self.base_lr = lr;
        self.hyper.learning_rate = lr;
        self.optimizers.set_learning_rate(lr);
    }

    /// Fresh network and optimizers, exploration back to its start.
    pub fn reinitialize(&mut self, rng: &mut impl Rng) {
        self.network = ActorCritic::from_hyperparameters(&self.hyper, rng);
        self.optimizers = OptimizerSet::for_network(&self.network, self.base_lr);
        self.exploration.reset();
        self.updates = 0;
    }

    /// Run one A2C update over a finished episode.
    ///
    /// Returns `None` without touching any state when the trajectory is empty.
    pub fn train_episode(&mut self, trajectory: &Trajectory) -> Option<UpdateDiagnostics> {
        if trajectory.is_empty() {
            return None;
        }
        let hp = &self.hyper;
        let n = trajectory.len();

        let values: Vec<f64> = trajectory.iter().map(|t| self.network.forward(&t.state).value).collect();
        let (advantages, returns) = compute_gae(&trajectory.rewards(), &values, hp.discount, hp.gae_lambda);
        let normalized = normalize_advantages(&advantages);

        let mut grads = Gradients::zeros_for(&self.network);
        let mut actor_loss = 0.0;
        let mut critic_loss = 0.0;

        for (t, step) in trajectory.iter().enumerate() {
            let out = self.network.forward(&step.state);
            let a = step.action.index();
            let adv = normalized[t];
            let h = entropy(&out.policy);

            actor_loss += -(out.policy[a] + LOG_EPS).ln() * adv - hp.entropy_coef * h;
            critic_loss += hp.value_coef * (out.value - returns[t]).powi(2);

            let d_logits = actor_logit_grad(&out.policy, a, adv, hp.entropy_coef);
            let d_value = 2.0 * hp.value_coef * (out.value - returns[t]);
            self.network.backward(&d_logits, d_value, &mut grads);
        }

        let grad_norm = grads.clip_global_norm(hp.max_grad_norm);
        grads.scale(1.0 / n as f64);

        let lr = self.base_lr * hp.lr_decay.powi(self.updates as i32);
        self.optimizers.set_learning_rate(lr);
        for ((param, grad), opt) in self
            .network
            .parameters_mut()
            .zip(grads.tensors())
            .zip(self.optimizers.iter_mut())
        {
            opt.update(param, grad);
        }
        self.updates += 1;

        let steps = n as f64;
        let diagnostics = UpdateDiagnostics {
            grad_norm,
            avg_advantage: advantages.iter().sum::<f64>() / steps,
            avg_return: returns.iter().sum::<f64>() / steps,
            mean_actor_loss: actor_loss / steps,
            mean_critic_loss: critic_loss / steps,
        };
        tracing::debug!(steps = n, lr, grad_norm, critic_loss = diagnostics.mean_critic_loss, "A2C update");
        Some(diagnostics)
    }
}
