use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Number of state components the simulator exposes.
pub const OBS_DIM: usize = 4;
/// Number of discrete actions.
pub const N_ACTIONS: usize = 2;

/// Cart-pole state: position, velocity, angle, angular velocity.
pub type Observation = [f64; OBS_DIM];
/// Probability per action, indexed by [`Action::index`].
pub type Policy = [f64; N_ACTIONS];

/// Push direction applied to the cart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Left,
    Right,
}

impl Action {
    pub const ALL: [Action; N_ACTIONS] = [Action::Left, Action::Right];

    pub fn index(self) -> usize {
        match self {
            Action::Left => 0,
            Action::Right => 1,
        }
    }

    pub fn from_index(i: usize) -> Option<Self> {
        Self::ALL.get(i).copied()
    }
}

impl FromStr for Action {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "left" | "l" | "0" => Ok(Action::Left),
            "right" | "r" | "1" => Ok(Action::Right),
            other => anyhow::bail!("unknown action '{other}' (expected left or right)"),
        }
    }
}

/// Hidden-layer nonlinearity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    #[default]
    Relu,
    Tanh,
    Elu,
    /// Sigmoid-gated linear unit, x·σ(x).
    Swish,
}

impl FromStr for Activation {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "relu" => Ok(Activation::Relu),
            "tanh" => Ok(Activation::Tanh),
            "elu" => Ok(Activation::Elu),
            "swish" | "silu" => Ok(Activation::Swish),
            other => anyhow::bail!("unknown activation '{other}' (expected relu, tanh, elu or swish)"),
        }
    }
}

impl fmt::Display for Activation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Activation::Relu => "relu",
            Activation::Tanh => "tanh",
            Activation::Elu => "elu",
            Activation::Swish => "swish",
        };
        f.write_str(name)
    }
}

/// Which control loop is active. Exactly one at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Idle,
    Training,
    Testing,
    Manual,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Mode::Idle => "IDLE",
            Mode::Training => "TRAINING",
            Mode::Testing => "TESTING",
            Mode::Manual => "MANUAL",
        };
        f.write_str(name)
    }
}

/// Training hyperparameters supplied by the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Hyperparameters {
    pub learning_rate: f64,
    /// Discount factor γ.
    pub discount: f64,
    pub entropy_coef: f64,
    pub value_coef: f64,
    pub max_grad_norm: f64,
    /// GAE λ.
    pub gae_lambda: f64,
    /// Width of every hidden layer.
    pub hidden_size: usize,
    /// Number of hidden layers (1–3).
    pub depth: usize,
    pub activation: Activation,
    /// Per-episode multiplicative learning-rate decay; 1.0 disables it.
    pub lr_decay: f64,
}

impl Default for Hyperparameters {
    fn default() -> Self {
        Self {
            learning_rate: 0.003,
            discount: 0.99,
            entropy_coef: 0.02,
            value_coef: 0.5,
            max_grad_norm: 1.0,
            gae_lambda: 0.95,
            hidden_size: 32,
            depth: 2,
            activation: Activation::Relu,
            lr_decay: 1.0,
        }
    }
}

/// Per-update training health, produced once per trained episode.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateDiagnostics {
    /// Global gradient norm before clipping.
    pub grad_norm: f64,
    /// Mean of the raw (un-normalized) advantages.
    pub avg_advantage: f64,
    pub avg_return: f64,
    pub mean_actor_loss: f64,
    pub mean_critic_loss: f64,
}

/// One dense layer as plain nested sequences, `weights[fan_in][fan_out]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerSnapshot {
    pub weights: Vec<Vec<f64>>,
    pub biases: Vec<f64>,
}

/// Every network parameter, in a shape-agnostic form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkSnapshot {
    pub activation: Activation,
    pub hidden: Vec<LayerSnapshot>,
    pub actor_head: LayerSnapshot,
    pub critic_head: LayerSnapshot,
}

/// A snapshot plus the context needed to rebuild the trainer around it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SavedModel {
    pub episode: usize,
    pub saved_at: DateTime<Utc>,
    pub hyperparameters: Hyperparameters,
    pub network: NetworkSnapshot,
}

/// Everything observable about a single environment step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepReport {
    pub episode: usize,
    pub step: usize,
    /// Simulator state after the step.
    pub raw_state: Observation,
    /// Network input the action was chosen from.
    pub normalized_state: Observation,
    pub action: Action,
    pub raw_reward: f64,
    pub shaped_reward: f64,
    pub policy: Policy,
    pub value: f64,
    pub done: bool,
}

/// Summary emitted when an episode ends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EpisodeSummary {
    pub episode: usize,
    pub steps: usize,
    pub total_reward: f64,
    /// Exploration rate after this episode.
    pub exploration: f64,
    /// Mean survival over the most recent episodes (up to 10).
    pub avg_survival: f64,
    pub diagnostics: Option<UpdateDiagnostics>,
}

/// Inputs accepted by the control session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Command {
    SetMode { mode: Mode },
    TogglePause,
    ManualAction { action: Action },
    SetLearningRate { lr: f64 },
    /// Training speed multiplier, 1–10.
    SetSpeed { speed: u32 },
    ResetPolicy,
    Shutdown,
}

/// Outputs emitted by the control session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SandboxEvent {
    ModeChanged { from: Mode, to: Mode },
    Paused { paused: bool },
    Step(StepReport),
    EpisodeFinished(EpisodeSummary),
    LearningRateChanged { lr: f64 },
    PolicyReset,
    /// A command that was refused in the current mode.
    Rejected { reason: String },
}
