//! Episode driver: simulator + trainer + the bookkeeping between them.

use super::a2c::{ExplorationSchedule, Trainer};
use super::env::{self, CartPole, Environment};
use super::history::SurvivalHistory;
use super::network::{explore_or_sample, ActorCritic};
use super::trajectory::Trajectory;
use crate::config::validate_hyperparameters;
use anyhow::{Context, Result};
use cartpole_protocol::{
    Action, EpisodeSummary, Hyperparameters, Observation, SavedModel, StepReport, UpdateDiagnostics,
};
use chrono::Utc;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const LOG_INTERVAL: usize = 10;
const AVG_WINDOW: usize = 10;

/// Where the action for a step comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepSource {
    /// Sample from the policy with the current exploration rate.
    Explore,
    /// Sample from the policy with no ε-random actions.
    Evaluate,
    /// Caller-supplied action. Nothing is recorded for training.
    Manual(Action),
}

pub struct Agent {
    env: CartPole,
    trainer: Trainer,
    rng: StdRng,
    trajectory: Trajectory,
    history: SurvivalHistory,
    episode: usize,
    episode_reward: f64,
    done: bool,
    last_diagnostics: Option<UpdateDiagnostics>,
}

impl Agent {
    /// Agent whose network, resets and sampling all derive from `seed`.
    pub fn new(hyper: Hyperparameters, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let env = CartPole::new(rng.gen());
        Self::assemble(env, hyper, rng)
    }

    /// Agent whose simulator restarts from `start` every episode.
    pub fn with_start_state(hyper: Hyperparameters, seed: u64, start: Observation) -> Self {
        Self::assemble(CartPole::with_start_state(start), hyper, StdRng::seed_from_u64(seed))
    }

    fn assemble(env: CartPole, hyper: Hyperparameters, mut rng: StdRng) -> Self {
        let trainer = Trainer::new(hyper, &mut rng);
        Agent {
            env,
            trainer,
            rng,
            trajectory: Trajectory::new(),
            history: SurvivalHistory::default(),
            episode: 0,
            episode_reward: 0.0,
            done: false,
            last_diagnostics: None,
        }
    }

    pub fn with_exploration(mut self, schedule: ExplorationSchedule) -> Self {
        self.trainer = self.trainer.with_exploration(schedule);
        self
    }

    pub fn trainer(&self) -> &Trainer {
        &self.trainer
    }

    pub fn network(&self) -> &ActorCritic {
        self.trainer.network()
    }

    pub fn history(&self) -> &SurvivalHistory {
        &self.history
    }

    /// Episodes finished so far.
    pub fn episode(&self) -> usize {
        self.episode
    }

    pub fn exploration(&self) -> f64 {
        self.trainer.exploration()
    }

    pub fn state(&self) -> Observation {
        self.env.state()
    }

    /// True once the current episode has hit a terminal state.
    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn last_diagnostics(&self) -> Option<UpdateDiagnostics> {
        self.last_diagnostics
    }

    pub fn set_learning_rate(&mut self, lr: f64) {
        self.trainer.set_learning_rate(lr);
    }

    pub fn begin_episode(&mut self) {
        self.env.reset();
        self.trajectory.clear();
        self.episode_reward = 0.0;
        self.done = false;
    }

    /// Advance the current episode by one control step.
    pub fn step(&mut self, source: StepSource) -> StepReport {
        let input = env::normalize(&self.env.state());
        let exploration = self.trainer.exploration();
        let out = self.trainer.network_mut().forward(&input);

        let action = match source {
            StepSource::Explore => explore_or_sample(&out.policy, exploration, &mut self.rng),
            StepSource::Evaluate => explore_or_sample(&out.policy, 0.0, &mut self.rng),
            StepSource::Manual(a) => a,
        };

        let result = self.env.step(action);
        let shaped = env::shaped_reward(&result.state, result.done);
        if !matches!(source, StepSource::Manual(_)) {
            self.trajectory.push(input, action, shaped);
        }
        self.episode_reward += shaped;
        self.done = result.done;

        StepReport {
            episode: self.episode,
            step: self.env.steps(),
            raw_state: result.state,
            normalized_state: input,
            action,
            raw_reward: result.reward,
            shaped_reward: shaped,
            policy: out.policy,
            value: out.value,
            done: result.done,
        }
    }

    /// Close the current episode, training on it when `train` is set.
    pub fn finish_episode(&mut self, train: bool) -> EpisodeSummary {
        let mut diagnostics = None;
        if train && !self.trajectory.is_empty() {
            diagnostics = self.trainer.train_episode(&self.trajectory);
            self.trainer.decay_exploration();
            if diagnostics.is_some() {
                self.last_diagnostics = diagnostics;
            }
        }

        let steps = self.env.steps();
        self.episode += 1;
        self.history.push(steps, self.trainer.exploration());
        let avg_survival = self.history.mean_recent(AVG_WINDOW);

        if self.episode % LOG_INTERVAL == 0 {
            tracing::info!(
                episode = self.episode,
                avg_survival = format!("{avg_survival:.1}"),
                exploration = format!("{:.3}", self.trainer.exploration()),
                grad_norm = ?self.last_diagnostics.map(|d| d.grad_norm),
                "Training progress"
            );
        }

        EpisodeSummary {
            episode: self.episode,
            steps,
            total_reward: self.episode_reward,
            exploration: self.trainer.exploration(),
            avg_survival,
            diagnostics,
        }
    }

    /// Play a whole episode without interruption.
    pub fn run_episode(&mut self, source: StepSource, train: bool) -> EpisodeSummary {
        self.begin_episode();
        while !self.done {
            self.step(source);
        }
        self.finish_episode(train)
    }

    /// Start over: fresh network and optimizers, cleared history and counters.
    pub fn reset_policy(&mut self) {
        self.trainer.reinitialize(&mut self.rng);
        self.history.clear();
        self.episode = 0;
        self.last_diagnostics = None;
        self.begin_episode();
    }

    pub fn saved_model(&self) -> SavedModel {
        SavedModel {
            episode: self.episode,
            saved_at: Utc::now(),
            hyperparameters: self.trainer.hyperparameters().clone(),
            network: self.network().snapshot(),
        }
    }

    /// Swap in a saved network. Optimizer moments and exploration start fresh.
    pub fn load_model(&mut self, model: &SavedModel) -> Result<()> {
        validate_hyperparameters(&model.hyperparameters).context("Invalid saved hyperparameters")?;
        let mut network = ActorCritic::from_hyperparameters(&model.hyperparameters, &mut self.rng);
        network
            .restore(&model.network)
            .context("Saved network does not match its hyperparameters")?;
        self.trainer = Trainer::with_network(network, model.hyperparameters.clone());
        self.episode = model.episode;
        self.history.clear();
        self.last_diagnostics = None;
        self.begin_episode();
        Ok(())
    }
}
