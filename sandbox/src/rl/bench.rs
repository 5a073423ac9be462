//! Headless learning benchmark: independent seeded training runs in parallel.

use super::a2c::ExplorationSchedule;
use super::agent::{Agent, StepSource};
use cartpole_protocol::{Hyperparameters, Observation};
use rayon::prelude::*;
use std::time::Instant;

/// Episodes averaged at each end of a survival curve.
pub const WINDOW: usize = 10;

#[derive(Debug, Clone)]
pub struct BenchConfig {
    pub hyper: Hyperparameters,
    pub seeds: Vec<u64>,
    pub episodes: usize,
    /// Freeze exploration at this rate; `None` uses the decaying schedule.
    pub exploration: Option<f64>,
    /// Restart every episode from this state instead of a random perturbation.
    pub start_state: Option<Observation>,
}

impl Default for BenchConfig {
    fn default() -> Self {
        BenchConfig {
            hyper: Hyperparameters::default(),
            seeds: (0..4).collect(),
            episodes: 200,
            exploration: Some(0.0),
            start_state: Some([0.0; 4]),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunResult {
    pub seed: u64,
    /// Steps survived per episode, in order.
    pub survival: Vec<usize>,
    pub elapsed_secs: f64,
}

impl RunResult {
    pub fn first_mean(&self) -> f64 {
        window_mean(self.survival.iter().take(WINDOW))
    }

    pub fn last_mean(&self) -> f64 {
        window_mean(self.survival.iter().rev().take(WINDOW))
    }

    pub fn best(&self) -> usize {
        self.survival.iter().copied().max().unwrap_or(0)
    }
}

#[derive(Debug)]
pub struct BenchResult {
    pub runs: Vec<RunResult>,
    pub elapsed_secs: f64,
}

impl BenchResult {
    /// First-window survival averaged over every run.
    pub fn mean_first(&self) -> f64 {
        self.mean_of(RunResult::first_mean)
    }

    /// Last-window survival averaged over every run.
    pub fn mean_last(&self) -> f64 {
        self.mean_of(RunResult::last_mean)
    }

    pub fn improved(&self) -> bool {
        self.mean_last() > self.mean_first()
    }

    fn mean_of(&self, f: impl Fn(&RunResult) -> f64) -> f64 {
        if self.runs.is_empty() {
            return 0.0;
        }
        self.runs.iter().map(f).sum::<f64>() / self.runs.len() as f64
    }
}

fn window_mean<'a>(it: impl Iterator<Item = &'a usize>) -> f64 {
    let (sum, n) = it.fold((0usize, 0usize), |(s, n), &v| (s + v, n + 1));
    if n == 0 {
        0.0
    } else {
        sum as f64 / n as f64
    }
}

/// Train one agent for `cfg.episodes` episodes and record its survival.
pub fn survival_curve(cfg: &BenchConfig, seed: u64) -> RunResult {
    let start = Instant::now();
    let mut agent = match cfg.start_state {
        Some(s) => Agent::with_start_state(cfg.hyper.clone(), seed, s),
        None => Agent::new(cfg.hyper.clone(), seed),
    };
    if let Some(rate) = cfg.exploration {
        agent = agent.with_exploration(ExplorationSchedule::frozen(rate));
    }

    let survival = (0..cfg.episodes)
        .map(|_| agent.run_episode(StepSource::Explore, true).steps)
        .collect();

    RunResult { seed, survival, elapsed_secs: start.elapsed().as_secs_f64() }
}

/// One run per seed, spread over the rayon pool. Results keep seed order.
pub fn run(cfg: &BenchConfig) -> BenchResult {
    let start = Instant::now();
    tracing::info!(
        seeds = cfg.seeds.len(),
        episodes = cfg.episodes,
        hidden = cfg.hyper.hidden_size,
        depth = cfg.hyper.depth,
        activation = %cfg.hyper.activation,
        "Starting benchmark"
    );

    let runs: Vec<RunResult> = cfg.seeds.par_iter().map(|&seed| survival_curve(cfg, seed)).collect();

    BenchResult { runs, elapsed_secs: start.elapsed().as_secs_f64() }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small() -> BenchConfig {
        BenchConfig { seeds: vec![1, 2, 3], episodes: 6, ..Default::default() }
    }

    #[test]
    fn test_runs_are_reproducible() {
        let cfg = small();
        let a = run(&cfg);
        let b = run(&cfg);
        assert_eq!(a.runs.len(), 3);
        for (x, y) in a.runs.iter().zip(&b.runs) {
            assert_eq!(x.seed, y.seed);
            assert_eq!(x.survival, y.survival);
            assert_eq!(x.survival.len(), 6);
        }
        assert_eq!(a.runs.iter().map(|r| r.seed).collect::<Vec<_>>(), vec![1, 2, 3]);
    }

    #[test]
    fn test_parallel_matches_sequential() {
        let cfg = small();
        let par = run(&cfg);
        let seq = survival_curve(&cfg, 2);
        assert_eq!(par.runs[1].survival, seq.survival);
    }

    #[test]
    fn test_window_means() {
        let r = RunResult { seed: 0, survival: (1..=25).collect(), elapsed_secs: 0.0 };
        assert_eq!(r.first_mean(), 5.5);
        assert_eq!(r.last_mean(), 20.5);
        assert_eq!(r.best(), 25);

        let short = RunResult { seed: 0, survival: vec![4, 8], elapsed_secs: 0.0 };
        assert_eq!(short.first_mean(), 6.0);
        assert_eq!(short.last_mean(), 6.0);
    }
}
