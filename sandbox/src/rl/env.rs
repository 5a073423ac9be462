//! Cart-pole simulator and the reward shaping the trainer learns from.
//!
//! Mirrors gymnasium's CartPole-v1 dynamics in pure Rust. The simulator
//! owns its RNG so `reset` is reproducible from the seed alone; `step`
//! draws nothing.

use cartpole_protocol::{Action, Observation};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const GRAVITY: f64 = 9.8;
const CART_MASS: f64 = 1.0;
const POLE_MASS: f64 = 0.1;
const TOTAL_MASS: f64 = CART_MASS + POLE_MASS;
const POLE_HALF_LENGTH: f64 = 0.5;
const POLE_MASS_LENGTH: f64 = POLE_MASS * POLE_HALF_LENGTH;
const FORCE_MAG: f64 = 10.0;
const TAU: f64 = 0.02; // timestep

pub const X_THRESHOLD: f64 = 2.4;
pub const THETA_THRESHOLD: f64 = 12.0 * std::f64::consts::PI / 180.0;
pub const MAX_STEPS: usize = 500;

const RESET_SPREAD: f64 = 0.05;

/// Per-component scale that maps the interesting state range to about [-1, 1].
pub const STATE_SCALE: Observation = [2.4, 4.0, 0.21, 4.0];

const ANGLE_PENALTY: f64 = 0.05;
const POSITION_PENALTY: f64 = 0.001;
const FAILURE_REWARD: f64 = -1.0;

/// Result of a step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepResult {
    pub state: Observation,
    pub reward: f64,
    pub done: bool,
}

/// The simulator contract the agent drives.
pub trait Environment {
    /// Reset to an initial state, returns it.
    fn reset(&mut self) -> Observation;

    /// Advance one control step.
    fn step(&mut self, action: Action) -> StepResult;

    fn state(&self) -> Observation;

    /// Steps taken since the last reset.
    fn steps(&self) -> usize;
}

pub struct CartPole {
    state: Observation, // x, x_dot, theta, theta_dot
    step_count: usize,
    rng: StdRng,
    /// When set, `reset` returns this instead of a random perturbation.
    start_state: Option<Observation>,
}

impl CartPole {
    pub fn new(seed: u64) -> Self {
        let mut env = CartPole {
            state: [0.0; 4],
            step_count: 0,
            rng: StdRng::seed_from_u64(seed),
            start_state: None,
        };
        env.reset();
        env
    }

    /// Simulator that always restarts from `state`.
    pub fn with_start_state(state: Observation) -> Self {
        CartPole {
            state,
            step_count: 0,
            rng: StdRng::seed_from_u64(0),
            start_state: Some(state),
        }
    }

    /// Overwrite the state without touching the step counter.
    pub fn set_state(&mut self, state: Observation) {
        self.state = state;
    }

    fn is_terminal(&self) -> bool {
        let [x, _, theta, _] = self.state;
        x.abs() > X_THRESHOLD || theta.abs() > THETA_THRESHOLD || self.step_count >= MAX_STEPS
    }
}

impl Environment for CartPole {
    fn reset(&mut self) -> Observation {
        self.state = match self.start_state {
            Some(s) => s,
            None => {
                let mut draw = || self.rng.gen_range(-RESET_SPREAD..=RESET_SPREAD);
                [draw(), draw(), draw(), draw()]
            }
        };
        self.step_count = 0;
        self.state
    }

    fn step(&mut self, action: Action) -> StepResult {
        let force = match action {
            Action::Right => FORCE_MAG,
            Action::Left => -FORCE_MAG,
        };

        let [x, x_dot, theta, theta_dot] = self.state;
        let cos_theta = theta.cos();
        let sin_theta = theta.sin();

        let temp = (force + POLE_MASS_LENGTH * theta_dot * theta_dot * sin_theta) / TOTAL_MASS;
        let theta_acc = (GRAVITY * sin_theta - cos_theta * temp)
            / (POLE_HALF_LENGTH * (4.0 / 3.0 - POLE_MASS * cos_theta * cos_theta / TOTAL_MASS));
        let x_acc = temp - POLE_MASS_LENGTH * theta_acc * cos_theta / TOTAL_MASS;

        self.state = [
            x + TAU * x_dot,
            x_dot + TAU * x_acc,
            theta + TAU * theta_dot,
            theta_dot + TAU * theta_acc,
        ];
        self.step_count += 1;

        let done = self.is_terminal();
        StepResult {
            state: self.state,
            reward: if done { 0.0 } else { 1.0 },
            done,
        }
    }

    fn state(&self) -> Observation {
        self.state
    }

    fn steps(&self) -> usize {
        self.step_count
    }
}

/// Scale a raw state into the network's input range.
pub fn normalize(state: &Observation) -> Observation {
    let mut out = [0.0; 4];
    for i in 0..4 {
        out[i] = state[i] / STATE_SCALE[i];
    }
    out
}

/// Reward the trainer sees for landing in `state`.
///
/// The failure reward replaces the shaped value outright, so a failing
/// step near the boundary is penalized by both the shaping trend leading
/// into it and the flat -1.
pub fn shaped_reward(state: &Observation, done: bool) -> f64 {
    if done {
        return FAILURE_REWARD;
    }
    let [x, _, theta, _] = *state;
    1.0 - ANGLE_PENALTY * theta.abs() - POSITION_PENALTY * x.abs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_is_deterministic() {
        let start = [0.01, -0.02, 0.03, -0.04];
        let mut a = CartPole::with_start_state(start);
        let mut b = CartPole::with_start_state(start);
        a.reset();
        b.reset();
        for action in [Action::Left, Action::Right, Action::Right, Action::Left] {
            assert_eq!(a.step(action), b.step(action));
        }
    }

    #[test]
    fn test_reset_is_seeded_and_bounded() {
        let mut a = CartPole::new(7);
        let mut b = CartPole::new(7);
        for _ in 0..20 {
            let sa = a.reset();
            assert_eq!(sa, b.reset());
            assert!(sa.iter().all(|v| v.abs() <= RESET_SPREAD));
            assert_eq!(a.steps(), 0);
        }
    }

    #[test]
    fn test_push_direction() {
        let mut env = CartPole::with_start_state([0.0; 4]);
        let r = env.step(Action::Right);
        // Velocity picks up the push, pole tips the other way.
        assert!(r.state[1] > 0.0);
        assert!(r.state[3] < 0.0);
        let mut env = CartPole::with_start_state([0.0; 4]);
        let l = env.step(Action::Left);
        assert!(l.state[1] < 0.0);
        assert!(l.state[3] > 0.0);
    }

    #[test]
    fn test_done_on_position_and_angle() {
        let mut env = CartPole::with_start_state([0.0; 4]);
        env.reset();
        env.set_state([2.39, 1.0, 0.0, 0.0]);
        let r = env.step(Action::Right);
        assert!(r.state[0] > X_THRESHOLD);
        assert!(r.done);
        assert_eq!(r.reward, 0.0);

        env.reset();
        env.set_state([0.0, 0.0, -0.2094, -1.0]);
        let r = env.step(Action::Left);
        assert!(r.state[2] < -THETA_THRESHOLD);
        assert!(r.done);

        env.reset();
        let r = env.step(Action::Left);
        assert!(!r.done);
        assert_eq!(r.reward, 1.0);
    }

    #[test]
    fn test_done_at_step_limit() {
        let mut env = CartPole::with_start_state([0.0; 4]);
        env.reset();
        let mut last = None;
        for i in 0..MAX_STEPS {
            // Keep the pole near upright by holding it in place.
            env.set_state([0.0; 4]);
            let action = if i % 2 == 0 { Action::Left } else { Action::Right };
            last = Some(env.step(action));
            if i + 1 < MAX_STEPS {
                assert!(!last.unwrap().done, "terminated early at step {}", i + 1);
            }
        }
        assert!(last.unwrap().done);
        assert_eq!(env.steps(), MAX_STEPS);
    }

    #[test]
    fn test_shaped_reward() {
        assert_eq!(shaped_reward(&[0.0; 4], false), 1.0);
        let r = shaped_reward(&[-1.0, 3.0, 0.1, -2.0], false);
        assert!((r - (1.0 - 0.005 - 0.001)).abs() < 1e-12);
        assert_eq!(shaped_reward(&[0.0; 4], true), -1.0);
    }

    #[test]
    fn test_normalize() {
        let n = normalize(&[2.4, -4.0, 0.21, 2.0]);
        assert_eq!(n, [1.0, -1.0, 1.0, 0.5]);
    }
}
