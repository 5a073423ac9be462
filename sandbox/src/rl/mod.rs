//! On-line actor-critic learning for the cart-pole task.
//!
//! Architecture:
//! - `env`: simulator + reward shaping
//! - `network`: actor-critic MLP with manual backprop
//! - `optim`: per-tensor Adam
//! - `a2c`: GAE, the per-episode update and the exploration schedule
//! - `agent`: episode driver tying the pieces together
//! - `bench`: seeded headless training runs

pub mod a2c;
pub mod activation;
pub mod agent;
pub mod bench;
pub mod env;
pub mod history;
pub mod network;
pub mod optim;
pub mod tensor;
pub mod trajectory;
