//! CartPole actor-critic sandbox.
//!
//! - [`rl`]: simulator, network, optimizer and trainer
//! - [`session`]: the interactive mode state machine
//! - [`config`]: file-backed configuration and validation

pub mod config;
pub mod rl;
pub mod session;
