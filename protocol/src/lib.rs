//! CartPole sandbox protocol
//!
//! Plain data types shared between the training core and whatever sits
//! around it: a renderer, a dashboard, a CLI, a persistence layer.
//!
//! ```text
//!  ┌──────────────┐  Command   ┌─────────┐
//!  │ collaborator │──────────► │ session │
//!  │ (UI, CLI…)   │◄────────── │ (core)  │
//!  └──────────────┘ SandboxEvent└─────────┘
//! ```
//!
//! Nothing here owns a wire format; every type is `serde`-derived so the
//! caller picks the encoding. Parameter snapshots are nested `f64`
//! sequences and round-trip exactly through any lossless encoding.

pub mod types;

pub use types::*;
