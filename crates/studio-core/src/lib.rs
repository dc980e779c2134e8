//! # studio-core
//!
//! Shared types for the studio backend: the agent event unions, id
//! generation, and the tracing subscriber setup.

pub mod events;
pub mod ids;
pub mod logging;
pub mod status;
