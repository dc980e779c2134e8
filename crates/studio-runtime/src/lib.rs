//! # studio-runtime
//!
//! The agent session orchestration core: subprocess supervision, per-reply
//! event fan-out, transcript accumulation, tool display filtering, plan
//! projection, and the facade tying them together.
//!
//! Data flow: an authenticated `send` spawns an agent subprocess and returns
//! a hub subscription; the agent posts event batches back over HTTP; each
//! batch runs Accumulator → Projector → Hub → Broadcast under a per-reply
//! lock; the finished signal (or an interrupt, or the child dying) closes
//! the stream with exactly one terminal event.

pub mod accumulator;
pub mod broadcast_sink;
pub mod errors;
pub mod hub;
pub mod orchestrator;
pub mod parser;
pub mod projector;
pub mod settings;
pub mod supervisor;
pub mod tool_filter;

pub use accumulator::TranscriptAccumulator;
pub use broadcast_sink::{BroadcastSink, NullBroadcastSink};
pub use errors::{Result, RuntimeError};
pub use hub::{CloseReason, FanoutHub, Subscription};
pub use orchestrator::{ChatOrchestrator, SendOutcome, SendRequest};
pub use projector::PlanProjector;
pub use settings::{load_settings_from_path, AgentMode, AgentSettings, SettingsError};
pub use supervisor::{AgentSupervisor, ExitNotice, SpawnParams};
pub use tool_filter::ToolDisplayFilter;
