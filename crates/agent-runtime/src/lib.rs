//! Session-scoped agent runtime.
//!
//! Sits between an interactive user surface and a streaming model backend:
//! it drives one user turn at a time, interprets model-issued tool calls,
//! gates side-effecting actions on user approval, executes tools in
//! parallel with live output, feeds results back to the model until it
//! yields the turn, and keeps the conversation history bounded through
//! compression.
//!
//! The entry point is [runtime::Scheduler]; spawn it to get a
//! [runtime::SchedulerHandle] for submitting turns and receiving events.

pub mod model;
pub mod runtime;
pub mod session;
pub mod tools;
pub mod util;

pub use model::{
    MockModel,
    Model,
    ModelRequest,
};
pub use runtime::protocol::{
    SchedulerError,
    SchedulerEvent,
};
pub use runtime::{
    Collaborators,
    Scheduler,
    SchedulerConfig,
    SchedulerHandle,
};
pub use session::{
    ChatSession,
    ChatSessionConfig,
};
pub use tools::registry::ToolRegistry;
pub use tools::{
    Confirmation,
    ConfirmationOutcome,
    Tool,
};
