//! Input routing and the external collaborator seams the scheduler talks to
//! during a turn.

use futures::future::BoxFuture;
use serde_json::Map;
use tokio_util::sync::CancellationToken;

use super::consts::SHELL_MODE_SENTINEL;
use crate::model::types::Part;

/// What a delegated slash command asked the scheduler to do.
#[derive(Debug, Clone)]
pub enum CommandOutcome {
    /// The command consumed the input; nothing reaches the model.
    Handled,
    /// Synthesize a single client-initiated tool call.
    ScheduleTool {
        tool_name: String,
        args: Map<String, serde_json::Value>,
    },
    /// Not a known command; treat the input as ordinary model input.
    NotHandled,
}

/// Handles input beginning with `/` or `?`.
pub trait CommandProcessor: Send + Sync {
    fn process(&self, input: &str, cancel_token: CancellationToken) -> BoxFuture<'static, eyre::Result<CommandOutcome>>;
}

/// Expands `@path` references into a composite query.
pub trait AtCommandProcessor: Send + Sync {
    fn expand(&self, input: &str, cancel_token: CancellationToken) -> BoxFuture<'static, eyre::Result<Vec<Part>>>;
}

/// Handles shell-mode input; the turn ends once it returns.
pub trait ShellProcessor: Send + Sync {
    fn run(&self, input: &str, cancel_token: CancellationToken) -> BoxFuture<'static, eyre::Result<()>>;
}

/// Signalled after a successful `save_memory` call, at most once per call.
pub trait MemoryRefresh: Send + Sync {
    fn refresh(&self) -> BoxFuture<'static, ()>;
}

/// Black-box pre-processor that repairs fuzzy replacement arguments before a
/// `replace` call is scheduled.
pub trait EditCorrector: Send + Sync {
    fn correct(
        &self,
        args: Map<String, serde_json::Value>,
        cancel_token: CancellationToken,
    ) -> BoxFuture<'static, Map<String, serde_json::Value>>;
}

/// Notified on unauthorized errors from the model; the scheduler appends no
/// error text itself.
pub trait AuthHandler: Send + Sync {
    fn on_auth_error(&self, message: String) -> BoxFuture<'static, ()>;
}

/// Classification of one raw user input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch<'a> {
    /// `/command` or `?command`, delegated to the command processor.
    SlashCommand(&'a str),
    /// `!command` while shell mode is active.
    Shell(&'a str),
    /// Contains an `@path` reference to expand.
    AtCommand(&'a str),
    /// Ordinary model input.
    Plain(&'a str),
}

/// Routes a raw query per the dispatch rules. Shell routing only applies
/// while shell mode is active.
pub fn route(input: &str, shell_mode_active: bool) -> Dispatch<'_> {
    let trimmed = input.trim_start();
    if trimmed.starts_with('/') || trimmed.starts_with('?') {
        return Dispatch::SlashCommand(trimmed);
    }
    if shell_mode_active {
        if let Some(rest) = trimmed.strip_prefix(SHELL_MODE_SENTINEL) {
            return Dispatch::Shell(rest);
        }
    }
    if input.contains('@') && input.split('@').nth(1).is_some_and(|rest| !rest.is_empty()) {
        return Dispatch::AtCommand(input);
    }
    Dispatch::Plain(input)
}
