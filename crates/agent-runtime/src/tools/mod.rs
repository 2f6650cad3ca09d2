pub mod registry;
pub mod responses;

use std::sync::Arc;

use futures::future::BoxFuture;
use serde::{
    Deserialize,
    Serialize,
};
use serde_json::Map;
use tokio_util::sync::CancellationToken;

use crate::model::types::Part;

pub type ToolFuture<T> = BoxFuture<'static, T>;

/// Callback tools invoke to surface live output while executing. Only the
/// most recent chunk is retained by the call record.
pub type LiveOutputFn = Arc<dyn Fn(String) + Send + Sync>;

/// Contract implemented by every tool the scheduler can drive.
///
/// Tool instances live in the registry for the process lifetime and are
/// shared by reference. The scheduler never invokes two methods on the same
/// instance concurrently, except `execute` on distinct calls.
pub trait Tool: Send + Sync {
    /// Stable name the model uses to call this tool.
    fn name(&self) -> &str;

    fn display_name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON schema for the tool's arguments.
    fn parameter_schema(&self) -> serde_json::Value;

    fn is_output_markdown(&self) -> bool {
        true
    }

    /// Whether the tool reports live output chunks during execution.
    fn can_stream_output(&self) -> bool {
        false
    }

    /// The MCP server this tool was discovered from, if any. Used for
    /// per-server approval memory and registry grouping.
    fn server_name(&self) -> Option<&str> {
        None
    }

    /// Cheap, synchronous argument validation. Returns an error message on
    /// rejection.
    fn validate_params(&self, args: &Map<String, serde_json::Value>) -> Option<String>;

    /// One-line description of what this invocation would do, shown in
    /// approval prompts.
    fn describe(&self, args: &Map<String, serde_json::Value>) -> String {
        serde_json::to_string(args).unwrap_or_default()
    }

    /// Whether this invocation needs user confirmation, and how to present
    /// it. May read the filesystem; must honor the cancellation token.
    fn should_confirm(
        &self,
        args: Map<String, serde_json::Value>,
        cancel_token: CancellationToken,
    ) -> ToolFuture<Result<Option<Confirmation>, ToolError>> {
        let _ = (args, cancel_token);
        Box::pin(async { Ok(None) })
    }

    /// Runs the tool. Must return promptly once the cancellation token
    /// fires; any cleanup is the tool's own responsibility.
    fn execute(
        &self,
        args: Map<String, serde_json::Value>,
        cancel_token: CancellationToken,
        live_output: Option<LiveOutputFn>,
    ) -> ToolFuture<Result<ToolOutput, ToolError>>;

    /// Support for the modify-in-editor approval flow.
    fn modify_context(&self) -> Option<Arc<dyn ModifyContext>> {
        None
    }
}

impl std::fmt::Debug for dyn Tool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tool").field("name", &self.name()).finish()
    }
}

/// Context a [Tool] exposes so the user can rework its proposed arguments in
/// an external editor while the call waits for approval.
pub trait ModifyContext: Send + Sync {
    /// The path the proposed change applies to.
    fn file_path(&self, args: &Map<String, serde_json::Value>) -> String;

    fn current_content(&self, args: Map<String, serde_json::Value>) -> ToolFuture<Result<String, ToolError>>;

    fn proposed_content(&self, args: Map<String, serde_json::Value>) -> ToolFuture<Result<String, ToolError>>;

    /// Rebuilds the call's arguments from the post-edit contents.
    fn updated_params(
        &self,
        old_content: &str,
        new_content: &str,
        args: &Map<String, serde_json::Value>,
    ) -> Map<String, serde_json::Value>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[serde(rename_all = "camelCase")]
pub enum ToolError {
    #[error("{0}")]
    Execution(String),
    #[error("the operation was cancelled")]
    Cancelled,
}

/// The result of a successful tool execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolOutput {
    /// Content fed back to the model.
    pub llm_content: LlmContent,
    /// Content shown to the user, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display: Option<DisplayOutput>,
}

impl ToolOutput {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            llm_content: LlmContent::Text(content.into()),
            display: None,
        }
    }

    pub fn with_display(mut self, display: DisplayOutput) -> Self {
        self.display = Some(display);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LlmContent {
    Text(String),
    Parts(Vec<Part>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DisplayOutput {
    Text(String),
    Diff(FileDiff),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileDiff {
    pub file_name: String,
    pub file_diff: String,
}

/// How a pending tool call should be presented for user approval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
#[serde(rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Confirmation {
    /// A file modification, presented with a diff.
    Edit { file_name: String, file_diff: String },
    /// A shell command execution.
    Exec { command: String, root_command: String },
    /// An MCP-discovered tool invocation.
    Mcp {
        server_name: String,
        tool_name: String,
        display_name: String,
    },
    /// A generic informational prompt.
    Info {
        prompt: String,
        #[serde(default)]
        urls: Vec<String>,
    },
}

impl Confirmation {
    pub fn is_edit(&self) -> bool {
        matches!(self, Confirmation::Edit { .. })
    }
}

/// The user's decision on a pending confirmation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum ConfirmationOutcome {
    /// Run this call only.
    ProceedOnce,
    /// Run this call and stop asking for every tool this session.
    ProceedAlways,
    /// Run this call and stop asking for tools from the same MCP server.
    ProceedAlwaysServer,
    /// Run this call and stop asking for this tool name.
    ProceedAlwaysTool,
    /// Open the proposed change in an external editor.
    ModifyWithEditor,
    /// Do not run this call.
    Cancel,
}

impl ConfirmationOutcome {
    pub fn approves(&self) -> bool {
        matches!(
            self,
            ConfirmationOutcome::ProceedOnce
                | ConfirmationOutcome::ProceedAlways
                | ConfirmationOutcome::ProceedAlwaysServer
                | ConfirmationOutcome::ProceedAlwaysTool
        )
    }
}
