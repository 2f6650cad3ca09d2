//! Per-call state machine and batch bookkeeping for model-requested tool
//! calls.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde::{
    Deserialize,
    Serialize,
};
use tracing::warn;

use super::protocol::SchedulerError;
use crate::model::demux::FunctionCallInfo;
use crate::model::types::Part;
use crate::tools::responses::{
    cancelled_part,
    convert_to_function_response,
    error_part,
};
use crate::tools::{
    Confirmation,
    ConfirmationOutcome,
    DisplayOutput,
    Tool,
    ToolOutput,
};

/// Session-wide policy controlling whether confirmation prompts are shown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum ApprovalMode {
    #[default]
    Default,
    /// Edit confirmations are auto-approved; everything else still asks.
    AutoEdit,
    /// All confirmations are suppressed.
    Yolo,
}

/// Remembered "always proceed" decisions, scoped per session, per MCP
/// server, and per tool name.
#[derive(Debug, Clone, Default)]
pub struct ApprovalMemory {
    session_wide: bool,
    servers: HashSet<String>,
    tools: HashSet<String>,
}

impl ApprovalMemory {
    pub fn covers(&self, tool_name: &str, server: Option<&str>) -> bool {
        if self.session_wide || self.tools.contains(tool_name) {
            return true;
        }
        server.is_some_and(|s| self.servers.contains(s))
    }

    pub fn remember(&mut self, outcome: ConfirmationOutcome, tool_name: &str, server: Option<&str>) {
        match outcome {
            ConfirmationOutcome::ProceedAlways => self.session_wide = true,
            ConfirmationOutcome::ProceedAlwaysServer => {
                if let Some(server) = server {
                    self.servers.insert(server.to_string());
                }
            },
            ConfirmationOutcome::ProceedAlwaysTool => {
                self.tools.insert(tool_name.to_string());
            },
            _ => {},
        }
    }
}

/// Lifecycle status of a tool call. Matches the variants of
/// [ToolCallState] one for one; used where only the discriminant matters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ToolCallStatus {
    Validating,
    AwaitingApproval,
    Scheduled,
    Executing,
    Success,
    Error,
    Cancelled,
}

impl ToolCallStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ToolCallStatus::Success | ToolCallStatus::Error | ToolCallStatus::Cancelled)
    }
}

/// What the model (or the user, for display) receives for a finished call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallResponse {
    pub call_id: String,
    /// Function-response parts fed back to the model.
    pub parts: Vec<Part>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display: Option<DisplayOutput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// State-specific payload of one tool call.
///
/// Transitions that are not expressible here cannot happen: an executing
/// call has no confirmation, a terminal call always has its response.
#[derive(Debug, Clone)]
pub enum ToolCallState {
    Validating,
    AwaitingApproval {
        confirmation: Confirmation,
        is_modifying: bool,
    },
    Scheduled,
    Executing {
        live_output: Option<String>,
    },
    Success {
        response: ToolCallResponse,
        duration: Duration,
    },
    Error {
        response: ToolCallResponse,
        duration: Option<Duration>,
    },
    Cancelled {
        response: ToolCallResponse,
    },
}

impl ToolCallState {
    pub fn status(&self) -> ToolCallStatus {
        match self {
            ToolCallState::Validating => ToolCallStatus::Validating,
            ToolCallState::AwaitingApproval { .. } => ToolCallStatus::AwaitingApproval,
            ToolCallState::Scheduled => ToolCallStatus::Scheduled,
            ToolCallState::Executing { .. } => ToolCallStatus::Executing,
            ToolCallState::Success { .. } => ToolCallStatus::Success,
            ToolCallState::Error { .. } => ToolCallStatus::Error,
            ToolCallState::Cancelled { .. } => ToolCallStatus::Cancelled,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ToolCall {
    pub request: FunctionCallInfo,
    /// Present unless the requested tool was not found in the registry.
    pub tool: Option<Arc<dyn Tool>>,
    pub state: ToolCallState,
    pub outcome: Option<ConfirmationOutcome>,
    response_submitted: bool,
}

impl ToolCall {
    fn new(request: FunctionCallInfo, tool: Option<Arc<dyn Tool>>) -> Self {
        Self {
            request,
            tool,
            state: ToolCallState::Validating,
            outcome: None,
            response_submitted: false,
        }
    }

    pub fn status(&self) -> ToolCallStatus {
        self.state.status()
    }

    pub fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }

    pub fn response(&self) -> Option<&ToolCallResponse> {
        match &self.state {
            ToolCallState::Success { response, .. }
            | ToolCallState::Error { response, .. }
            | ToolCallState::Cancelled { response } => Some(response),
            _ => None,
        }
    }

    pub fn response_submitted(&self) -> bool {
        self.response_submitted
    }

    /// Replaces the state, refusing to mutate a terminal call.
    fn transition(&mut self, next: ToolCallState) {
        if self.is_terminal() {
            warn!(
                call_id = %self.request.call_id,
                from = %self.status(),
                to = %next.status(),
                "ignoring state transition on a terminal tool call"
            );
            return;
        }
        self.state = next;
    }
}

/// A serializable snapshot of one call, for event consumers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallView {
    pub call_id: String,
    pub name: String,
    pub description: String,
    pub status: ToolCallStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confirmation: Option<Confirmation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub live_output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display: Option<DisplayOutput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

/// The current batch of tool calls plus the session-scoped approval policy.
///
/// At most one batch is non-terminal at any time; scheduling a new batch
/// while a call is executing or awaiting approval is refused.
#[derive(Debug, Default)]
pub struct ToolCallManager {
    calls: Vec<ToolCall>,
    memory: ApprovalMemory,
    /// Every call id observed this session, for uniqueness enforcement.
    seen_call_ids: HashSet<String>,
}

impl ToolCallManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn memory(&self) -> &ApprovalMemory {
        &self.memory
    }

    pub fn calls(&self) -> &[ToolCall] {
        &self.calls
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    fn call_mut(&mut self, call_id: &str) -> Result<&mut ToolCall, SchedulerError> {
        self.calls
            .iter_mut()
            .find(|c| c.request.call_id == call_id)
            .ok_or_else(|| SchedulerError::UnknownCallId(call_id.to_string()))
    }

    pub fn call(&self, call_id: &str) -> Option<&ToolCall> {
        self.calls.iter().find(|c| c.request.call_id == call_id)
    }

    /// Whether a new batch may be scheduled.
    pub fn can_schedule(&self) -> bool {
        !self
            .calls
            .iter()
            .any(|c| matches!(c.status(), ToolCallStatus::Executing | ToolCallStatus::AwaitingApproval))
    }

    /// Opens a new batch in `validating` state.
    ///
    /// Fails when a prior batch is still active or a call id repeats within
    /// the session (a duplicate id is a programmer bug upstream).
    pub fn begin_batch(
        &mut self,
        requests: Vec<(FunctionCallInfo, Option<Arc<dyn Tool>>)>,
    ) -> Result<(), SchedulerError> {
        if !self.can_schedule() {
            return Err(SchedulerError::BatchActive);
        }
        for (request, _) in &requests {
            if self.seen_call_ids.contains(&request.call_id) {
                return Err(SchedulerError::Internal(format!(
                    "duplicate tool call id: {}",
                    request.call_id
                )));
            }
        }
        self.calls.clear();
        for (request, tool) in requests {
            self.seen_call_ids.insert(request.call_id.clone());
            self.calls.push(ToolCall::new(request, tool));
        }
        Ok(())
    }

    /// Fails a call during validation.
    pub fn set_validation_error(&mut self, call_id: &str, message: String) -> Result<(), SchedulerError> {
        let call = self.call_mut(call_id)?;
        let response = ToolCallResponse {
            call_id: call.request.call_id.clone(),
            parts: vec![error_part(&call.request.name, &call.request.call_id, message.clone())],
            display: Some(DisplayOutput::Text(message.clone())),
            error: Some(message),
        };
        call.transition(ToolCallState::Error {
            response,
            duration: None,
        });
        Ok(())
    }

    pub fn set_scheduled(&mut self, call_id: &str) -> Result<(), SchedulerError> {
        self.call_mut(call_id)?.transition(ToolCallState::Scheduled);
        Ok(())
    }

    pub fn set_awaiting_approval(&mut self, call_id: &str, confirmation: Confirmation) -> Result<(), SchedulerError> {
        self.call_mut(call_id)?.transition(ToolCallState::AwaitingApproval {
            confirmation,
            is_modifying: false,
        });
        Ok(())
    }

    /// Applies a user decision to a call in `awaiting_approval`.
    ///
    /// Proceed decisions move the call to `scheduled` and record any
    /// "always" scope. Cancel terminates it. Modify flips the
    /// `is_modifying` flag and leaves the call awaiting; the editor flow is
    /// driven by the scheduler.
    pub fn apply_outcome(&mut self, call_id: &str, outcome: ConfirmationOutcome) -> Result<(), SchedulerError> {
        let memory_update = {
            let call = self.call_mut(call_id)?;
            if !matches!(call.state, ToolCallState::AwaitingApproval { .. }) {
                return Err(SchedulerError::NotAwaitingApproval(call_id.to_string()));
            }
            call.outcome = Some(outcome);
            match outcome {
                o if o.approves() => {
                    let update = (
                        call.request.name.clone(),
                        call.tool.as_ref().and_then(|t| t.server_name().map(String::from)),
                    );
                    call.transition(ToolCallState::Scheduled);
                    Some((o, update))
                },
                ConfirmationOutcome::Cancel => {
                    let response = cancelled_response(&call.request, super::consts::CONFIRMATION_DECLINED_REASON);
                    call.transition(ToolCallState::Cancelled { response });
                    None
                },
                ConfirmationOutcome::ModifyWithEditor => {
                    if let ToolCallState::AwaitingApproval { is_modifying, .. } = &mut call.state {
                        *is_modifying = true;
                    }
                    None
                },
                _ => None,
            }
        };
        if let Some((outcome, (name, server))) = memory_update {
            self.memory.remember(outcome, &name, server.as_deref());
        }
        Ok(())
    }

    /// Replaces a call's arguments and confirmation after a modify-in-editor
    /// round trip. With a refreshed confirmation the call stays in
    /// `awaiting_approval`; without one the modified call no longer needs
    /// approval and moves to `scheduled`.
    pub fn apply_modified_args(
        &mut self,
        call_id: &str,
        args: serde_json::Map<String, serde_json::Value>,
        confirmation: Option<Confirmation>,
    ) -> Result<(), SchedulerError> {
        let call = self.call_mut(call_id)?;
        if !matches!(call.state, ToolCallState::AwaitingApproval { .. }) {
            return Err(SchedulerError::NotAwaitingApproval(call_id.to_string()));
        }
        call.request.args = args;
        call.state = match confirmation {
            Some(confirmation) => ToolCallState::AwaitingApproval {
                confirmation,
                is_modifying: false,
            },
            None => ToolCallState::Scheduled,
        };
        Ok(())
    }

    /// Whether the classification phase is over and scheduled calls can run.
    pub fn ready_to_execute(&self) -> bool {
        let any_scheduled = self.calls.iter().any(|c| matches!(c.status(), ToolCallStatus::Scheduled));
        let blocked = self.calls.iter().any(|c| {
            matches!(
                c.status(),
                ToolCallStatus::Validating | ToolCallStatus::AwaitingApproval | ToolCallStatus::Executing
            )
        });
        any_scheduled && !blocked
    }

    /// Moves every scheduled call to `executing` simultaneously, returning
    /// the work to hand to the executor.
    pub fn start_execution(&mut self) -> Vec<(FunctionCallInfo, Arc<dyn Tool>)> {
        let mut work = Vec::new();
        for call in &mut self.calls {
            if !matches!(call.status(), ToolCallStatus::Scheduled) {
                continue;
            }
            let Some(tool) = call.tool.clone() else {
                // Unreachable: calls without a tool error during validation.
                continue;
            };
            call.transition(ToolCallState::Executing { live_output: None });
            work.push((call.request.clone(), tool));
        }
        work
    }

    pub fn record_live_output(&mut self, call_id: &str, chunk: String) -> Result<(), SchedulerError> {
        let call = self.call_mut(call_id)?;
        if let ToolCallState::Executing { live_output } = &mut call.state {
            *live_output = Some(chunk);
        }
        Ok(())
    }

    pub fn finish_success(
        &mut self,
        call_id: &str,
        output: ToolOutput,
        duration: Duration,
    ) -> Result<(), SchedulerError> {
        let call = self.call_mut(call_id)?;
        let parts = convert_to_function_response(&call.request.name, &call.request.call_id, &output.llm_content);
        let response = ToolCallResponse {
            call_id: call.request.call_id.clone(),
            parts,
            display: output.display,
            error: None,
        };
        call.transition(ToolCallState::Success { response, duration });
        Ok(())
    }

    pub fn finish_error(&mut self, call_id: &str, message: String, duration: Duration) -> Result<(), SchedulerError> {
        let call = self.call_mut(call_id)?;
        let response = ToolCallResponse {
            call_id: call.request.call_id.clone(),
            parts: vec![error_part(&call.request.name, &call.request.call_id, message.clone())],
            display: Some(DisplayOutput::Text(message.clone())),
            error: Some(message),
        };
        call.transition(ToolCallState::Error {
            response,
            duration: Some(duration),
        });
        Ok(())
    }

    pub fn finish_cancelled(&mut self, call_id: &str, reason: &str) -> Result<(), SchedulerError> {
        let call = self.call_mut(call_id)?;
        let response = cancelled_response(&call.request, reason);
        call.transition(ToolCallState::Cancelled { response });
        Ok(())
    }

    /// Cancels every call that has not started executing. Executing calls
    /// finish through the executor's cancellation race.
    pub fn cancel_pending(&mut self, reason: &str) {
        for call in &mut self.calls {
            match call.status() {
                ToolCallStatus::Validating | ToolCallStatus::AwaitingApproval | ToolCallStatus::Scheduled => {
                    let response = cancelled_response(&call.request, reason);
                    call.transition(ToolCallState::Cancelled { response });
                },
                _ => {},
            }
        }
    }

    pub fn all_terminal(&self) -> bool {
        self.calls.iter().all(ToolCall::is_terminal)
    }

    /// Model-initiated calls, in original emission order.
    pub fn model_initiated(&self) -> impl Iterator<Item = &ToolCall> {
        self.calls.iter().filter(|c| !c.request.is_client_initiated)
    }

    /// Collects the function-response parts for all model-initiated calls,
    /// in emission order, regardless of completion order.
    pub fn collect_model_responses(&self) -> Vec<Part> {
        self.model_initiated()
            .filter_map(ToolCall::response)
            .flat_map(|r| r.parts.iter().cloned())
            .collect()
    }

    pub fn mark_submitted(&mut self, call_id: &str) -> Result<(), SchedulerError> {
        let call = self.call_mut(call_id)?;
        call.response_submitted = true;
        Ok(())
    }

    /// Clears the batch once every response has been accounted for.
    pub fn take_batch(&mut self) -> Vec<ToolCall> {
        std::mem::take(&mut self.calls)
    }

    pub fn views(&self) -> Vec<ToolCallView> {
        self.calls
            .iter()
            .map(|call| {
                let (confirmation, live_output, display, duration_ms) = match &call.state {
                    ToolCallState::AwaitingApproval { confirmation, .. } => {
                        (Some(confirmation.clone()), None, None, None)
                    },
                    ToolCallState::Executing { live_output } => (None, live_output.clone(), None, None),
                    ToolCallState::Success { response, duration } => (
                        None,
                        None,
                        response.display.clone(),
                        Some(duration.as_millis() as u64),
                    ),
                    ToolCallState::Error { response, duration } => (
                        None,
                        None,
                        response.display.clone(),
                        duration.map(|d| d.as_millis() as u64),
                    ),
                    ToolCallState::Cancelled { response } => (None, None, response.display.clone(), None),
                    _ => (None, None, None, None),
                };
                ToolCallView {
                    call_id: call.request.call_id.clone(),
                    name: call.request.name.clone(),
                    description: call
                        .tool
                        .as_ref()
                        .map(|t| t.describe(&call.request.args))
                        .unwrap_or_default(),
                    status: call.status(),
                    confirmation,
                    live_output,
                    display,
                    duration_ms,
                }
            })
            .collect()
    }
}

fn cancelled_response(request: &FunctionCallInfo, reason: &str) -> ToolCallResponse {
    ToolCallResponse {
        call_id: request.call_id.clone(),
        parts: vec![cancelled_part(&request.name, &request.call_id, reason)],
        display: None,
        error: Some(format!("[Operation Cancelled] Reason: {}", reason)),
    }
}
