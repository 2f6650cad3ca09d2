//! The turn scheduler: drives one user turn to completion against the model
//! and the tool call manager, then yields control back to the user.

pub mod checkpoint;
pub mod consts;
pub mod dispatch;
pub mod executor;
pub mod modify;
pub mod next_speaker;
pub mod protocol;
pub mod tool_calls;
pub mod turn;

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use checkpoint::{
    CheckpointSidecar,
    CheckpointToolCall,
    SnapshotService,
    UiHistorySource,
};
use consts::{
    is_restorable_tool,
    CONTINUE_PROMPT,
    MAX_TURNS,
    REPLACE_TOOL,
    SAVE_MEMORY_TOOL,
    USER_CANCELLED_INFO,
};
use dispatch::{
    route,
    AtCommandProcessor,
    AuthHandler,
    CommandOutcome,
    CommandProcessor,
    Dispatch,
    EditCorrector,
    MemoryRefresh,
    ShellProcessor,
};
use executor::{
    ExecutionResult,
    ExecutorEvent,
    ToolExecutor,
};
use futures::StreamExt;
use modify::{
    run_modify_flow,
    ModifyResult,
};
use next_speaker::{
    check_next_speaker,
    NextSpeaker,
};
use protocol::{
    command_channel,
    CommandReceiver,
    CommandSender,
    Envelope,
    SchedulerError,
    SchedulerEvent,
    SchedulerRequest,
    SchedulerResponse,
};
use tokio::sync::{
    broadcast,
    mpsc,
};
use tokio_util::sync::CancellationToken;
use tool_calls::{
    ApprovalMode,
    ToolCallManager,
    ToolCallStatus,
};
use tracing::{
    debug,
    error,
    info,
    warn,
};
use turn::TurnContext;

use crate::model::demux::{
    synthesize_call_id,
    FunctionCallInfo,
    StreamDemux,
    StreamEvent,
};
use crate::model::types::{
    Message,
    Part,
    StreamErrorKind,
    StreamItem,
};
use crate::model::ModelStream;
use crate::session::ChatSession;
use crate::tools::registry::ToolRegistry;
use crate::tools::ConfirmationOutcome;

/// External collaborators the scheduler talks to. All optional; absent
/// collaborators degrade to pass-through behavior.
#[derive(Clone, Default)]
pub struct Collaborators {
    pub command: Option<Arc<dyn CommandProcessor>>,
    pub at_command: Option<Arc<dyn AtCommandProcessor>>,
    pub shell: Option<Arc<dyn ShellProcessor>>,
    pub snapshot: Option<Arc<dyn SnapshotService>>,
    pub ui_history: Option<Arc<dyn UiHistorySource>>,
    pub memory_refresh: Option<Arc<dyn MemoryRefresh>>,
    pub edit_corrector: Option<Arc<dyn EditCorrector>>,
    pub auth: Option<Arc<dyn AuthHandler>>,
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators")
            .field("command", &self.command.is_some())
            .field("at_command", &self.at_command.is_some())
            .field("shell", &self.shell.is_some())
            .field("snapshot", &self.snapshot.is_some())
            .field("memory_refresh", &self.memory_refresh.is_some())
            .field("edit_corrector", &self.edit_corrector.is_some())
            .field("auth", &self.auth.is_some())
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub approval_mode: ApprovalMode,
    pub shell_mode_active: bool,
    /// Snapshot restorable tool calls before approval.
    pub checkpointing_enabled: bool,
    /// Base directory for checkpoints and modify-flow temp files.
    pub temp_dir: PathBuf,
    /// Editor command for the modify-in-editor flow.
    pub editor_command: Option<String>,
    /// Continuation budget per turn.
    pub max_turns: u32,
    pub collaborators: Collaborators,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            approval_mode: ApprovalMode::Default,
            shell_mode_active: false,
            checkpointing_enabled: false,
            temp_dir: std::env::temp_dir(),
            editor_command: None,
            max_turns: MAX_TURNS,
            collaborators: Collaborators::default(),
        }
    }
}

/// Handle for submitting turns and receiving scheduler events.
#[derive(Debug)]
pub struct SchedulerHandle {
    sender: CommandSender,
    event_rx: broadcast::Receiver<SchedulerEvent>,
}

impl Clone for SchedulerHandle {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            event_rx: self.event_rx.resubscribe(),
        }
    }
}

impl SchedulerHandle {
    pub async fn recv(&mut self) -> Result<SchedulerEvent, broadcast::error::RecvError> {
        self.event_rx.recv().await
    }

    /// Submits one user turn. The caller keeps the cancellation token and
    /// may fire it at any time to abort the turn.
    pub async fn submit(&self, query: impl Into<String>, cancel_token: CancellationToken) -> Result<(), SchedulerError> {
        let request = SchedulerRequest::Submit {
            query: query.into(),
            cancel_token,
        };
        match self.sender.call(request).await? {
            SchedulerResponse::Success => Ok(()),
            other => Err(SchedulerError::Internal(format!("unexpected response: {:?}", other))),
        }
    }

    /// Resolves a pending confirmation with the user's decision.
    pub async fn resolve_confirmation(
        &self,
        call_id: impl Into<String>,
        outcome: ConfirmationOutcome,
    ) -> Result<(), SchedulerError> {
        let request = SchedulerRequest::ResolveConfirmation {
            call_id: call_id.into(),
            outcome,
        };
        match self.sender.call(request).await? {
            SchedulerResponse::Success => Ok(()),
            other => Err(SchedulerError::Internal(format!("unexpected response: {:?}", other))),
        }
    }

    /// Deep copy of the session history.
    pub async fn get_history(&self, curated: bool) -> Result<Vec<Message>, SchedulerError> {
        match self.sender.call(SchedulerRequest::GetHistory { curated }).await? {
            SchedulerResponse::History(history) => Ok(history),
            other => Err(SchedulerError::Internal(format!("unexpected response: {:?}", other))),
        }
    }
}

/// Per-turn state owned exclusively by the scheduler.
struct TurnState {
    ctx: TurnContext,
    /// The active model stream and its parse state, if one is open.
    stream: Option<(StreamDemux, ModelStream)>,
    /// The user message that opened the active stream; recorded together
    /// with the model output once the stream completes.
    pending_user: Option<Message>,
    cancelled: bool,
}

impl std::fmt::Debug for TurnState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TurnState")
            .field("ctx", &self.ctx)
            .field("stream", &self.stream.as_ref().map(|(demux, _)| demux))
            .field("pending_user", &self.pending_user)
            .field("cancelled", &self.cancelled)
            .finish()
    }
}

impl TurnState {
    fn new(cancel_token: CancellationToken, budget: u32) -> Self {
        Self {
            ctx: TurnContext::new(cancel_token, budget),
            stream: None,
            pending_user: None,
            cancelled: false,
        }
    }
}

/// The session-scoped scheduler actor.
///
/// All state transitions happen on one task; tool executions, the modify
/// editor, and the model stream run as background work that re-enters the
/// actor through channels.
#[derive(Debug)]
pub struct Scheduler {
    config: SchedulerConfig,
    session: ChatSession,
    registry: ToolRegistry,
    manager: ToolCallManager,
    executor: ToolExecutor,

    event_tx: broadcast::Sender<SchedulerEvent>,
    event_rx: Option<broadcast::Receiver<SchedulerEvent>>,
    event_buf: Vec<SchedulerEvent>,

    modify_tx: mpsc::Sender<ModifyResult>,
    modify_rx: mpsc::Receiver<ModifyResult>,

    /// `save_memory` call ids whose refresh signal already fired.
    memory_signalled: HashSet<String>,

    turn: Option<TurnState>,
}

impl Scheduler {
    pub fn new(session: ChatSession, registry: ToolRegistry, config: SchedulerConfig) -> Self {
        let (event_tx, event_rx) = broadcast::channel(1024);
        let (modify_tx, modify_rx) = mpsc::channel(8);
        Self {
            config,
            session,
            registry,
            manager: ToolCallManager::new(),
            executor: ToolExecutor::new(),
            event_tx,
            event_rx: Some(event_rx),
            event_buf: Vec::new(),
            modify_tx,
            modify_rx,
            memory_signalled: HashSet::new(),
            turn: None,
        }
    }

    /// Starts the scheduler task, returning the handle used to drive it.
    pub fn spawn(mut self) -> SchedulerHandle {
        self.session.set_tools(self.registry.function_declarations());
        let event_rx = self.event_rx.take().expect("event receiver should exist before spawn");
        let (tx, rx) = command_channel();
        tokio::spawn(async move {
            info!("scheduler start");
            self.main_loop(rx).await;
            info!("scheduler end");
        });
        SchedulerHandle { sender: tx, event_rx }
    }

    async fn main_loop(mut self, mut request_rx: CommandReceiver) {
        loop {
            for event in self.event_buf.drain(..) {
                let _ = self.event_tx.send(event);
            }

            let turn_token = self.turn.as_ref().map(|t| t.ctx.cancel_token().clone());
            let cancel_armed = turn_token.is_some() && self.turn.as_ref().is_some_and(|t| !t.cancelled);

            tokio::select! {
                envelope = request_rx.recv() => {
                    let Some(Envelope { request, reply_tx }) = envelope else {
                        warn!("scheduler request channel has closed, exiting");
                        break;
                    };
                    let res = self.handle_request(request).await;
                    if reply_tx.send(res).is_err() {
                        warn!("request caller went away before the reply was sent");
                    }
                },

                // Next raw item of the active model stream. Pending forever
                // when no stream is open.
                item = async {
                    match self.turn.as_mut() {
                        Some(TurnState { stream: Some((_, stream)), .. }) => stream.next().await,
                        _ => std::future::pending().await,
                    }
                } => {
                    self.handle_stream_item(item).await;
                },

                event = self.executor.recv() => {
                    self.handle_executor_event(event).await;
                },

                Some(result) = self.modify_rx.recv() => {
                    self.handle_modify_result(result).await;
                },

                _ = async {
                    match &turn_token {
                        Some(token) => token.cancelled().await,
                        None => std::future::pending().await,
                    }
                }, if cancel_armed => {
                    self.handle_turn_cancelled().await;
                },
            }
        }
    }

    fn emit(&mut self, event: SchedulerEvent) {
        self.event_buf.push(event);
    }

    fn emit_tool_calls_updated(&mut self) {
        let views = self.manager.views();
        self.emit(SchedulerEvent::ToolCallsUpdated(views));
    }

    async fn handle_request(&mut self, request: SchedulerRequest) -> Result<SchedulerResponse, SchedulerError> {
        debug!(?request, "handling scheduler request");
        match request {
            SchedulerRequest::Submit { query, cancel_token } => self.handle_submit(query, cancel_token).await,
            SchedulerRequest::ResolveConfirmation { call_id, outcome } => {
                self.handle_resolve_confirmation(call_id, outcome).await
            },
            SchedulerRequest::GetHistory { curated } => {
                Ok(SchedulerResponse::History(self.session.get_history(curated)))
            },
        }
    }

    // --- submission & dispatch ---

    async fn handle_submit(
        &mut self,
        query: String,
        cancel_token: CancellationToken,
    ) -> Result<SchedulerResponse, SchedulerError> {
        if self.turn.is_some() {
            return Err(SchedulerError::TurnActive);
        }
        if query.trim().is_empty() {
            return Ok(SchedulerResponse::Success);
        }

        enum Routed {
            Slash(String),
            Shell(String),
            At(String),
            Plain,
        }
        let routed = match route(&query, self.config.shell_mode_active) {
            Dispatch::SlashCommand(command) => Routed::Slash(command.to_string()),
            Dispatch::Shell(command) => Routed::Shell(command.to_string()),
            Dispatch::AtCommand(input) => Routed::At(input.to_string()),
            Dispatch::Plain(_) => Routed::Plain,
        };

        match routed {
            Routed::Slash(command) => {
                if let Some(processor) = self.config.collaborators.command.clone() {
                    match processor.process(&command, cancel_token.clone()).await {
                        Ok(CommandOutcome::Handled) => return Ok(SchedulerResponse::Success),
                        Ok(CommandOutcome::ScheduleTool { tool_name, args }) => {
                            return self.start_client_tool_turn(tool_name, args, cancel_token).await;
                        },
                        Ok(CommandOutcome::NotHandled) => {},
                        Err(err) => {
                            self.emit(SchedulerEvent::Error {
                                message: err.to_string(),
                                status: None,
                            });
                            return Ok(SchedulerResponse::Success);
                        },
                    }
                }
                self.start_model_turn(vec![Part::Text(query)], cancel_token).await
            },
            Routed::Shell(command) => {
                if let Some(shell) = self.config.collaborators.shell.clone() {
                    if let Err(err) = shell.run(&command, cancel_token).await {
                        self.emit(SchedulerEvent::Error {
                            message: err.to_string(),
                            status: None,
                        });
                    }
                } else {
                    warn!("shell input received without a shell processor");
                }
                Ok(SchedulerResponse::Success)
            },
            Routed::At(input) => {
                let parts = match self.config.collaborators.at_command.clone() {
                    Some(processor) => match processor.expand(&input, cancel_token.clone()).await {
                        Ok(parts) => parts,
                        Err(err) => {
                            self.emit(SchedulerEvent::Error {
                                message: err.to_string(),
                                status: None,
                            });
                            return Ok(SchedulerResponse::Success);
                        },
                    },
                    None => vec![Part::Text(input)],
                };
                self.start_model_turn(parts, cancel_token).await
            },
            Routed::Plain => self.start_model_turn(vec![Part::Text(query)], cancel_token).await,
        }
    }

    async fn start_model_turn(
        &mut self,
        parts: Vec<Part>,
        cancel_token: CancellationToken,
    ) -> Result<SchedulerResponse, SchedulerError> {
        match self.session.try_compress(false, cancel_token.clone()).await {
            Ok(Some(snapshot)) => self.emit(SchedulerEvent::ChatCompressed(snapshot)),
            Ok(None) => {},
            Err(err) => warn!(%err, "history compression failed, continuing uncompressed"),
        }

        self.turn = Some(TurnState::new(cancel_token, self.config.max_turns));
        self.continue_with(parts).await;
        Ok(SchedulerResponse::Success)
    }

    async fn start_client_tool_turn(
        &mut self,
        tool_name: String,
        args: serde_json::Map<String, serde_json::Value>,
        cancel_token: CancellationToken,
    ) -> Result<SchedulerResponse, SchedulerError> {
        self.turn = Some(TurnState::new(cancel_token, self.config.max_turns));
        let request = FunctionCallInfo {
            call_id: synthesize_call_id(&tool_name),
            name: tool_name,
            args,
            is_client_initiated: true,
        };
        self.schedule_batch(vec![request]).await;
        Ok(SchedulerResponse::Success)
    }

    /// Re-enters the model with `parts` as the next user message, consuming
    /// one unit of the continuation budget.
    async fn continue_with(&mut self, parts: Vec<Part>) {
        let Some(turn) = self.turn.as_mut() else { return };
        if turn.cancelled {
            self.finalize_turn();
            return;
        }
        if !turn.ctx.try_consume_turn() {
            info!("turn continuation budget exhausted");
            let usage = turn.ctx.last_usage();
            if let Some(usage) = usage {
                self.emit(SchedulerEvent::UsageMetadata(usage));
            }
            self.finalize_turn();
            return;
        }

        let cancel_token = turn.ctx.cancel_token().clone();
        let user_message = Message::user(parts);
        let stream = self.session.send_stream(&user_message, cancel_token).await;

        let Some(turn) = self.turn.as_mut() else { return };
        turn.pending_user = Some(user_message);
        turn.stream = Some((StreamDemux::new(), stream));
    }

    // --- stream handling ---

    async fn handle_stream_item(&mut self, item: Option<StreamItem>) {
        match item {
            Some(raw) => {
                let mut buf = Vec::new();
                if let Some(TurnState { stream: Some((demux, _)), .. }) = self.turn.as_mut() {
                    demux.next(Some(raw), &mut buf);
                }
                self.process_stream_events(buf).await;
            },
            None => {
                let Some(taken) = self.turn.as_mut().and_then(|t| t.stream.take()) else {
                    return;
                };
                let (mut demux, _) = taken;
                let mut buf = Vec::new();
                demux.next(None, &mut buf);
                self.process_stream_events(buf).await;
                self.finish_stream(demux).await;
            },
        }
    }

    async fn process_stream_events(&mut self, events: Vec<StreamEvent>) {
        for event in events {
            match event {
                StreamEvent::Content(text) => {
                    let flushed = self.turn.as_mut().and_then(|t| t.ctx.push_text(&text));
                    if let Some(flushed) = flushed {
                        self.emit(SchedulerEvent::ContentFinalized(flushed));
                    }
                    self.emit(SchedulerEvent::Content(text));
                },
                StreamEvent::Thought(summary) => self.emit(SchedulerEvent::Thought(summary)),
                StreamEvent::FunctionCall(info) => {
                    debug!(call_id = %info.call_id, name = %info.name, "model requested tool call");
                },
                StreamEvent::UsageMetadata(usage) => {
                    if let Some(turn) = self.turn.as_mut() {
                        turn.ctx.set_usage(usage);
                    }
                    self.emit(SchedulerEvent::UsageMetadata(usage));
                },
                StreamEvent::Error(err) => {
                    error!(%err, "model stream failed");
                    if err.kind == StreamErrorKind::Auth {
                        if let Some(auth) = self.config.collaborators.auth.clone() {
                            auth.on_auth_error(err.message.clone()).await;
                        }
                    } else {
                        self.emit(SchedulerEvent::Error {
                            message: err.message.clone(),
                            status: err.status,
                        });
                    }
                    self.finalize_turn();
                    return;
                },
                StreamEvent::UserCancelled => {
                    if let Some(turn) = self.turn.as_mut() {
                        turn.cancelled = true;
                    }
                    self.finalize_turn();
                    return;
                },
            }
        }
    }

    /// The model stream completed normally: record the exchange and either
    /// schedule the requested tools or decide who speaks next.
    async fn finish_stream(&mut self, demux: StreamDemux) {
        let Some(turn) = self.turn.as_mut() else { return };
        if demux.cancelled() || demux.errored() {
            // Terminal events were handled while processing the stream.
            return;
        }

        let calls: Vec<FunctionCallInfo> = demux.calls().to_vec();
        let model_parts = demux.into_model_parts();
        match turn.pending_user.take() {
            Some(user_message) => self.session.record_turn(user_message, model_parts),
            None => warn!("stream completed without a pending user message"),
        }

        if !calls.is_empty() {
            self.schedule_batch(calls).await;
            return;
        }

        let pending = self.turn.as_mut().and_then(|t| t.ctx.take_pending());
        if let Some(text) = pending {
            self.emit(SchedulerEvent::ContentFinalized(text));
        }
        self.run_next_speaker_check().await;
    }

    async fn run_next_speaker_check(&mut self) {
        let Some(turn) = self.turn.as_ref() else { return };
        let cancel_token = turn.ctx.cancel_token().clone();

        let speaker = tokio::select! {
            speaker = check_next_speaker(&mut self.session, cancel_token.clone()) => speaker,
            _ = cancel_token.cancelled() => {
                if let Some(turn) = self.turn.as_mut() {
                    turn.cancelled = true;
                }
                self.finalize_turn();
                return;
            },
        };

        match speaker {
            NextSpeaker::Model => {
                self.continue_with(vec![Part::Text(CONTINUE_PROMPT.to_string())]).await;
            },
            NextSpeaker::User => self.finalize_turn(),
        }
    }

    // --- tool batch handling ---

    async fn schedule_batch(&mut self, requests: Vec<FunctionCallInfo>) {
        let Some(turn) = self.turn.as_ref() else { return };
        let cancel_token = turn.ctx.cancel_token().clone();

        let mut entries = Vec::with_capacity(requests.len());
        for mut request in requests {
            // The edit corrector repairs fuzzy replacement arguments before
            // the call is validated or confirmed.
            if request.name == REPLACE_TOOL {
                if let Some(corrector) = self.config.collaborators.edit_corrector.clone() {
                    request.args = corrector.correct(request.args, cancel_token.clone()).await;
                }
            }
            let tool = self.registry.get(&request.name);
            entries.push((request, tool));
        }

        if let Err(err) = self.manager.begin_batch(entries) {
            error!(%err, "failed to schedule tool batch");
            self.emit(SchedulerEvent::Error {
                message: err.to_string(),
                status: None,
            });
            self.finalize_turn();
            return;
        }

        let call_ids: Vec<String> = self.manager.calls().iter().map(|c| c.request.call_id.clone()).collect();
        for call_id in call_ids {
            if cancel_token.is_cancelled() {
                break;
            }
            self.classify_call(&call_id, &cancel_token).await;
        }

        self.emit_tool_calls_updated();
        if cancel_token.is_cancelled() {
            self.handle_turn_cancelled().await;
            return;
        }
        self.after_batch_progress().await;
    }

    /// Runs one call through validation and confirmation routing.
    async fn classify_call(&mut self, call_id: &str, cancel_token: &CancellationToken) {
        let Some(call) = self.manager.call(call_id) else { return };
        let request = call.request.clone();
        let Some(tool) = call.tool.clone() else {
            let message = format!("Tool \"{}\" not found in registry", request.name);
            let _ = self.manager.set_validation_error(call_id, message);
            return;
        };

        if let Some(message) = tool.validate_params(&request.args) {
            let _ = self.manager.set_validation_error(call_id, message);
            return;
        }

        if self.config.approval_mode == ApprovalMode::Yolo {
            let _ = self.manager.set_scheduled(call_id);
            return;
        }

        match tool.should_confirm(request.args.clone(), cancel_token.clone()).await {
            Err(err) => {
                let _ = self.manager.set_validation_error(call_id, err.to_string());
            },
            Ok(None) => {
                let _ = self.manager.set_scheduled(call_id);
            },
            Ok(Some(confirmation)) => {
                let covered = self.manager.memory().covers(&request.name, tool.server_name());
                let auto_edit = self.config.approval_mode == ApprovalMode::AutoEdit && confirmation.is_edit();
                if covered || auto_edit {
                    let _ = self.manager.set_scheduled(call_id);
                    return;
                }

                if is_restorable_tool(&request.name) && self.config.checkpointing_enabled {
                    self.write_checkpoint(&request).await;
                }

                let _ = self.manager.set_awaiting_approval(call_id, confirmation.clone());
                self.emit(SchedulerEvent::ToolCallConfirmation {
                    call_id: call_id.to_string(),
                    name: request.name.clone(),
                    description: tool.describe(&request.args),
                    confirmation,
                });
            },
        }
    }

    /// Snapshots the target file and writes the restore sidecar for a
    /// restorable call entering `awaiting_approval`. Failures are logged;
    /// they never block the approval flow.
    async fn write_checkpoint(&mut self, request: &FunctionCallInfo) {
        let Some(snapshot) = self.config.collaborators.snapshot.clone() else {
            return;
        };
        let Some(file_path) = request.args.get("file_path").and_then(|v| v.as_str()).map(String::from) else {
            warn!(name = %request.name, "restorable call has no file_path argument, skipping checkpoint");
            return;
        };

        let commit_hash = match snapshot.snapshot(std::path::Path::new(&file_path)).await {
            Ok(hash) => hash,
            Err(err) => {
                warn!(%err, "filesystem snapshot failed, skipping checkpoint");
                return;
            },
        };

        let sidecar = CheckpointSidecar {
            history: self
                .config
                .collaborators
                .ui_history
                .as_ref()
                .map(|h| h.items())
                .unwrap_or_else(|| serde_json::json!([])),
            client_history: self.session.get_history(true),
            tool_call: CheckpointToolCall {
                name: request.name.clone(),
                args: request.args.clone(),
            },
            commit_hash,
            file_path,
        };
        if let Err(err) = checkpoint::write_sidecar(&self.config.temp_dir, chrono::Utc::now(), &request.name, &sidecar).await
        {
            warn!(%err, "failed to write checkpoint sidecar");
        }
    }

    /// Starts execution once classification settled, or completes the batch
    /// when every call is already terminal.
    async fn after_batch_progress(&mut self) {
        if self.manager.ready_to_execute() {
            let Some(turn) = self.turn.as_ref() else { return };
            let parent_token = turn.ctx.cancel_token().clone();
            for (request, tool) in self.manager.start_execution() {
                self.executor.start(request.call_id, tool, request.args, &parent_token);
            }
            self.emit_tool_calls_updated();
        } else if !self.manager.is_empty() && self.manager.all_terminal() {
            self.complete_batch().await;
        }
    }

    async fn handle_executor_event(&mut self, event: ExecutorEvent) {
        match event {
            ExecutorEvent::LiveOutput { call_id, chunk } => {
                let _ = self.manager.record_live_output(&call_id, chunk);
                self.emit_tool_calls_updated();
            },
            ExecutorEvent::Done { call_id, result, duration } => {
                let outcome = match result {
                    ExecutionResult::Output(output) => self.manager.finish_success(&call_id, output, duration),
                    ExecutionResult::Error(err) => self.manager.finish_error(&call_id, err.to_string(), duration),
                    ExecutionResult::Cancelled => self.manager.finish_cancelled(&call_id, USER_CANCELLED_INFO),
                };
                if let Err(err) = outcome {
                    warn!(%err, call_id, "failed to record tool completion");
                }
                self.emit_tool_calls_updated();
                if !self.manager.is_empty() && self.manager.all_terminal() {
                    self.complete_batch().await;
                }
            },
        }
    }

    /// Every call in the batch is terminal: signal collaborators, submit
    /// responses, and either re-enter the model or end the turn.
    async fn complete_batch(&mut self) {
        // Memory refresh fires at most once per successful save_memory call.
        let refresh_ids: Vec<String> = self
            .manager
            .calls()
            .iter()
            .filter(|c| c.request.name == SAVE_MEMORY_TOOL && c.status() == ToolCallStatus::Success)
            .map(|c| c.request.call_id.clone())
            .collect();
        for call_id in refresh_ids {
            if self.memory_signalled.insert(call_id) {
                if let Some(memory) = self.config.collaborators.memory_refresh.clone() {
                    memory.refresh().await;
                }
            }
        }

        let client_ids: Vec<String> = self
            .manager
            .calls()
            .iter()
            .filter(|c| c.request.is_client_initiated)
            .map(|c| c.request.call_id.clone())
            .collect();
        for call_id in &client_ids {
            let _ = self.manager.mark_submitted(call_id);
        }

        let model_calls: Vec<(String, ToolCallStatus)> = self
            .manager
            .model_initiated()
            .map(|c| (c.request.call_id.clone(), c.status()))
            .collect();

        if model_calls.is_empty() {
            self.manager.take_batch();
            self.finalize_turn();
            return;
        }

        let all_cancelled = model_calls.iter().all(|(_, status)| *status == ToolCallStatus::Cancelled);
        let response_parts = self.manager.collect_model_responses();
        for (call_id, _) in &model_calls {
            let _ = self.manager.mark_submitted(call_id);
        }
        self.manager.take_batch();

        if all_cancelled {
            // The model sees the cancellations on the next turn, but the
            // scheduler does not re-enter the model now.
            self.session.append_user(Message::user(response_parts));
            self.finalize_turn();
            return;
        }

        self.continue_with(response_parts).await;
    }

    // --- approvals ---

    async fn handle_resolve_confirmation(
        &mut self,
        call_id: String,
        outcome: ConfirmationOutcome,
    ) -> Result<SchedulerResponse, SchedulerError> {
        if outcome == ConfirmationOutcome::ModifyWithEditor {
            return self.start_modify_flow(call_id).await;
        }

        self.manager.apply_outcome(&call_id, outcome)?;
        self.emit_tool_calls_updated();
        self.after_batch_progress().await;
        Ok(SchedulerResponse::Success)
    }

    async fn start_modify_flow(&mut self, call_id: String) -> Result<SchedulerResponse, SchedulerError> {
        let call = self
            .manager
            .call(&call_id)
            .ok_or_else(|| SchedulerError::UnknownCallId(call_id.clone()))?;
        let tool = call.tool.clone().ok_or_else(|| SchedulerError::NotModifiable(call_id.clone()))?;
        let modify = tool
            .modify_context()
            .ok_or_else(|| SchedulerError::NotModifiable(call_id.clone()))?;
        let editor_command = self
            .config
            .editor_command
            .clone()
            .ok_or_else(|| SchedulerError::NotModifiable(call_id.clone()))?;
        let args = call.request.args.clone();

        self.manager.apply_outcome(&call_id, ConfirmationOutcome::ModifyWithEditor)?;
        self.emit_tool_calls_updated();

        let temp_dir = self.config.temp_dir.clone();
        let tx = self.modify_tx.clone();
        tokio::spawn(async move {
            let result = run_modify_flow(args, modify, &editor_command, &temp_dir, &call_id)
                .await
                .map_err(|e| e.to_string());
            let _ = tx.send(ModifyResult { call_id, result }).await;
        });
        Ok(SchedulerResponse::Success)
    }

    /// The editor round trip finished: refresh the confirmation from the
    /// modified args and re-present the approval prompt.
    async fn handle_modify_result(&mut self, result: ModifyResult) {
        let ModifyResult { call_id, result } = result;
        let Some(call) = self.manager.call(&call_id) else {
            warn!(call_id, "modify result for unknown call");
            return;
        };
        let Some(tool) = call.tool.clone() else { return };
        let previous = match &call.state {
            tool_calls::ToolCallState::AwaitingApproval { confirmation, .. } => confirmation.clone(),
            _ => return,
        };
        let original_args = call.request.args.clone();
        let cancel_token = self
            .turn
            .as_ref()
            .map(|t| t.ctx.cancel_token().clone())
            .unwrap_or_default();

        let (args, confirmation) = match result {
            Ok(new_args) => match tool.should_confirm(new_args.clone(), cancel_token).await {
                Ok(refreshed) => (new_args, refreshed),
                Err(err) => {
                    warn!(%err, "refreshing confirmation after modify failed");
                    (new_args, Some(previous))
                },
            },
            Err(message) => {
                warn!(message, "modify-in-editor flow failed");
                (original_args, Some(previous))
            },
        };

        if let Some(confirmation) = confirmation.clone() {
            self.emit(SchedulerEvent::ToolCallConfirmation {
                call_id: call_id.clone(),
                name: tool.name().to_string(),
                description: tool.describe(&args),
                confirmation,
            });
        }
        let _ = self.manager.apply_modified_args(&call_id, args, confirmation);
        self.emit_tool_calls_updated();
        self.after_batch_progress().await;
    }

    // --- cancellation & turn end ---

    async fn handle_turn_cancelled(&mut self) {
        let Some(turn) = self.turn.as_mut() else { return };
        if turn.cancelled {
            return;
        }
        info!("turn cancelled by user");
        turn.cancelled = true;
        turn.stream = None;
        turn.pending_user = None;
        turn.ctx.discard_pending();

        self.manager.cancel_pending(USER_CANCELLED_INFO);
        if !self.manager.is_empty() {
            self.emit_tool_calls_updated();
        }

        if self.executor.executing_count() > 0 {
            // Child tokens are already cancelled; completion events finish
            // the batch.
            return;
        }
        if !self.manager.is_empty() && self.manager.all_terminal() {
            self.complete_batch().await;
        } else {
            self.finalize_turn();
        }
    }

    /// Tears down the turn and emits the trailing events.
    fn finalize_turn(&mut self) {
        let Some(mut turn) = self.turn.take() else { return };
        if turn.cancelled {
            turn.ctx.discard_pending();
            self.emit(SchedulerEvent::UserCancelled);
            self.emit(SchedulerEvent::Info(USER_CANCELLED_INFO.to_string()));
        } else if let Some(text) = turn.ctx.take_pending() {
            self.emit(SchedulerEvent::ContentFinalized(text));
        }
        self.emit(SchedulerEvent::TurnComplete);
    }
}
