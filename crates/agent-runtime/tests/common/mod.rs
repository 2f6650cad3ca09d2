#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{
    Arc,
    Mutex,
};
use std::time::{
    Duration,
    Instant,
};

use agent_runtime::model::types::{
    FunctionCall,
    InlineData,
    Message,
    RawCandidate,
    RawChunk,
    RawContent,
    RawPart,
    Role,
    StreamError,
    StreamErrorKind,
    StreamItem,
    UsageInfo,
};
use agent_runtime::model::MockModel;
use agent_runtime::runtime::protocol::SchedulerEvent;
use agent_runtime::runtime::{
    Collaborators,
    Scheduler,
    SchedulerConfig,
    SchedulerHandle,
};
use agent_runtime::session::retry::RetryPolicy;
use agent_runtime::session::{
    ChatSession,
    ChatSessionConfig,
};
use agent_runtime::tools::registry::ToolRegistry;
use agent_runtime::tools::{
    Confirmation,
    ConfirmationOutcome,
    LiveOutputFn,
    ModifyContext,
    Tool,
    ToolError,
    ToolFuture,
    ToolOutput,
};
use schemars::{
    schema_for,
    JsonSchema,
};
use serde::Deserialize;
use serde_json::Map;
use tokio_util::sync::CancellationToken;

// --- scripted stream chunks ---

fn chunk_of(part: RawPart) -> StreamItem {
    StreamItem::Ok(RawChunk {
        candidates: vec![RawCandidate {
            content: Some(RawContent {
                role: Some(Role::Model),
                parts: vec![part],
            }),
        }],
        usage_metadata: None,
    })
}

pub fn text_chunk(text: &str) -> StreamItem {
    chunk_of(RawPart {
        text: Some(text.to_string()),
        ..Default::default()
    })
}

pub fn thought_chunk(text: &str) -> StreamItem {
    chunk_of(RawPart {
        thought: true,
        text: Some(text.to_string()),
        ..Default::default()
    })
}

pub fn call_chunk(id: &str, name: &str, args: serde_json::Value) -> StreamItem {
    chunk_of(RawPart {
        function_call: Some(FunctionCall {
            id: Some(id.to_string()),
            name: name.to_string(),
            args: serde_json::from_value(args).expect("args must be an object"),
        }),
        ..Default::default()
    })
}

pub fn inline_data_chunk(mime_type: &str, data: &[u8]) -> StreamItem {
    chunk_of(RawPart {
        inline_data: Some(InlineData {
            mime_type: mime_type.to_string(),
            data: data.to_vec(),
        }),
        ..Default::default()
    })
}

pub fn usage_chunk(total: u64) -> StreamItem {
    StreamItem::Ok(RawChunk {
        candidates: vec![],
        usage_metadata: Some(UsageInfo {
            prompt_token_count: 0,
            candidates_token_count: 0,
            total_token_count: total,
            api_time_ms: Some(10),
        }),
    })
}

pub fn interrupted_chunk() -> StreamItem {
    StreamItem::Err(StreamError::new(StreamErrorKind::Interrupted, "the stream was interrupted"))
}

pub fn next_speaker_json(speaker: &str) -> serde_json::Value {
    serde_json::json!({
        "reasoning": "scripted",
        "next_speaker": speaker,
    })
}

// --- configurable test tool ---

/// Arguments accepted by [TestTool]. Every field is optional; the tests
/// exercise different subsets.
#[derive(Debug, Default, Deserialize, JsonSchema)]
#[serde(default)]
pub struct TestToolParams {
    /// Path operated on by read-shaped tools.
    pub path: Option<String>,
    /// Target file for edit-shaped tools.
    pub file_path: Option<String>,
    pub old_string: Option<String>,
    pub new_string: Option<String>,
    /// When set, validation fails with this message.
    pub invalid: Option<String>,
}

type BehaviorFn = dyn Fn(&Map<String, serde_json::Value>) -> Result<String, String> + Send + Sync;

#[derive(Clone)]
pub enum ConfirmBehavior {
    /// Never asks for confirmation.
    None,
    /// Always presents the same confirmation.
    Static(Confirmation),
    /// Builds an edit confirmation (with a diff) from the current args.
    EditFromArgs,
}

pub struct TestTool {
    name: String,
    confirm: ConfirmBehavior,
    behavior: Arc<BehaviorFn>,
    delay: Duration,
    streams: bool,
    modifiable: bool,
    executed_args: Arc<Mutex<Vec<Map<String, serde_json::Value>>>>,
}

impl std::fmt::Debug for TestTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestTool").field("name", &self.name).finish()
    }
}

impl TestTool {
    pub fn new(name: &str, output: &str) -> Self {
        let output = output.to_string();
        Self::with_behavior(name, move |_| Ok(output.clone()))
    }

    pub fn with_behavior(
        name: &str,
        behavior: impl Fn(&Map<String, serde_json::Value>) -> Result<String, String> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.to_string(),
            confirm: ConfirmBehavior::None,
            behavior: Arc::new(behavior),
            delay: Duration::ZERO,
            streams: false,
            modifiable: false,
            executed_args: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn confirming(mut self, confirm: ConfirmBehavior) -> Self {
        self.confirm = confirm;
        self
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn streaming(mut self) -> Self {
        self.streams = true;
        self
    }

    pub fn modifiable(mut self) -> Self {
        self.modifiable = true;
        self
    }

    /// Arguments of every execution so far, in completion order.
    pub fn executions(&self) -> Vec<Map<String, serde_json::Value>> {
        self.executed_args.lock().unwrap().clone()
    }
}

fn edit_confirmation(args: &Map<String, serde_json::Value>) -> Confirmation {
    let file_name = args
        .get("file_path")
        .and_then(|v| v.as_str())
        .unwrap_or("/work/file.txt")
        .to_string();
    let old = args.get("old_string").and_then(|v| v.as_str()).unwrap_or_default();
    let new = args.get("new_string").and_then(|v| v.as_str()).unwrap_or_default();
    Confirmation::Edit {
        file_name,
        file_diff: format!("-{}\n+{}", old, new),
    }
}

impl Tool for TestTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn display_name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "test tool"
    }

    fn parameter_schema(&self) -> serde_json::Value {
        let schema = schema_for!(TestToolParams);
        serde_json::to_value(schema).expect("creating tool schema should not fail")
    }

    fn can_stream_output(&self) -> bool {
        self.streams
    }

    fn validate_params(&self, args: &Map<String, serde_json::Value>) -> Option<String> {
        args.get("invalid")
            .and_then(|v| v.as_str())
            .map(|msg| msg.to_string())
    }

    fn should_confirm(
        &self,
        args: Map<String, serde_json::Value>,
        _cancel_token: CancellationToken,
    ) -> ToolFuture<Result<Option<Confirmation>, ToolError>> {
        let confirmation = match &self.confirm {
            ConfirmBehavior::None => None,
            ConfirmBehavior::Static(c) => Some(c.clone()),
            ConfirmBehavior::EditFromArgs => Some(edit_confirmation(&args)),
        };
        Box::pin(async move { Ok(confirmation) })
    }

    fn execute(
        &self,
        args: Map<String, serde_json::Value>,
        cancel_token: CancellationToken,
        live_output: Option<LiveOutputFn>,
    ) -> ToolFuture<Result<ToolOutput, ToolError>> {
        let behavior = Arc::clone(&self.behavior);
        let executed = Arc::clone(&self.executed_args);
        let delay = self.delay;
        Box::pin(async move {
            if let Some(live) = &live_output {
                live("running".to_string());
            }
            tokio::select! {
                _ = cancel_token.cancelled() => return Err(ToolError::Cancelled),
                _ = tokio::time::sleep(delay) => {},
            }
            executed.lock().unwrap().push(args.clone());
            match behavior(&args) {
                Ok(output) => Ok(ToolOutput::text(output)),
                Err(message) => Err(ToolError::Execution(message)),
            }
        })
    }

    fn modify_context(&self) -> Option<Arc<dyn ModifyContext>> {
        if self.modifiable {
            Some(Arc::new(ReplaceModify))
        } else {
            None
        }
    }
}

/// Modify context for a `replace`-shaped tool: the proposed content is the
/// new string applied to a one-line file.
#[derive(Debug)]
struct ReplaceModify;

impl ModifyContext for ReplaceModify {
    fn file_path(&self, args: &Map<String, serde_json::Value>) -> String {
        args.get("file_path")
            .and_then(|v| v.as_str())
            .unwrap_or("/work/file.txt")
            .to_string()
    }

    fn current_content(&self, args: Map<String, serde_json::Value>) -> ToolFuture<Result<String, ToolError>> {
        Box::pin(async move {
            Ok(args
                .get("old_string")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string())
        })
    }

    fn proposed_content(&self, args: Map<String, serde_json::Value>) -> ToolFuture<Result<String, ToolError>> {
        Box::pin(async move {
            Ok(args
                .get("new_string")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string())
        })
    }

    fn updated_params(
        &self,
        _old_content: &str,
        new_content: &str,
        args: &Map<String, serde_json::Value>,
    ) -> Map<String, serde_json::Value> {
        let mut updated = args.clone();
        updated.insert(
            "new_string".to_string(),
            serde_json::Value::String(new_content.trim_end_matches('\n').to_string()),
        );
        updated
    }
}

// --- test case builder ---

pub struct TestCaseBuilder {
    responses: Vec<Vec<StreamItem>>,
    json_responses: Vec<serde_json::Value>,
    token_counts: Vec<u64>,
    tools: Vec<Arc<TestTool>>,
    seed_history: Vec<Message>,
    config: SchedulerConfig,
    approvals: Vec<ConfirmationOutcome>,
    cancel_on_confirmation: bool,
}

impl Default for TestCaseBuilder {
    fn default() -> Self {
        Self {
            responses: Vec::new(),
            json_responses: Vec::new(),
            token_counts: Vec::new(),
            tools: Vec::new(),
            seed_history: Vec::new(),
            config: SchedulerConfig::default(),
            approvals: Vec::new(),
            cancel_on_confirmation: false,
        }
    }
}

impl TestCaseBuilder {
    pub fn with_response(mut self, items: Vec<StreamItem>) -> Self {
        self.responses.push(items);
        self
    }

    pub fn with_json_response(mut self, value: serde_json::Value) -> Self {
        self.json_responses.push(value);
        self
    }

    pub fn with_token_count(mut self, count: u64) -> Self {
        self.token_counts.push(count);
        self
    }

    pub fn with_tool(mut self, tool: TestTool) -> Self {
        self.tools.push(Arc::new(tool));
        self
    }

    pub fn with_seed_history(mut self, messages: Vec<Message>) -> Self {
        self.seed_history = messages;
        self
    }

    pub fn with_config(mut self, f: impl FnOnce(&mut SchedulerConfig)) -> Self {
        f(&mut self.config);
        self
    }

    pub fn with_collaborators(mut self, collaborators: Collaborators) -> Self {
        self.config.collaborators = collaborators;
        self
    }

    pub fn with_approvals(mut self, approvals: impl IntoIterator<Item = ConfirmationOutcome>) -> Self {
        self.approvals.extend(approvals);
        self
    }

    pub fn cancel_on_confirmation(mut self) -> Self {
        self.cancel_on_confirmation = true;
        self
    }

    pub fn build(self) -> TestCase {
        let _ = tracing_subscriber::fmt::try_init();

        let mut model = MockModel::new();
        for response in self.responses {
            model = model.with_response(response);
        }
        for json in self.json_responses {
            model = model.with_json_response(json);
        }
        for count in self.token_counts {
            model = model.with_token_count(count);
        }

        let mut session = ChatSession::new(Arc::new(model.clone()), ChatSessionConfig::default())
            .with_retry_policy(RetryPolicy::immediate(3));
        if !self.seed_history.is_empty() {
            session.set_history(self.seed_history);
        }

        let mut registry = ToolRegistry::new();
        let mut tools = HashMap::new();
        for tool in self.tools {
            tools.insert(tool.name().to_string(), Arc::clone(&tool));
            registry.register(tool);
        }

        let handle = Scheduler::new(session, registry, self.config).spawn();
        TestCase {
            handle,
            model,
            tools,
            events: Vec::new(),
            approvals: self.approvals,
            approval_index: 0,
            cancel_on_confirmation: self.cancel_on_confirmation,
            cancel_token: CancellationToken::new(),
        }
    }
}

pub struct TestCase {
    pub handle: SchedulerHandle,
    pub model: MockModel,
    pub events: Vec<SchedulerEvent>,
    tools: HashMap<String, Arc<TestTool>>,
    approvals: Vec<ConfirmationOutcome>,
    approval_index: usize,
    cancel_on_confirmation: bool,
    cancel_token: CancellationToken,
}

impl TestCase {
    pub fn builder() -> TestCaseBuilder {
        TestCaseBuilder::default()
    }

    pub fn tool(&self, name: &str) -> &Arc<TestTool> {
        self.tools.get(name).expect("tool should be registered")
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel_token
    }

    /// Submits a turn and pumps events (answering confirmations from the
    /// scripted approvals) until the turn completes.
    pub async fn submit_and_run(&mut self, query: &str) {
        self.cancel_token = CancellationToken::new();
        self.handle
            .submit(query, self.cancel_token.clone())
            .await
            .expect("submit should succeed");
        self.pump_until_turn_complete(Duration::from_secs(5)).await;
    }

    pub async fn pump_until_turn_complete(&mut self, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        loop {
            let event = tokio::time::timeout_at(deadline.into(), self.handle.recv())
                .await
                .expect("timed out waiting for turn completion")
                .expect("event channel closed");
            self.events.push(event.clone());
            match event {
                SchedulerEvent::ToolCallConfirmation { call_id, .. } => {
                    if self.cancel_on_confirmation {
                        self.cancel_token.cancel();
                        continue;
                    }
                    let outcome = self
                        .approvals
                        .get(self.approval_index)
                        .copied()
                        .expect("a confirmation arrived without a scripted approval");
                    self.approval_index += 1;
                    self.handle
                        .resolve_confirmation(call_id, outcome)
                        .await
                        .expect("failed to resolve confirmation");
                },
                SchedulerEvent::TurnComplete => break,
                _ => {},
            }
        }
    }

    pub fn events_of_kind(&self, predicate: impl Fn(&SchedulerEvent) -> bool) -> Vec<&SchedulerEvent> {
        self.events.iter().filter(|e| predicate(e)).collect()
    }

    pub fn full_text(&self) -> String {
        self.events
            .iter()
            .filter_map(|e| match e {
                SchedulerEvent::Content(text) => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    pub async fn curated_history(&self) -> Vec<Message> {
        self.handle.get_history(true).await.expect("get_history should succeed")
    }

    pub async fn comprehensive_history(&self) -> Vec<Message> {
        self.handle.get_history(false).await.expect("get_history should succeed")
    }
}
