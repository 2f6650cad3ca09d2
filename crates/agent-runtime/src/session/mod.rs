pub mod compress;
pub mod history;
pub mod retry;
pub mod token_limits;

use std::sync::Arc;

use compress::{
    CompressionSnapshot,
    COMPRESSION_ACK,
    COMPRESSION_TOKEN_THRESHOLD,
};
use futures::future::BoxFuture;
use futures::StreamExt;
use history::History;
use retry::{
    RetryPolicy,
    RetryState,
};
use serde::{
    Deserialize,
    Serialize,
};
use token_limits::token_limit;
use tokio_util::sync::CancellationToken;
use tracing::{
    debug,
    info,
    warn,
};

use crate::model::types::{
    FunctionDeclaration,
    Message,
    Part,
    StreamError,
    StreamErrorKind,
    StreamItem,
};
use crate::model::{
    Model,
    ModelRequest,
    ModelStream,
};

/// Consulted when the model keeps getting throttled. Returning true switches
/// the session to the fallback model and restarts the retry allowance.
pub trait FlashFallbackHandler: Send + Sync {
    fn on_persistent_throttle(&self, current_model: &str, fallback_model: &str) -> BoxFuture<'static, bool>;
}

/// How the session authenticates against the backend. The fallback-model
/// handler is only consulted for OAuth sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AuthKind {
    OAuth,
    ApiKey,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSessionConfig {
    pub model_id: String,
    /// Model switched to on persistent throttling.
    pub fallback_model_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<String>,
    pub auth_kind: AuthKind,
    /// Environment preamble seeded at session start and preserved across
    /// compression resets.
    #[serde(default)]
    pub environment: Vec<Message>,
}

impl Default for ChatSessionConfig {
    fn default() -> Self {
        Self {
            model_id: "gemini-2.5-pro".to_string(),
            fallback_model_id: "gemini-2.5-flash".to_string(),
            system_instruction: None,
            auth_kind: AuthKind::OAuth,
            environment: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Stream(#[from] StreamError),
    #[error("the request was cancelled")]
    Cancelled,
    #[error("{0}")]
    Internal(String),
}

/// Owns the conversation history, the active model id, the system
/// instruction, and the tool declarations sent with every request.
///
/// All mutation happens through `&mut self` from the scheduler actor, which
/// is what serializes concurrent sends: a second send cannot begin until the
/// first has finished appending its model output.
#[derive(Debug)]
pub struct ChatSession {
    model: Arc<dyn Model>,
    config: ChatSessionConfig,
    tools: Vec<FunctionDeclaration>,
    history: History,
    retry_policy: RetryPolicy,
    flash_fallback: Option<Arc<dyn FlashFallbackHandler>>,
}

impl std::fmt::Debug for dyn FlashFallbackHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<FlashFallbackHandler>")
    }
}

impl ChatSession {
    pub fn new(model: Arc<dyn Model>, config: ChatSessionConfig) -> Self {
        let history = History::from_messages(config.environment.clone());
        Self {
            model,
            config,
            tools: Vec::new(),
            history,
            retry_policy: RetryPolicy::default(),
            flash_fallback: None,
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn with_flash_fallback(mut self, handler: Arc<dyn FlashFallbackHandler>) -> Self {
        self.flash_fallback = Some(handler);
        self
    }

    pub fn model_id(&self) -> &str {
        &self.config.model_id
    }

    pub fn set_tools(&mut self, tools: Vec<FunctionDeclaration>) {
        self.tools = tools;
    }

    // --- history API ---

    pub fn get_history(&self, curated: bool) -> Vec<Message> {
        self.history.get(curated)
    }

    pub fn set_history(&mut self, messages: Vec<Message>) {
        self.history.set(messages);
    }

    pub fn clear(&mut self) {
        self.history.set(self.config.environment.clone());
    }

    pub fn append_user(&mut self, message: Message) {
        self.history.append(message);
    }

    /// Records one model output into history, applying the merge rules.
    pub fn record_model_output(&mut self, parts: Vec<Part>, input_was_function_response: bool) {
        self.history.record_model_output(parts, input_was_function_response);
    }

    pub fn last_message(&self) -> Option<&Message> {
        self.history.last()
    }

    /// If the last message is an empty model message, inserts an empty text
    /// part so the entry survives serialization. Returns whether it did.
    ///
    /// Used by the next-speaker shortcut for empty model turns.
    pub fn pad_empty_model_tail(&mut self) -> bool {
        match self.history.last_mut() {
            Some(last) if last.role == crate::model::types::Role::Model && last.parts.is_empty() => {
                last.parts.push(Part::Text(String::new()));
                true
            },
            _ => false,
        }
    }

    // --- model API ---

    /// Records one completed send: the user input and the model output it
    /// produced are appended together, applying the merge rules.
    ///
    /// Recording is deferred to stream completion so a cancelled turn leaves
    /// the curated history untouched.
    pub fn record_turn(&mut self, user_message: Message, model_parts: Vec<Part>) {
        let input_was_function_response = user_message.is_function_response();
        self.history.append(user_message);
        self.history.record_model_output(model_parts, input_was_function_response);
    }

    /// Opens a model stream over the curated history plus `user_message`.
    ///
    /// The message is not recorded; call [Self::record_turn] once the stream
    /// has been fully consumed. Transient failures (throttling, 5xx) before
    /// the first chunk are retried with backoff; persistent throttling
    /// consults the fallback handler. Cancellation is never retried.
    pub async fn send_stream(&mut self, user_message: &Message, cancel_token: CancellationToken) -> ModelStream {
        let mut retry = RetryState::new(self.retry_policy.clone());

        loop {
            if cancel_token.is_cancelled() {
                return Box::pin(futures::stream::iter([StreamItem::Err(StreamError::new(
                    StreamErrorKind::Interrupted,
                    "the stream was interrupted",
                ))]));
            }

            let mut request = self.build_request(true);
            request.messages.push(user_message.clone());
            debug!(model = %request.model, messages = request.messages.len(), "sending model request");
            let mut stream = self.model.stream(request, cancel_token.clone());

            match stream.next().await {
                None => return Box::pin(futures::stream::empty()),
                Some(first @ StreamItem::Ok(_)) => {
                    return Box::pin(futures::stream::iter([first]).chain(stream));
                },
                Some(StreamItem::Err(err)) => {
                    if cancel_token.is_cancelled() || err.kind == StreamErrorKind::Interrupted {
                        return Box::pin(futures::stream::iter([StreamItem::Err(err)]));
                    }

                    let will_retry = retry.backoff_or_give_up(&err).await;

                    if retry.throttling_is_persistent() && self.try_flash_fallback().await {
                        retry.reset();
                        continue;
                    }

                    if will_retry {
                        continue;
                    }
                    return Box::pin(futures::stream::iter([StreamItem::Err(err)]));
                },
            }
        }
    }

    /// Switches to the fallback model if the configured handler approves.
    async fn try_flash_fallback(&mut self) -> bool {
        if self.config.auth_kind != AuthKind::OAuth {
            return false;
        }
        if self.config.model_id == self.config.fallback_model_id {
            return false;
        }
        let Some(handler) = self.flash_fallback.clone() else {
            return false;
        };
        if handler
            .on_persistent_throttle(&self.config.model_id, &self.config.fallback_model_id)
            .await
        {
            info!(
                from = %self.config.model_id,
                to = %self.config.fallback_model_id,
                "switching to fallback model after persistent throttling"
            );
            self.config.model_id = self.config.fallback_model_id.clone();
            true
        } else {
            false
        }
    }

    /// Counts the tokens the given contents occupy for the current model.
    pub async fn count_tokens(&self, contents: &[Message]) -> Result<Option<u64>, SessionError> {
        Ok(self.model.count_tokens(&self.config.model_id, contents).await?)
    }

    /// Structured generation over the curated history plus `extra` messages.
    pub async fn generate_json(
        &self,
        extra: Vec<Message>,
        schema: serde_json::Value,
        cancel_token: CancellationToken,
    ) -> Result<serde_json::Value, SessionError> {
        let mut messages = self.history.get(true);
        messages.extend(extra);
        let request = ModelRequest {
            model: self.config.model_id.clone(),
            messages,
            tools: None,
            system_instruction: self.config.system_instruction.clone(),
        };
        Ok(self.model.generate_json(request, schema, cancel_token).await?)
    }

    /// Compresses the history when forced or when the curated view reaches
    /// the token threshold. Returns the before/after counts when it fired.
    pub async fn try_compress(
        &mut self,
        force: bool,
        cancel_token: CancellationToken,
    ) -> Result<Option<CompressionSnapshot>, SessionError> {
        let curated = self.history.get(true);
        if curated.is_empty() {
            return Ok(None);
        }

        let original_token_count = match self.count_tokens(&curated).await? {
            Some(count) => count,
            None if force => 0,
            None => {
                warn!("token count unavailable, skipping compression check");
                return Ok(None);
            },
        };

        let limit = token_limit(&self.config.model_id);
        if !force && (original_token_count as f64) < COMPRESSION_TOKEN_THRESHOLD * limit as f64 {
            return Ok(None);
        }

        let mut contents = curated;
        contents.push(Message::user(vec![Part::Text(compress::compression_prompt().to_string())]));
        let request = ModelRequest {
            model: self.config.model_id.clone(),
            messages: contents,
            tools: None,
            system_instruction: self.config.system_instruction.clone(),
        };
        let summary = self.collect_text(request, cancel_token).await?;
        if summary.is_empty() {
            warn!("compression skipped: the model did not return a summary");
            return Ok(None);
        }

        let mut new_history = self.config.environment.clone();
        new_history.push(Message::user(vec![Part::Text(summary)]));
        new_history.push(Message::model(vec![Part::Text(COMPRESSION_ACK.to_string())]));
        self.history.set(new_history);

        let new_token_count = self.count_tokens(&self.history.get(true)).await?.unwrap_or(0);
        info!(original_token_count, new_token_count, "compressed chat history");
        Ok(Some(CompressionSnapshot {
            original_token_count,
            new_token_count,
        }))
    }

    /// Drives a non-streaming send by collecting the full response text.
    async fn collect_text(&self, request: ModelRequest, cancel_token: CancellationToken) -> Result<String, SessionError> {
        let mut stream = self.model.stream(request, cancel_token.clone());
        let mut text = String::new();
        while let Some(item) = stream.next().await {
            match item {
                StreamItem::Ok(chunk) => {
                    for candidate in chunk.candidates {
                        let Some(content) = candidate.content else { continue };
                        for part in content.parts {
                            if part.thought {
                                continue;
                            }
                            if let Some(t) = part.text {
                                text.push_str(&t);
                            }
                        }
                    }
                },
                StreamItem::Err(err) if err.kind == StreamErrorKind::Interrupted => {
                    return Err(SessionError::Cancelled);
                },
                StreamItem::Err(err) => return Err(err.into()),
            }
        }
        Ok(text)
    }

    fn build_request(&self, with_tools: bool) -> ModelRequest {
        ModelRequest {
            model: self.config.model_id.clone(),
            messages: self.history.get(true),
            tools: if with_tools && !self.tools.is_empty() {
                Some(self.tools.clone())
            } else {
                None
            },
            system_instruction: self.config.system_instruction.clone(),
        }
    }
}
