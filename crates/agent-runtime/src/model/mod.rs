pub mod demux;
pub mod types;

use std::pin::Pin;
use std::sync::{
    Arc,
    Mutex,
};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::{
    FutureExt,
    Stream,
};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{
    debug,
    error,
    trace,
};
use types::{
    FunctionDeclaration,
    Message,
    StreamError,
    StreamErrorKind,
    StreamItem,
};

pub type ModelStream = Pin<Box<dyn Stream<Item = StreamItem> + Send + 'static>>;

/// A request to the model backend.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelRequest {
    pub model: String,
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<FunctionDeclaration>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<String>,
}

/// Backend contract for a streaming generate-content compatible API.
///
/// Authentication and transport details live behind implementations of this
/// trait. Implementations must be cancel safe: once `cancel_token` fires the
/// returned stream should end promptly, emitting at most one
/// [StreamErrorKind::Interrupted] error.
pub trait Model: std::fmt::Debug + Send + Sync + 'static {
    /// Sends a conversation to the model, returning a stream of raw chunks.
    fn stream(&self, request: ModelRequest, cancel_token: CancellationToken) -> ModelStream;

    /// Non-streaming structured generation constrained by a JSON schema.
    ///
    /// Used for auxiliary decisions such as the next-speaker check.
    fn generate_json(
        &self,
        request: ModelRequest,
        schema: serde_json::Value,
        cancel_token: CancellationToken,
    ) -> BoxFuture<'static, Result<serde_json::Value, StreamError>>;

    /// Counts the tokens the given contents would occupy for `model`.
    ///
    /// Returns [None] when the backend cannot provide a count.
    fn count_tokens(&self, model: &str, contents: &[Message]) -> BoxFuture<'static, Result<Option<u64>, StreamError>>;

    /// Embeds the given text contents.
    fn embed(&self, model: &str, contents: Vec<String>) -> BoxFuture<'static, Result<Vec<Vec<f32>>, StreamError>>;
}

/// A scripted model backend for tests.
///
/// Responses are consumed in order; receiving more requests than scripted
/// responses panics, which surfaces broken test assumptions immediately.
#[derive(Debug, Clone)]
pub struct MockModel {
    inner: Arc<Mutex<mock::Inner>>,
}

impl MockModel {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(mock::Inner::new())),
        }
    }

    pub fn with_response(self, response: impl Into<MockResponse>) -> Self {
        self.inner.lock().unwrap().stream_responses.push(response.into());
        self
    }

    pub fn with_json_response(self, response: serde_json::Value) -> Self {
        self.inner.lock().unwrap().json_responses.push(response);
        self
    }

    pub fn with_token_count(self, count: u64) -> Self {
        self.inner.lock().unwrap().token_counts.push(count);
        self
    }

    /// All streaming requests received so far.
    pub fn requests(&self) -> Vec<ModelRequest> {
        self.inner.lock().unwrap().stream_requests.clone()
    }

    /// All structured-generation requests received so far.
    pub fn json_requests(&self) -> Vec<ModelRequest> {
        self.inner.lock().unwrap().json_requests.clone()
    }
}

impl Default for MockModel {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Default)]
pub struct MockResponse {
    items: Vec<StreamItem>,
    /// Delay before sending the first item.
    time_to_first_chunk_delay: Option<Duration>,
}

impl MockResponse {
    pub fn delayed(mut self, delay: Duration) -> Self {
        self.time_to_first_chunk_delay = Some(delay);
        self
    }

    async fn stream(self, tx: mpsc::Sender<StreamItem>, cancel_token: CancellationToken) {
        trace!(?self.items, "beginning stream for mock response");
        if let Some(delay) = self.time_to_first_chunk_delay {
            debug!(?delay, "sleeping before sending first chunk");
            tokio::time::sleep(delay).await;
        }
        for item in self.items {
            if cancel_token.is_cancelled() {
                let _ = tx
                    .send(StreamItem::Err(StreamError::new(
                        StreamErrorKind::Interrupted,
                        "the stream was interrupted",
                    )))
                    .await;
                return;
            }
            let _ = tx.send(item).await;
        }
    }
}

impl From<Vec<StreamItem>> for MockResponse {
    fn from(value: Vec<StreamItem>) -> Self {
        Self {
            items: value,
            ..Default::default()
        }
    }
}

impl Model for MockModel {
    fn stream(&self, request: ModelRequest, cancel_token: CancellationToken) -> ModelStream {
        let mut r = self.inner.lock().unwrap();
        let Some(response) = r.stream_responses.get(r.stream_index).cloned() else {
            error!("received an unexpected request: {:?}", request);
            panic!("received an unexpected request: {:?}", request);
        };
        r.stream_requests.push(request);
        r.stream_index += 1;
        drop(r);

        let (tx, rx) = mpsc::channel(32);
        tokio::spawn(async move {
            response.stream(tx, cancel_token).await;
        });
        Box::pin(ReceiverStream::new(rx))
    }

    fn generate_json(
        &self,
        request: ModelRequest,
        _schema: serde_json::Value,
        _cancel_token: CancellationToken,
    ) -> BoxFuture<'static, Result<serde_json::Value, StreamError>> {
        let mut r = self.inner.lock().unwrap();
        let response = r.json_responses.get(r.json_index).cloned();
        r.json_requests.push(request);
        r.json_index += 1;
        drop(r);

        async move {
            response.ok_or_else(|| StreamError::new(StreamErrorKind::Other, "no scripted json response"))
        }
        .boxed()
    }

    fn count_tokens(&self, _model: &str, _contents: &[Message]) -> BoxFuture<'static, Result<Option<u64>, StreamError>> {
        let mut r = self.inner.lock().unwrap();
        let count = r.token_counts.get(r.token_index).copied();
        r.token_index += 1;
        drop(r);

        async move { Ok(count) }.boxed()
    }

    fn embed(&self, _model: &str, contents: Vec<String>) -> BoxFuture<'static, Result<Vec<Vec<f32>>, StreamError>> {
        async move { Ok(vec![Vec::new(); contents.len()]) }.boxed()
    }
}

mod mock {
    use super::*;

    #[derive(Debug, Clone)]
    pub(super) struct Inner {
        pub stream_index: usize,
        pub stream_responses: Vec<MockResponse>,
        pub stream_requests: Vec<ModelRequest>,

        pub json_index: usize,
        pub json_responses: Vec<serde_json::Value>,
        pub json_requests: Vec<ModelRequest>,

        pub token_index: usize,
        pub token_counts: Vec<u64>,
    }

    impl Inner {
        pub(super) fn new() -> Self {
            Self {
                stream_index: 0,
                stream_responses: Vec::new(),
                stream_requests: Vec::new(),
                json_index: 0,
                json_responses: Vec::new(),
                json_requests: Vec::new(),
                token_index: 0,
                token_counts: Vec::new(),
            }
        }
    }
}

/// Builders for scripted stream chunks. Only compiled for tests.
#[cfg(test)]
pub mod testing {
    use serde_json::Map;

    use super::types::{
        FunctionCall,
        RawCandidate,
        RawChunk,
        RawContent,
        RawPart,
        Role,
        UsageInfo,
    };
    use super::StreamItem;

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

    pub fn call_chunk(id: Option<&str>, name: &str, args: Map<String, serde_json::Value>) -> StreamItem {
        chunk_of(RawPart {
            function_call: Some(FunctionCall {
                id: id.map(String::from),
                name: name.to_string(),
                args,
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
                api_time_ms: None,
            }),
        })
    }
}
