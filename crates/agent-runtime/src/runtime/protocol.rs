//! Requests, responses, and events exchanged with the scheduler actor.

use serde::{
    Deserialize,
    Serialize,
};
use tokio::sync::{
    mpsc,
    oneshot,
};
use tokio_util::sync::CancellationToken;

use super::tool_calls::ToolCallView;
use crate::model::types::{
    Message,
    ThoughtSummary,
    UsageInfo,
};
use crate::session::compress::CompressionSnapshot;
use crate::session::SessionError;
use crate::tools::{
    Confirmation,
    ConfirmationOutcome,
};

/// Events pushed to scheduler listeners, in the order the scheduler
/// observes them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value")]
#[serde(rename_all = "camelCase")]
pub enum SchedulerEvent {
    /// A streamed chunk of model text.
    Content(String),
    /// A finalized block of model text, cut at a markdown-safe point. The
    /// stream continues with a fresh pending block.
    ContentFinalized(String),
    /// A parsed reasoning summary.
    Thought(ThoughtSummary),
    /// The tool call batch changed (state transition or live output).
    ToolCallsUpdated(Vec<ToolCallView>),
    /// One call is waiting for the user's decision.
    ToolCallConfirmation {
        call_id: String,
        name: String,
        description: String,
        confirmation: Confirmation,
    },
    /// History was compressed before entering the model.
    ChatCompressed(CompressionSnapshot),
    UsageMetadata(UsageInfo),
    /// The turn was cancelled by the user.
    UserCancelled,
    /// An informational line for the transcript.
    Info(String),
    /// The turn failed; the session itself is preserved.
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        status: Option<u16>,
    },
    /// The scheduler yielded the turn back to the user.
    TurnComplete,
}

/// Requests accepted by the scheduler actor.
#[derive(Debug)]
pub enum SchedulerRequest {
    /// Submit one user turn. The caller owns the cancellation token and may
    /// fire it at any point to abort the turn.
    Submit {
        query: String,
        cancel_token: CancellationToken,
    },
    /// The user's decision for a call in `awaiting_approval`.
    ResolveConfirmation {
        call_id: String,
        outcome: ConfirmationOutcome,
    },
    /// Deep copy of the session history.
    GetHistory { curated: bool },
}

#[derive(Debug, Clone)]
pub enum SchedulerResponse {
    Success,
    History(Vec<Message>),
}

/// How many requests may queue ahead of the scheduler task. The scheduler
/// serves a single interactive surface, so a short queue is plenty; a full
/// queue pushes back on the caller instead of piling up turns.
const COMMAND_QUEUE_DEPTH: usize = 4;

/// One request in flight to the scheduler task, carrying the channel its
/// reply comes back on.
#[derive(Debug)]
pub(crate) struct Envelope {
    pub request: SchedulerRequest,
    pub reply_tx: oneshot::Sender<Result<SchedulerResponse, SchedulerError>>,
}

/// Sender half held by [super::SchedulerHandle].
#[derive(Debug, Clone)]
pub(crate) struct CommandSender {
    tx: mpsc::Sender<Envelope>,
}

impl CommandSender {
    /// Sends one request and awaits its reply.
    ///
    /// A closed channel in either direction means the scheduler task has
    /// exited, which surfaces uniformly as [SchedulerError::Channel].
    pub async fn call(&self, request: SchedulerRequest) -> Result<SchedulerResponse, SchedulerError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(Envelope { request, reply_tx })
            .await
            .map_err(|_| SchedulerError::Channel)?;
        reply_rx.await.map_err(|_| SchedulerError::Channel)?
    }
}

pub(crate) type CommandReceiver = mpsc::Receiver<Envelope>;

pub(crate) fn command_channel() -> (CommandSender, CommandReceiver) {
    let (tx, rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
    (CommandSender { tx }, rx)
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum SchedulerError {
    #[error("a turn is already in progress")]
    TurnActive,
    #[error("cannot schedule a new batch while calls are executing or awaiting approval")]
    BatchActive,
    #[error("no tool call with id '{0}'")]
    UnknownCallId(String),
    #[error("tool call '{0}' is not awaiting approval")]
    NotAwaitingApproval(String),
    #[error("tool call '{0}' does not support modification")]
    NotModifiable(String),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("the scheduler channel has closed")]
    Channel,
    #[error("{0}")]
    Internal(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_command_round_trip() {
        let (sender, mut rx) = command_channel();
        tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                let _ = envelope.reply_tx.send(Ok(SchedulerResponse::History(vec![])));
            }
        });

        let response = sender.call(SchedulerRequest::GetHistory { curated: true }).await.unwrap();
        assert!(matches!(response, SchedulerResponse::History(h) if h.is_empty()));
    }

    #[tokio::test]
    async fn test_exited_scheduler_surfaces_channel_error() {
        let (sender, rx) = command_channel();
        drop(rx);
        let err = sender.call(SchedulerRequest::GetHistory { curated: false }).await.unwrap_err();
        assert!(matches!(err, SchedulerError::Channel));
    }

    #[tokio::test]
    async fn test_dropped_reply_surfaces_channel_error() {
        let (sender, mut rx) = command_channel();
        tokio::spawn(async move {
            // Receive the envelope but drop it without replying.
            let _ = rx.recv().await;
        });
        let err = sender.call(SchedulerRequest::GetHistory { curated: false }).await.unwrap_err();
        assert!(matches!(err, SchedulerError::Channel));
    }
}
