//! Runs tool calls on background tasks so the scheduler loop stays
//! responsive while executions are in flight.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{
    Duration,
    Instant,
};

use serde_json::Map;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::tools::{
    LiveOutputFn,
    Tool,
    ToolError,
    ToolOutput,
};

#[derive(Debug)]
pub enum ExecutorEvent {
    /// The latest live-output chunk from a streaming tool.
    LiveOutput { call_id: String, chunk: String },
    /// A tool execution finished.
    Done {
        call_id: String,
        result: ExecutionResult,
        duration: Duration,
    },
}

#[derive(Debug)]
pub enum ExecutionResult {
    Output(ToolOutput),
    Error(ToolError),
    Cancelled,
}

/// Spawns one task per executing call and funnels completions back through
/// a single channel the scheduler selects on.
#[derive(Debug)]
pub struct ToolExecutor {
    event_tx: mpsc::Sender<ExecutorEvent>,
    event_rx: mpsc::Receiver<ExecutorEvent>,
    executing: HashMap<String, CancellationToken>,
}

impl ToolExecutor {
    pub fn new() -> Self {
        let (event_tx, event_rx) = mpsc::channel(64);
        Self {
            event_tx,
            event_rx,
            executing: HashMap::new(),
        }
    }

    pub fn executing_count(&self) -> usize {
        self.executing.len()
    }

    /// Starts executing one call. The execution races a child of
    /// `parent_token`; distinct calls proceed in parallel with no ordering
    /// guarantees.
    pub fn start(
        &mut self,
        call_id: String,
        tool: Arc<dyn Tool>,
        args: Map<String, serde_json::Value>,
        parent_token: &CancellationToken,
    ) {
        let cancel_token = parent_token.child_token();
        let result_tx = self.event_tx.clone();

        let live_output: Option<LiveOutputFn> = if tool.can_stream_output() {
            let live_tx = self.event_tx.clone();
            let live_call_id = call_id.clone();
            Some(Arc::new(move |chunk: String| {
                // Only the most recent chunk matters; dropping under
                // backpressure is fine.
                let _ = live_tx.try_send(ExecutorEvent::LiveOutput {
                    call_id: live_call_id.clone(),
                    chunk,
                });
            }))
        } else {
            None
        };

        let task_token = cancel_token.clone();
        let task_call_id = call_id.clone();
        tokio::spawn(async move {
            let started = Instant::now();
            let fut = tool.execute(args, task_token.clone(), live_output);
            let result = tokio::select! {
                _ = task_token.cancelled() => ExecutionResult::Cancelled,
                res = fut => match res {
                    Ok(output) => ExecutionResult::Output(output),
                    Err(ToolError::Cancelled) => ExecutionResult::Cancelled,
                    Err(err) => ExecutionResult::Error(err),
                },
            };
            let _ = result_tx
                .send(ExecutorEvent::Done {
                    call_id: task_call_id,
                    result,
                    duration: started.elapsed(),
                })
                .await;
        });

        debug!(call_id, "started tool execution");
        self.executing.insert(call_id, cancel_token);
    }

    /// Cancels one executing call; the completion arrives as a `Done` event.
    pub fn cancel(&self, call_id: &str) {
        if let Some(token) = self.executing.get(call_id) {
            token.cancel();
        }
    }

    pub fn cancel_all(&self) {
        for token in self.executing.values() {
            token.cancel();
        }
    }

    /// Receives the next executor event. Pending forever while nothing is
    /// executing, which makes it safe to select on unconditionally.
    pub async fn recv(&mut self) -> ExecutorEvent {
        loop {
            match self.event_rx.recv().await {
                Some(event) => {
                    if let ExecutorEvent::Done { call_id, .. } = &event {
                        self.executing.remove(call_id);
                    }
                    return event;
                },
                // Unreachable: the executor owns a sender for its lifetime.
                None => std::future::pending().await,
            }
        }
    }
}

impl Default for ToolExecutor {
    fn default() -> Self {
        Self::new()
    }
}
