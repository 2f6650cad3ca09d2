//! Per-turn state: the continuation budget and the pending text buffer that
//! lets long responses render incrementally.

use std::time::Instant;

use tokio_util::sync::CancellationToken;

use crate::model::types::UsageInfo;

/// Flush the pending buffer once it grows past this many bytes and a safe
/// split point exists.
const FLUSH_THRESHOLD: usize = 1024;

#[derive(Debug)]
pub struct TurnContext {
    cancel_token: CancellationToken,
    remaining_turns: u32,
    pending_text: String,
    last_usage: Option<UsageInfo>,
    started: Instant,
}

impl TurnContext {
    pub fn new(cancel_token: CancellationToken, budget: u32) -> Self {
        Self {
            cancel_token,
            remaining_turns: budget,
            pending_text: String::new(),
            last_usage: None,
            started: Instant::now(),
        }
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel_token
    }

    pub fn remaining_turns(&self) -> u32 {
        self.remaining_turns
    }

    /// Consumes one unit of the continuation budget. Returns false when the
    /// budget is exhausted.
    pub fn try_consume_turn(&mut self) -> bool {
        if self.remaining_turns == 0 {
            return false;
        }
        self.remaining_turns -= 1;
        true
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    pub fn set_usage(&mut self, usage: UsageInfo) {
        self.last_usage = Some(usage);
    }

    pub fn last_usage(&self) -> Option<UsageInfo> {
        self.last_usage
    }

    /// Appends streamed text to the pending buffer. When the buffer has
    /// grown past the flush threshold and a markdown-safe split point
    /// exists, the finalized prefix is returned and the remainder carries
    /// over.
    pub fn push_text(&mut self, chunk: &str) -> Option<String> {
        self.pending_text.push_str(chunk);
        if self.pending_text.len() < FLUSH_THRESHOLD {
            return None;
        }
        let split = find_last_safe_split_point(&self.pending_text);
        if split == 0 {
            return None;
        }
        let remainder = self.pending_text.split_off(split);
        let flushed = std::mem::replace(&mut self.pending_text, remainder);
        Some(flushed)
    }

    /// Takes whatever text is still buffered, if any.
    pub fn take_pending(&mut self) -> Option<String> {
        if self.pending_text.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.pending_text))
        }
    }

    /// Drops buffered text without surfacing it (cancellation path).
    pub fn discard_pending(&mut self) {
        self.pending_text.clear();
    }
}

/// Whether the byte index sits inside a fenced code block.
fn is_index_inside_code_block(content: &str, index: usize) -> bool {
    let mut fences = 0;
    let mut search_from = 0;
    while let Some(pos) = content[search_from..].find("```") {
        let absolute = search_from + pos;
        if absolute >= index {
            break;
        }
        fences += 1;
        search_from = absolute + 3;
    }
    fences % 2 == 1
}

/// Start index of the fence that encloses `index`, if any.
fn find_enclosing_code_block_start(content: &str, index: usize) -> Option<usize> {
    if !is_index_inside_code_block(content, index) {
        return None;
    }
    let mut last_open = None;
    let mut fences = 0;
    let mut search_from = 0;
    while let Some(pos) = content[search_from..].find("```") {
        let absolute = search_from + pos;
        if absolute >= index {
            break;
        }
        if fences % 2 == 0 {
            last_open = Some(absolute);
        }
        fences += 1;
        search_from = absolute + 3;
    }
    last_open
}

/// Finds the last byte index at which `content` can be cut so that the
/// prefix renders as complete markdown: either just before an unterminated
/// code fence, or after the last blank line that is not inside a fence.
///
/// Returns 0 when no safe cut exists.
pub fn find_last_safe_split_point(content: &str) -> usize {
    if let Some(block_start) = find_enclosing_code_block_start(content, content.len()) {
        return block_start;
    }

    let mut search_end = content.len();
    while let Some(pos) = content[..search_end].rfind("\n\n") {
        let split = pos + 2;
        if !is_index_inside_code_block(content, split) {
            return split;
        }
        search_end = pos;
    }
    0
}
