//! History compression: replacing a long conversation with a model-generated
//! summary while preserving the alternation invariant.

use serde::{
    Deserialize,
    Serialize,
};

/// Compress once the curated history reaches this fraction of the model's
/// context window.
pub const COMPRESSION_TOKEN_THRESHOLD: f64 = 0.95;

/// The model's acknowledgement seeded after the summary.
pub const COMPRESSION_ACK: &str = "Got it. Thanks for the summary!";

/// Before/after token counts recorded when compression fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompressionSnapshot {
    pub original_token_count: u64,
    pub new_token_count: u64,
}

/// The summarization request appended to the history being compressed.
pub fn compression_prompt() -> &'static str {
    "[SYSTEM NOTE: This is an automated summarization request, not from the user]\n\n\
    Summarize the conversation so far into a structured document that a fresh \
    session could resume from. The summary replaces the full history, so it must \
    capture everything needed to continue the work:\n\
    1) The user's goals and any explicit constraints they stated\n\
    2) Every significant tool call executed, with its outcome\n\
    3) File paths, code fragments, and technical decisions discussed\n\
    4) Work that remains unfinished, as concrete next steps\n\n\
    Write the summary in third person as a document, not as a chat reply. Do not \
    address the user. Filter out greetings and other chat conventions."
}
