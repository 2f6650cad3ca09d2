//! Converts raw model stream chunks into typed scheduler events.

use serde::{
    Deserialize,
    Serialize,
};
use serde_json::Map;
use tracing::warn;

use super::types::{
    FunctionCall,
    Part,
    RawChunk,
    StreamError,
    StreamErrorKind,
    StreamItem,
    ThoughtSummary,
    UsageInfo,
};

/// A typed event produced from the raw model stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value")]
#[serde(rename_all = "camelCase")]
pub enum StreamEvent {
    /// A chunk of model text.
    Content(String),
    /// A parsed reasoning summary.
    Thought(ThoughtSummary),
    /// A complete function call emitted by the model.
    FunctionCall(FunctionCallInfo),
    /// Usage metadata, typically arriving near the end of the stream.
    UsageMetadata(UsageInfo),
    /// The stream failed. No further events follow.
    Error(StreamError),
    /// The cancellation token fired mid-stream. Emitted exactly once.
    UserCancelled,
}

/// A function call request, with its id guaranteed present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionCallInfo {
    pub call_id: String,
    pub name: String,
    pub args: Map<String, serde_json::Value>,
    pub is_client_initiated: bool,
}

impl FunctionCallInfo {
    pub fn from_wire(call: FunctionCall) -> Self {
        let call_id = call.id.unwrap_or_else(|| synthesize_call_id(&call.name));
        Self {
            call_id,
            name: call.name,
            args: call.args,
            is_client_initiated: false,
        }
    }
}

/// Generates an id of the form `<name>-<millis>-<6 hex chars>` for function
/// calls that arrive without one.
pub fn synthesize_call_id(name: &str) -> String {
    let millis = chrono::Utc::now().timestamp_millis();
    let suffix: u32 = rand::random::<u32>() & 0xff_ffff;
    format!("{}-{}-{:06x}", name, millis, suffix)
}

/// Splits a thought part's text into subject and description.
///
/// By convention the subject is the first substring wrapped in `**…**`; the
/// description is the remainder with that wrapper removed. Both are trimmed.
/// This textual convention exists for wire compatibility with the model and
/// is deliberately confined to this one function.
pub fn parse_thought(text: &str) -> ThoughtSummary {
    if let Some(open) = text.find("**") {
        let after = open + 2;
        if let Some(close_rel) = text[after..].find("**") {
            let close = after + close_rel;
            let subject = text[after..close].trim().to_string();
            let mut description = String::with_capacity(text.len());
            description.push_str(&text[..open]);
            description.push_str(&text[close + 2..]);
            return ThoughtSummary {
                subject,
                description: description.trim().to_string(),
            };
        }
    }
    ThoughtSummary {
        subject: String::new(),
        description: text.trim().to_string(),
    }
}

/// Incremental parse state for one model response stream.
///
/// Call [StreamDemux::next] with each raw item (and once with [None] at
/// stream end); typed events are pushed into the caller's buffer. The demux
/// also accumulates the model output parts that the session records into
/// history once the stream completes.
#[derive(Debug, Default)]
pub struct StreamDemux {
    /// Model output parts in arrival order (text and function calls; thought
    /// parts are never recorded).
    parts: Vec<Part>,
    calls: Vec<FunctionCallInfo>,
    usage: Option<UsageInfo>,
    errored: bool,
    cancelled_emitted: bool,
    ended: bool,
}

impl StreamDemux {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advances the parse state with the next raw item.
    ///
    /// `None` marks the end of the raw stream.
    pub fn next(&mut self, item: Option<StreamItem>, buf: &mut Vec<StreamEvent>) {
        let Some(item) = item else {
            self.ended = true;
            return;
        };

        if self.errored || self.cancelled_emitted {
            warn!(?item, "ignoring stream item after a terminal stream event");
            return;
        }

        match item {
            StreamItem::Ok(chunk) => self.next_chunk(chunk, buf),
            StreamItem::Err(err) if err.kind == StreamErrorKind::Interrupted => {
                self.cancelled_emitted = true;
                buf.push(StreamEvent::UserCancelled);
            },
            StreamItem::Err(err) => {
                self.errored = true;
                buf.push(StreamEvent::Error(err));
            },
        }
    }

    fn next_chunk(&mut self, chunk: RawChunk, buf: &mut Vec<StreamEvent>) {
        for candidate in chunk.candidates {
            let Some(content) = candidate.content else {
                continue;
            };
            for part in content.parts {
                if part.thought {
                    let summary = parse_thought(part.text.as_deref().unwrap_or(""));
                    buf.push(StreamEvent::Thought(summary));
                } else if let Some(call) = part.function_call {
                    let info = FunctionCallInfo::from_wire(call.clone());
                    self.parts.push(Part::FunctionCall(FunctionCall {
                        id: Some(info.call_id.clone()),
                        name: call.name,
                        args: call.args,
                    }));
                    self.calls.push(info.clone());
                    buf.push(StreamEvent::FunctionCall(info));
                } else if let Some(text) = part.text {
                    self.parts.push(Part::Text(text.clone()));
                    buf.push(StreamEvent::Content(text));
                } else if let Some(data) = part.inline_data {
                    self.parts.push(Part::InlineData(data));
                }
            }
        }

        if let Some(usage) = chunk.usage_metadata {
            self.usage = Some(usage);
            buf.push(StreamEvent::UsageMetadata(usage));
        }
    }

    pub fn ended(&self) -> bool {
        self.ended
    }

    pub fn errored(&self) -> bool {
        self.errored
    }

    pub fn cancelled(&self) -> bool {
        self.cancelled_emitted
    }

    pub fn calls(&self) -> &[FunctionCallInfo] {
        &self.calls
    }

    pub fn usage(&self) -> Option<UsageInfo> {
        self.usage
    }

    /// The accumulated model output, ready for the history merge rules.
    pub fn into_model_parts(self) -> Vec<Part> {
        self.parts
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::{
        call_chunk,
        text_chunk,
        thought_chunk,
        usage_chunk,
    };
    use super::super::types::StreamErrorKind;
    use super::*;

    fn drain(items: Vec<StreamItem>) -> (StreamDemux, Vec<StreamEvent>) {
        let mut demux = StreamDemux::new();
        let mut buf = Vec::new();
        for item in items {
            demux.next(Some(item), &mut buf);
        }
        demux.next(None, &mut buf);
        (demux, buf)
    }

    #[test]
    fn test_parse_thought_with_subject() {
        let summary = parse_thought("**Planning the edit** I should look at the file first.");
        assert_eq!(summary.subject, "Planning the edit");
        assert_eq!(summary.description, "I should look at the file first.");
    }

    #[test]
    fn test_parse_thought_subject_mid_text() {
        let summary = parse_thought("prefix **Subject** suffix");
        assert_eq!(summary.subject, "Subject");
        assert_eq!(summary.description, "prefix  suffix".trim());
    }

    #[test]
    fn test_parse_thought_without_subject() {
        let summary = parse_thought("  plain reasoning text ");
        assert_eq!(summary.subject, "");
        assert_eq!(summary.description, "plain reasoning text");
    }

    #[test]
    fn test_parse_thought_unclosed_marker() {
        let summary = parse_thought("**unclosed subject");
        assert_eq!(summary.subject, "");
        assert_eq!(summary.description, "**unclosed subject");
    }

    #[test]
    fn test_synthesized_call_id_shape() {
        let id = synthesize_call_id("list_dir");
        let rest = id.strip_prefix("list_dir-").unwrap();
        let (millis, hex) = rest.rsplit_once('-').unwrap();
        assert!(millis.parse::<i64>().is_ok());
        assert_eq!(hex.len(), 6);
        assert!(hex.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_demux_content_and_calls() {
        let (demux, events) = drain(vec![
            thought_chunk("**Think** about it"),
            text_chunk("Hello "),
            text_chunk("world"),
            call_chunk(Some("c1"), "read", serde_json::Map::new()),
            usage_chunk(42),
        ]);

        assert!(matches!(&events[0], StreamEvent::Thought(t) if t.subject == "Think"));
        assert!(matches!(&events[1], StreamEvent::Content(t) if t == "Hello "));
        assert!(matches!(&events[2], StreamEvent::Content(t) if t == "world"));
        assert!(matches!(&events[3], StreamEvent::FunctionCall(c) if c.call_id == "c1"));
        assert!(matches!(&events[4], StreamEvent::UsageMetadata(u) if u.total_token_count == 42));

        assert_eq!(demux.calls().len(), 1);
        // Thought parts are not retained as model output.
        let parts = demux.into_model_parts();
        assert_eq!(parts.len(), 3);
        assert!(matches!(&parts[0], Part::Text(t) if t == "Hello "));
    }

    #[test]
    fn test_demux_synthesizes_missing_call_id() {
        let (demux, _events) = drain(vec![call_chunk(None, "grep", serde_json::Map::new())]);
        assert!(demux.calls()[0].call_id.starts_with("grep-"));
    }

    #[test]
    fn test_demux_single_cancellation_event() {
        let mut demux = StreamDemux::new();
        let mut buf = Vec::new();
        let interrupted =
            || StreamItem::Err(StreamError::new(StreamErrorKind::Interrupted, "the stream was interrupted"));
        demux.next(Some(text_chunk("partial")), &mut buf);
        demux.next(Some(interrupted()), &mut buf);
        demux.next(Some(interrupted()), &mut buf);
        demux.next(None, &mut buf);

        let cancelled = buf.iter().filter(|e| matches!(e, StreamEvent::UserCancelled)).count();
        assert_eq!(cancelled, 1);
        assert!(demux.cancelled());
    }

    #[test]
    fn test_demux_error_terminates() {
        let (demux, events) = drain(vec![
            text_chunk("before"),
            StreamItem::Err(StreamError::new(StreamErrorKind::ServiceFailure, "boom").with_status(500)),
            text_chunk("after"),
        ]);
        assert!(demux.errored());
        assert!(matches!(events.last(), Some(StreamEvent::Error(e)) if e.status == Some(500)));
        assert_eq!(events.iter().filter(|e| matches!(e, StreamEvent::Content(_))).count(), 1);
    }
}
