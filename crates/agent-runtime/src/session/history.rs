//! Conversation history: the append-only comprehensive log and the curated
//! view sent to the model.

use tracing::warn;

use crate::model::types::{
    Message,
    Part,
    Role,
};

/// Whether a model message is acceptable in the curated view.
///
/// A message is valid when it has at least one part and no part is a
/// non-thought part with empty content. Safety filters and recitation limits
/// can produce messages that fail this check.
pub fn is_valid_content(message: &Message) -> bool {
    if message.parts.is_empty() {
        return false;
    }
    for part in &message.parts {
        match part {
            Part::Thought(_) => {},
            Part::Text(text) if text.is_empty() => return false,
            Part::InlineData(data) if data.data.is_empty() => return false,
            _ => {},
        }
    }
    true
}

/// Extracts the curated (valid) history from the comprehensive log.
///
/// The model may produce invalid or empty output; sending it back would make
/// the next request malformed. When a group of consecutive model messages
/// contains an invalid one, the whole group is dropped together with the
/// user message that caused it, preserving strict user/model alternation.
pub fn extract_curated_history(comprehensive: &[Message]) -> Vec<Message> {
    let mut curated: Vec<Message> = Vec::with_capacity(comprehensive.len());
    let mut i = 0;
    while i < comprehensive.len() {
        if comprehensive[i].role == Role::User {
            curated.push(comprehensive[i].clone());
            i += 1;
        } else {
            let mut model_output = Vec::new();
            let mut is_valid = true;
            while i < comprehensive.len() && comprehensive[i].role == Role::Model {
                if is_valid && !is_valid_content(&comprehensive[i]) {
                    is_valid = false;
                }
                model_output.push(comprehensive[i].clone());
                i += 1;
            }
            if is_valid {
                curated.append(&mut model_output);
            } else {
                // Invalid model output invalidates the user input that caused it.
                curated.pop();
            }
        }
    }
    curated
}

/// The append-only conversation log.
///
/// Only the owning [super::ChatSession] mutates a `History`; every external
/// reader receives a deep copy.
#[derive(Debug, Default, Clone)]
pub struct History {
    comprehensive: Vec<Message>,
}

impl History {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_messages(messages: Vec<Message>) -> Self {
        Self {
            comprehensive: messages,
        }
    }

    pub fn len(&self) -> usize {
        self.comprehensive.len()
    }

    pub fn is_empty(&self) -> bool {
        self.comprehensive.is_empty()
    }

    pub fn last(&self) -> Option<&Message> {
        self.comprehensive.last()
    }

    pub fn last_mut(&mut self) -> Option<&mut Message> {
        self.comprehensive.last_mut()
    }

    pub fn append(&mut self, message: Message) {
        if matches!(message.role, Role::Model) {
            warn!("model output should be recorded through record_model_output");
        }
        self.comprehensive.push(message);
    }

    /// Returns a deep copy of the comprehensive or curated view.
    pub fn get(&self, curated: bool) -> Vec<Message> {
        if curated {
            extract_curated_history(&self.comprehensive)
        } else {
            self.comprehensive.clone()
        }
    }

    pub fn set(&mut self, messages: Vec<Message>) {
        self.comprehensive = messages;
    }

    pub fn clear(&mut self) {
        self.comprehensive.clear();
    }

    /// Records one model output into the log, applying the merge rules:
    ///
    /// 1. Thought-only parts are dropped.
    /// 2. If nothing observable remains and the user input was not a function
    ///    response, an empty model message preserves alternation.
    /// 3. Adjacent text parts are coalesced into a single part.
    /// 4. A text-only output merges into a trailing text-only model message
    ///    instead of appending a new entry.
    pub fn record_model_output(&mut self, parts: Vec<Part>, input_was_function_response: bool) {
        let mut parts: Vec<Part> = parts
            .into_iter()
            .filter(|p| !matches!(p, Part::Thought(_)))
            .collect();

        if parts.is_empty() {
            if !input_was_function_response {
                self.comprehensive.push(Message::model(vec![]));
            }
            return;
        }

        coalesce_text_parts(&mut parts);

        let incoming_text_only = parts.iter().all(|p| matches!(p, Part::Text(_)));
        if incoming_text_only {
            if let Some(last) = self.comprehensive.last_mut() {
                let last_text_only =
                    last.role == Role::Model && !last.parts.is_empty() && last.parts.iter().all(|p| matches!(p, Part::Text(_)));
                if last_text_only {
                    let mut merged: Vec<Part> = last.parts.drain(..).chain(parts).collect();
                    coalesce_text_parts(&mut merged);
                    last.parts = merged;
                    return;
                }
            }
        }

        self.comprehensive.push(Message::model(parts));
    }
}

fn coalesce_text_parts(parts: &mut Vec<Part>) {
    let mut merged: Vec<Part> = Vec::with_capacity(parts.len());
    for part in parts.drain(..) {
        match (merged.last_mut(), part) {
            (Some(Part::Text(acc)), Part::Text(next)) => acc.push_str(&next),
            (_, part) => merged.push(part),
        }
    }
    *parts = merged;
}
