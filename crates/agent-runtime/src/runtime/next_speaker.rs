//! Decides whether the model intends to keep talking after a stream that
//! produced no tool calls.

use serde::{
    Deserialize,
    Serialize,
};
use tokio_util::sync::CancellationToken;
use tracing::{
    debug,
    warn,
};

use crate::model::types::{
    Message,
    Part,
    Role,
};
use crate::session::ChatSession;

const NEXT_SPEAKER_PROMPT: &str = "Analyze *only* the content and structure of your immediately preceding \
response. Based *strictly* on that response, determine who should logically speak next: the 'user' or the \
'model' (you).\n\
**Decision Rules (apply in order):**\n\
1. **Model Continues:** If your last response explicitly states an immediate next action *you* intend to \
take, OR if the response seems clearly incomplete, then the **'model'** should speak next.\n\
2. **Question to User:** If your last response ends with a direct question specifically addressed *to the \
user*, then the **'user'** should speak next.\n\
3. **Waiting for User:** If your last response completed a thought or task *and* does not meet the criteria \
for Rule 1 or 2, it implies a pause expecting user input. In this case, the **'user'** should speak next.\n\
Respond *only* in JSON format according to the schema.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum NextSpeaker {
    User,
    Model,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NextSpeakerResponse {
    pub reasoning: String,
    pub next_speaker: NextSpeaker,
}

pub fn response_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "reasoning": {
                "type": "string",
                "description": "Brief explanation justifying the next_speaker choice."
            },
            "next_speaker": {
                "type": "string",
                "enum": ["user", "model"],
                "description": "Who should speak next."
            }
        },
        "required": ["reasoning", "next_speaker"]
    })
}

/// Determines the next speaker after a stream with no tool calls.
///
/// Deterministic shortcuts come first; only genuinely ambiguous turns spend
/// an auxiliary model call. Any failure falls back to handing the turn to
/// the user.
pub async fn check_next_speaker(session: &mut ChatSession, cancel_token: CancellationToken) -> NextSpeaker {
    // A trailing function response always hands the turn back to the model.
    if session.last_message().is_some_and(Message::is_function_response) {
        return NextSpeaker::Model;
    }

    // An empty model turn means the model stopped mid-thought; pad the entry
    // so it serializes and let the model continue.
    if session.pad_empty_model_tail() {
        return NextSpeaker::Model;
    }

    match session.last_message() {
        Some(last) if last.role == Role::Model => {},
        _ => return NextSpeaker::User,
    }

    let check = Message::user(vec![Part::Text(NEXT_SPEAKER_PROMPT.to_string())]);
    match session.generate_json(vec![check], response_schema(), cancel_token).await {
        Ok(value) => match serde_json::from_value::<NextSpeakerResponse>(value) {
            Ok(response) => {
                debug!(reasoning = %response.reasoning, next_speaker = %response.next_speaker, "next speaker check");
                response.next_speaker
            },
            Err(err) => {
                warn!(?err, "next speaker check returned malformed JSON");
                NextSpeaker::User
            },
        },
        Err(err) => {
            warn!(%err, "next speaker check failed");
            NextSpeaker::User
        },
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::model::types::FunctionResponse;
    use crate::model::MockModel;
    use crate::session::ChatSessionConfig;

    fn session(model: MockModel) -> ChatSession {
        ChatSession::new(Arc::new(model), ChatSessionConfig::default())
    }

    #[tokio::test]
    async fn test_function_response_tail_means_model() {
        let mut session = session(MockModel::new());
        session.append_user(Message::user(vec![Part::FunctionResponse(FunctionResponse {
            id: "c1".into(),
            name: "read".into(),
            response: serde_json::Map::new(),
        })]));

        let speaker = check_next_speaker(&mut session, CancellationToken::new()).await;
        assert_eq!(speaker, NextSpeaker::Model);
    }

    #[tokio::test]
    async fn test_empty_model_tail_is_padded_and_continues() {
        let mut session = session(MockModel::new());
        session.append_user(Message::user(vec![Part::Text("q".into())]));
        session.record_model_output(vec![], false);

        let speaker = check_next_speaker(&mut session, CancellationToken::new()).await;
        assert_eq!(speaker, NextSpeaker::Model);
        let last = session.get_history(false).last().cloned().unwrap();
        assert_eq!(last.parts.len(), 1, "an empty text part was inserted");
    }

    #[tokio::test]
    async fn test_llm_check_user() {
        let model = MockModel::new().with_json_response(serde_json::json!({
            "reasoning": "the response ended with a question to the user",
            "next_speaker": "user"
        }));
        let mut session = session(model);
        session.append_user(Message::user(vec![Part::Text("q".into())]));
        session.record_model_output(vec![Part::Text("Anything else?".into())], false);

        let speaker = check_next_speaker(&mut session, CancellationToken::new()).await;
        assert_eq!(speaker, NextSpeaker::User);
    }

    #[tokio::test]
    async fn test_llm_check_model() {
        let model = MockModel::new().with_json_response(serde_json::json!({
            "reasoning": "the response announces an immediate next step",
            "next_speaker": "model"
        }));
        let mut session = session(model);
        session.append_user(Message::user(vec![Part::Text("q".into())]));
        session.record_model_output(vec![Part::Text("Next, I will read the file.".into())], false);

        let speaker = check_next_speaker(&mut session, CancellationToken::new()).await;
        assert_eq!(speaker, NextSpeaker::Model);
    }

    #[tokio::test]
    async fn test_check_failure_falls_back_to_user() {
        // No scripted JSON response: generate_json errors.
        let mut session = session(MockModel::new());
        session.append_user(Message::user(vec![Part::Text("q".into())]));
        session.record_model_output(vec![Part::Text("done".into())], false);

        let speaker = check_next_speaker(&mut session, CancellationToken::new()).await;
        assert_eq!(speaker, NextSpeaker::User);
    }
}
