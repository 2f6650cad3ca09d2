//! Normalizes tool output into the function-response parts fed back to the
//! model. Conversion is deterministic for a fixed input.

use serde_json::Map;

use super::LlmContent;
use crate::model::types::{
    FunctionResponse,
    Part,
};

/// Builds a `functionResponse` part carrying `{output: <text>}`.
pub fn output_part(tool_name: &str, call_id: &str, output: impl Into<String>) -> Part {
    let mut response = Map::new();
    response.insert("output".to_string(), serde_json::Value::String(output.into()));
    Part::FunctionResponse(FunctionResponse {
        id: call_id.to_string(),
        name: tool_name.to_string(),
        response,
    })
}

/// Builds a `functionResponse` part carrying `{error: <message>}`.
pub fn error_part(tool_name: &str, call_id: &str, message: impl Into<String>) -> Part {
    let mut response = Map::new();
    response.insert("error".to_string(), serde_json::Value::String(message.into()));
    Part::FunctionResponse(FunctionResponse {
        id: call_id.to_string(),
        name: tool_name.to_string(),
        response,
    })
}

/// The error response for a cancelled call.
pub fn cancelled_part(tool_name: &str, call_id: &str, reason: &str) -> Part {
    error_part(tool_name, call_id, format!("[Operation Cancelled] Reason: {}", reason))
}

/// Converts a tool's `llm_content` into the parts appended to history under
/// the call's id and tool name.
pub fn convert_to_function_response(tool_name: &str, call_id: &str, content: &LlmContent) -> Vec<Part> {
    let parts = match content {
        LlmContent::Text(text) => return vec![output_part(tool_name, call_id, text.clone())],
        LlmContent::Parts(parts) => parts,
    };

    if let [single] = parts.as_slice() {
        match single {
            Part::FunctionResponse(existing) => {
                // A nested response means the tool wrapped another tool's
                // output; flatten its text so the model sees one level.
                if let Some(nested) = existing.response.get("content").and_then(|v| v.as_array()) {
                    let text: String = nested
                        .iter()
                        .filter_map(|item| item.get("text").and_then(|t| t.as_str()))
                        .collect();
                    return vec![output_part(tool_name, call_id, text)];
                }
                return vec![single.clone()];
            },
            Part::InlineData(data) => {
                return vec![
                    output_part(
                        tool_name,
                        call_id,
                        format!("Binary content of type {} was processed.", data.mime_type),
                    ),
                    single.clone(),
                ];
            },
            _ => {},
        }
    }

    let mut out = Vec::with_capacity(parts.len() + 1);
    out.push(output_part(tool_name, call_id, "Tool execution succeeded."));
    out.extend(parts.iter().cloned());
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::types::InlineData;

    fn response_map(json: serde_json::Value) -> Map<String, serde_json::Value> {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn test_string_content() {
        let parts = convert_to_function_response("read", "c1", &LlmContent::Text("a.txt\nb.txt".into()));
        assert_eq!(parts.len(), 1);
        let response = parts[0].function_response().unwrap();
        assert_eq!(response.id, "c1");
        assert_eq!(response.name, "read");
        assert_eq!(response.response["output"], "a.txt\nb.txt");
    }

    #[test]
    fn test_part_list_gets_synthetic_header() {
        let content = LlmContent::Parts(vec![Part::Text("one".into()), Part::Text("two".into())]);
        let parts = convert_to_function_response("read", "c1", &content);
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0].function_response().unwrap().response["output"], "Tool execution succeeded.");
        assert_eq!(parts[1].text(), Some("one"));
    }

    #[test]
    fn test_single_text_part_list_also_gets_header() {
        // A one-element list is still a list: no carve-out exists for a
        // bare text part, so it takes the generic list rule.
        let content = LlmContent::Parts(vec![Part::Text("lone".into())]);
        let parts = convert_to_function_response("read", "c1", &content);
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].function_response().unwrap().response["output"], "Tool execution succeeded.");
        assert_eq!(parts[1].text(), Some("lone"));
    }

    #[test]
    fn test_nested_function_response_flattens_text() {
        let content = LlmContent::Parts(vec![Part::FunctionResponse(FunctionResponse {
            id: "inner".into(),
            name: "inner_tool".into(),
            response: response_map(serde_json::json!({
                "content": [
                    {"text": "alpha "},
                    {"inlineData": {"mimeType": "image/png", "data": "0102"}},
                    {"text": "beta"},
                ]
            })),
        })]);
        let parts = convert_to_function_response("outer", "c9", &content);
        assert_eq!(parts.len(), 1);
        let response = parts[0].function_response().unwrap();
        assert_eq!(response.id, "c9");
        assert_eq!(response.name, "outer");
        // Binary entries in the nested content are dropped.
        assert_eq!(response.response["output"], "alpha beta");
    }

    #[test]
    fn test_plain_function_response_passes_through() {
        let inner = FunctionResponse {
            id: "c2".into(),
            name: "tool".into(),
            response: response_map(serde_json::json!({"output": "done"})),
        };
        let content = LlmContent::Parts(vec![Part::FunctionResponse(inner.clone())]);
        let parts = convert_to_function_response("tool", "c2", &content);
        assert_eq!(parts, vec![Part::FunctionResponse(inner)]);
    }

    #[test]
    fn test_inline_data_gets_mime_note() {
        let content = LlmContent::Parts(vec![Part::InlineData(InlineData {
            mime_type: "image/png".into(),
            data: vec![1, 2, 3],
        })]);
        let parts = convert_to_function_response("screenshot", "c3", &content);
        assert_eq!(parts.len(), 2);
        assert_eq!(
            parts[0].function_response().unwrap().response["output"],
            "Binary content of type image/png was processed."
        );
        assert!(matches!(&parts[1], Part::InlineData(d) if d.mime_type == "image/png"));
    }

    #[test]
    fn test_conversion_is_deterministic() {
        let content = LlmContent::Parts(vec![Part::Text("x".into()), Part::Text("y".into())]);
        let a = serde_json::to_string(&convert_to_function_response("t", "c", &content)).unwrap();
        let b = serde_json::to_string(&convert_to_function_response("t", "c", &content)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_error_and_cancelled_shapes() {
        let err = error_part("t", "c", "ENOENT");
        assert_eq!(err.function_response().unwrap().response["error"], "ENOENT");

        let cancelled = cancelled_part("t", "c", "User did not allow tool call");
        assert_eq!(
            cancelled.function_response().unwrap().response["error"],
            "[Operation Cancelled] Reason: User did not allow tool call"
        );
    }
}
