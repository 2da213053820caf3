//! Decoding of the agent's newline-delimited JSON output.
//!
//! ```text
//! {"type":"assistant","message":{"content":[{"type":"text","text":"..."},{"type":"tool_use","name":"Edit"}]}}
//! {"type":"result","result":"...","permission_denials":[{"tool_name":"Edit"}],"is_error":false}
//! {"type":"error","error":{"message":"..."}}
//! ```

use serde::Deserialize;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Assistant {
        #[serde(default)]
        message: AssistantMessage,
    },
    Result(ResultEvent),
    Error {
        #[serde(default)]
        error: serde_json::Value,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct AssistantMessage {
    #[serde(default)]
    pub content: Vec<ContentBlock>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        #[serde(default)]
        text: String,
    },
    ToolUse {
        #[serde(default)]
        name: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ResultEvent {
    #[serde(default)]
    pub result: String,
    #[serde(default)]
    pub permission_denials: Vec<PermissionDenial>,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default)]
    pub subtype: Option<String>,
    #[serde(default)]
    pub num_turns: Option<u32>,
    #[serde(default)]
    pub total_cost_usd: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct PermissionDenial {
    #[serde(default)]
    pub tool_name: String,
}

impl StreamEvent {
    /// Human-readable text of an `error` event.
    pub fn error_message(&self) -> Option<String> {
        let StreamEvent::Error { error } = self else {
            return None;
        };
        let message = match error {
            serde_json::Value::String(s) => s.clone(),
            serde_json::Value::Object(map) => map
                .get("message")
                .and_then(|m| m.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| error.to_string()),
            serde_json::Value::Null => "unknown agent error".to_string(),
            other => other.to_string(),
        };
        Some(message)
    }
}

/// Parse one stdout line. Blank lines and non-JSON lines yield `None`.
pub fn parse_line(line: &str) -> Option<StreamEvent> {
    let line = line.trim();
    if !line.starts_with('{') {
        return None;
    }
    serde_json::from_str(line).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assistant_blocks() {
        let line = r#"{"type":"assistant","message":{"id":"m1","content":[
            {"type":"text","text":"Looking around"},
            {"type":"tool_use","id":"t1","name":"Write","input":{"file_path":"a"}},
            {"type":"thinking","thinking":"..."}]}}"#
            .replace('\n', "");
        let Some(StreamEvent::Assistant { message }) = parse_line(&line) else {
            panic!("expected assistant event");
        };
        assert_eq!(
            message.content,
            vec![
                ContentBlock::Text {
                    text: "Looking around".into()
                },
                ContentBlock::ToolUse {
                    name: "Write".into()
                },
                ContentBlock::Other,
            ]
        );
    }

    #[test]
    fn result_with_denials() {
        let line = r#"{"type":"result","subtype":"success","is_error":false,"result":"done","permission_denials":[{"tool_name":"Edit","tool_use_id":"x","tool_input":{}}],"num_turns":3}"#;
        let Some(StreamEvent::Result(result)) = parse_line(line) else {
            panic!("expected result event");
        };
        assert_eq!(result.result, "done");
        assert_eq!(result.permission_denials[0].tool_name, "Edit");
        assert_eq!(result.num_turns, Some(3));
        assert!(!result.is_error);
    }

    #[test]
    fn error_shapes() {
        let obj = parse_line(r#"{"type":"error","error":{"message":"rate limited"}}"#).unwrap();
        assert_eq!(obj.error_message().as_deref(), Some("rate limited"));
        let s = parse_line(r#"{"type":"error","error":"boom"}"#).unwrap();
        assert_eq!(s.error_message().as_deref(), Some("boom"));
    }

    #[test]
    fn unknown_and_garbage_lines() {
        assert_eq!(
            parse_line(r#"{"type":"system","subtype":"init","tools":[]}"#),
            Some(StreamEvent::Other)
        );
        assert_eq!(parse_line("   "), None);
        assert_eq!(parse_line("Error: something on stdout"), None);
        assert_eq!(parse_line("{broken"), None);
    }
}
