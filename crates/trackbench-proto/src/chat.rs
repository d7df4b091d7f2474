//! Chat-completions request and response types.
//!
//! Both external collaborators, the intent-resolution service and the
//! evaluation service, are OpenAI-style chat-completions endpoints.
//! Requests declare an optional tool catalog; responses carry a message
//! with optional free text and zero-or-more requested tool calls whose
//! argument payloads are JSON-encoded strings.

use serde::{Deserialize, Serialize};

/// One message in a chat exchange.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// A declared tool in the catalog sent with resolution requests.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolSpec {
    #[serde(rename = "type")]
    pub kind: String,
    pub function: ToolFunction,
}

/// The function half of a tool declaration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolFunction {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// JSON-schema parameter object; opaque to the harness.
    #[serde(default = "empty_object")]
    pub parameters: serde_json::Value,
}

fn empty_object() -> serde_json::Value {
    serde_json::json!({ "type": "object", "properties": {} })
}

impl ToolSpec {
    /// Wraps a function declaration in the `type: function` envelope.
    pub fn function(name: impl Into<String>, description: impl Into<String>, parameters: serde_json::Value) -> Self {
        Self {
            kind: "function".to_string(),
            function: ToolFunction {
                name: name.into(),
                description: description.into(),
                parameters,
            },
        }
    }
}

/// Request body for a chat-completions call.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ToolSpec>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<String>,
    pub temperature: f64,
}

impl ChatRequest {
    /// A plain request with no tool catalog.
    pub fn new(model: impl Into<String>, messages: Vec<ChatMessage>, temperature: f64) -> Self {
        Self {
            model: model.into(),
            messages,
            tools: None,
            tool_choice: None,
            temperature,
        }
    }

    /// Attaches a tool catalog with automatic tool choice.
    pub fn with_tools(mut self, tools: Vec<ToolSpec>) -> Self {
        self.tools = Some(tools);
        self.tool_choice = Some("auto".to_string());
        self
    }
}

/// Response body for a chat-completions call.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ChatCompletion {
    #[serde(default)]
    pub choices: Vec<ChatChoice>,
}

/// One completion choice.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ChatChoice {
    pub message: AssistantReply,
}

/// The assistant message inside a completion choice.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct AssistantReply {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub tool_calls: Vec<ToolCallRequest>,
}

impl AssistantReply {
    /// True when the reply carries non-empty free text.
    pub fn has_content(&self) -> bool {
        self.content.as_deref().is_some_and(|c| !c.trim().is_empty())
    }
}

/// A tool call requested by the resolution service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCallRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub function: FunctionCall,
}

/// The named function and its transport-encoded arguments.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FunctionCall {
    pub name: String,
    /// Arguments arrive as a JSON-encoded string and must be decoded
    /// before dispatch to the worker.
    #[serde(default = "default_arguments")]
    pub arguments: String,
}

fn default_arguments() -> String {
    "{}".to_string()
}

impl FunctionCall {
    /// Decodes the argument payload into a structured value.
    pub fn decode_arguments(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::from_str(&self.arguments)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_serializes_tool_catalog() {
        let request = ChatRequest::new(
            "gpt-4-turbo-preview",
            vec![ChatMessage::system("prompt"), ChatMessage::user("hello")],
            0.1,
        )
        .with_tools(vec![ToolSpec::function(
            "list_tracks",
            "List all tracks",
            json!({"type": "object", "properties": {}}),
        )]);

        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["tool_choice"], "auto");
        assert_eq!(value["tools"][0]["type"], "function");
        assert_eq!(value["tools"][0]["function"]["name"], "list_tracks");
        assert_eq!(value["messages"][0]["role"], "system");
    }

    #[test]
    fn test_plain_request_omits_tools() {
        let request = ChatRequest::new("m", vec![ChatMessage::user("hi")], 0.3);
        let value = serde_json::to_value(&request).unwrap();
        assert!(value.get("tools").is_none());
        assert!(value.get("tool_choice").is_none());
    }

    #[test]
    fn test_reply_deserializes_tool_calls() {
        let body = json!({
            "choices": [{
                "message": {
                    "content": null,
                    "tool_calls": [{
                        "id": "call_1",
                        "function": {
                            "name": "track_volume",
                            "arguments": "{\"track\":\"Drums\",\"volume\":\"+3dB\"}"
                        }
                    }]
                }
            }]
        });

        let completion: ChatCompletion = serde_json::from_value(body).unwrap();
        let reply = &completion.choices[0].message;
        assert!(!reply.has_content());
        assert_eq!(reply.tool_calls.len(), 1);

        let args = reply.tool_calls[0].function.decode_arguments().unwrap();
        assert_eq!(args["track"], "Drums");
    }

    #[test]
    fn test_decode_arguments_failure_is_local() {
        let call = FunctionCall {
            name: "track_pan".to_string(),
            arguments: "not json".to_string(),
        };
        assert!(call.decode_arguments().is_err());
    }

    #[test]
    fn test_has_content_treats_blank_as_empty() {
        let reply = AssistantReply {
            content: Some("   ".to_string()),
            tool_calls: vec![],
        };
        assert!(!reply.has_content());
    }
}
