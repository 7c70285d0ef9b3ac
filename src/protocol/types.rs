//! Typed payload records for the model and inference operations.
//!
//! Field names on the wire are camelCase. All numeric response fields are
//! optional so partial information (e.g. a usage block with only a chunk
//! count) serializes without placeholder zeros.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

/// One turn of a conversation. The last `user` message is the active
/// prompt; everything before it is history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: ChatRole, content: impl Into<String>) -> Self {
        ChatMessage {
            role,
            content: content.into(),
        }
    }
}

/// Sampling knobs. Fields the engine does not support are ignored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SamplingParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repetition_penalty: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sampling: Option<SamplingParams>,
}

/// Best-effort token accounting. `completion_tokens` counts streamed
/// chunks, not tokenizer tokens.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_tokens: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Timings {
    /// Wall time from request entry to the first chunk, or the total time
    /// when no chunks were produced.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttft_ms: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_ms: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_per_second: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateResponse {
    pub request_id: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timings: Option<Timings>,
}

/// Where to fetch a model from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum DownloadSource {
    #[serde(rename = "huggingface")]
    HuggingFace {
        repo: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        revision: Option<String>,
    },
    #[serde(rename = "localPath")]
    LocalPath { path: String },
}

// ---------------------------------------------------------------------------
// Request/reply payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Capabilities {
    pub chat_completions: bool,
    pub stream: bool,
    pub download: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeOk {
    pub server_version: String,
    pub capabilities: Capabilities,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadRequest {
    pub source: DownloadSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub models_dir: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadedModel {
    pub model: String,
    pub local_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelRequest {
    pub model: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelLoadOk {
    pub model: String,
    pub loaded: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelDeleteOk {
    pub model: String,
    pub deleted: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelListOk {
    pub cached: Vec<String>,
    pub loaded: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelRequest {
    pub request_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelOk {
    pub request_id: String,
    pub cancelled: bool,
}

fn default_unload_all() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResetRequest {
    #[serde(default = "default_unload_all")]
    pub unload_all: bool,
    #[serde(default)]
    pub clear_cache: bool,
}

impl Default for ResetRequest {
    fn default() -> Self {
        ResetRequest {
            unload_all: true,
            clear_cache: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResetOk {
    pub ok: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamStartPayload {
    pub request_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamTokenPayload {
    pub request_id: String,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamEndPayload {
    pub request_id: String,
    #[serde(rename = "final")]
    pub final_response: GenerateResponse,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamErrorPayload {
    pub request_id: String,
    pub code: String,
    pub message: String,
}

/// A logical stream event as seen by the client consumer.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Start,
    Token { text: String },
    End { response: GenerateResponse },
    Error { code: String, message: String },
}

impl StreamEvent {
    /// Whether this event terminates its stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::End { .. } | StreamEvent::Error { .. })
    }
}

/// Split a message list into the active prompt and its history.
///
/// The active prompt is the content of the last `user` message; everything
/// before it is history in order. With no `user` message the prompt is empty
/// and the full list is history.
pub fn split_prompt(messages: &[ChatMessage]) -> (String, Vec<ChatMessage>) {
    match messages
        .iter()
        .rposition(|m| m.role == ChatRole::User)
    {
        Some(idx) => (messages[idx].content.clone(), messages[..idx].to_vec()),
        None => (String::new(), messages.to_vec()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_request_wire_names_are_camel_case() {
        let req = GenerateRequest {
            model: "m".into(),
            messages: vec![ChatMessage::new(ChatRole::User, "hi")],
            max_tokens: Some(16),
            stop: None,
            sampling: Some(SamplingParams {
                top_p: Some(0.9),
                ..Default::default()
            }),
        };
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("\"maxTokens\":16"));
        assert!(json.contains("\"topP\":0.9"));
        assert!(json.contains("\"role\":\"user\""));
    }

    #[test]
    fn download_source_is_tagged_by_kind() {
        let hf: DownloadSource = serde_json::from_str(
            "{\"kind\":\"huggingface\",\"repo\":\"org/model\"}",
        )
        .unwrap();
        assert_eq!(
            hf,
            DownloadSource::HuggingFace {
                repo: "org/model".into(),
                revision: None
            }
        );

        let local: DownloadSource =
            serde_json::from_str("{\"kind\":\"localPath\",\"path\":\"/tmp/m\"}").unwrap();
        assert_eq!(
            local,
            DownloadSource::LocalPath {
                path: "/tmp/m".into()
            }
        );
    }

    #[test]
    fn stream_end_payload_uses_final_key() {
        let payload = StreamEndPayload {
            request_id: "s1".into(),
            final_response: GenerateResponse {
                request_id: "s1".into(),
                text: "Hello!".into(),
                usage: Some(Usage {
                    completion_tokens: Some(3),
                    ..Default::default()
                }),
                timings: None,
            },
        };
        let json = serde_json::to_string(&payload).unwrap();
        assert!(json.contains("\"final\":{"));
        assert!(json.contains("\"completionTokens\":3"));
        assert!(!json.contains("promptTokens"));
    }

    #[test]
    fn reset_request_defaults() {
        let req: ResetRequest = serde_json::from_str("{}").unwrap();
        assert!(req.unload_all);
        assert!(!req.clear_cache);
    }

    #[test]
    fn split_prompt_takes_last_user_message() {
        let messages = vec![
            ChatMessage::new(ChatRole::System, "be brief"),
            ChatMessage::new(ChatRole::User, "one"),
            ChatMessage::new(ChatRole::Assistant, "1"),
            ChatMessage::new(ChatRole::User, "two"),
        ];
        let (prompt, history) = split_prompt(&messages);
        assert_eq!(prompt, "two");
        assert_eq!(history.len(), 3);
        assert_eq!(history[1].content, "one");
    }

    #[test]
    fn split_prompt_without_user_message() {
        let messages = vec![ChatMessage::new(ChatRole::System, "sys")];
        let (prompt, history) = split_prompt(&messages);
        assert_eq!(prompt, "");
        assert_eq!(history, messages);
    }
}
