//! The top-level RPC envelope and the message type registry.
//!
//! Every frame body is a single JSON object `{id?, type, payload?}`.
//! The `id` is an opaque correlation string chosen by the client; the host
//! only ever echoes it. Unrecognized fields are ignored so the schema can
//! grow without breaking older peers.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One wire message. Immutable once queued for send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Correlation id. Requests carry a client-chosen id; replies and stream
    /// events echo it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Method or event tag, e.g. `model.load` or `inference.stream.token`.
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl Envelope {
    pub fn new(id: Option<String>, kind: impl Into<String>, payload: Option<Value>) -> Self {
        Envelope {
            id,
            kind: kind.into(),
            payload,
        }
    }

    /// A reply envelope echoing the request id.
    pub fn reply(id: &str, kind: impl Into<String>, payload: Value) -> Self {
        Envelope {
            id: Some(id.to_string()),
            kind: kind.into(),
            payload: Some(payload),
        }
    }

    /// An `error` envelope with the standard `{code, message}` payload.
    pub fn error(id: &str, code: &str, message: impl Into<String>) -> Self {
        Envelope {
            id: Some(id.to_string()),
            kind: msg::ERROR.to_string(),
            payload: Some(serde_json::json!({
                "code": code,
                "message": message.into(),
            })),
        }
    }

    /// Whether this envelope is one of the `inference.stream.*` events.
    pub fn is_stream_event(&self) -> bool {
        self.kind.starts_with(msg::STREAM_EVENT_PREFIX)
    }
}

/// Message type tags.
pub mod msg {
    pub const HANDSHAKE: &str = "handshake";
    pub const HANDSHAKE_OK: &str = "handshake.ok";

    pub const MODEL_DOWNLOAD: &str = "model.download";
    pub const MODEL_DOWNLOAD_OK: &str = "model.download.ok";
    pub const MODEL_LOAD: &str = "model.load";
    pub const MODEL_LOAD_OK: &str = "model.load.ok";
    pub const MODEL_UNLOAD: &str = "model.unload";
    pub const MODEL_UNLOAD_OK: &str = "model.unload.ok";
    pub const MODEL_DELETE: &str = "model.delete";
    pub const MODEL_DELETE_OK: &str = "model.delete.ok";
    pub const MODEL_LIST: &str = "model.list";
    pub const MODEL_LIST_OK: &str = "model.list.ok";

    pub const INFERENCE_GENERATE: &str = "inference.generate";
    pub const INFERENCE_GENERATE_OK: &str = "inference.generate.ok";
    pub const INFERENCE_STREAM: &str = "inference.stream";
    pub const STREAM_START: &str = "inference.stream.start";
    pub const STREAM_TOKEN: &str = "inference.stream.token";
    pub const STREAM_END: &str = "inference.stream.end";
    pub const STREAM_ERROR: &str = "inference.stream.error";
    pub const INFERENCE_CANCEL: &str = "inference.cancel";
    pub const INFERENCE_CANCEL_OK: &str = "inference.cancel.ok";

    pub const RESET: &str = "reset";
    pub const RESET_OK: &str = "reset.ok";

    pub const ERROR: &str = "error";

    /// Prefix shared by all stream events, used for demultiplexing.
    pub const STREAM_EVENT_PREFIX: &str = "inference.stream.";
}

/// Wire error codes. The set is open-ended; these are the ones the core
/// emits.
pub mod codes {
    pub const UNAUTHORIZED: &str = "unauthorized";
    pub const UNKNOWN_TYPE: &str = "unknown_type";
    pub const BAD_REQUEST: &str = "bad_request";
    pub const INTERNAL: &str = "internal";
    pub const CANCELLED: &str = "cancelled";
    pub const BACKPRESSURE: &str = "backpressure";
    pub const TRANSPORT_CLOSED: &str = "transport_closed";
    pub const STREAM_ERROR: &str = "stream_error";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_serializes_with_type_tag() {
        let env = Envelope::reply("1", msg::MODEL_LOAD_OK, serde_json::json!({"model": "m"}));
        let json = serde_json::to_string(&env).unwrap();
        assert!(json.contains("\"type\":\"model.load.ok\""));
        assert!(json.contains("\"id\":\"1\""));
    }

    #[test]
    fn envelope_omits_absent_fields() {
        let env = Envelope::new(None, msg::MODEL_LIST, None);
        let json = serde_json::to_string(&env).unwrap();
        assert_eq!(json, "{\"type\":\"model.list\"}");
    }

    #[test]
    fn envelope_ignores_unknown_fields() {
        let env: Envelope =
            serde_json::from_str("{\"id\":\"7\",\"type\":\"reset\",\"extra\":42}").unwrap();
        assert_eq!(env.id.as_deref(), Some("7"));
        assert_eq!(env.kind, msg::RESET);
        assert!(env.payload.is_none());
    }

    #[test]
    fn stream_event_prefix_matches_all_events() {
        for kind in [
            msg::STREAM_START,
            msg::STREAM_TOKEN,
            msg::STREAM_END,
            msg::STREAM_ERROR,
        ] {
            let env = Envelope::new(Some("s".into()), kind, None);
            assert!(env.is_stream_event());
        }
        assert!(!Envelope::new(None, msg::INFERENCE_STREAM, None).is_stream_event());
    }
}
