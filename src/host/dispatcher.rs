//! Routes decoded envelopes to engine calls and replies.
//!
//! One dispatcher per connection. The authentication gate runs inline on the
//! read path; everything else runs in its own task so a long generation
//! never blocks a cancel arriving on the same connection.
//!
//! Stream state per request id: `Idle -> Streaming -> {Ended | Errored |
//! Cancelled}`. The generation task is the only emitter of terminal events,
//! so the first terminal to emit wins and nothing follows it. Cancel flags
//! are registered on the read path, before the handler task is spawned, so
//! a cancel arriving right behind its stream request always finds the flag.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde::de::DeserializeOwned;
use serde_json::{json, Value};

use crate::engine::{Engine, EngineError};
use crate::protocol::types::{
    CancelOk, CancelRequest, Capabilities, DownloadRequest, GenerateRequest, GenerateResponse,
    HandshakeOk, HandshakeRequest, ModelDeleteOk, ModelListOk, ModelLoadOk, ModelRequest,
    ResetOk, ResetRequest, Timings, Usage,
};
use crate::protocol::{codes, msg, Envelope};
use crate::{log_debug, log_warn};

use super::connection::ConnectionHandle;

const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

pub struct Dispatcher {
    engine: Arc<dyn Engine>,
    auth_token: Option<String>,
    conn: ConnectionHandle,
    authenticated: AtomicBool,
    /// Cancel flags for in-flight generations, keyed by request id.
    streams: Mutex<HashMap<String, Arc<AtomicBool>>>,
}

impl Dispatcher {
    pub fn new(engine: Arc<dyn Engine>, auth_token: Option<String>, conn: ConnectionHandle) -> Self {
        // With no token configured, connections start authenticated.
        let authenticated = AtomicBool::new(auth_token.is_none());
        Dispatcher {
            engine,
            auth_token,
            conn,
            authenticated,
            streams: Mutex::new(HashMap::new()),
        }
    }

    /// Route one decoded envelope. Called from the connection's read task.
    pub fn dispatch(self: &Arc<Self>, env: Envelope) {
        let rid = env
            .id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        log_debug!("DISPATCH", "connection {}: {} (id={rid})", self.conn.id(), env.kind);

        if env.kind == msg::HANDSHAKE {
            self.handle_handshake(&rid, env.payload);
            return;
        }
        if !self.authenticated.load(Ordering::SeqCst) {
            self.conn
                .send(&Envelope::error(&rid, codes::UNAUTHORIZED, "Not authenticated"));
            self.conn.close();
            return;
        }

        // Register the cancel flag here, not in the handler task: the two
        // frames of a stream-then-cancel pair can arrive in one read, and
        // their handler tasks run unordered.
        let cancelled = match env.kind.as_str() {
            msg::INFERENCE_STREAM | msg::INFERENCE_GENERATE => {
                let flag = Arc::new(AtomicBool::new(false));
                self.streams
                    .lock()
                    .unwrap()
                    .insert(rid.clone(), flag.clone());
                Some(flag)
            }
            _ => None,
        };

        let this = self.clone();
        tokio::spawn(async move {
            this.handle_request(rid, env.kind, env.payload, cancelled).await;
        });
    }

    /// Abandon all in-flight generations for this connection. The
    /// connection is gone, so no terminal events are delivered; the engine
    /// just gets told to stop.
    pub fn connection_closed(&self) {
        let streams: Vec<(String, Arc<AtomicBool>)> =
            self.streams.lock().unwrap().drain().collect();
        for (rid, cancelled) in streams {
            log_debug!("DISPATCH", "connection {}: abandoning stream {rid}", self.conn.id());
            cancelled.store(true, Ordering::SeqCst);
            self.engine.cancel(&rid);
        }
    }

    fn handle_handshake(&self, rid: &str, payload: Option<Value>) {
        let request: HandshakeRequest = match parse_payload(payload) {
            Ok(request) => request,
            Err(e) => {
                self.conn.send(&Envelope::error(rid, codes::BAD_REQUEST, e));
                return;
            }
        };
        if let Some(expected) = &self.auth_token {
            let presented = request.auth_token.unwrap_or_default();
            if !constant_time_eq(presented.as_bytes(), expected.as_bytes()) {
                log_warn!("DISPATCH", "connection {}: handshake rejected", self.conn.id());
                self.conn
                    .send(&Envelope::error(rid, codes::UNAUTHORIZED, "Invalid auth token"));
                self.conn.close();
                return;
            }
            self.authenticated.store(true, Ordering::SeqCst);
        }
        let ok = HandshakeOk {
            server_version: SERVER_VERSION.to_string(),
            capabilities: Capabilities {
                chat_completions: true,
                stream: true,
                download: true,
            },
        };
        self.reply(rid, msg::HANDSHAKE_OK, &ok);
    }

    async fn handle_request(
        self: Arc<Self>,
        rid: String,
        kind: String,
        payload: Option<Value>,
        cancelled: Option<Arc<AtomicBool>>,
    ) {
        match kind.as_str() {
            msg::MODEL_DOWNLOAD => {
                let request: DownloadRequest = match parse_payload(payload) {
                    Ok(request) => request,
                    Err(e) => return self.reply_error(&rid, codes::BAD_REQUEST, e),
                };
                match self
                    .engine
                    .download(&request.source, request.models_dir.as_deref())
                    .await
                {
                    Ok(downloaded) => self.reply(&rid, msg::MODEL_DOWNLOAD_OK, &downloaded),
                    Err(e) => self.reply_engine_error(&rid, e),
                }
            }
            msg::MODEL_LOAD => {
                let Some(model) = self.parse_model(&rid, payload) else { return };
                match self.engine.load(&model).await {
                    Ok(()) => self.reply(&rid, msg::MODEL_LOAD_OK, &ModelLoadOk { model, loaded: true }),
                    Err(e) => self.reply_engine_error(&rid, e),
                }
            }
            msg::MODEL_UNLOAD => {
                let Some(model) = self.parse_model(&rid, payload) else { return };
                match self.engine.unload(&model).await {
                    Ok(()) => {
                        self.reply(&rid, msg::MODEL_UNLOAD_OK, &ModelLoadOk { model, loaded: false })
                    }
                    Err(e) => self.reply_engine_error(&rid, e),
                }
            }
            msg::MODEL_DELETE => {
                let Some(model) = self.parse_model(&rid, payload) else { return };
                match self.engine.delete(&model).await {
                    Ok(()) => {
                        self.reply(&rid, msg::MODEL_DELETE_OK, &ModelDeleteOk { model, deleted: true })
                    }
                    Err(e) => self.reply_engine_error(&rid, e),
                }
            }
            msg::MODEL_LIST => match self.engine.list().await {
                Ok(list) => {
                    let mut cached = list.cached;
                    let mut loaded = list.loaded;
                    cached.sort();
                    loaded.sort();
                    self.reply(&rid, msg::MODEL_LIST_OK, &ModelListOk { cached, loaded });
                }
                Err(e) => self.reply_engine_error(&rid, e),
            },
            msg::INFERENCE_GENERATE => {
                let cancelled =
                    cancelled.unwrap_or_else(|| Arc::new(AtomicBool::new(false)));
                let request: GenerateRequest = match parse_payload(payload) {
                    Ok(request) => request,
                    Err(e) => {
                        self.streams.lock().unwrap().remove(&rid);
                        return self.reply_error(&rid, codes::BAD_REQUEST, e);
                    }
                };
                match self.run_generation(&rid, request, false, cancelled).await {
                    Ok(response) => self.reply(&rid, msg::INFERENCE_GENERATE_OK, &response),
                    Err((code, message)) => self.reply_error(&rid, &code, message),
                }
            }
            msg::INFERENCE_STREAM => {
                let cancelled =
                    cancelled.unwrap_or_else(|| Arc::new(AtomicBool::new(false)));
                let request: GenerateRequest = match parse_payload(payload) {
                    Ok(request) => request,
                    Err(e) => {
                        self.streams.lock().unwrap().remove(&rid);
                        return self.reply_error(&rid, codes::BAD_REQUEST, e);
                    }
                };
                // Start always precedes tokens, even if the engine then
                // fails immediately.
                self.conn.send(&Envelope::reply(
                    &rid,
                    msg::STREAM_START,
                    json!({ "requestId": rid }),
                ));
                match self.run_generation(&rid, request, true, cancelled).await {
                    Ok(response) => {
                        self.conn.send(&Envelope::reply(
                            &rid,
                            msg::STREAM_END,
                            json!({ "requestId": rid, "final": response }),
                        ));
                    }
                    Err((code, message)) => {
                        self.conn.send(&Envelope::reply(
                            &rid,
                            msg::STREAM_ERROR,
                            json!({ "requestId": rid, "code": code, "message": message }),
                        ));
                    }
                }
            }
            msg::INFERENCE_CANCEL => {
                let request: CancelRequest = match parse_payload(payload) {
                    Ok(request) => request,
                    Err(e) => return self.reply_error(&rid, codes::BAD_REQUEST, e),
                };
                if let Some(cancelled) = self.streams.lock().unwrap().get(&request.request_id) {
                    cancelled.store(true, Ordering::SeqCst);
                }
                self.engine.cancel(&request.request_id);
                // Acknowledged immediately, even for unknown ids; the stream
                // terminates on its own schedule.
                self.reply(
                    &rid,
                    msg::INFERENCE_CANCEL_OK,
                    &CancelOk {
                        request_id: request.request_id,
                        cancelled: true,
                    },
                );
            }
            msg::RESET => {
                let request: ResetRequest = match parse_payload(payload) {
                    Ok(request) => request,
                    Err(e) => return self.reply_error(&rid, codes::BAD_REQUEST, e),
                };
                match self
                    .engine
                    .reset(request.unload_all, request.clear_cache)
                    .await
                {
                    Ok(()) => self.reply(&rid, msg::RESET_OK, &ResetOk { ok: true }),
                    Err(e) => self.reply_engine_error(&rid, e),
                }
            }
            other => {
                self.reply_error(
                    &rid,
                    codes::UNKNOWN_TYPE,
                    format!("Unknown message type: {other}"),
                );
            }
        }
    }

    /// Drive one generation to completion, shared by `inference.generate`
    /// (accumulate only) and `inference.stream` (emit token events). The
    /// cancel flag was registered in `dispatch`; this removes it when the
    /// generation terminates.
    async fn run_generation(
        &self,
        rid: &str,
        request: GenerateRequest,
        emit: bool,
        cancelled: Arc<AtomicBool>,
    ) -> Result<GenerateResponse, (String, String)> {
        let result = self.drive_stream(rid, request, emit, &cancelled).await;
        self.streams.lock().unwrap().remove(rid);
        result
    }

    async fn drive_stream(
        &self,
        rid: &str,
        request: GenerateRequest,
        emit: bool,
        cancelled: &AtomicBool,
    ) -> Result<GenerateResponse, (String, String)> {
        // A cancel may have landed between registration and this task
        // getting scheduled.
        if cancelled.load(Ordering::SeqCst) {
            return Err((codes::CANCELLED.to_string(), "Cancelled".to_string()));
        }
        let started = Instant::now();
        let mut rx = match self.engine.stream(rid, &request).await {
            Ok(rx) => rx,
            Err(e) => return Err((engine_code(&e, emit).to_string(), e.to_string())),
        };

        let mut text = String::new();
        let mut chunk_count: u32 = 0;
        let mut ttft_ms: Option<f64> = None;

        while let Some(item) = rx.recv().await {
            if cancelled.load(Ordering::SeqCst) {
                return Err((codes::CANCELLED.to_string(), "Cancelled".to_string()));
            }
            match item {
                Ok(chunk) => {
                    if ttft_ms.is_none() {
                        ttft_ms = Some(elapsed_ms(started));
                    }
                    chunk_count += 1;
                    text.push_str(&chunk);
                    if emit {
                        self.conn.send(&Envelope::reply(
                            rid,
                            msg::STREAM_TOKEN,
                            json!({ "requestId": rid, "text": chunk }),
                        ));
                    }
                }
                Err(e) => return Err((codes::STREAM_ERROR.to_string(), e.to_string())),
            }
        }

        if cancelled.load(Ordering::SeqCst) {
            return Err((codes::CANCELLED.to_string(), "Cancelled".to_string()));
        }

        let total_ms = elapsed_ms(started);
        let total_secs = total_ms / 1000.0;
        Ok(GenerateResponse {
            request_id: rid.to_string(),
            text,
            usage: Some(Usage {
                prompt_tokens: None,
                completion_tokens: Some(chunk_count),
                total_tokens: None,
            }),
            timings: Some(Timings {
                ttft_ms: Some(ttft_ms.unwrap_or(total_ms)),
                total_ms: Some(total_ms),
                tokens_per_second: if total_secs > 0.0 {
                    Some(f64::from(chunk_count) / total_secs)
                } else {
                    None
                },
            }),
        })
    }

    fn parse_model(&self, rid: &str, payload: Option<Value>) -> Option<String> {
        let request: ModelRequest = match parse_payload(payload) {
            Ok(request) => request,
            Err(e) => {
                self.reply_error(rid, codes::BAD_REQUEST, e);
                return None;
            }
        };
        if request.model.is_empty() {
            self.reply_error(rid, codes::BAD_REQUEST, "model must be a non-empty string");
            return None;
        }
        Some(request.model)
    }

    fn reply<T: serde::Serialize>(&self, rid: &str, kind: &str, payload: &T) {
        match serde_json::to_value(payload) {
            Ok(value) => {
                self.conn.send(&Envelope::reply(rid, kind, value));
            }
            Err(e) => {
                log_warn!("DISPATCH", "failed to serialize {kind} reply: {e}");
                self.reply_error(rid, codes::INTERNAL, "reply serialization failed");
            }
        }
    }

    fn reply_error(&self, rid: &str, code: &str, message: impl Into<String>) {
        self.conn.send(&Envelope::error(rid, code, message));
    }

    fn reply_engine_error(&self, rid: &str, error: EngineError) {
        self.reply_error(rid, engine_code(&error, false), error.to_string());
    }
}

fn parse_payload<T: DeserializeOwned>(payload: Option<Value>) -> Result<T, String> {
    serde_json::from_value(payload.unwrap_or_else(|| json!({}))).map_err(|e| e.to_string())
}

fn engine_code(error: &EngineError, streaming: bool) -> &'static str {
    if streaming {
        return codes::STREAM_ERROR;
    }
    match error {
        EngineError::InvalidRequest(_) => codes::BAD_REQUEST,
        EngineError::Failed(_) => codes::INTERNAL,
    }
}

fn elapsed_ms(started: Instant) -> f64 {
    started.elapsed().as_secs_f64() * 1000.0
}

/// Compare two byte strings without early exit, so the comparison time does
/// not leak how much of the token matched.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::MockEngine;
    use crate::host::connection::WriterCmd;
    use crate::protocol::types::{ChatMessage, ChatRole, ErrorPayload, StreamEndPayload};
    use crate::protocol::FrameDecoder;
    use tokio::sync::mpsc;

    fn decode_frames(writer_rx: &mut mpsc::UnboundedReceiver<WriterCmd>) -> Vec<Envelope> {
        let mut decoder = FrameDecoder::new();
        let mut out = Vec::new();
        while let Ok(cmd) = writer_rx.try_recv() {
            if let WriterCmd::Frame(bytes) = cmd {
                decoder.extend(&bytes);
                while let Some(env) = decoder.next_envelope().unwrap() {
                    out.push(env);
                }
            }
        }
        out
    }

    async fn drain_until_idle(writer_rx: &mut mpsc::UnboundedReceiver<WriterCmd>) -> Vec<Envelope> {
        // Spawned handler tasks need a few polls to finish.
        for _ in 0..50 {
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
            let envs = decode_frames(writer_rx);
            if !envs.is_empty() {
                return envs;
            }
        }
        Vec::new()
    }

    fn dispatcher_with(
        engine: MockEngine,
        auth_token: Option<&str>,
    ) -> (Arc<Dispatcher>, mpsc::UnboundedReceiver<WriterCmd>) {
        let (conn, writer_rx) = ConnectionHandle::for_tests();
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::new(engine),
            auth_token.map(String::from),
            conn,
        ));
        (dispatcher, writer_rx)
    }

    fn generate_payload() -> Value {
        serde_json::to_value(GenerateRequest {
            model: "m".into(),
            messages: vec![ChatMessage::new(ChatRole::User, "hi")],
            max_tokens: Some(16),
            stop: None,
            sampling: None,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn handshake_success_reports_version_and_capabilities() {
        let (dispatcher, mut writer_rx) = dispatcher_with(MockEngine::new(), Some("abc"));
        dispatcher.dispatch(Envelope::new(
            Some("1".into()),
            msg::HANDSHAKE,
            Some(json!({"authToken": "abc"})),
        ));
        let envs = decode_frames(&mut writer_rx);
        assert_eq!(envs.len(), 1);
        assert_eq!(envs[0].kind, msg::HANDSHAKE_OK);
        assert_eq!(envs[0].id.as_deref(), Some("1"));
        let ok: HandshakeOk = serde_json::from_value(envs[0].payload.clone().unwrap()).unwrap();
        assert_eq!(ok.server_version, "0.1.0");
        assert!(ok.capabilities.stream);
    }

    #[tokio::test]
    async fn handshake_failure_replies_unauthorized_and_closes() {
        let (dispatcher, mut writer_rx) = dispatcher_with(MockEngine::new(), Some("abc"));
        dispatcher.dispatch(Envelope::new(
            Some("1".into()),
            msg::HANDSHAKE,
            Some(json!({"authToken": "xyz"})),
        ));
        let envs = decode_frames(&mut writer_rx);
        assert_eq!(envs[0].kind, msg::ERROR);
        let err: ErrorPayload = serde_json::from_value(envs[0].payload.clone().unwrap()).unwrap();
        assert_eq!(err.code, codes::UNAUTHORIZED);
        assert_eq!(err.message, "Invalid auth token");
        assert!(dispatcher.conn.is_closed());
    }

    #[tokio::test]
    async fn unauthenticated_traffic_is_rejected_and_connection_closed() {
        let (dispatcher, mut writer_rx) = dispatcher_with(MockEngine::new(), Some("abc"));
        dispatcher.dispatch(Envelope::new(Some("2".into()), msg::MODEL_LIST, None));
        let envs = decode_frames(&mut writer_rx);
        let err: ErrorPayload = serde_json::from_value(envs[0].payload.clone().unwrap()).unwrap();
        assert_eq!(err.code, codes::UNAUTHORIZED);
        assert!(dispatcher.conn.is_closed());
    }

    #[tokio::test]
    async fn model_list_is_sorted_and_empty_before_any_load() {
        let (dispatcher, mut writer_rx) = dispatcher_with(MockEngine::new(), None);
        dispatcher.dispatch(Envelope::new(Some("2".into()), msg::MODEL_LIST, None));
        let envs = drain_until_idle(&mut writer_rx).await;
        assert_eq!(envs[0].kind, msg::MODEL_LIST_OK);
        let list: ModelListOk = serde_json::from_value(envs[0].payload.clone().unwrap()).unwrap();
        assert_eq!(list, ModelListOk::default());
    }

    #[tokio::test]
    async fn unknown_type_replies_error_and_keeps_connection_open() {
        let (dispatcher, mut writer_rx) = dispatcher_with(MockEngine::new(), None);
        dispatcher.dispatch(Envelope::new(Some("u1".into()), "nope", None));
        let envs = drain_until_idle(&mut writer_rx).await;
        let err: ErrorPayload = serde_json::from_value(envs[0].payload.clone().unwrap()).unwrap();
        assert_eq!(err.code, codes::UNKNOWN_TYPE);
        assert_eq!(err.message, "Unknown message type: nope");
        assert!(!dispatcher.conn.is_closed());
    }

    #[tokio::test]
    async fn stream_emits_start_tokens_end_in_order() {
        let engine = MockEngine::new().with_script(["Hel", "lo", "!"]);
        let (dispatcher, mut writer_rx) = dispatcher_with(engine, None);
        dispatcher.dispatch(Envelope::new(
            Some("s1".into()),
            msg::INFERENCE_STREAM,
            Some(generate_payload()),
        ));

        let mut envs = Vec::new();
        while !envs.iter().any(|e: &Envelope| e.kind == msg::STREAM_END) {
            envs.extend(drain_until_idle(&mut writer_rx).await);
        }

        let kinds: Vec<&str> = envs.iter().map(|e| e.kind.as_str()).collect();
        assert_eq!(
            kinds,
            vec![
                msg::STREAM_START,
                msg::STREAM_TOKEN,
                msg::STREAM_TOKEN,
                msg::STREAM_TOKEN,
                msg::STREAM_END,
            ]
        );
        for env in &envs {
            assert_eq!(env.id.as_deref(), Some("s1"));
        }
        let end: StreamEndPayload =
            serde_json::from_value(envs.last().unwrap().payload.clone().unwrap()).unwrap();
        assert_eq!(end.final_response.text, "Hello!");
        assert_eq!(
            end.final_response.usage.unwrap().completion_tokens,
            Some(3)
        );
        assert!(end.final_response.timings.unwrap().total_ms.is_some());

        // Terminal event destroyed the per-request state.
        assert!(dispatcher.streams.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn generate_accumulates_without_stream_events() {
        let engine = MockEngine::new().with_script(["Hel", "lo", "!"]);
        let (dispatcher, mut writer_rx) = dispatcher_with(engine, None);
        dispatcher.dispatch(Envelope::new(
            Some("g1".into()),
            msg::INFERENCE_GENERATE,
            Some(generate_payload()),
        ));
        let envs = drain_until_idle(&mut writer_rx).await;
        assert_eq!(envs.len(), 1);
        assert_eq!(envs[0].kind, msg::INFERENCE_GENERATE_OK);
        let response: GenerateResponse =
            serde_json::from_value(envs[0].payload.clone().unwrap()).unwrap();
        assert_eq!(response.text, "Hello!");
        assert_eq!(response.request_id, "g1");
    }

    #[tokio::test]
    async fn cancel_is_acknowledged_even_for_unknown_ids() {
        let (dispatcher, mut writer_rx) = dispatcher_with(MockEngine::new(), None);
        dispatcher.dispatch(Envelope::new(
            Some("c1".into()),
            msg::INFERENCE_CANCEL,
            Some(json!({"requestId": "nope"})),
        ));
        let envs = drain_until_idle(&mut writer_rx).await;
        assert_eq!(envs[0].kind, msg::INFERENCE_CANCEL_OK);
        let ok: CancelOk = serde_json::from_value(envs[0].payload.clone().unwrap()).unwrap();
        assert!(ok.cancelled);
        assert_eq!(ok.request_id, "nope");
    }

    #[tokio::test]
    async fn cancel_racing_stream_start_is_not_lost() {
        let engine = MockEngine::new()
            .with_script(vec!["tok "; 50])
            .with_chunk_delay(std::time::Duration::from_millis(5));
        let (dispatcher, mut writer_rx) = dispatcher_with(engine, None);

        // Both frames arrive in one read; the cancel's handler task may run
        // before the stream's has inserted any state of its own.
        dispatcher.dispatch(Envelope::new(
            Some("s1".into()),
            msg::INFERENCE_STREAM,
            Some(generate_payload()),
        ));
        dispatcher.dispatch(Envelope::new(
            Some("c1".into()),
            msg::INFERENCE_CANCEL,
            Some(json!({"requestId": "s1"})),
        ));

        let mut envs = Vec::new();
        while !envs.iter().any(|e: &Envelope| e.kind == msg::STREAM_ERROR) {
            envs.extend(drain_until_idle(&mut writer_rx).await);
        }
        let error = envs.iter().find(|e| e.kind == msg::STREAM_ERROR).unwrap();
        let payload = error.payload.clone().unwrap();
        assert_eq!(payload["code"], codes::CANCELLED);
        assert_eq!(payload["message"], "Cancelled");
        assert!(envs.iter().any(|e| e.kind == msg::INFERENCE_CANCEL_OK));
        assert!(dispatcher.streams.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn engine_stream_failure_surfaces_as_stream_error() {
        let engine = MockEngine::new()
            .with_script(["one "])
            .with_stream_error("backend exploded");
        let (dispatcher, mut writer_rx) = dispatcher_with(engine, None);
        dispatcher.dispatch(Envelope::new(
            Some("s2".into()),
            msg::INFERENCE_STREAM,
            Some(generate_payload()),
        ));
        let mut envs = Vec::new();
        while !envs.iter().any(|e: &Envelope| e.kind == msg::STREAM_ERROR) {
            envs.extend(drain_until_idle(&mut writer_rx).await);
        }
        let last = envs.last().unwrap();
        let payload = last.payload.clone().unwrap();
        assert_eq!(payload["code"], codes::STREAM_ERROR);
        assert_eq!(payload["message"], "backend exploded");
        assert!(dispatcher.streams.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn malformed_generate_payload_is_bad_request() {
        let (dispatcher, mut writer_rx) = dispatcher_with(MockEngine::new(), None);
        dispatcher.dispatch(Envelope::new(
            Some("g2".into()),
            msg::INFERENCE_GENERATE,
            Some(json!({"messages": "not a list"})),
        ));
        let envs = drain_until_idle(&mut writer_rx).await;
        let err: ErrorPayload = serde_json::from_value(envs[0].payload.clone().unwrap()).unwrap();
        assert_eq!(err.code, codes::BAD_REQUEST);
    }

    #[tokio::test]
    async fn empty_model_name_is_bad_request() {
        let (dispatcher, mut writer_rx) = dispatcher_with(MockEngine::new(), None);
        dispatcher.dispatch(Envelope::new(
            Some("m1".into()),
            msg::MODEL_LOAD,
            Some(json!({"model": ""})),
        ));
        let envs = drain_until_idle(&mut writer_rx).await;
        let err: ErrorPayload = serde_json::from_value(envs[0].payload.clone().unwrap()).unwrap();
        assert_eq!(err.code, codes::BAD_REQUEST);
    }

    #[test]
    fn constant_time_eq_basics() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"ab"));
        assert!(constant_time_eq(b"", b""));
    }
}
