//! Client connection to the host.
//!
//! Owns the pending-request table and the stream subscription table, a
//! serialized writer task, and a reader task that demultiplexes replies and
//! stream events. Optionally supervises a spawned host child: any failure
//! during construction kills the child before surfacing the error.

pub mod process;
pub mod stream;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot};

use crate::config::{default_client_socket_path, ClientConfig};
use crate::protocol::types::{
    CancelOk, DownloadRequest, DownloadSource, DownloadedModel, ErrorPayload, GenerateRequest,
    GenerateResponse, HandshakeOk, ModelDeleteOk, ModelListOk, ModelLoadOk, ResetOk,
    ResetRequest, StreamEndPayload, StreamErrorPayload, StreamEvent, StreamTokenPayload,
};
use crate::protocol::{codes, frame, msg, Envelope, FrameDecoder};
use crate::{log_debug, log_warn};

pub use process::ProcessManager;
pub use stream::TokenStream;

/// Sleep between connect attempts while a freshly spawned host binds.
const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(25);
/// Give up connecting to a spawned host after this long.
const CONNECT_DEADLINE: Duration = Duration::from_secs(3);

const READ_BUFFER: usize = 8192;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("timed out connecting to {}", .path.display())]
    ConnectTimeout { path: PathBuf },
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),
    #[error("host error ({code}): {message}")]
    Rpc { code: String, message: String },
    #[error("connection closed")]
    TransportClosed,
    #[error("unexpected payload: {0}")]
    Payload(#[from] serde_json::Error),
}

#[derive(Debug)]
enum WriterCmd {
    Frame(Vec<u8>),
    Shutdown,
}

#[derive(Debug)]
struct ClientInner {
    writer_tx: mpsc::UnboundedSender<WriterCmd>,
    /// One-shot completion slots for in-flight requests.
    pending: Mutex<HashMap<String, oneshot::Sender<Result<Value, ErrorPayload>>>>,
    /// Event sinks for in-flight streams.
    subs: Mutex<HashMap<String, mpsc::UnboundedSender<StreamEvent>>>,
    next_id: AtomicU64,
    closed: AtomicBool,
    process: Option<ProcessManager>,
    server_info: Mutex<Option<HandshakeOk>>,
}

/// Handle to a connected host. Clones share the same connection.
#[derive(Clone, Debug)]
pub struct HostClient {
    inner: Arc<ClientInner>,
}

impl HostClient {
    /// Connect per the configuration: spawn the host child if a binary is
    /// configured, open the socket (with bounded retry for a spawned host),
    /// and perform the handshake when an auth token is in scope.
    pub async fn connect(config: ClientConfig) -> Result<HostClient, ClientError> {
        let socket_path = config
            .socket_path
            .clone()
            .unwrap_or_else(default_client_socket_path);
        let spawning = config.host_binary.is_some();
        // A spawned host always gets a token, generated if none was given,
        // so a local bystander can't race us to the socket.
        let auth_token = match (config.auth_token.clone(), spawning) {
            (Some(token), _) => Some(token),
            (None, true) => Some(uuid::Uuid::new_v4().simple().to_string()),
            (None, false) => None,
        };

        let process = match &config.host_binary {
            Some(binary) => Some(ProcessManager::spawn(
                binary,
                &socket_path,
                auth_token.as_deref(),
                config.device,
                config.stdio,
            )?),
            None => None,
        };

        let stream = match connect_with_retry(&socket_path, spawning).await {
            Ok(stream) => stream,
            Err(e) => {
                if let Some(process) = &process {
                    process.kill().await;
                }
                return Err(e);
            }
        };

        let (read_half, write_half) = stream.into_split();
        let (writer_tx, writer_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(ClientInner {
            writer_tx,
            pending: Mutex::new(HashMap::new()),
            subs: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            process,
            server_info: Mutex::new(None),
        });

        tokio::spawn(writer_task(writer_rx, write_half));
        tokio::spawn(reader_task(read_half, inner.clone()));

        let client = HostClient { inner };

        if let Some(token) = auth_token {
            match client
                .request(msg::HANDSHAKE, Some(json!({ "authToken": token })))
                .await
            {
                Ok(value) => match serde_json::from_value::<HandshakeOk>(value) {
                    Ok(info) => {
                        *client.inner.server_info.lock().unwrap() = Some(info);
                    }
                    Err(e) => {
                        client.close().await;
                        return Err(ClientError::HandshakeFailed(e.to_string()));
                    }
                },
                Err(e) => {
                    let message = e.to_string();
                    client.close().await;
                    return Err(ClientError::HandshakeFailed(message));
                }
            }
        }

        Ok(client)
    }

    /// Server version and capability flags from the handshake, if one ran.
    pub fn server_info(&self) -> Option<HandshakeOk> {
        self.inner.server_info.lock().unwrap().clone()
    }

    /// One-shot request/response. Resolves with the reply payload, or fails
    /// on an `error` envelope or connection loss.
    pub async fn request(
        &self,
        kind: &str,
        payload: Option<Value>,
    ) -> Result<Value, ClientError> {
        self.request_with_id(kind, payload, None).await
    }

    /// Like [`HostClient::request`] with a caller-chosen correlation id.
    pub async fn request_with_id(
        &self,
        kind: &str,
        payload: Option<Value>,
        id: Option<String>,
    ) -> Result<Value, ClientError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(ClientError::TransportClosed);
        }
        let id = id.unwrap_or_else(|| self.inner.allocate_id());
        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().unwrap().insert(id.clone(), tx);

        let env = Envelope::new(Some(id.clone()), kind, payload);
        if !self.inner.write(&env) {
            self.inner.pending.lock().unwrap().remove(&id);
            return Err(ClientError::TransportClosed);
        }

        match rx.await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(ClientError::Rpc {
                code: err.code,
                message: err.message,
            }),
            Err(_) => Err(ClientError::TransportClosed),
        }
    }

    /// Start a streamed generation. Events arrive on the returned
    /// [`TokenStream`] in order: `Start`, tokens, then one `End` or `Error`.
    pub fn stream(
        &self,
        request: &GenerateRequest,
        request_id: Option<String>,
    ) -> Result<TokenStream, ClientError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(ClientError::TransportClosed);
        }
        let payload = serde_json::to_value(request)?;
        let id = request_id.unwrap_or_else(|| self.inner.allocate_id());
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.subs.lock().unwrap().insert(id.clone(), tx);

        let env = Envelope::new(Some(id.clone()), msg::INFERENCE_STREAM, Some(payload));
        if !self.inner.write(&env) {
            self.inner.subs.lock().unwrap().remove(&id);
            return Err(ClientError::TransportClosed);
        }
        Ok(TokenStream::new(id, rx, self.clone()))
    }

    /// Tear down the socket and, if we spawned it, the host child.
    /// Idempotent.
    pub async fn close(&self) {
        if !self.inner.closed.swap(true, Ordering::SeqCst) {
            let _ = self.inner.writer_tx.send(WriterCmd::Shutdown);
            self.inner.fail_all();
        }
        if let Some(process) = &self.inner.process {
            process.kill().await;
        }
    }

    // -- typed wrappers ----------------------------------------------------

    pub async fn download(
        &self,
        source: DownloadSource,
        models_dir: Option<String>,
    ) -> Result<DownloadedModel, ClientError> {
        let payload = serde_json::to_value(DownloadRequest { source, models_dir })?;
        let value = self.request(msg::MODEL_DOWNLOAD, Some(payload)).await?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn load_model(&self, model: &str) -> Result<ModelLoadOk, ClientError> {
        let value = self
            .request(msg::MODEL_LOAD, Some(json!({ "model": model })))
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn unload_model(&self, model: &str) -> Result<ModelLoadOk, ClientError> {
        let value = self
            .request(msg::MODEL_UNLOAD, Some(json!({ "model": model })))
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn delete_model(&self, model: &str) -> Result<ModelDeleteOk, ClientError> {
        let value = self
            .request(msg::MODEL_DELETE, Some(json!({ "model": model })))
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn list_models(&self) -> Result<ModelListOk, ClientError> {
        let value = self.request(msg::MODEL_LIST, None).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Non-streamed generation: the host accumulates and returns the full
    /// response.
    pub async fn generate(
        &self,
        request: &GenerateRequest,
    ) -> Result<GenerateResponse, ClientError> {
        let value = self
            .request(msg::INFERENCE_GENERATE, Some(serde_json::to_value(request)?))
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Cancel a streamed generation. Returns when the host acknowledges;
    /// the stream's terminal event arrives separately.
    pub async fn cancel(&self, request_id: &str) -> Result<CancelOk, ClientError> {
        let value = self
            .request(msg::INFERENCE_CANCEL, Some(json!({ "requestId": request_id })))
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn reset(&self, request: ResetRequest) -> Result<ResetOk, ClientError> {
        let value = self
            .request(msg::RESET, Some(serde_json::to_value(&request)?))
            .await?;
        Ok(serde_json::from_value(value)?)
    }
}

impl ClientInner {
    fn allocate_id(&self) -> String {
        self.next_id.fetch_add(1, Ordering::Relaxed).to_string()
    }

    fn write(&self, env: &Envelope) -> bool {
        let bytes = match frame::encode(env) {
            Ok(bytes) => bytes,
            Err(e) => {
                log_warn!("CLIENT", "failed to encode {}: {e}", env.kind);
                return false;
            }
        };
        self.writer_tx.send(WriterCmd::Frame(bytes)).is_ok()
    }

    /// Reject every pending request and terminate every open stream. Runs
    /// on socket loss and on explicit close.
    fn fail_all(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let pending: Vec<_> = self.pending.lock().unwrap().drain().collect();
        for (_, tx) in pending {
            let _ = tx.send(Err(ErrorPayload {
                code: codes::TRANSPORT_CLOSED.to_string(),
                message: "Connection closed".to_string(),
            }));
        }
        let subs: Vec<_> = self.subs.lock().unwrap().drain().collect();
        for (_, tx) in subs {
            let _ = tx.send(StreamEvent::Error {
                code: codes::TRANSPORT_CLOSED.to_string(),
                message: "Connection closed".to_string(),
            });
        }
    }

    fn demux(&self, env: Envelope) {
        if env.is_stream_event() {
            self.demux_stream_event(env);
            return;
        }

        let Some(id) = env.id else {
            log_debug!("CLIENT", "discarding envelope without id: {}", env.kind);
            return;
        };
        let is_error = env.kind == msg::ERROR;
        let payload = env.payload.unwrap_or(Value::Null);

        if let Some(tx) = self.pending.lock().unwrap().remove(&id) {
            if is_error {
                let _ = tx.send(Err(parse_error_payload(payload)));
            } else {
                let _ = tx.send(Ok(payload));
            }
            return;
        }

        // A stream request rejected outright (e.g. bad_request before any
        // start event) resolves its subscription instead.
        if is_error {
            if let Some(tx) = self.subs.lock().unwrap().remove(&id) {
                let err = parse_error_payload(payload);
                let _ = tx.send(StreamEvent::Error {
                    code: err.code,
                    message: err.message,
                });
                return;
            }
        }
        log_debug!("CLIENT", "no pending request for reply id={id}");
    }

    fn demux_stream_event(&self, env: Envelope) {
        // Stream events carry the id both on the envelope and in the
        // payload; the envelope wins when present.
        let sid = env.id.clone().or_else(|| {
            env.payload
                .as_ref()
                .and_then(|p| p.get("requestId"))
                .and_then(|v| v.as_str())
                .map(String::from)
        });
        let Some(sid) = sid else {
            log_debug!("CLIENT", "stream event without request id: {}", env.kind);
            return;
        };

        let payload = env.payload.unwrap_or(Value::Null);
        let event = match env.kind.as_str() {
            msg::STREAM_START => StreamEvent::Start,
            msg::STREAM_TOKEN => match serde_json::from_value::<StreamTokenPayload>(payload) {
                Ok(token) => StreamEvent::Token { text: token.text },
                Err(e) => {
                    log_warn!("CLIENT", "malformed token event for {sid}: {e}");
                    return;
                }
            },
            msg::STREAM_END => match serde_json::from_value::<StreamEndPayload>(payload) {
                Ok(end) => StreamEvent::End {
                    response: end.final_response,
                },
                Err(e) => StreamEvent::Error {
                    code: codes::STREAM_ERROR.to_string(),
                    message: format!("malformed end event: {e}"),
                },
            },
            msg::STREAM_ERROR => match serde_json::from_value::<StreamErrorPayload>(payload) {
                Ok(err) => StreamEvent::Error {
                    code: err.code,
                    message: err.message,
                },
                Err(e) => StreamEvent::Error {
                    code: codes::STREAM_ERROR.to_string(),
                    message: format!("malformed error event: {e}"),
                },
            },
            other => {
                log_debug!("CLIENT", "unknown stream event: {other}");
                return;
            }
        };

        let terminal = event.is_terminal();
        let mut subs = self.subs.lock().unwrap();
        let Some(tx) = subs.get(&sid) else {
            log_debug!("CLIENT", "no subscription for stream id={sid}");
            return;
        };
        let subscriber_gone = tx.send(event).is_err();
        if subscriber_gone || terminal {
            subs.remove(&sid);
        }
        drop(subs);
        if subscriber_gone && !terminal {
            // Subscriber went away without cancelling; stop the host side
            // too.
            let cancel_id = self.allocate_id();
            self.write(&Envelope::new(
                Some(cancel_id),
                msg::INFERENCE_CANCEL,
                Some(json!({ "requestId": sid })),
            ));
        }
    }
}

fn parse_error_payload(payload: Value) -> ErrorPayload {
    serde_json::from_value(payload).unwrap_or_else(|_| ErrorPayload {
        code: codes::INTERNAL.to_string(),
        message: "malformed error payload".to_string(),
    })
}

async fn connect_with_retry(
    path: &std::path::Path,
    spawned: bool,
) -> Result<UnixStream, ClientError> {
    let deadline = Instant::now() + CONNECT_DEADLINE;
    loop {
        match UnixStream::connect(path).await {
            Ok(stream) => return Ok(stream),
            Err(e)
                if spawned
                    && matches!(
                        e.kind(),
                        std::io::ErrorKind::NotFound | std::io::ErrorKind::ConnectionRefused
                    ) =>
            {
                if Instant::now() >= deadline {
                    return Err(ClientError::ConnectTimeout {
                        path: path.to_path_buf(),
                    });
                }
                tokio::time::sleep(CONNECT_RETRY_DELAY).await;
            }
            Err(e) => return Err(ClientError::Io(e)),
        }
    }
}

async fn writer_task(mut writer_rx: mpsc::UnboundedReceiver<WriterCmd>, mut write_half: OwnedWriteHalf) {
    while let Some(cmd) = writer_rx.recv().await {
        match cmd {
            WriterCmd::Frame(bytes) => {
                if let Err(e) = write_half.write_all(&bytes).await {
                    log_debug!("CLIENT", "write error: {e}");
                    break;
                }
            }
            WriterCmd::Shutdown => break,
        }
    }
    let _ = write_half.shutdown().await;
}

async fn reader_task(mut read_half: OwnedReadHalf, inner: Arc<ClientInner>) {
    let mut decoder = FrameDecoder::new();
    let mut buf = vec![0u8; READ_BUFFER];

    'outer: loop {
        let n = match read_half.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                log_debug!("CLIENT", "read error: {e}");
                break;
            }
        };
        decoder.extend(&buf[..n]);
        loop {
            match decoder.next_envelope() {
                Ok(Some(env)) => inner.demux(env),
                Ok(None) => break,
                Err(e) => {
                    log_warn!("CLIENT", "{e}");
                    break 'outer;
                }
            }
        }
    }

    log_debug!("CLIENT", "socket closed");
    inner.fail_all();
}
