//! One accepted socket: read loop, serialized writer, close handling.
//!
//! Task design per connection:
//! - read task: reads bytes, feeds the frame decoder, hands envelopes to the
//!   dispatcher
//! - writer task: drains the write queue so concurrent sends never
//!   interleave bytes of distinct frames
//!
//! Both tasks are detached; they terminate when the peer goes away or
//! [`ConnectionHandle::close`] fires.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::{mpsc, watch};

use crate::engine::Engine;
use crate::protocol::{frame, Envelope, FrameDecoder};
use crate::{log_debug, log_warn};

use super::dispatcher::Dispatcher;

/// Cap on bytes queued for a slow peer. Exceeding it closes the connection.
pub const MAX_QUEUED_BYTES: usize = 64 * 1024 * 1024;

const READ_BUFFER: usize = 8192;

pub(crate) enum WriterCmd {
    Frame(Vec<u8>),
    Shutdown,
}

/// Cheap clonable handle to a live connection. Sends are non-blocking and
/// FIFO; `close` is idempotent.
#[derive(Clone)]
pub struct ConnectionHandle {
    id: u64,
    writer_tx: mpsc::UnboundedSender<WriterCmd>,
    queued_bytes: Arc<AtomicUsize>,
    closed: Arc<AtomicBool>,
    close_tx: Arc<watch::Sender<bool>>,
}

impl ConnectionHandle {
    fn new(id: u64, writer_tx: mpsc::UnboundedSender<WriterCmd>) -> (Self, watch::Receiver<bool>) {
        let (close_tx, close_rx) = watch::channel(false);
        (
            ConnectionHandle {
                id,
                writer_tx,
                queued_bytes: Arc::new(AtomicUsize::new(0)),
                closed: Arc::new(AtomicBool::new(false)),
                close_tx: Arc::new(close_tx),
            },
            close_rx,
        )
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Enqueue an envelope for transmission. Returns `false` if the
    /// connection is closed or closing.
    pub fn send(&self, env: &Envelope) -> bool {
        if self.is_closed() {
            return false;
        }
        let bytes = match frame::encode(env) {
            Ok(bytes) => bytes,
            Err(e) => {
                log_warn!("CONN", "connection {}: failed to encode {}: {e}", self.id, env.kind);
                return false;
            }
        };
        let queued = self.queued_bytes.fetch_add(bytes.len(), Ordering::SeqCst) + bytes.len();
        if queued > MAX_QUEUED_BYTES {
            log_warn!(
                "CONN",
                "connection {}: write queue exceeded {} bytes, closing (backpressure)",
                self.id,
                MAX_QUEUED_BYTES
            );
            self.close();
            return false;
        }
        self.writer_tx.send(WriterCmd::Frame(bytes)).is_ok()
    }

    /// Stop both tasks. Frames queued before the call are still flushed.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.writer_tx.send(WriterCmd::Shutdown);
        let _ = self.close_tx.send(true);
    }

    #[cfg(test)]
    pub(crate) fn for_tests() -> (Self, mpsc::UnboundedReceiver<WriterCmd>) {
        let (writer_tx, writer_rx) = mpsc::unbounded_channel();
        let (handle, _close_rx) = Self::new(0, writer_tx);
        (handle, writer_rx)
    }
}

/// Wrap an accepted socket in a fresh connection + dispatcher pair.
pub fn spawn(stream: UnixStream, id: u64, engine: Arc<dyn Engine>, auth_token: Option<String>) {
    let (read_half, write_half) = stream.into_split();
    let (writer_tx, writer_rx) = mpsc::unbounded_channel();
    let (handle, close_rx) = ConnectionHandle::new(id, writer_tx);
    let dispatcher = Arc::new(Dispatcher::new(engine, auth_token, handle.clone()));

    tokio::spawn(writer_task(
        writer_rx,
        write_half,
        handle.queued_bytes.clone(),
        id,
    ));
    tokio::spawn(read_task(read_half, close_rx, handle, dispatcher));
}

async fn read_task(
    mut read_half: OwnedReadHalf,
    mut close_rx: watch::Receiver<bool>,
    handle: ConnectionHandle,
    dispatcher: Arc<Dispatcher>,
) {
    let mut decoder = FrameDecoder::new();
    let mut buf = vec![0u8; READ_BUFFER];

    'outer: while !*close_rx.borrow() {
        tokio::select! {
            _ = close_rx.changed() => break,
            result = read_half.read(&mut buf) => {
                let n = match result {
                    Ok(0) => {
                        log_debug!("CONN", "connection {}: peer closed", handle.id());
                        break;
                    }
                    Ok(n) => n,
                    Err(e) => {
                        log_warn!("CONN", "connection {}: read error: {e}", handle.id());
                        break;
                    }
                };
                decoder.extend(&buf[..n]);
                loop {
                    match decoder.next_envelope() {
                        Ok(Some(env)) => dispatcher.dispatch(env),
                        Ok(None) => break,
                        Err(e) => {
                            log_warn!("CONN", "connection {}: {e}", handle.id());
                            break 'outer;
                        }
                    }
                }
            }
        }
    }

    // Abandon in-flight streams for this connection before tearing down.
    dispatcher.connection_closed();
    handle.close();
}

async fn writer_task(
    mut writer_rx: mpsc::UnboundedReceiver<WriterCmd>,
    mut write_half: OwnedWriteHalf,
    queued_bytes: Arc<AtomicUsize>,
    id: u64,
) {
    while let Some(cmd) = writer_rx.recv().await {
        match cmd {
            WriterCmd::Frame(bytes) => {
                let len = bytes.len();
                let result = write_half.write_all(&bytes).await;
                queued_bytes.fetch_sub(len, Ordering::SeqCst);
                if let Err(e) = result {
                    log_debug!("CONN", "connection {id}: write error: {e}");
                    break;
                }
            }
            WriterCmd::Shutdown => break,
        }
    }
    let _ = write_half.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::msg;

    fn megabyte_frame() -> Envelope {
        Envelope::reply(
            "1",
            msg::STREAM_TOKEN,
            serde_json::json!({ "requestId": "1", "text": "x".repeat(1024 * 1024) }),
        )
    }

    #[test]
    fn send_past_queue_cap_closes_the_connection() {
        // The writer of a test handle never drains, so every send stays
        // queued, like a peer that stopped reading.
        let (handle, mut writer_rx) = ConnectionHandle::for_tests();
        let env = megabyte_frame();

        let mut accepted = 0;
        while handle.send(&env) {
            accepted += 1;
            assert!(accepted < 100, "queue cap never tripped");
        }

        // The cap closed the connection; roughly 64 one-MiB frames fit.
        assert!(handle.is_closed());
        assert!(accepted >= 60, "closed after only {accepted} frames");

        // Frames queued before the cap are still flushed, then the writer
        // is told to shut down.
        let mut frames = 0;
        let mut saw_shutdown = false;
        while let Ok(cmd) = writer_rx.try_recv() {
            match cmd {
                WriterCmd::Frame(_) => frames += 1,
                WriterCmd::Shutdown => {
                    saw_shutdown = true;
                    break;
                }
            }
        }
        assert_eq!(frames, accepted);
        assert!(saw_shutdown);
    }

    #[test]
    fn send_after_close_is_rejected() {
        let (handle, _writer_rx) = ConnectionHandle::for_tests();
        assert!(handle.send(&megabyte_frame()));
        handle.close();
        assert!(!handle.send(&megabyte_frame()));
        // Close stays idempotent.
        handle.close();
        assert!(handle.is_closed());
    }
}
