//! The narrow capability contract the dispatcher drives.
//!
//! The inference runtime itself (model loading, tokenization, sampling,
//! artifact download) lives behind this trait. The dispatcher assumes only
//! that calls return to its own execution context and that `stream` respects
//! `cancel` at chunk boundaries.

pub mod mock;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::protocol::types::{DownloadSource, DownloadedModel, GenerateRequest};

pub use mock::MockEngine;

#[derive(Debug, Clone, thiserror::Error)]
pub enum EngineError {
    /// The request was malformed or referenced something the engine cannot
    /// act on (missing model, bad source). Maps to `bad_request` on the wire.
    #[error("{0}")]
    InvalidRequest(String),
    /// The engine failed while doing the work. Maps to `internal` (or
    /// `stream_error` mid-stream) on the wire.
    #[error("{0}")]
    Failed(String),
}

/// The engine's view of its model sets, both unsorted; the dispatcher sorts
/// before replying.
#[derive(Debug, Clone, Default)]
pub struct ModelList {
    pub cached: Vec<String>,
    pub loaded: Vec<String>,
}

/// Chunk stream handed back by [`Engine::stream`]. The channel closing
/// without an error terminates the stream normally.
pub type ChunkReceiver = mpsc::Receiver<Result<String, EngineError>>;

#[async_trait]
pub trait Engine: Send + Sync {
    /// Fetch a model artifact. May perform long network I/O.
    async fn download(
        &self,
        source: &DownloadSource,
        models_dir: Option<&str>,
    ) -> Result<DownloadedModel, EngineError>;

    async fn load(&self, model: &str) -> Result<(), EngineError>;

    async fn unload(&self, model: &str) -> Result<(), EngineError>;

    async fn delete(&self, model: &str) -> Result<(), EngineError>;

    async fn list(&self) -> Result<ModelList, EngineError>;

    /// Start generating for `request_id`. Chunks arrive on the returned
    /// channel; the engine must stop yielding promptly after
    /// [`Engine::cancel`] is called with the same id.
    async fn stream(
        &self,
        request_id: &str,
        request: &GenerateRequest,
    ) -> Result<ChunkReceiver, EngineError>;

    /// Signal the in-flight stream for `request_id`, if any. Idempotent.
    fn cancel(&self, request_id: &str);

    async fn reset(&self, unload_all: bool, clear_cache: bool) -> Result<(), EngineError>;
}
