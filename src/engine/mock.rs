//! Scripted in-process engine.
//!
//! Backs the shipped `mlx-host` binary and the test suite. Generation either
//! replays a configured chunk script or echoes the prompt word by word. Real
//! engines live in their own crates and implement [`Engine`] against an
//! actual runtime.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{ChunkReceiver, Engine, EngineError, ModelList};
use crate::log_debug;
use crate::protocol::types::{DownloadSource, DownloadedModel, GenerateRequest};

/// Channel capacity for generated chunks; the producer task blocks when the
/// dispatcher falls behind.
const CHUNK_BUFFER: usize = 32;

struct MockState {
    cached: BTreeSet<String>,
    loaded: BTreeSet<String>,
    /// When set, every generation replays exactly these chunks.
    script: Option<Vec<String>>,
    /// Injected failure: emitted as a stream error after `script` chunks run
    /// out (or immediately with an empty script).
    stream_error: Option<String>,
    chunk_delay: Duration,
}

pub struct MockEngine {
    state: Mutex<MockState>,
    cancels: Arc<Mutex<HashMap<String, Arc<AtomicBool>>>>,
}

impl MockEngine {
    pub fn new() -> Self {
        MockEngine {
            state: Mutex::new(MockState {
                cached: BTreeSet::new(),
                loaded: BTreeSet::new(),
                script: None,
                stream_error: None,
                chunk_delay: Duration::ZERO,
            }),
            cancels: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Replay these chunks for every generation instead of echoing.
    pub fn with_script<I, S>(self, chunks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.state.lock().unwrap().script =
            Some(chunks.into_iter().map(Into::into).collect());
        self
    }

    /// Fail the stream with this message after the scripted chunks.
    pub fn with_stream_error(self, message: impl Into<String>) -> Self {
        self.state.lock().unwrap().stream_error = Some(message.into());
        self
    }

    /// Sleep between chunks, so tests can interleave cancellation.
    pub fn with_chunk_delay(self, delay: Duration) -> Self {
        self.state.lock().unwrap().chunk_delay = delay;
        self
    }

    fn chunks_for(&self, request: &GenerateRequest) -> (Vec<String>, Option<String>, Duration) {
        let state = self.state.lock().unwrap();
        let chunks = match &state.script {
            Some(script) => script.clone(),
            None => {
                let (prompt, _history) = crate::protocol::types::split_prompt(&request.messages);
                prompt
                    .split_whitespace()
                    .map(|w| format!("{w} "))
                    .collect()
            }
        };
        let mut chunks = chunks;
        if let Some(max) = request.max_tokens {
            chunks.truncate(max as usize);
        }
        (chunks, state.stream_error.clone(), state.chunk_delay)
    }
}

impl Default for MockEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Engine for MockEngine {
    async fn download(
        &self,
        source: &DownloadSource,
        models_dir: Option<&str>,
    ) -> Result<DownloadedModel, EngineError> {
        let (model, local_path) = match source {
            DownloadSource::HuggingFace { repo, .. } => {
                if repo.is_empty() {
                    return Err(EngineError::InvalidRequest("empty repo".to_string()));
                }
                let model = repo
                    .rsplit('/')
                    .next()
                    .unwrap_or(repo.as_str())
                    .to_string();
                let dir = models_dir.unwrap_or("models");
                (model, format!("{dir}/{repo}"))
            }
            DownloadSource::LocalPath { path } => {
                if path.is_empty() {
                    return Err(EngineError::InvalidRequest("empty path".to_string()));
                }
                let model = std::path::Path::new(path)
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .unwrap_or(path.as_str())
                    .to_string();
                (model, path.clone())
            }
        };
        self.state.lock().unwrap().cached.insert(model.clone());
        log_debug!("ENGINE", "downloaded {model} -> {local_path}");
        Ok(DownloadedModel { model, local_path })
    }

    async fn load(&self, model: &str) -> Result<(), EngineError> {
        let mut state = self.state.lock().unwrap();
        state.cached.insert(model.to_string());
        state.loaded.insert(model.to_string());
        Ok(())
    }

    async fn unload(&self, model: &str) -> Result<(), EngineError> {
        self.state.lock().unwrap().loaded.remove(model);
        Ok(())
    }

    async fn delete(&self, model: &str) -> Result<(), EngineError> {
        let mut state = self.state.lock().unwrap();
        state.loaded.remove(model);
        state.cached.remove(model);
        Ok(())
    }

    async fn list(&self) -> Result<ModelList, EngineError> {
        let state = self.state.lock().unwrap();
        Ok(ModelList {
            cached: state.cached.iter().cloned().collect(),
            loaded: state.loaded.iter().cloned().collect(),
        })
    }

    async fn stream(
        &self,
        request_id: &str,
        request: &GenerateRequest,
    ) -> Result<ChunkReceiver, EngineError> {
        if request.model.is_empty() {
            return Err(EngineError::InvalidRequest("empty model".to_string()));
        }

        let cancelled = Arc::new(AtomicBool::new(false));
        self.cancels
            .lock()
            .unwrap()
            .insert(request_id.to_string(), cancelled.clone());

        let (chunks, stream_error, delay) = self.chunks_for(request);
        let (tx, rx) = mpsc::channel(CHUNK_BUFFER);
        let rid = request_id.to_string();
        let cancels = self.cancels.clone();

        tokio::spawn(async move {
            for chunk in chunks {
                if cancelled.load(Ordering::SeqCst) {
                    log_debug!("ENGINE", "stream {rid} stopped at cancel");
                    break;
                }
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                if tx.send(Ok(chunk)).await.is_err() {
                    break; // Dispatcher dropped the stream.
                }
            }
            if !cancelled.load(Ordering::SeqCst) {
                if let Some(message) = stream_error {
                    let _ = tx.send(Err(EngineError::Failed(message))).await;
                }
            }
            cancels.lock().unwrap().remove(&rid);
        });

        Ok(rx)
    }

    fn cancel(&self, request_id: &str) {
        if let Some(flag) = self.cancels.lock().unwrap().get(request_id) {
            flag.store(true, Ordering::SeqCst);
        }
    }

    async fn reset(&self, unload_all: bool, clear_cache: bool) -> Result<(), EngineError> {
        let mut state = self.state.lock().unwrap();
        if unload_all {
            state.loaded.clear();
        }
        if clear_cache {
            state.cached.clear();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::types::{ChatMessage, ChatRole};

    fn request(prompt: &str) -> GenerateRequest {
        GenerateRequest {
            model: "m".into(),
            messages: vec![ChatMessage::new(ChatRole::User, prompt)],
            max_tokens: None,
            stop: None,
            sampling: None,
        }
    }

    #[tokio::test]
    async fn scripted_chunks_replay_in_order() {
        let engine = MockEngine::new().with_script(["Hel", "lo", "!"]);
        let mut rx = engine.stream("s1", &request("hi")).await.unwrap();
        let mut out = String::new();
        while let Some(chunk) = rx.recv().await {
            out.push_str(&chunk.unwrap());
        }
        assert_eq!(out, "Hello!");
    }

    #[tokio::test]
    async fn echo_mode_splits_prompt_into_words() {
        let engine = MockEngine::new();
        let mut rx = engine.stream("s1", &request("two words")).await.unwrap();
        let mut chunks = Vec::new();
        while let Some(chunk) = rx.recv().await {
            chunks.push(chunk.unwrap());
        }
        assert_eq!(chunks, vec!["two ", "words "]);
    }

    #[tokio::test]
    async fn cancel_stops_the_stream() {
        let engine = MockEngine::new()
            .with_script(vec!["a"; 100])
            .with_chunk_delay(Duration::from_millis(5));
        let mut rx = engine.stream("s1", &request("hi")).await.unwrap();
        assert!(rx.recv().await.is_some());
        engine.cancel("s1");
        let mut rest = 0;
        while rx.recv().await.is_some() {
            rest += 1;
        }
        assert!(rest < 100, "stream kept yielding after cancel");
    }

    #[tokio::test]
    async fn download_registers_the_model_in_the_cache() {
        let engine = MockEngine::new();
        let downloaded = engine
            .download(
                &DownloadSource::HuggingFace {
                    repo: "org/tiny-llm".into(),
                    revision: None,
                },
                None,
            )
            .await
            .unwrap();
        assert_eq!(downloaded.model, "tiny-llm");
        let list = engine.list().await.unwrap();
        assert_eq!(list.cached, vec!["tiny-llm"]);
        assert!(list.loaded.is_empty());
    }

    #[tokio::test]
    async fn reset_clears_loaded_and_optionally_cache() {
        let engine = MockEngine::new();
        engine.load("m1").await.unwrap();
        engine.reset(true, false).await.unwrap();
        let list = engine.list().await.unwrap();
        assert!(list.loaded.is_empty());
        assert_eq!(list.cached, vec!["m1"]);
        engine.reset(true, true).await.unwrap();
        assert!(engine.list().await.unwrap().cached.is_empty());
    }
}
