//! Local LLM inference as a long-lived co-process.
//!
//! The host side binds a unix-domain socket and serves a framed-JSON RPC
//! protocol (model lifecycle, one-shot generation, streamed generation with
//! cancellation) on behalf of an [`engine::Engine`] implementation. The
//! client side connects to a running host, or spawns one as a supervised
//! child, and exposes typed request and streaming APIs.
//!
//! Wire format: `u32 big-endian length || JSON envelope {id?, type,
//! payload?}`. See [`protocol`] for the codec and message catalogue.

pub mod client;
pub mod config;
pub mod engine;
pub mod host;
pub mod logger;
pub mod protocol;

pub use client::{ClientError, HostClient, TokenStream};
pub use config::{ClientConfig, Device, HostConfig, StdioPolicy};
pub use engine::{Engine, EngineError, MockEngine};
pub use host::serve;
pub use protocol::types::{
    ChatMessage, ChatRole, DownloadSource, GenerateRequest, GenerateResponse, SamplingParams,
    StreamEvent,
};
