//! Wire protocol: framing, the RPC envelope, and typed payload records.

pub mod envelope;
pub mod frame;
pub mod types;

pub use envelope::{codes, msg, Envelope};
pub use frame::{FrameDecoder, FrameError, MAX_FRAME_SIZE};
