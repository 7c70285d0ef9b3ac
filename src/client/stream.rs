//! Consumable event sequence for one `inference.stream` request.

use tokio::sync::mpsc;

use crate::protocol::types::{CancelOk, GenerateResponse, StreamEvent};

use super::{ClientError, HostClient};

/// Events for a single stream id, in arrival order: `Start`, then tokens,
/// then exactly one `End` or `Error`. After the terminal event `next`
/// returns `None`.
pub struct TokenStream {
    request_id: String,
    events: mpsc::UnboundedReceiver<StreamEvent>,
    client: HostClient,
}

impl TokenStream {
    pub(super) fn new(
        request_id: String,
        events: mpsc::UnboundedReceiver<StreamEvent>,
        client: HostClient,
    ) -> Self {
        TokenStream {
            request_id,
            events,
            client,
        }
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// The next event, or `None` once the terminal event has been consumed.
    pub async fn next(&mut self) -> Option<StreamEvent> {
        self.events.recv().await
    }

    /// Ask the host to cancel this stream. Returns once the host
    /// acknowledges; the stream itself still terminates with its own
    /// `Error{code: "cancelled"}` event.
    pub async fn cancel(&self) -> Result<CancelOk, ClientError> {
        self.client.cancel(&self.request_id).await
    }

    /// Drain the stream to completion and return the final response.
    ///
    /// A terminal `Error` event becomes `ClientError::Rpc`.
    pub async fn collect(mut self) -> Result<GenerateResponse, ClientError> {
        while let Some(event) = self.next().await {
            match event {
                StreamEvent::Start | StreamEvent::Token { .. } => {}
                StreamEvent::End { response } => return Ok(response),
                StreamEvent::Error { code, message } => {
                    return Err(ClientError::Rpc { code, message })
                }
            }
        }
        Err(ClientError::TransportClosed)
    }
}
