use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use reqwest::Client;
use tracing::{debug, instrument};

use foundry_core::{ClientError, ThreadId};

use crate::sse::sse_messages;

/// Raw message payloads from one open stream connection. Ends on clean
/// close; a read failure arrives as a single `Err` item.
pub type MessageStream = BoxStream<'static, Result<String, ClientError>>;

/// Opens the server-push connection for a session.
#[async_trait]
pub trait StreamTransport: Send + Sync + 'static {
    async fn open(&self, thread_id: &ThreadId) -> Result<MessageStream, ClientError>;
}

/// `GET {base}/stream/{id}` as `text/event-stream`.
///
/// Only the connect phase is time-limited; an open stream may stay idle
/// indefinitely and relies on the transport to report failure.
pub struct HttpStreamTransport {
    client: Client,
    base_url: String,
}

impl HttpStreamTransport {
    pub fn new(base_url: impl Into<String>, connect_timeout: Duration) -> Result<Self, ClientError> {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| ClientError::Transport(format!("build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl StreamTransport for HttpStreamTransport {
    #[instrument(skip(self), fields(thread_id = %thread_id))]
    async fn open(&self, thread_id: &ThreadId) -> Result<MessageStream, ClientError> {
        let url = format!("{}/stream/{}", self.base_url, thread_id);
        let resp = self
            .client
            .get(&url)
            .header("accept", "text/event-stream")
            .header("cache-control", "no-cache")
            .send()
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(ClientError::Transport(format!(
                "stream open returned {}",
                resp.status().as_u16()
            )));
        }

        debug!("event stream connected");
        Ok(Box::pin(sse_messages(resp.bytes_stream())))
    }
}
