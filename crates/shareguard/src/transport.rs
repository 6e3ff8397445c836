//! moving envelopes between sharer and helpers
//!
//! the core only needs [`Transport::send_request`]. dropping the returned future
//! abandons the request, which is how superseded exchanges are cancelled.

use std::time::Duration;

use async_trait::async_trait;

use crate::message::Message;
use crate::Result;

/// request/response channel to helpers
#[async_trait]
pub trait Transport: Send + Sync {
    /// deliver `message` to the helper at `address` and return its reply.
    /// implementations should give up after `timeout`.
    async fn send_request(&self, address: &str, message: Message, timeout: Duration) -> Result<Message>;
}

#[cfg(feature = "network")]
pub use http::HttpTransport;

#[cfg(feature = "network")]
mod http {
    use std::time::Duration;

    use async_trait::async_trait;
    use reqwest::header::CONTENT_TYPE;
    use reqwest::{Client, StatusCode};
    use tracing::debug;

    use super::Transport;
    use crate::config::RetryParameters;
    use crate::message::Message;
    use crate::{Error, Result};

    /// binary envelopes POSTed to the helper's address
    pub struct HttpTransport {
        http: Client,
    }

    impl HttpTransport {
        pub fn new(retry: &RetryParameters) -> Result<Self> {
            let http = Client::builder()
                .connect_timeout(retry.connect_timeout)
                .build()
                .map_err(|e| Error::Transport(e.to_string()))?;
            Ok(Self { http })
        }
    }

    #[async_trait]
    impl Transport for HttpTransport {
        async fn send_request(&self, address: &str, message: Message, timeout: Duration) -> Result<Message> {
            let body = message.encode()?;
            debug!(address, bytes = body.len(), "POST envelope");

            let resp = self
                .http
                .post(address)
                .timeout(timeout)
                .header(CONTENT_TYPE, "application/octet-stream")
                .body(body)
                .send()
                .await
                .map_err(|e| {
                    if e.is_timeout() {
                        Error::Timeout(timeout)
                    } else {
                        Error::Transport(e.to_string())
                    }
                })?;

            if resp.status() != StatusCode::OK {
                return Err(Error::Transport(format!("HTTP status {}", resp.status())));
            }

            let bytes = resp
                .bytes()
                .await
                .map_err(|e| Error::Transport(e.to_string()))?;
            Message::decode(&bytes)
        }
    }
}
