//! TCP transport to the evaluation server
//!
//! Every request gets its own connection: connect, write one encoded
//! request, read messages until the completion detector is satisfied, then
//! shut the socket down.

use std::io;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

use rv_core::config::ServerAddress;
use rv_core::{CompletionPolicy, Transport, TransportError};
use rv_protocol::{Message, MessageCodec, Request};

use crate::completion::CompletionDetector;

/// Default hard ceiling on waiting for any message
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);

/// Transport that opens a fresh TCP connection per request
#[derive(Debug, Clone)]
pub struct TcpTransport {
    address: ServerAddress,
    hard_timeout: Duration,
}

impl TcpTransport {
    /// Create a transport for the given server
    pub fn new(address: ServerAddress) -> Self {
        Self {
            address,
            hard_timeout: DEFAULT_RESPONSE_TIMEOUT,
        }
    }

    /// Override the hard response ceiling
    pub fn with_timeout(mut self, hard_timeout: Duration) -> Self {
        self.hard_timeout = hard_timeout;
        self
    }

    async fn connect(&self) -> Result<TcpStream, TransportError> {
        let unreachable = |source: io::Error| TransportError::ServerUnreachable {
            address: self.address.to_string(),
            source,
        };

        let host = self.address.host.as_str();
        let stream = tokio::time::timeout(
            self.hard_timeout,
            TcpStream::connect((host, self.address.port)),
        )
        .await
        .map_err(|_| unreachable(io::Error::new(io::ErrorKind::TimedOut, "connect timed out")))?
        .map_err(unreachable)?;

        stream.set_nodelay(true).map_err(unreachable)?;
        Ok(stream)
    }

    async fn exchange(
        &self,
        framed: &mut Framed<TcpStream, MessageCodec>,
        request: &Request,
        policy: CompletionPolicy,
        observer: &mut (dyn for<'m> FnMut(&'m Message) + Send),
    ) -> Result<Vec<Message>, TransportError> {
        framed.send(request).await?;

        let mut detector = CompletionDetector::new(policy);
        let mut batch = Vec::new();

        loop {
            let wait = detector.next_wait().unwrap_or(self.hard_timeout);

            let next = match tokio::time::timeout(wait, framed.next()).await {
                Ok(next) => next,
                Err(_) if batch.is_empty() => {
                    return Err(TransportError::ResponseTimeout(self.hard_timeout));
                }
                Err(_) => {
                    tracing::debug!(
                        "{} batch closed after {:?} quiet ({} messages)",
                        request.op(),
                        wait,
                        batch.len()
                    );
                    break;
                }
            };

            let message = match next {
                Some(message) => message?,
                None => {
                    tracing::debug!("Server closed connection during {}", request.op());
                    break;
                }
            };

            tracing::debug!("<- {:?}", message);
            observer(&message);
            let complete = detector.observe(&message);
            batch.push(message);

            if complete {
                break;
            }
        }

        Ok(batch)
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send_observed(
        &self,
        request: &Request,
        policy: CompletionPolicy,
        observer: &mut (dyn for<'m> FnMut(&'m Message) + Send),
    ) -> Result<Vec<Message>, TransportError> {
        let stream = self.connect().await?;
        tracing::debug!("-> {} {:?}", self.address, request);

        let mut framed = Framed::new(stream, MessageCodec::new());
        let result = self.exchange(&mut framed, request, policy, observer).await;

        // The connection is closed whatever the outcome
        let mut stream = framed.into_inner();
        if let Err(e) = stream.shutdown().await {
            tracing::debug!("Error shutting down connection to {}: {}", self.address, e);
        }

        result
    }
}
