//! Transport trait

use async_trait::async_trait;
use std::time::Duration;

use crate::error::TransportError;
use rv_protocol::{Message, Request};

/// How a transport decides that a response batch is complete
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionPolicy {
    /// Stop after a quiet period that adapts to the traffic seen so far
    ///
    /// The window shrinks toward `floor` while output is streaming and grows
    /// toward `ceiling` otherwise. A `done` status ends the batch at once.
    Adaptive { floor: Duration, ceiling: Duration },

    /// Stop at the first message with a `done` status
    UntilDone,

    /// Stop after exactly this many messages, or at the first exception
    Expect(usize),
}

/// One request/response exchange with the evaluation server
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send `request` and collect its response batch
    ///
    /// `observer` sees every message as soon as it is decoded, before the
    /// batch is complete.
    async fn send_observed(
        &self,
        request: &Request,
        policy: CompletionPolicy,
        observer: &mut (dyn for<'m> FnMut(&'m Message) + Send),
    ) -> Result<Vec<Message>, TransportError>;

    /// Send `request` and collect its response batch
    async fn send(
        &self,
        request: &Request,
        policy: CompletionPolicy,
    ) -> Result<Vec<Message>, TransportError> {
        self.send_observed(request, policy, &mut |_: &Message| {}).await
    }
}
