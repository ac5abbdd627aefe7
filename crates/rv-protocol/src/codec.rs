//! Tokio codecs for bencode values and protocol messages
//!
//! A bencode value carries no length header, so the decoder owns a resumable
//! [`Parser`] that consumes whatever is buffered and picks up where it left
//! off on the next read. A stream that ends inside a value is truncated.

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use crate::error::ProtocolError;
use crate::message::{Message, Request};
use crate::value::{Parser, Value};

/// Codec for raw bencode values
#[derive(Debug, Default)]
pub struct ValueCodec {
    parser: Parser,
}

impl ValueCodec {
    /// Create a new codec
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for ValueCodec {
    type Item = Value;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let value = self.parser.parse(src)?;
        match &value {
            Some(value) => tracing::trace!("Decoded {}", value.type_name()),
            None if self.parser.is_mid_value() => {
                tracing::trace!("Waiting for more input, {} bytes into value", self.parser.consumed())
            }
            None => {}
        }
        Ok(value)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(value) => Ok(Some(value)),
            None if src.is_empty() && !self.parser.is_mid_value() => Ok(None),
            None => Err(ProtocolError::TruncatedStream {
                offset: self.parser.consumed() + src.len(),
            }),
        }
    }
}

impl Encoder<Value> for ValueCodec {
    type Error = ProtocolError;

    fn encode(&mut self, value: Value, dst: &mut BytesMut) -> Result<(), Self::Error> {
        value.encode(dst);
        Ok(())
    }
}

/// Client-side codec: encodes requests, decodes response messages
#[derive(Debug, Default)]
pub struct MessageCodec {
    inner: ValueCodec,
}

impl MessageCodec {
    /// Create a new codec
    pub fn new() -> Self {
        Self {
            inner: ValueCodec::new(),
        }
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        self.inner.decode(src)?.map(Message::try_from).transpose()
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        self.inner.decode_eof(src)?.map(Message::try_from).transpose()
    }
}

impl Encoder<Request> for MessageCodec {
    type Error = ProtocolError;

    fn encode(&mut self, request: Request, dst: &mut BytesMut) -> Result<(), Self::Error> {
        request.to_value().encode(dst);
        Ok(())
    }
}

impl Encoder<&Request> for MessageCodec {
    type Error = ProtocolError;

    fn encode(&mut self, request: &Request, dst: &mut BytesMut) -> Result<(), Self::Error> {
        request.to_value().encode(dst);
        Ok(())
    }
}
