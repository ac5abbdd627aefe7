//! rv-protocol: Wire protocol for reval evaluation sessions
//!
//! This crate defines the bencode encoding used between the reval client and
//! an nREPL-style evaluation server, plus the request and response message
//! shapes built on top of it.

pub mod error;
pub mod value;
pub mod message;
pub mod codec;
pub mod session;

pub use error::ProtocolError;
pub use value::{decode, Parser, Value, MAX_STRING_LEN};
pub use message::{Message, Op, Request};
pub use codec::{MessageCodec, ValueCodec};
pub use session::SessionId;
