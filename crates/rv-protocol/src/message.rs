//! Request and response messages for the evaluation protocol
//!
//! Every message on the wire is a bencode map. Requests are flat maps of
//! byte-strings and always carry an `op`; responses may nest lists and
//! integers. Response keys this client does not understand are kept but
//! otherwise ignored.
//!
//! # Message Flow
//!
//! 1. `clone` returns a `new-session` token
//! 2. `eval` on that session streams `out` / `err` / `value` messages and
//!    finally a `status` list containing `done`
//! 3. An exception adds an `ex` field; `stacktrace` fetches the causes
//! 4. `interrupt` asks the server to stop the pending evaluation
//! 5. `close` releases the session

use std::collections::BTreeMap;
use std::fmt;

use bytes::Bytes;

use crate::error::ProtocolError;
use crate::session::SessionId;
use crate::value::Value;

/// Status value marking the last message of a response
pub const STATUS_DONE: &str = "done";

/// Operations this client sends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    /// Create a new session
    Clone,
    /// Evaluate code in a session
    Eval,
    /// Feed bytes to the session's input
    Stdin,
    /// Interrupt the pending evaluation
    Interrupt,
    /// Fetch the causes of the last exception
    Stacktrace,
    /// Release a session
    Close,
}

impl Op {
    pub fn as_str(&self) -> &'static str {
        match self {
            Op::Clone => "clone",
            Op::Eval => "eval",
            Op::Stdin => "stdin",
            Op::Interrupt => "interrupt",
            Op::Stacktrace => "stacktrace",
            Op::Close => "close",
        }
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outgoing request: a flat map of byte-strings that always includes `op`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    op: Op,
    fields: BTreeMap<&'static str, Bytes>,
}

impl Request {
    /// Create a bare request for an operation
    pub fn new(op: Op) -> Self {
        Self {
            op,
            fields: BTreeMap::new(),
        }
    }

    /// `clone` request
    pub fn clone_session() -> Self {
        Self::new(Op::Clone)
    }

    /// `eval` request for `code` in `session`
    pub fn eval(session: &SessionId, code: impl Into<String>) -> Self {
        Self::new(Op::Eval)
            .with_session(session)
            .with("code", code.into())
    }

    /// `stdin` request carrying raw input bytes
    pub fn stdin(session: &SessionId, data: impl Into<Bytes>) -> Self {
        Self::new(Op::Stdin)
            .with_session(session)
            .with("stdin", data)
    }

    /// `interrupt` request for the pending evaluation in `session`
    pub fn interrupt(session: &SessionId) -> Self {
        Self::new(Op::Interrupt).with_session(session)
    }

    /// `stacktrace` request for the last exception in `session`
    pub fn stacktrace(session: &SessionId) -> Self {
        Self::new(Op::Stacktrace).with_session(session)
    }

    /// `close` request
    pub fn close(session: &SessionId) -> Self {
        Self::new(Op::Close).with_session(session)
    }

    /// Set the `session` field
    pub fn with_session(self, session: &SessionId) -> Self {
        self.with("session", session.as_str().to_string())
    }

    /// Set an arbitrary byte-string field
    ///
    /// `op` cannot be overridden this way.
    pub fn with(mut self, key: &'static str, value: impl Into<Bytes>) -> Self {
        if key != "op" {
            self.fields.insert(key, value.into());
        }
        self
    }

    pub fn op(&self) -> Op {
        self.op
    }

    /// Look up a field as UTF-8 text
    pub fn get(&self, key: &str) -> Option<&str> {
        if key == "op" {
            return Some(self.op.as_str());
        }
        self.fields
            .get(key)
            .and_then(|b| std::str::from_utf8(b).ok())
    }

    /// Convert to a bencode map
    pub fn to_value(&self) -> Value {
        let mut entries: BTreeMap<Bytes, Value> = self
            .fields
            .iter()
            .map(|(k, v)| (Bytes::from_static(k.as_bytes()), Value::Bytes(v.clone())))
            .collect();
        entries.insert(Bytes::from_static(b"op"), Value::from(self.op.as_str()));
        Value::Dict(entries)
    }
}

impl From<&Request> for Value {
    fn from(request: &Request) -> Self {
        request.to_value()
    }
}

/// Incoming response message
#[derive(Clone, PartialEq, Eq)]
pub struct Message {
    fields: BTreeMap<Bytes, Value>,
}

impl Message {
    /// Raw field access
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.fields.get(key.as_bytes())
    }

    /// Field as UTF-8 text
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.field(key).and_then(Value::as_str)
    }

    /// Field as text, treating an empty string as absent
    fn non_empty(&self, key: &str) -> Option<&str> {
        self.get_str(key).filter(|s| !s.is_empty())
    }

    pub fn session(&self) -> Option<&str> {
        self.get_str("session")
    }

    /// Session token from a `clone` response
    pub fn new_session(&self) -> Option<SessionId> {
        self.non_empty("new-session").map(SessionId::from)
    }

    /// Standard output chunk
    pub fn out(&self) -> Option<&[u8]> {
        self.field("out").and_then(Value::as_bytes).map(|b| b.as_ref())
    }

    /// Standard error chunk
    pub fn err(&self) -> Option<&[u8]> {
        self.field("err").and_then(Value::as_bytes).map(|b| b.as_ref())
    }

    pub fn value(&self) -> Option<&str> {
        self.get_str("value")
    }

    /// Exception class name from an evaluation error
    pub fn ex(&self) -> Option<&str> {
        self.non_empty("ex")
    }

    pub fn root_ex(&self) -> Option<&str> {
        self.non_empty("root-ex")
    }

    /// Exception class in a stacktrace response
    pub fn class(&self) -> Option<&str> {
        self.non_empty("class")
    }

    /// Exception message in a stacktrace response
    pub fn message(&self) -> Option<&str> {
        self.get_str("message")
    }

    /// Entries of the `status` list
    pub fn status(&self) -> Vec<&str> {
        self.field("status")
            .and_then(Value::as_list)
            .map(|items| items.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default()
    }

    pub fn has_status(&self, status: &str) -> bool {
        self.status().iter().any(|s| *s == status)
    }

    /// Whether this message marks the end of its response
    pub fn is_done(&self) -> bool {
        self.has_status(STATUS_DONE)
    }

    /// Whether this message carries incremental output
    pub fn has_output(&self) -> bool {
        self.out().is_some() || self.err().is_some()
    }

    /// Whether this message reports a real evaluation exception
    ///
    /// The server reports its own socket shutting down with an `ex` as well;
    /// that one is not an error in the evaluated code. Only the `ex` text
    /// decides: output chunks are whatever the program printed.
    pub fn is_exception(&self) -> bool {
        self.ex().is_some_and(|ex| !is_connection_closing(ex))
    }

    pub fn to_value(&self) -> Value {
        Value::Dict(self.fields.clone())
    }
}

fn is_connection_closing(ex: &str) -> bool {
    let ex = ex.to_ascii_lowercase();
    ex.contains("socket closed") || ex.contains("connection closing")
}

impl TryFrom<Value> for Message {
    type Error = ProtocolError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Dict(fields) => Ok(Self { fields }),
            other => Err(ProtocolError::NotAMessage(other.type_name())),
        }
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Message")?;
        fmt::Debug::fmt(&self.to_value(), f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::decode;

    fn message(input: &[u8]) -> Message {
        Message::try_from(decode(input).unwrap()).unwrap()
    }

    #[test]
    fn test_eval_request_encoding() {
        let session = SessionId::new("abc");
        let request = Request::eval(&session, "(+ 1 2)").with("ns", "user");

        assert_eq!(
            request.to_value().to_bytes().as_ref(),
            b"d4:code7:(+ 1 2)2:ns4:user2:op4:eval7:session3:abce"
        );
    }

    #[test]
    fn test_op_cannot_be_overridden() {
        let request = Request::clone_session().with("op", "eval");
        assert_eq!(request.op(), Op::Clone);
        assert_eq!(request.get("op"), Some("clone"));
    }

    #[test]
    fn test_op_names() {
        for op in [
            Op::Clone,
            Op::Eval,
            Op::Stdin,
            Op::Interrupt,
            Op::Stacktrace,
            Op::Close,
        ] {
            let request = Request::new(op);
            assert_eq!(request.get("op"), Some(op.as_str()));
            assert_eq!(op.to_string(), op.as_str());
        }
    }

    #[test]
    fn test_clone_response() {
        let msg = message(b"d11:new-session4:s-427:session1:x6:statusl4:doneee");
        assert_eq!(msg.new_session(), Some(SessionId::new("s-42")));
        assert!(msg.is_done());
        assert!(!msg.has_output());
    }

    #[test]
    fn test_empty_new_session_is_absent() {
        let msg = message(b"d11:new-session0:e");
        assert_eq!(msg.new_session(), None);
    }

    #[test]
    fn test_output_and_unknown_keys() {
        let msg = message(b"d3:out6:hello\n7:unknownli1ee5:extra3:yese");
        assert_eq!(msg.out(), Some(&b"hello\n"[..]));
        assert!(msg.has_output());
        assert!(msg.status().is_empty());
    }

    #[test]
    fn test_exception_detection() {
        let msg = message(b"d2:ex19:java.lang.Exception6:statusl10:eval-erroree");
        assert!(msg.is_exception());
        assert!(msg.has_status("eval-error"));

        let closing = message(b"d2:ex39:java.net.SocketException: Socket closede");
        assert!(!closing.is_exception());

        let empty = message(b"d2:ex0:e");
        assert!(!empty.is_exception());
    }

    #[test]
    fn test_exception_with_closing_text_in_err_is_real() {
        let msg = message(
            b"d3:err30:warn: connection closing soon\n2:ex26:java.lang.RuntimeExceptione",
        );
        assert!(msg.is_exception());
    }

    #[test]
    fn test_non_map_is_not_a_message() {
        let result = Message::try_from(Value::Int(3));
        assert!(matches!(result, Err(ProtocolError::NotAMessage("integer"))));
    }
}
