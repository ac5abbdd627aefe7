//! Bencode values and the streaming parser
//!
//! Four self-describing variants travel on the wire:
//! - byte-string: `<length>:<raw bytes>`
//! - integer: `i<decimal digits>e`
//! - list: `l<elements>e`
//! - map: `d<key value pairs>e`, keys are byte-strings in lexicographic order
//!
//! The parser keeps its container stack on the heap instead of recursing, so
//! arbitrarily nested responses cannot exhaust the call stack, and keeps it
//! between reads so a large response is scanned exactly once.

use std::collections::BTreeMap;
use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::ProtocolError;

/// Largest byte-string the parser will accept (64 MiB)
pub const MAX_STRING_LEN: usize = 64 * 1024 * 1024;

/// A decoded bencode value
#[derive(Clone, PartialEq, Eq)]
pub enum Value {
    /// Raw byte-string (usually UTF-8 text)
    Bytes(Bytes),
    /// Signed integer
    Int(i64),
    /// Ordered list of values
    List(Vec<Value>),
    /// Map with byte-string keys, kept in canonical order
    Dict(BTreeMap<Bytes, Value>),
}

impl Value {
    /// Human-readable variant name, used in error messages
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Bytes(_) => "byte-string",
            Value::Int(_) => "integer",
            Value::List(_) => "list",
            Value::Dict(_) => "map",
        }
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Byte-string contents as UTF-8, if valid
    pub fn as_str(&self) -> Option<&str> {
        self.as_bytes().and_then(|b| std::str::from_utf8(b).ok())
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&BTreeMap<Bytes, Value>> {
        match self {
            Value::Dict(entries) => Some(entries),
            _ => None,
        }
    }

    /// Encode this value, appending to `dst`
    pub fn encode(&self, dst: &mut BytesMut) {
        match self {
            Value::Bytes(b) => encode_bytes(b, dst),
            Value::Int(i) => {
                dst.put_u8(b'i');
                dst.extend_from_slice(i.to_string().as_bytes());
                dst.put_u8(b'e');
            }
            Value::List(items) => {
                dst.put_u8(b'l');
                for item in items {
                    item.encode(dst);
                }
                dst.put_u8(b'e');
            }
            Value::Dict(entries) => {
                dst.put_u8(b'd');
                // BTreeMap iteration is already lexicographic by key bytes
                for (key, value) in entries {
                    encode_bytes(key, dst);
                    value.encode(dst);
                }
                dst.put_u8(b'e');
            }
        }
    }

    /// Encode into a fresh buffer
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode(&mut buf);
        buf.freeze()
    }
}

fn encode_bytes(b: &[u8], dst: &mut BytesMut) {
    dst.reserve(b.len() + 12);
    dst.extend_from_slice(b.len().to_string().as_bytes());
    dst.put_u8(b':');
    dst.extend_from_slice(b);
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bytes(b) => match std::str::from_utf8(b) {
                Ok(s) => write!(f, "{:?}", s),
                Err(_) => write!(f, "<{} bytes>", b.len()),
            },
            Value::Int(i) => write!(f, "{}", i),
            Value::List(items) => f.debug_list().entries(items).finish(),
            Value::Dict(entries) => f
                .debug_map()
                .entries(
                    entries
                        .iter()
                        .map(|(k, v)| (String::from_utf8_lossy(k).into_owned(), v)),
                )
                .finish(),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Bytes(Bytes::copy_from_slice(s.as_bytes()))
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Bytes(Bytes::from(s))
    }
}

impl From<Bytes> for Value {
    fn from(b: Bytes) -> Self {
        Value::Bytes(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::List(items)
    }
}

impl From<BTreeMap<Bytes, Value>> for Value {
    fn from(entries: BTreeMap<Bytes, Value>) -> Self {
        Value::Dict(entries)
    }
}

/// Open container awaiting more elements
#[derive(Debug)]
enum Frame {
    List(Vec<Value>),
    Dict {
        entries: BTreeMap<Bytes, Value>,
        pending_key: Option<Bytes>,
    },
}

/// Token currently being read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Token {
    /// Next byte is a type discriminator or a container end
    Start,
    /// Inside `i...e`; the value is accumulated with its sign applied
    Integer {
        negative: bool,
        value: i64,
        digits: usize,
    },
    /// Reading the decimal length of a byte-string
    Length(usize),
    /// Length read; waiting for this many payload bytes
    Body(usize),
}

/// Resumable bencode parser
///
/// The parser consumes input as it goes and keeps its container stack and
/// partial token between calls, so a value split across many reads is
/// scanned once. The type discriminator is examined as the lookahead byte and
/// handed to the token it opens: for byte-strings it is the first digit of
/// the length.
///
/// # Example
///
/// ```
/// use bytes::BytesMut;
/// use rv_protocol::{Parser, Value};
///
/// let mut parser = Parser::new();
/// let mut buf = BytesMut::from(&b"l3:ou"[..]);
/// assert_eq!(parser.parse(&mut buf).unwrap(), None);
///
/// buf.extend_from_slice(b"ti1ee");
/// let value = parser.parse(&mut buf).unwrap();
/// assert_eq!(value, Some(Value::List(vec!["out".into(), Value::Int(1)])));
/// ```
#[derive(Debug)]
pub struct Parser {
    stack: Vec<Frame>,
    token: Token,
    /// Bytes of the current top-level value consumed so far
    consumed: usize,
    /// Offset within the current value where `token` began
    token_start: usize,
}

impl Default for Parser {
    fn default() -> Self {
        Self::new()
    }
}

impl Parser {
    pub fn new() -> Self {
        Self {
            stack: Vec::new(),
            token: Token::Start,
            consumed: 0,
            token_start: 0,
        }
    }

    /// Whether part of a value has been consumed without completing it
    pub fn is_mid_value(&self) -> bool {
        self.consumed > 0
    }

    /// Bytes of the unfinished value consumed so far
    pub fn consumed(&self) -> usize {
        self.consumed
    }

    /// Continue parsing with the bytes in `src`
    ///
    /// Consumed bytes are removed from `src`. Returns `Ok(None)` when `src`
    /// runs out before the value ends; call again once more bytes arrive.
    /// Bytes after a completed value are left in `src`.
    pub fn parse(&mut self, src: &mut BytesMut) -> Result<Option<Value>, ProtocolError> {
        loop {
            let value = match self.token {
                Token::Body(len) => {
                    if src.len() < len {
                        return Ok(None);
                    }
                    self.consumed += len;
                    self.token = Token::Start;
                    Value::Bytes(src.split_to(len).freeze())
                }
                _ => {
                    let Some(&byte) = src.first() else {
                        return Ok(None);
                    };
                    src.advance(1);
                    let at = self.consumed;
                    self.consumed += 1;

                    match self.step(byte, at)? {
                        Some(value) => value,
                        None => continue,
                    }
                }
            };

            if let Some(done) = self.attach(value)? {
                self.consumed = 0;
                return Ok(Some(done));
            }
        }
    }

    /// Feed one byte to the current token, returning a finished scalar or a
    /// closed container
    fn step(&mut self, byte: u8, at: usize) -> Result<Option<Value>, ProtocolError> {
        match self.token {
            Token::Start => {
                self.token_start = at;
                match byte {
                    b'i' => {
                        self.token = Token::Integer {
                            negative: false,
                            value: 0,
                            digits: 0,
                        };
                        Ok(None)
                    }
                    b'0'..=b'9' => {
                        self.token = Token::Length(usize::from(byte - b'0'));
                        Ok(None)
                    }
                    b'l' => {
                        self.stack.push(Frame::List(Vec::new()));
                        Ok(None)
                    }
                    b'd' => {
                        self.stack.push(Frame::Dict {
                            entries: BTreeMap::new(),
                            pending_key: None,
                        });
                        Ok(None)
                    }
                    b'e' => match self.stack.pop() {
                        Some(Frame::List(items)) => Ok(Some(Value::List(items))),
                        Some(Frame::Dict {
                            entries,
                            pending_key: None,
                        }) => Ok(Some(Value::Dict(entries))),
                        Some(Frame::Dict {
                            pending_key: Some(_),
                            ..
                        }) => Err(ProtocolError::malformed(at, "map key without a value")),
                        None => Err(ProtocolError::malformed(at, "unexpected end marker")),
                    },
                    _ => Err(ProtocolError::malformed(at, "unknown type discriminator")),
                }
            }

            Token::Integer {
                negative,
                value,
                digits,
            } => {
                let start = self.token_start;
                match byte {
                    b'-' if digits == 0 && !negative => {
                        self.token = Token::Integer {
                            negative: true,
                            value,
                            digits,
                        };
                        Ok(None)
                    }
                    b'e' if digits > 0 => {
                        self.token = Token::Start;
                        Ok(Some(Value::Int(value)))
                    }
                    b'0'..=b'9' => {
                        let digit = i64::from(byte - b'0');
                        // Negative values accumulate downward so i64::MIN fits
                        let next = value.checked_mul(10).and_then(|v| {
                            if negative {
                                v.checked_sub(digit)
                            } else {
                                v.checked_add(digit)
                            }
                        });
                        let value = next
                            .ok_or_else(|| ProtocolError::malformed(start, "integer out of range"))?;
                        self.token = Token::Integer {
                            negative,
                            value,
                            digits: digits + 1,
                        };
                        Ok(None)
                    }
                    _ => Err(ProtocolError::malformed(start, "invalid integer")),
                }
            }

            Token::Length(len) => match byte {
                b':' if len == 0 => {
                    self.token = Token::Start;
                    Ok(Some(Value::Bytes(Bytes::new())))
                }
                b':' => {
                    self.token = Token::Body(len);
                    Ok(None)
                }
                b'0'..=b'9' => {
                    let len = len
                        .checked_mul(10)
                        .and_then(|l| l.checked_add(usize::from(byte - b'0')))
                        .unwrap_or(usize::MAX);
                    if len > MAX_STRING_LEN {
                        return Err(ProtocolError::PayloadTooLarge {
                            size: len,
                            max: MAX_STRING_LEN,
                        });
                    }
                    self.token = Token::Length(len);
                    Ok(None)
                }
                _ => Err(ProtocolError::malformed(
                    self.token_start,
                    "invalid byte-string length",
                )),
            },

            Token::Body(_) => unreachable!("payload bytes are taken in bulk"),
        }
    }

    /// Add a finished value to the innermost open container
    ///
    /// Returns the value itself when no container is open.
    fn attach(&mut self, value: Value) -> Result<Option<Value>, ProtocolError> {
        match self.stack.last_mut() {
            None => Ok(Some(value)),
            Some(Frame::List(items)) => {
                items.push(value);
                Ok(None)
            }
            Some(Frame::Dict {
                entries,
                pending_key,
            }) => {
                match pending_key.take() {
                    Some(key) => {
                        entries.insert(key, value);
                    }
                    None => match value {
                        Value::Bytes(key) => *pending_key = Some(key),
                        _ => {
                            return Err(ProtocolError::malformed(
                                self.token_start,
                                "map key must be a byte-string",
                            ))
                        }
                    },
                }
                Ok(None)
            }
        }
    }
}

/// Decode exactly one value from a complete buffer
///
/// Trailing bytes after the first value are ignored; use [`Parser`] directly
/// to keep them.
pub fn decode(input: &[u8]) -> Result<Value, ProtocolError> {
    let mut buf = BytesMut::from(input);
    let mut parser = Parser::new();
    match parser.parse(&mut buf)? {
        Some(value) => Ok(value),
        None => Err(ProtocolError::TruncatedStream {
            offset: parser.consumed(),
        }),
    }
}
