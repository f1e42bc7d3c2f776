//! Binary wire codec for framed notebook messages.
//!
//! A message on the duplex channel is a single binary blob holding one
//! tagged [`Value`]. The codec knows nothing about actions or topics; it
//! round-trips the supported shapes (null, bool, integer, float, string,
//! byte array, sequence, map) and nothing else. Schema validation lives in
//! the transport.

use std::{collections::BTreeMap, io::Cursor, string::FromUtf8Error};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use derive_more::From;

pub type ParseResult<T, E = ParseError> = Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("Not enough data is available to parse a message")]
    Incomplete,

    #[error("Unknown value tag: {0:#04x}")]
    UnknownTag(u8),

    #[error("Unexpected variant: {0}")]
    UnexpectedVariant(String),

    #[error("Trailing bytes after a complete value")]
    TrailingBytes,

    #[error("protocol error; invalid frame format.")]
    Protocol(#[from] FromUtf8Error),
}

// One byte of type tag, then a fixed- or length-prefixed payload. Lengths
// and numbers are big-endian.
const TAG_NULL: u8 = 0x00;
const TAG_BOOL: u8 = 0x01;
const TAG_INT: u8 = 0x02;
const TAG_FLOAT: u8 = 0x03;
const TAG_STR: u8 = 0x04;
const TAG_BYTES: u8 = 0x05;
const TAG_ARRAY: u8 = 0x06;
const TAG_MAP: u8 = 0x07;

/// A dynamically typed payload value.
#[derive(Debug, Clone, PartialEq, From)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Bytes),
    Array(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl From<&str> for Value {
    fn from(s: &str) -> Self { Value::Str(s.to_owned()) }
}

impl Value {
    /// Builds a map value from `(key, value)` pairs.
    pub fn map<'a>(entries: impl IntoIterator<Item = (&'a str, Value)>) -> Value {
        Value::Map(
            entries
                .into_iter()
                .map(|(k, v)| (k.to_owned(), v))
                .collect(),
        )
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Map(map) => map.get(key),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub const fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub const fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub const fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    pub const fn is_null(&self) -> bool { matches!(self, Value::Null) }

    /// Byte content regardless of whether the server sent a string or a
    /// byte array. Terminal output and download chunks arrive as either.
    pub fn to_chunk(&self) -> Option<Bytes> {
        match self {
            Value::Bytes(b) => Some(b.clone()),
            Value::Str(s) => Some(Bytes::from(s.clone().into_bytes())),
            _ => None,
        }
    }

    /// Encode the value into a standalone binary blob.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(64);
        self.write(&mut buf);
        buf.freeze()
    }

    fn write(&self, buf: &mut BytesMut) {
        match self {
            Value::Null => buf.put_u8(TAG_NULL),
            Value::Bool(b) => {
                buf.put_u8(TAG_BOOL);
                buf.put_u8(u8::from(*b));
            },
            Value::Int(i) => {
                buf.put_u8(TAG_INT);
                buf.put_i64(*i);
            },
            Value::Float(f) => {
                buf.put_u8(TAG_FLOAT);
                buf.put_f64(*f);
            },
            Value::Str(s) => {
                buf.put_u8(TAG_STR);
                write_len_prefixed(buf, s.as_bytes());
            },
            Value::Bytes(b) => {
                buf.put_u8(TAG_BYTES);
                write_len_prefixed(buf, b);
            },
            Value::Array(items) => {
                buf.put_u8(TAG_ARRAY);
                buf.put_u32(items.len() as u32);
                for item in items {
                    item.write(buf);
                }
            },
            Value::Map(map) => {
                buf.put_u8(TAG_MAP);
                buf.put_u32(map.len() as u32);
                for (key, value) in map {
                    write_len_prefixed(buf, key.as_bytes());
                    value.write(buf);
                }
            },
        }
    }

    /// Decode a standalone binary blob into a value.
    ///
    /// A truncated buffer yields [`ParseError::Incomplete`]; bytes left over
    /// after one complete value are an error, since every channel message
    /// carries exactly one.
    pub fn decode(src: &[u8]) -> ParseResult<Value> {
        let mut buf = Cursor::new(src);
        let value = Value::parse(&mut buf)?;
        if buf.has_remaining() {
            return Err(ParseError::TrailingBytes);
        }
        Ok(value)
    }

    fn parse(buf: &mut Cursor<&[u8]>) -> ParseResult<Value> {
        match get_u8(buf)? {
            TAG_NULL => Ok(Value::Null),
            TAG_BOOL => match get_u8(buf)? {
                0 => Ok(Value::Bool(false)),
                1 => Ok(Value::Bool(true)),
                other => Err(ParseError::UnexpectedVariant(format!("bool {other}"))),
            },
            TAG_INT => {
                if buf.remaining() < 8 {
                    return Err(ParseError::Incomplete);
                }
                Ok(Value::Int(buf.get_i64()))
            },
            TAG_FLOAT => {
                if buf.remaining() < 8 {
                    return Err(ParseError::Incomplete);
                }
                Ok(Value::Float(buf.get_f64()))
            },
            TAG_STR => Ok(Value::Str(get_string(buf)?)),
            TAG_BYTES => {
                let raw = get_len_prefixed(buf)?;
                Ok(Value::Bytes(Bytes::copy_from_slice(raw)))
            },
            TAG_ARRAY => {
                let len = get_u32(buf)? as usize;
                let mut items = Vec::with_capacity(len.min(1024));
                for _ in 0..len {
                    items.push(Value::parse(buf)?);
                }
                Ok(Value::Array(items))
            },
            TAG_MAP => {
                let len = get_u32(buf)? as usize;
                let mut map = BTreeMap::new();
                for _ in 0..len {
                    let key = get_string(buf)?;
                    map.insert(key, Value::parse(buf)?);
                }
                Ok(Value::Map(map))
            },
            other => Err(ParseError::UnknownTag(other)),
        }
    }
}

fn write_len_prefixed(buf: &mut BytesMut, raw: &[u8]) {
    buf.put_u32(raw.len() as u32);
    buf.put_slice(raw);
}

fn get_u8(buf: &mut Cursor<&[u8]>) -> ParseResult<u8> {
    if !buf.has_remaining() {
        return Err(ParseError::Incomplete);
    }
    Ok(buf.get_u8())
}

fn get_u32(buf: &mut Cursor<&[u8]>) -> ParseResult<u32> {
    if buf.remaining() < 4 {
        return Err(ParseError::Incomplete);
    }
    Ok(buf.get_u32())
}

fn get_len_prefixed<'a>(buf: &mut Cursor<&'a [u8]>) -> ParseResult<&'a [u8]> {
    let len = get_u32(buf)? as usize;
    let start = buf.position() as usize;
    let src = *buf.get_ref();
    if src.len() - start < len {
        return Err(ParseError::Incomplete);
    }
    buf.set_position((start + len) as u64);
    Ok(&src[start..start + len])
}

fn get_string(buf: &mut Cursor<&[u8]>) -> ParseResult<String> {
    let raw = get_len_prefixed(buf)?;
    Ok(String::from_utf8(raw.to_vec())?)
}

/// The four frame shapes the channel carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display, strum_macros::EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum FrameKind {
    Request,
    Response,
    Error,
    Event,
}

/// One wire unit: a tagged record encoded as a [`Value::Map`].
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub kind:           FrameKind,
    /// Named server-side operation. Requests only.
    pub action:         Option<String>,
    /// Topic the server will answer on.
    pub response_event: Option<String>,
    /// Topic the server will report failure on.
    pub error_event:    Option<String>,
    /// Server push topic. Events only.
    pub event:          Option<String>,
    /// Optional topic alias the event should be dispatched under.
    pub alias:          Option<String>,
    pub data:           Value,
}

impl Frame {
    /// A client request expecting a reply on the derived topics.
    pub fn request(
        action: impl Into<String>,
        response_event: impl Into<String>,
        error_event: impl Into<String>,
        data: Value,
    ) -> Frame {
        Frame {
            kind:           FrameKind::Request,
            action:         Some(action.into()),
            response_event: Some(response_event.into()),
            error_event:    Some(error_event.into()),
            event:          None,
            alias:          None,
            data,
        }
    }

    /// A server push on `event`. Used by tests standing in for the server.
    pub fn event(event: impl Into<String>, data: Value) -> Frame {
        Frame {
            kind:           FrameKind::Event,
            action:         None,
            response_event: None,
            error_event:    None,
            event:          Some(event.into()),
            alias:          None,
            data,
        }
    }

    /// A server response addressed to `response_event`.
    pub fn response(response_event: impl Into<String>, data: Value) -> Frame {
        Frame {
            kind:           FrameKind::Response,
            action:         None,
            response_event: Some(response_event.into()),
            error_event:    None,
            event:          None,
            alias:          None,
            data,
        }
    }

    /// A server error addressed to `error_event`.
    pub fn error(error_event: impl Into<String>, data: Value) -> Frame {
        Frame {
            kind:           FrameKind::Error,
            action:         None,
            response_event: None,
            error_event:    Some(error_event.into()),
            event:          None,
            alias:          None,
            data,
        }
    }

    pub fn to_value(&self) -> Value {
        let mut map = BTreeMap::new();
        map.insert("kind".to_owned(), Value::Str(self.kind.to_string()));
        if let Some(action) = &self.action {
            map.insert("action".to_owned(), Value::Str(action.clone()));
        }
        if let Some(topic) = &self.response_event {
            map.insert("responseEvent".to_owned(), Value::Str(topic.clone()));
        }
        if let Some(topic) = &self.error_event {
            map.insert("errorEvent".to_owned(), Value::Str(topic.clone()));
        }
        if let Some(event) = &self.event {
            map.insert("event".to_owned(), Value::Str(event.clone()));
        }
        if let Some(alias) = &self.alias {
            map.insert("as".to_owned(), Value::Str(alias.clone()));
        }
        map.insert("data".to_owned(), self.data.clone());
        Value::Map(map)
    }

    pub fn from_value(value: &Value) -> ParseResult<Frame> {
        let kind = value
            .get("kind")
            .and_then(Value::as_str)
            .ok_or_else(|| ParseError::UnexpectedVariant("missing frame kind".to_owned()))?;
        let kind = kind
            .parse::<FrameKind>()
            .map_err(|_| ParseError::UnexpectedVariant(format!("frame kind {kind}")))?;
        let field = |name: &str| {
            value
                .get(name)
                .and_then(Value::as_str)
                .map(str::to_owned)
        };
        Ok(Frame {
            kind,
            action: field("action"),
            response_event: field("responseEvent"),
            error_event: field("errorEvent"),
            event: field("event"),
            alias: field("as"),
            data: value.get("data").cloned().unwrap_or(Value::Null),
        })
    }

    pub fn encode(&self) -> Bytes { self.to_value().encode() }

    pub fn decode(src: &[u8]) -> ParseResult<Frame> {
        Frame::from_value(&Value::decode(src)?)
    }
}
