//! CoAP message codec (RFC 7252).
//!
//! # Wire format
//!
//! ```text
//! [1 byte: Ver(2) | Type(2) | Token length(4)]
//! [1 byte: Code (class.detail)]
//! [2 bytes BE: Message ID]
//! [0-8 bytes: Token]
//! [Options: delta/length nibbles, optional extended bytes, value]
//! [0xFF payload marker][payload]   (only if a payload is present)
//! ```
//!
//! Option deltas and lengths use the RFC 7252 §3.1 nibble encoding:
//! 0-12 inline, 13 = one extra byte (+13), 14 = two extra bytes (+269).

use std::fmt;

use serde::Serialize;

/// Protocol version carried in every header.
pub const VERSION: u8 = 1;

/// Longest token a message may carry.
pub const MAX_TOKEN_LEN: usize = 8;

const PAYLOAD_MARKER: u8 = 0xFF;

/// Option numbers used by the gateway client.
pub mod option {
    pub const OBSERVE: u16 = 6;
    pub const URI_PATH: u16 = 11;
    pub const CONTENT_FORMAT: u16 = 12;
    pub const URI_QUERY: u16 = 15;
}

/// `Observe` option value that registers an observation.
pub const OBSERVE_REGISTER: u32 = 0;

/// `Observe` option value that cancels an observation.
pub const OBSERVE_DEREGISTER: u32 = 1;

/// Errors from decoding a datagram.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CoapError {
    #[error("message truncated at {0} bytes")]
    Truncated(usize),

    #[error("unsupported CoAP version {0}")]
    Version(u8),

    #[error("invalid token length {0}")]
    TokenLength(u8),

    #[error("malformed option at byte {0}")]
    Option(usize),

    #[error("payload marker without payload")]
    EmptyPayload,
}

/// Message type (the `T` header field).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Confirmable,
    NonConfirmable,
    Acknowledgement,
    Reset,
}

impl MessageKind {
    fn bits(self) -> u8 {
        match self {
            MessageKind::Confirmable => 0,
            MessageKind::NonConfirmable => 1,
            MessageKind::Acknowledgement => 2,
            MessageKind::Reset => 3,
        }
    }

    fn from_bits(bits: u8) -> Self {
        match bits & 0x03 {
            0 => MessageKind::Confirmable,
            1 => MessageKind::NonConfirmable,
            2 => MessageKind::Acknowledgement,
            _ => MessageKind::Reset,
        }
    }
}

/// Request method or response code, packed as `class << 5 | detail`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Code(pub u8);

impl Code {
    pub const EMPTY: Code = Code(0x00);
    pub const GET: Code = Code(0x01);
    pub const POST: Code = Code(0x02);
    pub const PUT: Code = Code(0x03);
    pub const DELETE: Code = Code(0x04);

    pub const CREATED: Code = Code::new(2, 1);
    pub const DELETED: Code = Code::new(2, 2);
    pub const VALID: Code = Code::new(2, 3);
    pub const CHANGED: Code = Code::new(2, 4);
    pub const CONTENT: Code = Code::new(2, 5);

    pub const BAD_REQUEST: Code = Code::new(4, 0);
    pub const UNAUTHORIZED: Code = Code::new(4, 1);
    pub const NOT_FOUND: Code = Code::new(4, 4);
    pub const METHOD_NOT_ALLOWED: Code = Code::new(4, 5);
    pub const INTERNAL_SERVER_ERROR: Code = Code::new(5, 0);
    pub const SERVICE_UNAVAILABLE: Code = Code::new(5, 3);

    pub const fn new(class: u8, detail: u8) -> Self {
        Code((class << 5) | (detail & 0x1f))
    }

    pub const fn class(self) -> u8 {
        self.0 >> 5
    }

    pub const fn detail(self) -> u8 {
        self.0 & 0x1f
    }

    pub fn is_empty(self) -> bool {
        self == Code::EMPTY
    }

    pub fn is_request(self) -> bool {
        self.class() == 0 && !self.is_empty()
    }

    pub fn is_success(self) -> bool {
        self.class() == 2
    }

    /// True for client (4.xx) and server (5.xx) errors.
    pub fn is_error(self) -> bool {
        matches!(self.class(), 4 | 5)
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}", self.class(), self.detail())
    }
}

/// A single option instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoapOption {
    pub number: u16,
    pub value: Vec<u8>,
}

/// A decoded or outgoing CoAP message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub kind: MessageKind,
    pub code: Code,
    pub message_id: u16,
    pub token: Vec<u8>,
    /// Sorted by option number; repeated options keep insertion order.
    options: Vec<CoapOption>,
    pub payload: Vec<u8>,
}

impl Packet {
    /// Creates a confirmable request for the given path segments.
    ///
    /// Message ID and token are left empty; the session assigns them.
    pub fn request<S: AsRef<str>>(code: Code, path: &[S]) -> Self {
        let mut packet = Self {
            kind: MessageKind::Confirmable,
            code,
            message_id: 0,
            token: Vec::new(),
            options: Vec::new(),
            payload: Vec::new(),
        };
        for segment in path {
            packet.add_option(option::URI_PATH, segment.as_ref().as_bytes().to_vec());
        }
        packet
    }

    /// Creates an empty acknowledgement for a confirmable message.
    pub fn empty_ack(message_id: u16) -> Self {
        Self::empty(MessageKind::Acknowledgement, message_id)
    }

    /// Creates a reset for a message we cannot or will not process.
    pub fn reset(message_id: u16) -> Self {
        Self::empty(MessageKind::Reset, message_id)
    }

    fn empty(kind: MessageKind, message_id: u16) -> Self {
        Self {
            kind,
            code: Code::EMPTY,
            message_id,
            token: Vec::new(),
            options: Vec::new(),
            payload: Vec::new(),
        }
    }

    /// Adds an option, keeping options ordered by number.
    pub fn add_option(&mut self, number: u16, value: Vec<u8>) {
        let at = self.options.partition_point(|o| o.number <= number);
        self.options.insert(at, CoapOption { number, value });
    }

    /// Removes every instance of an option.
    pub fn remove_option(&mut self, number: u16) {
        self.options.retain(|o| o.number != number);
    }

    /// Returns the values of an option in wire order.
    pub fn option_values(&self, number: u16) -> impl Iterator<Item = &[u8]> {
        self.options
            .iter()
            .filter(move |o| o.number == number)
            .map(|o| o.value.as_slice())
    }

    /// Returns the `Uri-Path` segments.
    pub fn uri_path(&self) -> Vec<String> {
        self.option_values(option::URI_PATH)
            .map(|v| String::from_utf8_lossy(v).into_owned())
            .collect()
    }

    /// Returns the `Observe` option value, if present.
    pub fn observe(&self) -> Option<u32> {
        self.option_values(option::OBSERVE).next().map(decode_uint)
    }

    /// Sets (replaces) the `Observe` option.
    pub fn set_observe(&mut self, value: u32) {
        self.remove_option(option::OBSERVE);
        self.add_option(option::OBSERVE, encode_uint(value));
    }

    /// Sets the payload to the JSON serialization of `value`.
    pub fn with_json<T: Serialize>(mut self, value: &T) -> Result<Self, serde_json::Error> {
        self.payload = serde_json::to_vec(value)?;
        Ok(self)
    }

    /// True for messages that carry neither request nor response.
    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    /// Serializes the packet to wire bytes.
    pub fn encode(&self) -> Vec<u8> {
        let token_len = self.token.len().min(MAX_TOKEN_LEN);
        let mut out = Vec::with_capacity(4 + token_len + self.payload.len() + 16);
        out.push((VERSION << 6) | (self.kind.bits() << 4) | token_len as u8);
        out.push(self.code.0);
        out.extend_from_slice(&self.message_id.to_be_bytes());
        out.extend_from_slice(&self.token[..token_len]);

        let mut last = 0u16;
        for opt in &self.options {
            let (delta_nibble, delta_ext) = split_extended(usize::from(opt.number - last));
            let (len_nibble, len_ext) = split_extended(opt.value.len());
            out.push((delta_nibble << 4) | len_nibble);
            out.extend_from_slice(&delta_ext);
            out.extend_from_slice(&len_ext);
            out.extend_from_slice(&opt.value);
            last = opt.number;
        }

        if !self.payload.is_empty() {
            out.push(PAYLOAD_MARKER);
            out.extend_from_slice(&self.payload);
        }
        out
    }

    /// Parses wire bytes into a packet.
    pub fn decode(buf: &[u8]) -> Result<Self, CoapError> {
        if buf.len() < 4 {
            return Err(CoapError::Truncated(buf.len()));
        }
        let version = buf[0] >> 6;
        if version != VERSION {
            return Err(CoapError::Version(version));
        }
        let kind = MessageKind::from_bits(buf[0] >> 4);
        let token_len = buf[0] & 0x0f;
        if usize::from(token_len) > MAX_TOKEN_LEN {
            return Err(CoapError::TokenLength(token_len));
        }
        let code = Code(buf[1]);
        let message_id = u16::from_be_bytes([buf[2], buf[3]]);

        let mut pos = 4 + usize::from(token_len);
        if buf.len() < pos {
            return Err(CoapError::Truncated(buf.len()));
        }
        let token = buf[4..pos].to_vec();

        let mut options = Vec::new();
        let mut payload = Vec::new();
        let mut number: u16 = 0;
        while pos < buf.len() {
            let header = buf[pos];
            let header_at = pos;
            pos += 1;
            if header == PAYLOAD_MARKER {
                if pos == buf.len() {
                    return Err(CoapError::EmptyPayload);
                }
                payload = buf[pos..].to_vec();
                break;
            }
            let delta = read_extended(header >> 4, buf, &mut pos, header_at)?;
            let length = read_extended(header & 0x0f, buf, &mut pos, header_at)?;
            number = u16::try_from(delta)
                .ok()
                .and_then(|d| number.checked_add(d))
                .ok_or(CoapError::Option(header_at))?;
            let end = pos + length;
            if end > buf.len() {
                return Err(CoapError::Truncated(buf.len()));
            }
            options.push(CoapOption {
                number,
                value: buf[pos..end].to_vec(),
            });
            pos = end;
        }

        Ok(Self {
            kind,
            code,
            message_id,
            token,
            options,
            payload,
        })
    }
}

/// Splits a delta or length into its nibble and extended bytes.
fn split_extended(value: usize) -> (u8, Vec<u8>) {
    if value < 13 {
        (value as u8, Vec::new())
    } else if value < 269 {
        (13, vec![(value - 13) as u8])
    } else {
        let ext = (value - 269).min(usize::from(u16::MAX)) as u16;
        (14, ext.to_be_bytes().to_vec())
    }
}

fn read_extended(
    nibble: u8,
    buf: &[u8],
    pos: &mut usize,
    header_at: usize,
) -> Result<usize, CoapError> {
    match nibble {
        0..=12 => Ok(usize::from(nibble)),
        13 => {
            let byte = *buf.get(*pos).ok_or(CoapError::Truncated(buf.len()))?;
            *pos += 1;
            Ok(usize::from(byte) + 13)
        }
        14 => {
            let bytes = buf
                .get(*pos..*pos + 2)
                .ok_or(CoapError::Truncated(buf.len()))?;
            *pos += 2;
            Ok(usize::from(u16::from_be_bytes([bytes[0], bytes[1]])) + 269)
        }
        _ => Err(CoapError::Option(header_at)),
    }
}

/// Encodes an option uint with the minimal number of bytes (0 is empty).
pub fn encode_uint(value: u32) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let skip = bytes.iter().take_while(|b| **b == 0).count();
    bytes[skip..].to_vec()
}

/// Decodes an option uint of up to four bytes.
pub fn decode_uint(bytes: &[u8]) -> u32 {
    let start = bytes.len().saturating_sub(4);
    bytes[start..]
        .iter()
        .fold(0u32, |acc, b| (acc << 8) | u32::from(*b))
}
