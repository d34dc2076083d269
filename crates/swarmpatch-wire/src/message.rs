//! Message framing and the strict codec
//!
//! A framed message is a 20-byte header (type, body length, magic cookie,
//! 96-bit transaction id) followed by padded TLV attributes. The codec is
//! strict: a message decodes only if its length is exact, its fingerprint and
//! integrity trailers verify, its Username attribute is present, and it
//! carries no unknown comprehension-required attribute.

use crate::attr::{types, Attribute, Software};
use crate::error::{Result, WireError};
use crate::integrity;
use crate::{DEFAULT_SOFTWARE, MAGIC_COOKIE};
use bytes::Bytes;
use std::fmt;

/// 96-bit transaction identifier correlating a request with its response.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransactionId(pub [u8; 12]);

impl TransactionId {
    pub fn random() -> Self {
        TransactionId(rand::random())
    }
}

impl fmt::Debug for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TransactionId({})", hex::encode(self.0))
    }
}

/// Protocol methods in use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    /// Register with the server and keep the NAT binding alive.
    Binding,
    /// Request the current session table.
    Refresh,
    /// Relay an opaque payload to another peer.
    Data,
    /// Overlay channel hint, acknowledged but otherwise unused.
    ChannelBind,
}

impl Method {
    fn to_u12(self) -> u16 {
        match self {
            Method::Binding => 0x001,
            Method::Refresh => 0x004,
            Method::Data => 0x007,
            Method::ChannelBind => 0x009,
        }
    }

    fn from_u12(raw: u16) -> Option<Self> {
        match raw {
            0x001 => Some(Method::Binding),
            0x004 => Some(Method::Refresh),
            0x007 => Some(Method::Data),
            0x009 => Some(Method::ChannelBind),
            _ => None,
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Method::Binding => "binding",
            Method::Refresh => "refresh",
            Method::Data => "data",
            Method::ChannelBind => "channel-bind",
        };
        f.write_str(name)
    }
}

/// Message classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Class {
    Request,
    Indication,
    SuccessResponse,
    ErrorResponse,
}

impl Class {
    fn to_u2(self) -> u16 {
        match self {
            Class::Request => 0b00,
            Class::Indication => 0b01,
            Class::SuccessResponse => 0b10,
            Class::ErrorResponse => 0b11,
        }
    }

    fn from_u2(raw: u16) -> Self {
        match raw & 0b11 {
            0b00 => Class::Request,
            0b01 => Class::Indication,
            0b10 => Class::SuccessResponse,
            _ => Class::ErrorResponse,
        }
    }
}

/// A (method, class) pair, encoded with the class bits interleaved into the
/// method per RFC 5389 §6.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageType {
    pub method: Method,
    pub class: Class,
}

impl MessageType {
    pub const fn new(method: Method, class: Class) -> Self {
        MessageType { method, class }
    }

    pub fn to_u16(self) -> u16 {
        let m = self.method.to_u12();
        let c = self.class.to_u2();
        ((m & 0x0f80) << 2) | ((c & 0b10) << 7) | ((m & 0x0070) << 1) | ((c & 0b01) << 4) | (m & 0x000f)
    }

    pub fn from_u16(raw: u16) -> Result<Self> {
        let m = ((raw >> 2) & 0x0f80) | ((raw >> 1) & 0x0070) | (raw & 0x000f);
        let c = ((raw >> 7) & 0b10) | ((raw >> 4) & 0b01);
        let method = Method::from_u12(m)
            .ok_or_else(|| WireError::Malformed(format!("unknown method {m:#05x}")))?;
        Ok(MessageType {
            method,
            class: Class::from_u2(c),
        })
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {:?}", self.method, self.class)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct RawAttr {
    attr_type: u16,
    value: Vec<u8>,
}

/// A decoded (or under-construction) protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    kind: MessageType,
    transaction_id: TransactionId,
    attrs: Vec<RawAttr>,
}

impl Message {
    /// New message with a fresh random transaction id.
    pub fn new(kind: MessageType) -> Self {
        Message {
            kind,
            transaction_id: TransactionId::random(),
            attrs: Vec::new(),
        }
    }

    /// New message reusing the transaction id of the request it answers.
    pub fn response_to(kind: MessageType, transaction_id: TransactionId) -> Self {
        Message {
            kind,
            transaction_id,
            attrs: Vec::new(),
        }
    }

    pub fn kind(&self) -> MessageType {
        self.kind
    }

    pub fn transaction_id(&self) -> TransactionId {
        self.transaction_id
    }

    pub fn is(&self, method: Method, class: Class) -> bool {
        self.kind.method == method && self.kind.class == class
    }

    /// Append a typed attribute.
    pub fn add<A: Attribute>(&mut self, attr: &A) -> Result<()> {
        let value = attr.encode_value(&self.transaction_id)?;
        self.attrs.push(RawAttr {
            attr_type: A::TYPE,
            value,
        });
        Ok(())
    }

    /// Builder-style [`add`](Self::add).
    pub fn with<A: Attribute>(mut self, attr: &A) -> Result<Self> {
        self.add(attr)?;
        Ok(self)
    }

    pub fn has(&self, attr_type: u16) -> bool {
        self.attrs.iter().any(|a| a.attr_type == attr_type)
    }

    /// Decode the first attribute of the given type.
    pub fn get<A: Attribute>(&self) -> Result<A> {
        let raw = self
            .attrs
            .iter()
            .find(|a| a.attr_type == A::TYPE)
            .ok_or(WireError::AttributeNotFound(A::TYPE))?;
        A::decode_value(&self.transaction_id, &raw.value)
    }
}

fn is_known_attr(attr_type: u16) -> bool {
    matches!(
        attr_type,
        types::USERNAME
            | types::MESSAGE_INTEGRITY
            | types::ERROR_CODE
            | types::DATA
            | types::EVEN_PORT
            | types::XOR_MAPPED_ADDRESS
            | types::SOFTWARE
            | types::FINGERPRINT
    )
}

fn comprehension_required(attr_type: u16) -> bool {
    attr_type < 0x8000
}

/// Strict encoder/decoder bound to the shared short-term password.
#[derive(Debug, Clone)]
pub struct Codec {
    password: String,
    software: Software,
    require_software: bool,
}

impl Codec {
    pub fn new(password: impl Into<String>) -> Self {
        Codec {
            password: password.into(),
            software: Software(DEFAULT_SOFTWARE.to_string()),
            require_software: false,
        }
    }

    pub fn with_software(mut self, name: impl Into<String>) -> Self {
        self.software = Software(name.into());
        self
    }

    /// Reject decoded messages whose Software attribute is absent or names
    /// another implementation. The server runs with this on; agents stay
    /// lenient towards their server.
    pub fn require_matching_software(mut self) -> Self {
        self.require_software = true;
        self
    }

    /// Frame a message: attributes, then Software (if the caller did not set
    /// one), then the integrity and fingerprint trailers.
    pub fn encode(&self, msg: &Message) -> Result<Bytes> {
        let mut buf = Vec::with_capacity(128);
        buf.extend_from_slice(&msg.kind.to_u16().to_be_bytes());
        buf.extend_from_slice(&0u16.to_be_bytes());
        buf.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
        buf.extend_from_slice(&msg.transaction_id.0);

        for attr in &msg.attrs {
            write_attr(&mut buf, attr.attr_type, &attr.value);
        }
        if !msg.has(types::SOFTWARE) {
            let value = self.software.encode_value(&msg.transaction_id)?;
            write_attr(&mut buf, types::SOFTWARE, &value);
        }

        integrity::append_integrity(&mut buf, &self.password);
        integrity::append_fingerprint(&mut buf);
        Ok(Bytes::from(buf))
    }

    /// Decode and validate a datagram.
    pub fn decode(&self, buf: &[u8]) -> Result<Message> {
        if buf.len() < 20 || buf[0] & 0b1100_0000 != 0 {
            return Err(WireError::NonProtocol);
        }
        let cookie = u32::from_be_bytes(buf[4..8].try_into().unwrap());
        if cookie != MAGIC_COOKIE {
            return Err(WireError::NonProtocol);
        }

        let kind = MessageType::from_u16(u16::from_be_bytes(buf[..2].try_into().unwrap()))?;
        let body_len = u16::from_be_bytes(buf[2..4].try_into().unwrap()) as usize;
        if body_len % 4 != 0 || 20 + body_len != buf.len() {
            return Err(WireError::Malformed(format!(
                "body length {} does not match datagram of {} bytes",
                body_len,
                buf.len()
            )));
        }
        let transaction_id = TransactionId(buf[8..20].try_into().unwrap());

        let mut attrs = Vec::new();
        let mut integrity_at: Option<(usize, Vec<u8>)> = None;
        let mut fingerprint_at: Option<(usize, u32)> = None;
        let mut cursor = 20;
        while cursor < buf.len() {
            if cursor + 4 > buf.len() {
                return Err(WireError::Malformed("truncated attribute header".into()));
            }
            let attr_type = u16::from_be_bytes(buf[cursor..cursor + 2].try_into().unwrap());
            let value_len =
                u16::from_be_bytes(buf[cursor + 2..cursor + 4].try_into().unwrap()) as usize;
            let value_end = cursor + 4 + value_len;
            if value_end > buf.len() {
                return Err(WireError::Malformed("truncated attribute value".into()));
            }
            let value = &buf[cursor + 4..value_end];

            if fingerprint_at.is_some() {
                // nothing may follow the fingerprint
                return Err(WireError::Malformed("attribute after fingerprint".into()));
            }
            match attr_type {
                types::MESSAGE_INTEGRITY => {
                    integrity_at = Some((cursor, value.to_vec()));
                }
                types::FINGERPRINT => {
                    if value_len != 4 {
                        return Err(WireError::Fingerprint);
                    }
                    fingerprint_at =
                        Some((cursor, u32::from_be_bytes(value.try_into().unwrap())));
                }
                _ if integrity_at.is_some() => {
                    // only the fingerprint may follow the integrity tag
                    return Err(WireError::Malformed(format!(
                        "attribute {attr_type:#06x} after message integrity"
                    )));
                }
                _ if !is_known_attr(attr_type) && comprehension_required(attr_type) => {
                    return Err(WireError::Malformed(format!(
                        "unknown comprehension-required attribute {attr_type:#06x}"
                    )));
                }
                _ if !is_known_attr(attr_type) => {
                    // comprehension-optional, skip
                }
                _ => {
                    attrs.push(RawAttr {
                        attr_type,
                        value: value.to_vec(),
                    });
                }
            }

            // attributes are padded to 4-byte boundaries
            cursor = value_end + (4 - value_len % 4) % 4;
        }

        let (fp_offset, fp_value) = fingerprint_at.ok_or(WireError::Fingerprint)?;
        if !integrity::verify_fingerprint(buf, fp_offset, fp_value) {
            return Err(WireError::Fingerprint);
        }
        let (mi_offset, tag) = integrity_at.ok_or(WireError::Integrity)?;
        if !integrity::verify_integrity(buf, mi_offset, &tag, &self.password) {
            return Err(WireError::Integrity);
        }

        let msg = Message {
            kind,
            transaction_id,
            attrs,
        };
        if !msg.has(types::USERNAME) {
            return Err(WireError::MissingUsername);
        }
        if self.require_software {
            match msg.get::<Software>() {
                Ok(advertised) if advertised == self.software => {}
                Ok(advertised) => return Err(WireError::Software(advertised.0)),
                Err(_) => return Err(WireError::Software("attribute missing".to_string())),
            }
        }
        Ok(msg)
    }
}

fn write_attr(buf: &mut Vec<u8>, attr_type: u16, value: &[u8]) {
    buf.extend_from_slice(&attr_type.to_be_bytes());
    buf.extend_from_slice(&(value.len() as u16).to_be_bytes());
    buf.extend_from_slice(value);
    let pad = (4 - value.len() % 4) % 4;
    buf.extend_from_slice(&[0u8; 3][..pad]);
}
