//! Typed message attributes
//!
//! Each attribute knows its TLV type code and how to encode/decode its value
//! bytes. XOR-MAPPED-ADDRESS additionally needs the transaction id of the
//! enclosing message, so both directions receive it.

use crate::error::{Result, WireError};
use crate::message::TransactionId;
use crate::{MAGIC_COOKIE, MAX_DATA_LEN};
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;

/// TLV type codes for the attributes in use
pub mod types {
    pub const USERNAME: u16 = 0x0006;
    pub const MESSAGE_INTEGRITY: u16 = 0x0008;
    pub const ERROR_CODE: u16 = 0x0009;
    pub const DATA: u16 = 0x0013;
    pub const EVEN_PORT: u16 = 0x0018;
    pub const XOR_MAPPED_ADDRESS: u16 = 0x0020;
    pub const SOFTWARE: u16 = 0x8022;
    pub const FINGERPRINT: u16 = 0x8028;
}

/// A typed attribute that can be written to and read from a message
pub trait Attribute: Sized {
    /// TLV type code
    const TYPE: u16;

    /// Human name used in error reporting
    const NAME: &'static str;

    /// Encode the attribute value (without the TLV header)
    fn encode_value(&self, transaction_id: &TransactionId) -> Result<Vec<u8>>;

    /// Decode the attribute value (without the TLV header)
    fn decode_value(transaction_id: &TransactionId, value: &[u8]) -> Result<Self>;
}

/// Identifier of a peer, carried in the Username attribute.
///
/// Six opaque bytes, rendered as lowercase hex. Derived from the device
/// serial number or MAC address, so it is stable across restarts; two
/// devices presenting the same id are indistinguishable to the server.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PeerId(pub [u8; 6]);

impl PeerId {
    pub const LEN: usize = 6;

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self)
    }
}

impl FromStr for PeerId {
    type Err = WireError;

    fn from_str(s: &str) -> Result<Self> {
        let raw = hex::decode(s)
            .map_err(|e| WireError::attribute("Username", format!("bad hex peer id: {e}")))?;
        PeerId::try_from(raw.as_slice())
    }
}

impl TryFrom<&[u8]> for PeerId {
    type Error = WireError;

    fn try_from(raw: &[u8]) -> Result<Self> {
        if raw.len() != Self::LEN {
            return Err(WireError::attribute(
                "Username",
                format!("peer id is {} bytes, expected {}", raw.len(), Self::LEN),
            ));
        }
        let mut id = [0u8; Self::LEN];
        id.copy_from_slice(raw);
        Ok(PeerId(id))
    }
}

impl Attribute for PeerId {
    const TYPE: u16 = types::USERNAME;
    const NAME: &'static str = "Username";

    fn encode_value(&self, _txid: &TransactionId) -> Result<Vec<u8>> {
        Ok(self.0.to_vec())
    }

    fn decode_value(_txid: &TransactionId, value: &[u8]) -> Result<Self> {
        PeerId::try_from(value)
    }
}

// Hex string in human-readable formats (JSON renderings), raw bytes on the
// MessagePack wire. One type, both encodings.
impl Serialize for PeerId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            serializer.serialize_str(&self.to_string())
        } else {
            serializer.serialize_bytes(&self.0)
        }
    }
}

impl<'de> Deserialize<'de> for PeerId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct PeerIdVisitor;

        impl<'de> Visitor<'de> for PeerIdVisitor {
            type Value = PeerId;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a 6-byte peer id")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<PeerId, E> {
                v.parse().map_err(E::custom)
            }

            fn visit_bytes<E: de::Error>(self, v: &[u8]) -> std::result::Result<PeerId, E> {
                PeerId::try_from(v).map_err(E::custom)
            }

            fn visit_seq<A: de::SeqAccess<'de>>(
                self,
                mut seq: A,
            ) -> std::result::Result<PeerId, A::Error> {
                let mut raw = Vec::with_capacity(PeerId::LEN);
                while let Some(b) = seq.next_element::<u8>()? {
                    raw.push(b);
                }
                PeerId::try_from(raw.as_slice()).map_err(de::Error::custom)
            }
        }

        if deserializer.is_human_readable() {
            deserializer.deserialize_str(PeerIdVisitor)
        } else {
            deserializer.deserialize_bytes(PeerIdVisitor)
        }
    }
}

/// Opaque payload relayed between peers, carried in the Data attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerData(pub Vec<u8>);

impl PeerData {
    pub fn new(payload: impl Into<Vec<u8>>) -> Result<Self> {
        let payload = payload.into();
        if payload.len() > MAX_DATA_LEN {
            return Err(WireError::DataTooLarge(payload.len()));
        }
        Ok(PeerData(payload))
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.0
    }
}

impl Attribute for PeerData {
    const TYPE: u16 = types::DATA;
    const NAME: &'static str = "Data";

    fn encode_value(&self, _txid: &TransactionId) -> Result<Vec<u8>> {
        if self.0.len() > MAX_DATA_LEN {
            return Err(WireError::DataTooLarge(self.0.len()));
        }
        Ok(self.0.clone())
    }

    fn decode_value(_txid: &TransactionId, value: &[u8]) -> Result<Self> {
        PeerData::new(value.to_vec())
    }
}

/// External and internal swarm-transfer ports advertised by an agent.
///
/// Rides in the EvenPort attribute as two little-endian 32-bit integers,
/// which is how the original deployment wedged a port pair into a STUN
/// attribute nobody else was using.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwarmPorts {
    pub external: u16,
    pub internal: u16,
}

impl Attribute for SwarmPorts {
    const TYPE: u16 = types::EVEN_PORT;
    const NAME: &'static str = "EvenPort";

    fn encode_value(&self, _txid: &TransactionId) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(8);
        out.extend_from_slice(&u32::from(self.external).to_le_bytes());
        out.extend_from_slice(&u32::from(self.internal).to_le_bytes());
        Ok(out)
    }

    fn decode_value(_txid: &TransactionId, value: &[u8]) -> Result<Self> {
        if value.len() != 8 {
            return Err(WireError::attribute(
                Self::NAME,
                format!("expected 8 bytes, got {}", value.len()),
            ));
        }
        let external = u32::from_le_bytes(value[..4].try_into().unwrap());
        let internal = u32::from_le_bytes(value[4..].try_into().unwrap());
        let port = |v: u32| {
            u16::try_from(v).map_err(|_| WireError::attribute(Self::NAME, format!("port {v} out of range")))
        };
        Ok(SwarmPorts {
            external: port(external)?,
            internal: port(internal)?,
        })
    }
}

/// Reflexive transport address observed by the server (XOR-MAPPED-ADDRESS).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XorMappedAddress(pub SocketAddr);

impl Attribute for XorMappedAddress {
    const TYPE: u16 = types::XOR_MAPPED_ADDRESS;
    const NAME: &'static str = "XorMappedAddress";

    fn encode_value(&self, txid: &TransactionId) -> Result<Vec<u8>> {
        let xport = self.0.port() ^ (MAGIC_COOKIE >> 16) as u16;
        let mut out = vec![0u8];
        match self.0.ip() {
            IpAddr::V4(ip) => {
                out.push(0x01);
                out.extend_from_slice(&xport.to_be_bytes());
                let xip = u32::from(ip) ^ MAGIC_COOKIE;
                out.extend_from_slice(&xip.to_be_bytes());
            }
            IpAddr::V6(ip) => {
                out.push(0x02);
                out.extend_from_slice(&xport.to_be_bytes());
                let mut mask = [0u8; 16];
                mask[..4].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
                mask[4..].copy_from_slice(&txid.0);
                let octets = ip.octets();
                for (i, b) in octets.iter().enumerate() {
                    out.push(b ^ mask[i]);
                }
            }
        }
        Ok(out)
    }

    fn decode_value(txid: &TransactionId, value: &[u8]) -> Result<Self> {
        if value.len() < 8 {
            return Err(WireError::attribute(Self::NAME, "value too short"));
        }
        let xport = u16::from_be_bytes(value[2..4].try_into().unwrap());
        let port = xport ^ (MAGIC_COOKIE >> 16) as u16;
        match value[1] {
            0x01 => {
                let xip = u32::from_be_bytes(value[4..8].try_into().unwrap());
                let ip = Ipv4Addr::from(xip ^ MAGIC_COOKIE);
                Ok(XorMappedAddress(SocketAddr::new(IpAddr::V4(ip), port)))
            }
            0x02 => {
                if value.len() < 20 {
                    return Err(WireError::attribute(Self::NAME, "IPv6 value too short"));
                }
                let mut mask = [0u8; 16];
                mask[..4].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
                mask[4..].copy_from_slice(&txid.0);
                let mut octets = [0u8; 16];
                for i in 0..16 {
                    octets[i] = value[4 + i] ^ mask[i];
                }
                let ip = Ipv6Addr::from(octets);
                Ok(XorMappedAddress(SocketAddr::new(IpAddr::V6(ip), port)))
            }
            family => Err(WireError::attribute(
                Self::NAME,
                format!("unknown address family {family:#04x}"),
            )),
        }
    }
}

/// Error code carried by ErrorResponse messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorCode {
    pub code: u16,
    pub reason: String,
}

impl ErrorCode {
    /// Relay target is not present in the session table.
    pub fn peer_not_found() -> Self {
        ErrorCode {
            code: 404,
            reason: "Peer Not Found".to_string(),
        }
    }

    /// Relay sender passed authentication but has no session entry.
    pub fn not_registered() -> Self {
        ErrorCode {
            code: 401,
            reason: "Not Registered".to_string(),
        }
    }
}

impl Attribute for ErrorCode {
    const TYPE: u16 = types::ERROR_CODE;
    const NAME: &'static str = "ErrorCode";

    fn encode_value(&self, _txid: &TransactionId) -> Result<Vec<u8>> {
        let mut out = vec![0u8, 0u8, (self.code / 100) as u8, (self.code % 100) as u8];
        out.extend_from_slice(self.reason.as_bytes());
        Ok(out)
    }

    fn decode_value(_txid: &TransactionId, value: &[u8]) -> Result<Self> {
        if value.len() < 4 {
            return Err(WireError::attribute(Self::NAME, "value too short"));
        }
        let code = u16::from(value[2] & 0x07) * 100 + u16::from(value[3]);
        let reason = String::from_utf8_lossy(&value[4..]).into_owned();
        Ok(ErrorCode { code, reason })
    }
}

/// Software name advertised by the sending implementation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Software(pub String);

impl Attribute for Software {
    const TYPE: u16 = types::SOFTWARE;
    const NAME: &'static str = "Software";

    fn encode_value(&self, _txid: &TransactionId) -> Result<Vec<u8>> {
        Ok(self.0.as_bytes().to_vec())
    }

    fn decode_value(_txid: &TransactionId, value: &[u8]) -> Result<Self> {
        let name = std::str::from_utf8(value)
            .map_err(|_| WireError::attribute(Self::NAME, "not valid UTF-8"))?;
        Ok(Software(name.to_string()))
    }
}
