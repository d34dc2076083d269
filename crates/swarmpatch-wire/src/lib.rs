//! STUN-framed wire protocol for the swarmpatch rendezvous exchange
//!
//! Peers and the rendezvous server speak a small subset of the STUN binary
//! framing (RFC 5389 header and TLV attributes, RFC 5766 method numbers)
//! over UDP. Every message is authenticated with a short-term-credential
//! HMAC and closed with a CRC fingerprint.

pub mod attr;
pub mod error;
pub mod integrity;
pub mod message;

pub use attr::{ErrorCode, PeerData, PeerId, Software, SwarmPorts, XorMappedAddress};
pub use error::{Result, WireError};
pub use message::{Class, Codec, Message, MessageType, Method, TransactionId};

/// Magic cookie present in every framed message (RFC 5389 §6).
pub const MAGIC_COOKIE: u32 = 0x2112_A442;

/// XOR mask applied to the CRC-32 fingerprint value.
pub const FINGERPRINT_XOR: u32 = 0x5354_554e;

/// Upper bound on the opaque payload carried by a Data attribute.
pub const MAX_DATA_LEN: usize = 56 * 1024;

/// Software name advertised when the codec is not given another one.
pub const DEFAULT_SOFTWARE: &str = "swarmpatch";
