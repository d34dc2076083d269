//! Error types for the wire codec

use thiserror::Error;

/// Result type for wire operations
pub type Result<T> = std::result::Result<T, WireError>;

/// Wire codec error types
///
/// `NonProtocol` is the only variant a receive loop may see for arbitrary
/// datagrams (port scans, unrelated traffic); everything else means the
/// sender attempted to speak the protocol and got it wrong.
#[derive(Error, Debug)]
pub enum WireError {
    #[error("not a protocol message")]
    NonProtocol,

    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("message integrity check failed")]
    Integrity,

    #[error("fingerprint mismatch")]
    Fingerprint,

    #[error("username attribute is missing")]
    MissingUsername,

    #[error("software attribute rejected: {0}")]
    Software(String),

    #[error("attribute {0:#06x} not present")]
    AttributeNotFound(u16),

    #[error("invalid {name} attribute: {reason}")]
    AttributeValue { name: &'static str, reason: String },

    #[error("data payload of {0} bytes exceeds the {max} byte limit", max = crate::MAX_DATA_LEN)]
    DataTooLarge(usize),
}

impl WireError {
    pub(crate) fn attribute(name: &'static str, reason: impl Into<String>) -> Self {
        WireError::AttributeValue {
            name,
            reason: reason.into(),
        }
    }
}
