//! Short-term-credential integrity and fingerprint trailers
//!
//! MESSAGE-INTEGRITY is an HMAC-SHA1 keyed with the shared short-term
//! password; it covers the framed message up to the integrity attribute with
//! the header length rewritten to include that attribute. FINGERPRINT is a
//! CRC-32 of everything before it, XORed with a fixed mask, and is always the
//! final attribute. Both helpers operate on the raw framed buffer so encode
//! and verify cannot disagree on what was covered.

use crate::FINGERPRINT_XOR;
use crate::attr::types;
use hmac::{Hmac, Mac};
use sha1::Sha1;

type HmacSha1 = Hmac<Sha1>;

/// Byte length of the HMAC-SHA1 tag.
pub const TAG_LEN: usize = 20;

/// Full TLV length of the integrity attribute.
pub const INTEGRITY_ATTR_LEN: usize = 4 + TAG_LEN;

/// Full TLV length of the fingerprint attribute.
pub const FINGERPRINT_ATTR_LEN: usize = 4 + 4;

fn patch_length(buf: &mut [u8], attr_len: u16) {
    let body = (buf.len() - 20) as u16 + attr_len;
    buf[2..4].copy_from_slice(&body.to_be_bytes());
}

fn hmac_tag(prefix: &[u8], password: &str) -> [u8; TAG_LEN] {
    // HMAC accepts keys of any length
    let mut mac = HmacSha1::new_from_slice(password.as_bytes()).expect("hmac key");
    mac.update(prefix);
    mac.finalize().into_bytes().into()
}

/// Append the MESSAGE-INTEGRITY attribute to a framed message.
pub fn append_integrity(buf: &mut Vec<u8>, password: &str) {
    patch_length(buf, INTEGRITY_ATTR_LEN as u16);
    let tag = hmac_tag(buf, password);
    buf.extend_from_slice(&types::MESSAGE_INTEGRITY.to_be_bytes());
    buf.extend_from_slice(&(TAG_LEN as u16).to_be_bytes());
    buf.extend_from_slice(&tag);
}

/// Verify a MESSAGE-INTEGRITY tag found at `offset` in the received buffer.
pub fn verify_integrity(buf: &[u8], offset: usize, tag: &[u8], password: &str) -> bool {
    if tag.len() != TAG_LEN || offset < 20 || offset > buf.len() {
        return false;
    }
    let mut prefix = buf[..offset].to_vec();
    patch_length(&mut prefix, INTEGRITY_ATTR_LEN as u16);
    let mut mac = HmacSha1::new_from_slice(password.as_bytes()).expect("hmac key");
    mac.update(&prefix);
    mac.verify_slice(tag).is_ok()
}

/// Append the FINGERPRINT attribute, closing the message.
pub fn append_fingerprint(buf: &mut Vec<u8>) {
    patch_length(buf, FINGERPRINT_ATTR_LEN as u16);
    let crc = crc32fast::hash(buf) ^ FINGERPRINT_XOR;
    buf.extend_from_slice(&types::FINGERPRINT.to_be_bytes());
    buf.extend_from_slice(&4u16.to_be_bytes());
    buf.extend_from_slice(&crc.to_be_bytes());
}

/// Verify a FINGERPRINT value found at `offset` in the received buffer.
///
/// The received header length already accounts for the fingerprint, so the
/// checksum input is exactly the bytes preceding the attribute.
pub fn verify_fingerprint(buf: &[u8], offset: usize, value: u32) -> bool {
    if offset < 20 || offset > buf.len() {
        return false;
    }
    crc32fast::hash(&buf[..offset]) ^ FINGERPRINT_XOR == value
}

#[cfg(test)]
mod tests {
    use super::*;

    fn framed(body: &[u8]) -> Vec<u8> {
        let mut buf = vec![0u8; 20];
        buf[2..4].copy_from_slice(&(body.len() as u16).to_be_bytes());
        buf[4..8].copy_from_slice(&crate::MAGIC_COOKIE.to_be_bytes());
        buf.extend_from_slice(body);
        buf
    }

    #[test]
    fn integrity_round_trip() {
        let mut buf = framed(b"atrbytes");
        append_integrity(&mut buf, "123");

        let offset = buf.len() - INTEGRITY_ATTR_LEN;
        let tag = &buf[offset + 4..];
        assert!(verify_integrity(&buf, offset, tag, "123"));
        assert!(!verify_integrity(&buf, offset, tag, "456"));
    }

    #[test]
    fn integrity_detects_tampering() {
        let mut buf = framed(b"atrbytes");
        append_integrity(&mut buf, "123");
        let offset = buf.len() - INTEGRITY_ATTR_LEN;
        let tag = buf[offset + 4..].to_vec();

        let mut tampered = buf.clone();
        tampered[20] ^= 0xff;
        assert!(!verify_integrity(&tampered, offset, &tag, "123"));
    }

    #[test]
    fn fingerprint_round_trip() {
        let mut buf = framed(b"data");
        append_fingerprint(&mut buf);

        let offset = buf.len() - FINGERPRINT_ATTR_LEN;
        let value = u32::from_be_bytes(buf[offset + 4..].try_into().unwrap());
        assert!(verify_fingerprint(&buf, offset, value));
        assert!(!verify_fingerprint(&buf, offset, value ^ 1));
    }
}
