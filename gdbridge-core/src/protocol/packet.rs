//! RSP packet encoding: checksums, framing and binary escaping.

use crate::error::{RspError, RspResult};

/// Start of a packet.
pub const PACKET_START: u8 = b'$';
/// End of a packet payload, followed by two checksum digits.
pub const PACKET_END: u8 = b'#';
/// Positive acknowledgement.
pub const ACK: u8 = b'+';
/// Negative acknowledgement, requests a retransmit.
pub const NAK: u8 = b'-';
/// Asynchronous break-in sent by the client while the target runs.
pub const INTERRUPT: u8 = 0x03;
/// Binary escape marker. The following byte is XORed with [`ESCAPE_XOR`].
pub const ESCAPE: u8 = 0x7d;
pub const ESCAPE_XOR: u8 = 0x20;

/// One decoded packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub payload: Vec<u8>,
    pub checksum: u8,
}

impl Frame {
    /// Build a frame for `payload`, computing its checksum.
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        let payload = payload.into();
        let checksum = checksum(&payload);
        Self { payload, checksum }
    }

    /// Wire form: `$<payload>#<checksum>`.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.payload.len() + 4);
        out.push(PACKET_START);
        out.extend_from_slice(&self.payload);
        out.push(PACKET_END);
        out.extend_from_slice(format!("{:02x}", self.checksum).as_bytes());
        out
    }

    /// Check a received checksum against the payload.
    pub fn verify(payload: Vec<u8>, received: u8) -> RspResult<Self> {
        let computed = checksum(&payload);
        if computed == received {
            Ok(Self { payload, checksum: received })
        } else {
            Err(RspError::ChecksumMismatch { received, computed })
        }
    }
}

/// Sum of all payload bytes modulo 256.
pub fn checksum(payload: &[u8]) -> u8 {
    payload.iter().fold(0u8, |acc, &b| acc.wrapping_add(b))
}

/// Bytes that must be escaped inside binary packet data.
pub fn needs_escape(byte: u8) -> bool {
    matches!(byte, b'#' | b'$' | ESCAPE | b'*')
}

/// Escape bytes that may not appear raw inside a packet.
pub fn escape(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    for &byte in data {
        if needs_escape(byte) {
            out.push(ESCAPE);
            out.push(byte ^ ESCAPE_XOR);
        } else {
            out.push(byte);
        }
    }
    out
}

/// Undo [`escape`]. Each marker consumes the following source byte, so an
/// escaped pair yields exactly one output byte. A trailing lone marker is
/// dropped.
pub fn unescape(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut i = 0;
    while i < data.len() {
        if data[i] == ESCAPE {
            if let Some(&next) = data.get(i + 1) {
                out.push(next ^ ESCAPE_XOR);
            }
            i += 2;
        } else {
            out.push(data[i]);
            i += 1;
        }
    }
    out
}

/// Parse a hexadecimal number field such as an address or a length.
pub fn parse_hex_u32(field: &[u8]) -> RspResult<u32> {
    std::str::from_utf8(field)
        .ok()
        .filter(|s| !s.is_empty())
        .and_then(|s| u32::from_str_radix(s, 16).ok())
        .ok_or_else(|| RspError::InvalidHex(String::from_utf8_lossy(field).into_owned()))
}

/// Parse a hexadecimal length or offset field.
pub fn parse_hex_usize(field: &[u8]) -> RspResult<usize> {
    std::str::from_utf8(field)
        .ok()
        .filter(|s| !s.is_empty())
        .and_then(|s| usize::from_str_radix(s, 16).ok())
        .ok_or_else(|| RspError::InvalidHex(String::from_utf8_lossy(field).into_owned()))
}

/// Decode a hex byte string such as a register value or `M` packet data.
pub fn decode_hex(field: &[u8]) -> RspResult<Vec<u8>> {
    hex::decode(field).map_err(|_| RspError::InvalidHex(String::from_utf8_lossy(field).into_owned()))
}

/// Encode a register value the way GDB expects it on a little-endian target.
pub fn encode_u32_le(value: u32) -> String {
    hex::encode(value.to_le_bytes())
}

/// Decode an 8 digit register value sent in target (little-endian) byte order.
pub fn decode_u32_le(field: &[u8]) -> RspResult<u32> {
    let bytes = decode_hex(field)?;
    let bytes: [u8; 4] = bytes
        .try_into()
        .map_err(|_| RspError::InvalidHex(String::from_utf8_lossy(field).into_owned()))?;
    Ok(u32::from_le_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_is_byte_sum_mod_256() {
        assert_eq!(checksum(b""), 0);
        assert_eq!(checksum(b"OK"), 0x9a);
        assert_eq!(checksum(b"qSupported"), 0x37);
        assert_eq!(checksum(b"?"), 0x3f);
        assert_eq!(checksum(b"g"), 0x67);
        assert_eq!(checksum(&[0xff, 0x02]), 0x01);
    }

    #[test]
    fn test_encode_zero_pads_checksum() {
        let frame = Frame::new(vec![0x01]);
        assert_eq!(frame.encode(), b"$\x01#01");
        assert_eq!(Frame::new("OK").encode(), b"$OK#9a");
    }

    #[test]
    fn test_verify_rejects_bad_checksum() {
        assert!(Frame::verify(b"OK".to_vec(), 0x9a).is_ok());
        match Frame::verify(b"OK".to_vec(), 0x00) {
            Err(RspError::ChecksumMismatch { received, computed }) => {
                assert_eq!(received, 0);
                assert_eq!(computed, 0x9a);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_unescape_marker() {
        assert_eq!(unescape(&[0x7d, 0x00]), vec![0x20]);
        assert_eq!(unescape(&[0x01, 0x7d, 0x5d, 0x02]), vec![0x01, 0x7d, 0x02]);
        assert_eq!(unescape(&[0x7d, 0x03, 0x7d, 0x04]), vec![0x23, 0x24]);
        assert_eq!(unescape(&[0x05, 0x7d]), vec![0x05]);
    }

    #[test]
    fn test_escape_special_bytes() {
        assert_eq!(escape(b"a#b"), vec![b'a', 0x7d, 0x03, b'b']);
        assert_eq!(escape(&[0x7d]), vec![0x7d, 0x5d]);
        assert_eq!(escape(b"*$"), vec![0x7d, 0x0a, 0x7d, 0x04]);
    }

    #[test]
    fn test_unescape_inverts_escape() {
        let data: Vec<u8> = (0..=255).collect();
        assert_eq!(unescape(&escape(&data)), data);
    }

    #[test]
    fn test_hex_fields() {
        assert_eq!(parse_hex_u32(b"20000000").unwrap(), 0x2000_0000);
        assert_eq!(parse_hex_usize(b"1f").unwrap(), 31);
        assert!(parse_hex_u32(b"").is_err());
        assert!(parse_hex_u32(b"xyz").is_err());
        assert_eq!(decode_hex(b"0aff").unwrap(), vec![0x0a, 0xff]);
    }

    #[test]
    fn test_register_byte_order() {
        assert_eq!(encode_u32_le(0x0800_1234), "34120008");
        assert_eq!(decode_u32_le(b"34120008").unwrap(), 0x0800_1234);
        assert!(decode_u32_le(b"3412").is_err());
    }
}
