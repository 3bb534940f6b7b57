//! Fast-Path envelope recognition.
//!
//! Fast-Path is RDP's reduced-overhead framing ([MS-RDPBCGR] 2.2.9.1.2): one
//! header byte whose two low bits are zero, followed by a length field using
//! the shared one-or-two-octet encoding. When bit 7 of the first length octet
//! is set, the low seven bits become the high byte of a 15-bit length.
//!
//! The length counts the whole PDU, header included.

use crate::PduResult;

/// Smallest possible Fast-Path envelope: header byte plus one length octet.
pub const MIN_HEADER_SIZE: usize = 2;

/// Size in bytes of the encoded header, given its first length octet.
pub fn header_size(first_length_octet: u8) -> usize {
    if first_length_octet & 0x80 != 0 {
        3
    } else {
        2
    }
}

/// Computes the total PDU length from a buffered Fast-Path header.
///
/// Returns `Ok(None)` while fewer bytes than the header occupies are
/// buffered. This is a pure length computation; validating that the first
/// byte actually denotes Fast-Path is the caller's concern.
pub fn find_size(bytes: &[u8]) -> PduResult<Option<usize>> {
    if bytes.len() < MIN_HEADER_SIZE {
        return Ok(None);
    }

    let a = bytes[1];

    if bytes.len() < header_size(a) {
        return Ok(None);
    }

    let length = if a & 0x80 != 0 {
        let b = bytes[2];

        ((u16::from(a) & !0x80) << 8) + u16::from(b)
    } else {
        u16::from(a)
    };

    Ok(Some(usize::from(length)))
}
