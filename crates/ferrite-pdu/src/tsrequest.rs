//! TSRequest envelope recognition.
//!
//! During NLA the stream carries CredSSP TSRequests ([MS-CSSP] 2.2.1), which
//! are raw ASN.1 DER `SEQUENCE`s rather than TPKT or Fast-Path envelopes.
//! Only the definite length forms occur on the wire: the short form, and the
//! long form with one or two length octets. Anything wider would declare a
//! payload beyond 64 KiB, which CredSSP never produces.

use crate::{PduError, PduResult};

/// DER tag of a constructed `SEQUENCE`, the first byte of every TSRequest.
pub const SEQUENCE_TAG: u8 = 0x30;

/// Computes the total PDU length from a buffered TSRequest prefix.
///
/// The returned length covers the DER header itself. Returns `Ok(None)`
/// while the buffered prefix is too short to hold the length encoding.
pub fn find_size(bytes: &[u8]) -> PduResult<Option<usize>> {
    debug_assert_eq!(bytes.first(), Some(&SEQUENCE_TAG));

    if bytes.len() < 2 {
        return Ok(None);
    }

    let first = bytes[1];

    if first & 0x80 == 0 {
        return Ok(Some(usize::from(first) + 2));
    }

    match first & !0x80 {
        1 => {
            if bytes.len() < 3 {
                return Ok(None);
            }

            Ok(Some(usize::from(bytes[2]) + 3))
        }
        2 => {
            if bytes.len() < 4 {
                return Ok(None);
            }

            let declared = (usize::from(bytes[2]) << 8) | usize::from(bytes[3]);

            Ok(Some(declared + 4))
        }
        _ => {
            warn!(length_octets = first & !0x80, "unsupported TSRequest length encoding");

            Err(PduError::InvalidMessage {
                field: "TSRequest length",
                reason: "more than two length octets",
            })
        }
    }
}
