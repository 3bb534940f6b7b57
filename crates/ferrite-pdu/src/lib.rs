//! Framing envelopes used by the RDP transport.
//!
//! A single byte stream multiplexes three distinct envelopes, told apart by
//! the first one to four bytes of a PDU:
//!
//! - TPKT (`0x03` version octet), carrying X.224 traffic,
//! - Fast-Path (2- or 3-byte header), carrying high-frequency session traffic,
//! - TSRequest (ASN.1 DER `SEQUENCE`, tag `0x30`), carrying CredSSP material.
//!
//! This crate only recognizes the envelopes and computes their total length;
//! payload interpretation belongs to upper layers.

#[macro_use]
extern crate tracing;

pub mod fastpath;
pub mod tpkt;
pub mod tsrequest;

use core::fmt;

use thiserror::Error;

pub type PduResult<T> = Result<T, PduError>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PduError {
    #[error("not enough bytes: received {received} bytes, expected {expected} bytes")]
    NotEnoughBytes { received: usize, expected: usize },
    #[error("unexpected message type ({got:#04x})")]
    UnexpectedMessageType { got: u8 },
    #[error("unsupported TPKT version ({got})")]
    UnsupportedVersion { got: u8 },
    #[error("invalid `{field}`: {reason}")]
    InvalidMessage { field: &'static str, reason: &'static str },
}

/// The envelope of a single PDU on the wire.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Framing {
    Tpkt,
    FastPath,
    TsRequest,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PduInfo {
    pub framing: Framing,
    /// Total length of the PDU, header included.
    pub length: usize,
}

macro_rules! ensure_enough {
    ($bytes:expr, $len:expr) => {
        if $bytes.len() < $len {
            return Ok(None);
        }
    };
}

/// Finds the next PDU size during the established session.
///
/// Steady-state traffic is either TPKT or Fast-Path; the two low bits of the
/// first byte disambiguate. Returns `Ok(None)` until enough bytes are
/// buffered to recognize the header.
pub fn find_size(bytes: &[u8]) -> PduResult<Option<PduInfo>> {
    ensure_enough!(bytes, 1);

    match bytes[0] & 0b11 {
        0x03 => {
            ensure_enough!(bytes, tpkt::TpktHeader::SIZE);
            let header = tpkt::TpktHeader::read(bytes)?;

            Ok(Some(PduInfo {
                framing: Framing::Tpkt,
                length: header.packet_length(),
            }))
        }
        0x00 => match fastpath::find_size(bytes)? {
            Some(length) => Ok(Some(PduInfo {
                framing: Framing::FastPath,
                length,
            })),
            None => Ok(None),
        },
        _ => Err(PduError::UnexpectedMessageType { got: bytes[0] }),
    }
}

/// Finds the next PDU size during connection negotiation.
///
/// Before the session is established the stream may also carry CredSSP
/// TSRequests, so the first byte is multiplexed three ways: `0x03` is TPKT,
/// `0x30` is a DER `SEQUENCE`, anything else is decoded as Fast-Path.
pub fn negotiation_find_size(bytes: &[u8]) -> PduResult<Option<PduInfo>> {
    ensure_enough!(bytes, 1);

    match bytes[0] {
        tpkt::TpktHeader::VERSION => {
            ensure_enough!(bytes, tpkt::TpktHeader::SIZE);
            let header = tpkt::TpktHeader::read(bytes)?;

            Ok(Some(PduInfo {
                framing: Framing::Tpkt,
                length: header.packet_length(),
            }))
        }
        tsrequest::SEQUENCE_TAG => match tsrequest::find_size(bytes)? {
            Some(length) => Ok(Some(PduInfo {
                framing: Framing::TsRequest,
                length,
            })),
            None => Ok(None),
        },
        _ => match fastpath::find_size(bytes)? {
            Some(length) => Ok(Some(PduInfo {
                framing: Framing::FastPath,
                length,
            })),
            None => Ok(None),
        },
    }
}

/// Tells the transport which envelope the caller is waiting for, and how many
/// bytes the next PDU occupies once enough of its header arrived.
pub trait PduHint: Send + Sync + fmt::Debug + 'static {
    fn find_size(&self, bytes: &[u8]) -> PduResult<Option<usize>>;
}

/// Matches any envelope valid during negotiation.
#[derive(Clone, Copy, Debug)]
pub struct NegotiationHint;

pub const NEGOTIATION_HINT: NegotiationHint = NegotiationHint;

impl PduHint for NegotiationHint {
    fn find_size(&self, bytes: &[u8]) -> PduResult<Option<usize>> {
        negotiation_find_size(bytes).map(|opt| opt.map(|info| info.length))
    }
}

/// Matches TPKT-framed PDUs (X.224 negotiation traffic).
#[derive(Clone, Copy, Debug)]
pub struct TpktHint;

pub const TPKT_HINT: TpktHint = TpktHint;

impl PduHint for TpktHint {
    fn find_size(&self, bytes: &[u8]) -> PduResult<Option<usize>> {
        match negotiation_find_size(bytes)? {
            Some(info) => {
                debug_assert_eq!(info.framing, Framing::Tpkt);
                Ok(Some(info.length))
            }
            None => Ok(None),
        }
    }
}

/// Matches Fast-Path PDUs.
#[derive(Clone, Copy, Debug)]
pub struct FastPathHint;

pub const FAST_PATH_HINT: FastPathHint = FastPathHint;

impl PduHint for FastPathHint {
    fn find_size(&self, bytes: &[u8]) -> PduResult<Option<usize>> {
        match negotiation_find_size(bytes)? {
            Some(info) => {
                debug_assert_eq!(info.framing, Framing::FastPath);
                Ok(Some(info.length))
            }
            None => Ok(None),
        }
    }
}

/// Matches CredSSP TSRequest PDUs exchanged during NLA.
#[derive(Clone, Copy, Debug)]
pub struct TsRequestHint;

pub const TS_REQUEST_HINT: TsRequestHint = TsRequestHint;

impl PduHint for TsRequestHint {
    fn find_size(&self, bytes: &[u8]) -> PduResult<Option<usize>> {
        match negotiation_find_size(bytes)? {
            Some(info) => {
                debug_assert_eq!(info.framing, Framing::TsRequest);
                Ok(Some(info.length))
            }
            None => Ok(None),
        }
    }
}
