use std::io;

use ferrite_pdu::PduError;
use thiserror::Error;

pub type TransportResult<T> = Result<T, TransportError>;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("I/O failure")]
    Io(#[from] io::Error),
    #[error("invalid PDU framing")]
    Pdu(#[from] PduError),
    #[error("TLS failure")]
    Tls(#[from] rustls::Error),
    #[error("invalid configuration: {0}")]
    Config(&'static str),
    #[error("authentication failed")]
    Authentication,
    #[error("connection closed by peer")]
    PeerClosed,
    #[error("transport is not connected")]
    NotConnected,
    #[error("PDU handler reported failure")]
    Handler,
    #[error("dispatch invoked re-entrantly")]
    Reentrancy,
}
