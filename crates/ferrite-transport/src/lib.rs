//! The transport core of an RDP client.
//!
//! The [`Transport`] sits directly above a byte stream (plain TCP or TLS) and
//! delivers exactly one framed PDU at a time to an upper protocol handler.
//! It operates in two coexisting modes:
//!
//! - a synchronous mode used during connection negotiation, where
//!   [`Transport::recv_pdu`] reads exactly one PDU,
//! - an asynchronous readiness-polled mode used during the session, where the
//!   caller's event loop drives [`Transport::check_fds`] and complete PDUs
//!   are handed to the registered [`PduHandler`].
//!
//! The underlying stream can be upgraded in-place from cleartext TCP to TLS,
//! and an NLA authenticator can be layered on top, without changing the
//! upper-layer contract.

#[macro_use]
extern crate tracing;

mod error;
mod settings;
mod tcp;
mod tls;
mod transport;

pub use error::{TransportError, TransportResult};
pub use settings::Settings;
pub use tcp::{can_recv, TcpEndpoint};
pub use tls::{TlsEndpoint, TlsIdentity};
pub use transport::{CredsspAuthenticator, LayerKind, PduHandler, Transport, BUFFER_SIZE, IDLE_INTERVAL};
