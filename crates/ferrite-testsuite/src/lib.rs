//! Shared helpers for the integration tests: loopback transports and canned
//! PDU handlers.

use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use bytes::BytesMut;
use ferrite_transport::{PduHandler, Settings, Transport, TransportResult};

/// A TPKT carrying four payload bytes, 8 bytes total.
pub const TPKT_SINGLE: [u8; 8] = [0x03, 0x00, 0x00, 0x08, 0xAA, 0xBB, 0xCC, 0xDD];

/// Two back-to-back Fast-Path frames, four bytes each.
pub const FASTPATH_PAIR: [u8; 8] = [0x04, 0x04, 0x11, 0x22, 0x04, 0x04, 0x33, 0x44];

/// A TSRequest using the one-octet long length form, 7 bytes total.
pub const TSREQUEST_EXTENDED: [u8; 7] = [0x30, 0x81, 0x04, 0x01, 0x02, 0x03, 0x04];

/// Connects a transport to a loopback listener and returns it together with
/// the peer's end of the connection.
pub fn loopback_transport(settings: Settings) -> (Transport, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    let mut transport = Transport::new(Arc::new(settings));
    transport.connect("127.0.0.1", port).unwrap();

    let (peer, _) = listener.accept().unwrap();

    (transport, peer)
}

/// Drives `check_fds` until a PDU is dispatched or `attempts` polls elapse.
pub fn drive(transport: &mut Transport, attempts: usize) -> TransportResult<bool> {
    for _ in 0..attempts {
        if transport.check_fds()? {
            return Ok(true);
        }

        thread::sleep(Duration::from_millis(1));
    }

    Ok(false)
}

/// Records every dispatched PDU; the shared frame list outlives the handler
/// registration.
pub struct CollectingHandler {
    frames: Arc<Mutex<Vec<Vec<u8>>>>,
    accept: bool,
}

impl CollectingHandler {
    pub fn recording() -> (Self, Arc<Mutex<Vec<Vec<u8>>>>) {
        let frames = Arc::new(Mutex::new(Vec::new()));

        (
            Self {
                frames: Arc::clone(&frames),
                accept: true,
            },
            frames,
        )
    }

    /// Same as [`CollectingHandler::recording`], but the handler refuses
    /// every PDU.
    pub fn refusing() -> (Self, Arc<Mutex<Vec<Vec<u8>>>>) {
        let (mut handler, frames) = Self::recording();
        handler.accept = false;

        (handler, frames)
    }
}

impl PduHandler for CollectingHandler {
    fn on_pdu(&mut self, _transport: &mut Transport, pdu: &mut BytesMut) -> bool {
        self.frames.lock().unwrap().push(pdu.to_vec());
        self.accept
    }
}
