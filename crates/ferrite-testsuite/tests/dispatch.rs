//! The non-blocking dispatch loop: `check_fds` and the PDU handler contract.

use std::io::Write as _;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use bytes::BytesMut;
use ferrite_testsuite::{drive, loopback_transport, CollectingHandler, FASTPATH_PAIR, TPKT_SINGLE};
use ferrite_transport::{PduHandler, Settings, Transport, TransportError, TransportResult};

#[test]
fn whole_tpkt_is_dispatched_once() {
    let (mut transport, mut peer) = loopback_transport(Settings::default());
    let (handler, frames) = CollectingHandler::recording();
    transport.set_pdu_handler(Box::new(handler));
    transport.set_blocking_mode(false).unwrap();

    peer.write_all(&TPKT_SINGLE).unwrap();

    assert!(drive(&mut transport, 500).unwrap());
    assert_eq!(frames.lock().unwrap().as_slice(), &[TPKT_SINGLE.to_vec()]);

    // No further PDU, no further callback.
    assert!(!drive(&mut transport, 20).unwrap());
    assert_eq!(frames.lock().unwrap().len(), 1);
}

#[test]
fn byte_by_byte_arrival_dispatches_after_the_last_byte() {
    let (mut transport, mut peer) = loopback_transport(Settings::default());
    let (handler, frames) = CollectingHandler::recording();
    transport.set_pdu_handler(Box::new(handler));
    transport.set_blocking_mode(false).unwrap();

    for (index, byte) in TPKT_SINGLE.iter().enumerate() {
        peer.write_all(&[*byte]).unwrap();
        peer.flush().unwrap();

        if index < TPKT_SINGLE.len() - 1 {
            assert!(!drive(&mut transport, 20).unwrap());
            assert!(frames.lock().unwrap().is_empty());
        }
    }

    assert!(drive(&mut transport, 500).unwrap());
    assert_eq!(frames.lock().unwrap().as_slice(), &[TPKT_SINGLE.to_vec()]);
}

#[test]
fn back_to_back_fastpath_frames_dispatch_one_per_call() {
    let (mut transport, mut peer) = loopback_transport(Settings::default());
    let (handler, frames) = CollectingHandler::recording();
    transport.set_pdu_handler(Box::new(handler));
    transport.set_blocking_mode(false).unwrap();

    peer.write_all(&FASTPATH_PAIR).unwrap();

    assert!(drive(&mut transport, 500).unwrap());
    assert_eq!(frames.lock().unwrap().len(), 1);
    assert_eq!(frames.lock().unwrap()[0], &FASTPATH_PAIR[..4]);

    // The second frame needs no additional bytes from the peer.
    assert!(drive(&mut transport, 500).unwrap());
    assert_eq!(frames.lock().unwrap().len(), 2);
    assert_eq!(frames.lock().unwrap()[1], &FASTPATH_PAIR[4..]);
}

#[test]
fn unrecognized_framing_is_a_protocol_error() {
    let (mut transport, mut peer) = loopback_transport(Settings::default());
    let (handler, frames) = CollectingHandler::recording();
    transport.set_pdu_handler(Box::new(handler));
    transport.set_blocking_mode(false).unwrap();

    peer.write_all(&[0xFF, 0xFF, 0xFF, 0xFF]).unwrap();

    let error = poll_until_error(&mut transport);
    assert!(matches!(error, TransportError::Pdu(_)), "got: {error:?}");
    assert!(frames.lock().unwrap().is_empty());
}

#[test]
fn partial_header_is_preserved_between_events() {
    let (mut transport, mut peer) = loopback_transport(Settings::default());
    let (handler, frames) = CollectingHandler::recording();
    transport.set_pdu_handler(Box::new(handler));
    transport.set_blocking_mode(false).unwrap();

    peer.write_all(&TPKT_SINGLE[..2]).unwrap();

    while transport.pending_bytes() < 2 {
        assert!(!transport.check_fds().unwrap());
        thread::sleep(Duration::from_millis(1));
    }

    assert!(!drive(&mut transport, 20).unwrap());
    assert_eq!(transport.pending_bytes(), 2);
    assert!(frames.lock().unwrap().is_empty());

    peer.write_all(&TPKT_SINGLE[2..]).unwrap();

    assert!(drive(&mut transport, 500).unwrap());
    assert_eq!(frames.lock().unwrap().as_slice(), &[TPKT_SINGLE.to_vec()]);
    assert_eq!(transport.pending_bytes(), 0);
}

#[test]
fn handler_refusal_surfaces_as_failure() {
    let (mut transport, mut peer) = loopback_transport(Settings::default());
    let (handler, frames) = CollectingHandler::refusing();
    transport.set_pdu_handler(Box::new(handler));
    transport.set_blocking_mode(false).unwrap();

    peer.write_all(&TPKT_SINGLE).unwrap();

    let error = poll_until_error(&mut transport);
    assert!(matches!(error, TransportError::Handler), "got: {error:?}");
    assert_eq!(frames.lock().unwrap().len(), 1);
}

struct ReentrantHandler {
    inner_result: Arc<Mutex<Option<TransportResult<bool>>>>,
}

impl PduHandler for ReentrantHandler {
    fn on_pdu(&mut self, transport: &mut Transport, _pdu: &mut BytesMut) -> bool {
        *self.inner_result.lock().unwrap() = Some(transport.check_fds());
        true
    }
}

#[test]
fn check_fds_refuses_to_recurse() {
    let (mut transport, mut peer) = loopback_transport(Settings::default());

    let inner_result = Arc::new(Mutex::new(None));
    transport.set_pdu_handler(Box::new(ReentrantHandler {
        inner_result: Arc::clone(&inner_result),
    }));
    transport.set_blocking_mode(false).unwrap();

    peer.write_all(&TPKT_SINGLE).unwrap();

    // The outer dispatch succeeds even though the nested call was refused.
    assert!(drive(&mut transport, 500).unwrap());

    let inner = inner_result.lock().unwrap().take().expect("handler was not invoked");
    assert!(matches!(inner, Err(TransportError::Reentrancy)), "got: {inner:?}");
}

struct EchoHandler;

impl PduHandler for EchoHandler {
    fn on_pdu(&mut self, transport: &mut Transport, pdu: &mut BytesMut) -> bool {
        transport.write(pdu).is_ok()
    }
}

#[test]
fn handler_may_write_through_the_transport() {
    let (mut transport, mut peer) = loopback_transport(Settings::default());
    transport.set_pdu_handler(Box::new(EchoHandler));
    transport.set_blocking_mode(false).unwrap();

    peer.write_all(&TPKT_SINGLE).unwrap();

    assert!(drive(&mut transport, 500).unwrap());

    let mut echoed = [0u8; TPKT_SINGLE.len()];
    use std::io::Read as _;
    peer.read_exact(&mut echoed).unwrap();
    assert_eq!(echoed, TPKT_SINGLE);
}

/// Keeps polling until the transport reports an error, allowing time for the
/// bytes to arrive.
fn poll_until_error(transport: &mut Transport) -> TransportError {
    for _ in 0..500 {
        match transport.check_fds() {
            Ok(_) => thread::sleep(Duration::from_millis(1)),
            Err(e) => return e,
        }
    }

    panic!("transport never reported an error");
}
