//! Construction, layer management and the write path.

use std::io::Read as _;
use std::net::TcpListener;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use ferrite_testsuite::{loopback_transport, TPKT_SINGLE};
use ferrite_transport::{LayerKind, Settings, Transport, TransportError};
use rstest::rstest;

#[test]
fn a_new_transport_is_cleartext_and_blocking() {
    let transport = Transport::new(Arc::new(Settings::default()));

    assert_eq!(transport.layer_kind(), LayerKind::Tcp);
    assert!(transport.is_blocking());
    assert_eq!(transport.pending_bytes(), 0);
    assert_eq!(transport.peer_public_key(), None);
}

#[test]
fn get_read_fds_appends_the_active_socket() {
    let (transport, _peer) = loopback_transport(Settings::default());

    let mut rfds = Vec::new();
    transport.get_read_fds(&mut rfds);

    assert_eq!(rfds.len(), 1);

    // The same descriptor every time.
    transport.get_read_fds(&mut rfds);
    assert_eq!(rfds[0], rfds[1]);
}

#[test]
fn get_read_fds_is_empty_before_connecting() {
    let transport = Transport::new(Arc::new(Settings::default()));

    let mut rfds = Vec::new();
    transport.get_read_fds(&mut rfds);

    assert!(rfds.is_empty());
}

#[rstest]
#[case(1)]
#[case(1_000)]
#[case(100_000)]
fn write_delivers_everything(#[case] length: usize) {
    let (mut transport, mut peer) = loopback_transport(Settings::default());

    let payload: Vec<u8> = (0..length).map(|i| i as u8).collect();
    let expected = payload.clone();

    let reader = thread::spawn(move || {
        let mut received = vec![0u8; length];
        peer.read_exact(&mut received).unwrap();
        received
    });

    let written = transport.write(&payload).unwrap();
    assert_eq!(written, length);

    assert_eq!(reader.join().unwrap(), expected);
}

#[test]
fn write_failure_closes_the_layer() {
    let (mut transport, peer) = loopback_transport(Settings::default());
    drop(peer);

    let payload = [0u8; 1024];
    let mut first_error = None;

    for _ in 0..4096 {
        match transport.write(&payload) {
            Ok(_) => thread::sleep(Duration::from_millis(1)),
            Err(e) => {
                first_error = Some(e);
                break;
            }
        }
    }

    let first_error = first_error.expect("write against a dropped peer never failed");
    assert!(matches!(first_error, TransportError::Io(_)), "got: {first_error:?}");
    assert_eq!(transport.layer_kind(), LayerKind::Closed);

    // Fails fast, without a socket to touch.
    let second = transport.write(&payload);
    assert!(matches!(second, Err(TransportError::PeerClosed)), "got: {second:?}");
}

#[test]
fn legacy_rdp_security_entry_points_are_noops() {
    let mut transport = Transport::new(Arc::new(Settings::default()));

    transport.connect_rdp().unwrap();
    transport.accept_rdp().unwrap();

    assert_eq!(transport.layer_kind(), LayerKind::Tcp);
}

#[test]
fn set_blocking_mode_updates_the_transport_flag() {
    let (mut transport, _peer) = loopback_transport(Settings::default());

    transport.set_blocking_mode(false).unwrap();
    assert!(!transport.is_blocking());

    // No data: the non-blocking dispatch returns promptly with no work.
    assert!(!transport.check_fds().unwrap());

    transport.set_blocking_mode(true).unwrap();
    assert!(transport.is_blocking());
}

#[test]
fn attach_adopts_an_existing_socket() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let client = thread::spawn(move || {
        use std::io::Write as _;

        let mut stream = std::net::TcpStream::connect(addr).unwrap();
        stream.write_all(&TPKT_SINGLE).unwrap();
    });

    let (stream, _) = listener.accept().unwrap();

    let mut transport = Transport::new(Arc::new(Settings::default()));
    transport.attach(stream).unwrap();

    let frame = transport.recv_pdu().unwrap();
    assert_eq!(&frame[..], &TPKT_SINGLE);

    client.join().unwrap();
}

#[test]
fn disconnect_shuts_the_stream_down() {
    let (mut transport, mut peer) = loopback_transport(Settings::default());

    transport.disconnect().unwrap();

    let mut buf = [0u8; 1];
    assert_eq!(peer.read(&mut buf).unwrap(), 0);
}

#[test]
fn tls_upgrade_requires_a_live_socket() {
    let mut transport = Transport::new(Arc::new(Settings::default()));

    let result = transport.connect_tls();
    assert!(matches!(result, Err(TransportError::NotConnected)), "got: {result:?}");
    assert_eq!(transport.layer_kind(), LayerKind::Tcp);
}

#[test]
fn accept_tls_requires_identity_paths() {
    let (mut transport, _peer) = loopback_transport(Settings::default());

    let result = transport.accept_tls();
    assert!(matches!(result, Err(TransportError::Config(_))), "got: {result:?}");
    assert_eq!(transport.layer_kind(), LayerKind::Tcp);
}
