//! The blocking path: single-PDU reads used during connection negotiation.

use std::io::Write as _;
use std::thread;
use std::time::Duration;

use ferrite_pdu::TS_REQUEST_HINT;
use ferrite_testsuite::{loopback_transport, TPKT_SINGLE, TSREQUEST_EXTENDED};
use ferrite_transport::Settings;

#[test]
fn recv_pdu_reads_one_whole_tpkt() {
    let (mut transport, mut peer) = loopback_transport(Settings::default());

    peer.write_all(&TPKT_SINGLE).unwrap();

    let frame = transport.recv_pdu().unwrap();
    assert_eq!(&frame[..], &TPKT_SINGLE);
}

#[test]
fn recv_pdu_assembles_fragmented_arrivals() {
    let (mut transport, mut peer) = loopback_transport(Settings::default());

    let writer = thread::spawn(move || {
        for chunk in TPKT_SINGLE.chunks(3) {
            peer.write_all(chunk).unwrap();
            peer.flush().unwrap();
            thread::sleep(Duration::from_millis(5));
        }

        peer
    });

    let frame = transport.recv_pdu().unwrap();
    assert_eq!(&frame[..], &TPKT_SINGLE);

    writer.join().unwrap();
}

#[test]
fn recv_pdu_reads_tsrequest_with_extended_length() {
    let (mut transport, mut peer) = loopback_transport(Settings::default());

    peer.write_all(&TSREQUEST_EXTENDED).unwrap();

    let frame = transport.recv_pdu().unwrap();
    assert_eq!(&frame[..], &TSREQUEST_EXTENDED);
}

#[test]
fn recv_pdu_by_hint_matches_tsrequest() {
    let (mut transport, mut peer) = loopback_transport(Settings::default());

    peer.write_all(&TSREQUEST_EXTENDED).unwrap();

    let frame = transport.recv_pdu_by_hint(&TS_REQUEST_HINT).unwrap();
    assert_eq!(&frame[..], &TSREQUEST_EXTENDED);
}

#[test]
fn back_to_back_pdus_are_read_one_at_a_time() {
    let (mut transport, mut peer) = loopback_transport(Settings::default());

    peer.write_all(&TPKT_SINGLE).unwrap();
    peer.write_all(&TSREQUEST_EXTENDED).unwrap();

    let first = transport.recv_pdu().unwrap();
    assert_eq!(&first[..], &TPKT_SINGLE);

    let second = transport.recv_pdu().unwrap();
    assert_eq!(&second[..], &TSREQUEST_EXTENDED);
}
