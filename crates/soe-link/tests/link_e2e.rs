//! End-to-end protocol scenarios over localhost TCP and mock serial ports.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use soe_frame::{FrameReader, FrameWriter, Message, Opcode};
use soe_link::{LinkConfig, SocketHandler};
use soe_serial::{MockPort, PortOpener, SerialError, SerialPort};
use soe_transport::{TcpLink, TcpServer};

/// Tracks every mock port a handler opens, keyed by device name.
#[derive(Default)]
struct MockBay {
    ports: Mutex<HashMap<String, Arc<MockPort>>>,
}

impl MockBay {
    fn opener(self: &Arc<Self>) -> PortOpener {
        let bay = Arc::clone(self);
        Arc::new(move |name, _config| {
            let port = Arc::new(MockPort::new(name));
            bay.ports
                .lock()
                .unwrap()
                .insert(name.to_string(), Arc::clone(&port));
            Ok(port as Arc<dyn SerialPort>)
        })
    }

    fn port(&self, name: &str) -> Arc<MockPort> {
        Arc::clone(
            self.ports
                .lock()
                .unwrap()
                .get(name)
                .unwrap_or_else(|| panic!("port {name} was never opened")),
        )
    }
}

fn fast_config() -> LinkConfig {
    LinkConfig {
        serial_rx_timeout_consec: Duration::from_millis(5),
        inet_tx_rep_interval: Duration::from_millis(50),
        inet_keep_alive_interval: Duration::from_secs(600),
        ..LinkConfig::default()
    }
}

fn tcp_pair() -> (TcpLink, TcpLink) {
    let server = TcpServer::bind("127.0.0.1:0".parse().unwrap()).unwrap();
    let addr = server.local_addr();
    let accept = std::thread::spawn(move || server.accept().unwrap());
    let client = TcpLink::connect(addr.to_string()).unwrap();
    let accepted = accept.join().unwrap();
    (client, accepted)
}

fn handler_pair(config: LinkConfig) -> (SocketHandler, Arc<MockBay>, SocketHandler, Arc<MockBay>) {
    let (client_link, server_link) = tcp_pair();
    let bay_a = Arc::new(MockBay::default());
    let bay_b = Arc::new(MockBay::default());
    let a = SocketHandler::spawn(client_link, config.clone(), bay_a.opener()).unwrap();
    let b = SocketHandler::spawn(server_link, config, bay_b.opener()).unwrap();
    (a, bay_a, b, bay_b)
}

fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn open_close_round_trip_leaves_no_state() {
    let (a, bay_a, b, bay_b) = handler_pair(fast_config());

    a.open_remote_port("ttyS0", 9600, "ttyUSB0").unwrap();

    let links = a.list_ports();
    assert_eq!(links.len(), 1);
    assert_eq!(links[0].local, "ttyUSB0");
    assert_eq!(links[0].remote, "ttyS0");
    assert_eq!(b.list_ports().len(), 1);
    assert!(bay_a.port("ttyUSB0").is_open());
    assert!(bay_b.port("ttyS0").is_open());

    a.close_remote_port("ttyUSB0").unwrap();

    assert!(a.list_ports().is_empty());
    assert!(b.list_ports().is_empty());
    assert!(!bay_a.port("ttyUSB0").is_open());
    assert!(!bay_b.port("ttyS0").is_open());
}

#[test]
fn refused_claim_reports_failure_and_releases_local_port() {
    let (client_link, server_link) = tcp_pair();
    let bay_a = Arc::new(MockBay::default());
    let refusing: PortOpener = Arc::new(|_, _| Err(SerialError::Closed));

    let a = SocketHandler::spawn(client_link, fast_config(), bay_a.opener()).unwrap();
    let _b = SocketHandler::spawn(server_link, fast_config(), refusing).unwrap();

    let err = a.open_remote_port("ttyS0", 9600, "ttyUSB0").unwrap_err();
    assert!(err.to_string().contains("refused"));
    assert!(a.list_ports().is_empty());
    assert!(!bay_a.port("ttyUSB0").is_open());
}

#[test]
fn bytes_bridge_both_directions() {
    let (a, bay_a, _b, bay_b) = handler_pair(fast_config());
    a.open_remote_port("ttyS0", 115_200, "ttyUSB0").unwrap();

    bay_a.port("ttyUSB0").feed(b"HELLO");
    wait_until("bytes to reach B's serial", || {
        bay_b.port("ttyS0").written() == b"HELLO"
    });

    bay_b.port("ttyS0").feed(b"WORLD");
    wait_until("bytes to reach A's serial", || {
        bay_a.port("ttyUSB0").written() == b"WORLD"
    });

    // Nothing was delivered twice.
    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(bay_b.port("ttyS0").written(), b"HELLO");
    assert_eq!(bay_a.port("ttyUSB0").written(), b"WORLD");
}

#[test]
fn large_transfer_survives_chunking() {
    let (a, bay_a, _b, bay_b) = handler_pair(fast_config());
    a.open_remote_port("ttyS0", 115_200, "ttyUSB0").unwrap();

    let payload: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
    // Feed in odd-sized slices so entries fill and roll over mid-chunk.
    for chunk in payload.chunks(777) {
        bay_a.port("ttyUSB0").feed(chunk);
    }

    wait_until("full transfer to arrive in order", || {
        bay_b.port("ttyS0").written() == payload
    });
}

#[test]
fn peer_initiated_close_tears_down_the_link() {
    let (a, bay_a, b, _bay_b) = handler_pair(fast_config());
    a.open_remote_port("ttyS0", 9600, "ttyUSB0").unwrap();

    // B closes its side locally; A learns via unsolicited CLOSED.
    b.close_local_port("ttyS0").unwrap();

    wait_until("A to drop the link", || a.list_ports().is_empty());
    assert!(!bay_a.port("ttyUSB0").is_open());
}

#[test]
fn connection_teardown_force_releases_claims() {
    let (a, bay_a, b, bay_b) = handler_pair(fast_config());
    a.open_remote_port("ttyS0", 9600, "ttyUSB0").unwrap();

    drop(b); // connection dies

    wait_until("A to drop all claims", || a.list_ports().is_empty());
    assert!(!bay_a.port("ttyUSB0").is_open());
    assert!(!bay_b.port("ttyS0").is_open());
    wait_until("A to report inactive", || !a.is_active());
}

#[test]
fn close_all_ports_releases_everything() {
    let (a, _bay_a, b, _bay_b) = handler_pair(fast_config());
    a.open_remote_port("ttyS0", 9600, "ttyUSB0").unwrap();
    a.open_remote_port("ttyS1", 9600, "ttyUSB1").unwrap();
    assert_eq!(a.list_ports().len(), 2);

    a.close_all_ports().unwrap();
    assert!(a.list_ports().is_empty());
    assert!(b.list_ports().is_empty());
}

// ---------------------------------------------------------------------------
// Frame-level scenarios driven by a hand-rolled peer
// ---------------------------------------------------------------------------

struct ManualPeer {
    reader: FrameReader<TcpLink>,
    writer: FrameWriter<TcpLink>,
}

impl ManualPeer {
    fn send(&mut self, message: &Message) {
        self.writer.send_message(message).unwrap();
    }

    /// Next message, keep-alives included.
    fn recv_raw(&mut self) -> Message {
        Message::decode(self.reader.read_frame().unwrap()).unwrap()
    }

    /// Next message that is not an empty keep-alive STREAM.
    fn recv(&mut self) -> Message {
        loop {
            let message = self.recv_raw();
            if let Message::Stream { data, .. } = &message {
                if data.is_empty() {
                    continue;
                }
            }
            return message;
        }
    }
}

fn manual_pair(config: LinkConfig) -> (SocketHandler, Arc<MockBay>, ManualPeer) {
    let (client_link, server_link) = tcp_pair();
    let bay = Arc::new(MockBay::default());
    let handler = SocketHandler::spawn(server_link, config, bay.opener()).unwrap();

    client_link
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    let reader_link = client_link.try_clone().unwrap();
    let peer = ManualPeer {
        reader: FrameReader::new(reader_link),
        writer: FrameWriter::new(client_link),
    };
    (handler, bay, peer)
}

fn manual_open(peer: &mut ManualPeer, name: &str) {
    peer.send(&Message::Open {
        baud: 9600,
        port: name.into(),
    });
    assert_eq!(peer.recv(), Message::Opened { port: name.into() });
}

#[test]
fn single_stream_gets_both_confirmations() {
    let (_handler, bay, mut peer) = manual_pair(fast_config());
    manual_open(&mut peer, "mock1");

    peer.send(&Message::Stream {
        port: "mock1".into(),
        id: 0,
        data: Bytes::from_static(b"HELLO"),
    });

    let first = peer.recv();
    let second = peer.recv();
    let expected_rx = Message::RxConfirm {
        port: "mock1".into(),
        id: 0,
    };
    let expected_tx = Message::TxConfirm {
        port: "mock1".into(),
        id: 0,
    };
    assert!(
        (first == expected_rx && second == expected_tx)
            || (first == expected_tx && second == expected_rx),
        "got {first:?} then {second:?}"
    );

    wait_until("bytes on the serial device", || {
        bay.port("mock1").written() == b"HELLO"
    });
}

#[test]
fn duplicate_stream_is_acknowledged_but_written_once() {
    let (_handler, bay, mut peer) = manual_pair(fast_config());
    manual_open(&mut peer, "mock1");

    let stream = Message::Stream {
        port: "mock1".into(),
        id: 0,
        data: Bytes::from_static(b"ONCE"),
    };
    peer.send(&stream);

    // Drain the RX_CONFIRM and TX_CONFIRM for the first delivery.
    let mut seen_tx = false;
    let mut seen_rx = false;
    while !(seen_tx && seen_rx) {
        match peer.recv() {
            Message::RxConfirm { id: 0, .. } => seen_rx = true,
            Message::TxConfirm { id: 0, .. } => seen_tx = true,
            other => panic!("unexpected {other:?}"),
        }
    }
    std::thread::sleep(Duration::from_millis(50));

    // The duplicate still gets a network-level acknowledgement...
    peer.send(&stream);
    assert_eq!(
        peer.recv(),
        Message::RxConfirm {
            port: "mock1".into(),
            id: 0,
        }
    );

    // ...but reaches the device exactly once.
    std::thread::sleep(Duration::from_millis(150));
    assert_eq!(bay.port("mock1").written(), b"ONCE");
}

#[test]
fn unconfirmed_stream_is_retransmitted_until_acknowledged() {
    let (_handler, bay, mut peer) = manual_pair(fast_config());
    manual_open(&mut peer, "mock1");

    bay.port("mock1").feed(b"PING");

    let first = peer.recv();
    let Message::Stream { port, id, data } = first else {
        panic!("expected STREAM, got {first:?}");
    };
    assert_eq!(port, "mock1");
    assert_eq!(data.as_ref(), b"PING");

    // Withhold RX_CONFIRM: the same payload must come around again after
    // the repetition interval.
    let again = peer.recv();
    assert_eq!(
        again,
        Message::Stream {
            port: "mock1".into(),
            id,
            data: Bytes::from_static(b"PING"),
        }
    );

    // Acknowledge reception and transmission; fresh data then gets a fresh
    // id, and the old payload stops circulating.
    peer.send(&Message::RxConfirm {
        port: "mock1".into(),
        id,
    });
    peer.send(&Message::TxConfirm {
        port: "mock1".into(),
        id,
    });

    bay.port("mock1").feed(b"NEXT");
    loop {
        match peer.recv() {
            Message::Stream { id: next_id, data, .. } if data.as_ref() == b"NEXT" => {
                assert_eq!(next_id, id.wrapping_add(1));
                break;
            }
            // In-flight repeats of the old payload may still arrive.
            Message::Stream { id: old, data, .. } => {
                assert_eq!(old, id);
                assert_eq!(data.as_ref(), b"PING");
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}

#[test]
fn idle_claim_emits_keep_alive() {
    let config = LinkConfig {
        inet_keep_alive_interval: Duration::from_millis(100),
        ..fast_config()
    };
    let (_handler, _bay, mut peer) = manual_pair(config);
    manual_open(&mut peer, "mock1");

    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        assert!(Instant::now() < deadline, "no keep-alive observed");
        if let Message::Stream { port, data, .. } = peer.recv_raw() {
            if data.is_empty() {
                assert_eq!(port, "mock1");
                break;
            }
        }
    }
}

#[test]
fn stream_to_unknown_port_is_an_error_without_ack() {
    let (_handler, _bay, mut peer) = manual_pair(fast_config());

    peer.send(&Message::Stream {
        port: "nope".into(),
        id: 0,
        data: Bytes::from_static(b"X"),
    });

    match peer.recv() {
        Message::Error { port, message } => {
            assert_eq!(port.as_deref(), Some("nope"));
            assert!(message.unwrap().contains("not claimed"));
        }
        other => panic!("expected ERROR, got {other:?}"),
    }
}

#[test]
fn close_of_unclaimed_port_is_an_error() {
    let (_handler, _bay, mut peer) = manual_pair(fast_config());

    peer.send(&Message::Close {
        port: "nope".into(),
    });

    match peer.recv() {
        Message::Error { port, .. } => assert_eq!(port.as_deref(), Some("nope")),
        other => panic!("expected ERROR, got {other:?}"),
    }
}

#[test]
fn malformed_frame_is_reported_without_teardown() {
    let (_handler, _bay, mut peer) = manual_pair(fast_config());

    // An OPEN payload too short for its schema.
    peer.writer.send(Opcode::Open, &[0x00]).unwrap();

    match peer.recv() {
        Message::Error { port, message } => {
            assert!(port.is_none());
            assert!(message.unwrap().contains("malformed"));
        }
        other => panic!("expected ERROR, got {other:?}"),
    }

    // The connection survived: a regular handshake still works.
    manual_open(&mut peer, "mock1");
}

#[test]
fn stale_opened_is_discarded() {
    let (handler, _bay, mut peer) = manual_pair(fast_config());

    // No sequence is pending; an unsolicited OPENED must not disturb state.
    peer.send(&Message::Opened {
        port: "ghost".into(),
    });
    std::thread::sleep(Duration::from_millis(100));
    assert!(handler.list_ports().is_empty());
    assert!(handler.is_active());
}
