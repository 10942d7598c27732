//! Plaintext detection, the detector registry, and shutdown behavior.

use std::io::Write;
use std::sync::Arc;
use std::time::{Duration, Instant};

use hostd_admission::config::DetectionConfig;
use hostd_admission::detect::{MarkerDetector, ProtocolDetector};
use hostd_admission::service::EchoService;

mod common;

use common::{connect, echo, read_until_closed, wait_until, Harness};

#[test]
fn test_marker_split_across_reads_is_detected() {
    let harness = Harness::start(None, DetectionConfig::default());

    let mut sock = connect(harness.addr());
    sock.write_all(b"CONN").unwrap();
    std::thread::sleep(Duration::from_millis(50));
    sock.write_all(b"ECT\n\n\0").unwrap();

    let mut reply = [0u8; 10];
    std::io::Read::read_exact(&mut sock, &mut reply).unwrap();
    assert_eq!(&reply, b"CONNECT\n\n\0");
}

#[test]
fn test_stomp_frame_command_is_detected() {
    let harness = Harness::start(None, DetectionConfig::default());

    let mut sock = connect(harness.addr());
    let frame = b"STOMP\nhost:node1\n\n\0";
    assert_eq!(echo(&mut sock, frame).unwrap(), frame);
}

#[test]
fn test_garbage_is_closed_and_loop_keeps_serving() {
    let harness = Harness::start(None, DetectionConfig::default());

    let mut garbage = connect(harness.addr());
    garbage.write_all(b"GARBAGE!GARBAGE!").unwrap();
    let response = read_until_closed(&mut garbage).expect("garbage connection left open");
    assert!(response.is_empty());

    let mut sock = connect(harness.addr());
    assert_eq!(echo(&mut sock, b"CONNECT\n\n\0").unwrap(), b"CONNECT\n\n\0");
    assert!(wait_until(|| harness.acceptor.pending_connections() == 0));
}

#[test]
fn test_silent_peer_is_closed_after_detection_timeout() {
    let detection = DetectionConfig {
        timeout_ms: 200,
        ..DetectionConfig::default()
    };
    let harness = Harness::start(None, detection);

    let started = Instant::now();
    let mut sock = connect(harness.addr());
    let response = read_until_closed(&mut sock).expect("silent connection left open");
    assert!(response.is_empty());
    assert!(started.elapsed() >= Duration::from_millis(150));
    assert!(wait_until(|| harness.acceptor.pending_connections() == 0));
}

#[test]
fn test_detector_added_and_removed_at_runtime() {
    let harness = Harness::start(None, DetectionConfig::default());
    let hello: Arc<dyn ProtocolDetector> =
        Arc::new(MarkerDetector::new(["HELLO"], Arc::new(EchoService)));

    harness.acceptor.add_detector(hello.clone());
    let mut sock = connect(harness.addr());
    assert_eq!(echo(&mut sock, b"HELLO world").unwrap(), b"HELLO world");

    assert!(harness.acceptor.remove_detector(&hello));
    let mut sock = connect(harness.addr());
    sock.write_all(b"HELLO again").unwrap();
    let response = read_until_closed(&mut sock).expect("unclaimed connection left open");
    assert!(response.is_empty());
}

#[test]
fn test_double_stop_is_harmless_and_thread_joins() {
    let harness = Harness::start(None, DetectionConfig::default());
    let addr = harness.addr();

    // An established session survives the acceptor stopping.
    let mut session = connect(addr);
    assert_eq!(echo(&mut session, b"CONNECT\n\n\0").unwrap(), b"CONNECT\n\n\0");

    harness.acceptor.stop();
    harness.acceptor.stop();
    assert!(wait_until(|| std::net::TcpStream::connect(addr).is_err()));
    assert_eq!(echo(&mut session, b"still open").unwrap(), b"still open");

    let Harness { acceptor, reactor } = harness;
    reactor.stop();
    reactor.stop();
    reactor.join().unwrap();
    drop(acceptor);

    let response = read_until_closed(&mut session).expect("session outlived the reactor");
    assert!(response.is_empty());
}
