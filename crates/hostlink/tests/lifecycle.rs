//! Connection lifecycle: drain-on-disconnect, drain timeout, reconnect,
//! liveness.

use std::sync::Arc;
use std::time::Duration;

use hostlink::{Connection, ConnectorConfig, StatusCode, PROTOCOL_MAJOR, PROTOCOL_MINOR};
use hostlink_testkit::{MockHost, TestLink};

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

#[test]
fn disconnect_waits_for_inflight_calls() {
    init_tracing();
    let link = Arc::new(TestLink::connect_sync().unwrap());
    link.host.set_response_delay(Duration::from_millis(40));

    let workers: Vec<_> = (0..3u8)
        .map(|i| {
            let link = link.clone();
            std::thread::spawn(move || link.conn.write_read(&[i; 32], 256))
        })
        .collect();

    // Let the calls get in flight before tearing down.
    std::thread::sleep(Duration::from_millis(10));
    link.conn.disconnect().unwrap();

    // Disconnect returned only after every call completed.
    for w in workers {
        let reply = w.join().unwrap().unwrap();
        assert_eq!(reply.len(), 32);
    }
    let stats = link.conn.stats();
    assert_eq!(stats.completions, 3);
    assert!(link.conn.client_id().is_none());
}

#[test]
fn drain_timeout_is_a_hard_failure() {
    let host = MockHost::new();
    let config = ConnectorConfig {
        drain_timeout: Duration::from_millis(30),
        ..ConnectorConfig::default()
    };
    let link = Arc::new(TestLink::connect_sync_with(host, config).unwrap());
    link.host.set_response_delay(Duration::from_millis(300));

    let slow = {
        let link = link.clone();
        std::thread::spawn(move || link.conn.write_read(b"slow", 256))
    };
    std::thread::sleep(Duration::from_millis(10));

    let err = link.conn.disconnect().unwrap_err();
    assert_eq!(err.code(), StatusCode::DrainTimeout);

    // The straggler still finishes; nothing crashes, nothing was freed
    // under it.
    let reply = slow.join().unwrap().unwrap();
    assert_eq!(reply, b"slow");
}

#[test]
fn new_calls_are_rejected_while_draining() {
    let link = TestLink::connect_sync().unwrap();
    link.conn.disconnect().unwrap();
    let err = link.conn.write_read(b"late", 64).unwrap_err();
    assert_eq!(err.code(), StatusCode::NotConnected);
}

#[test]
fn reconnect_requeries_capabilities() {
    let link = TestLink::connect_sync().unwrap();
    let first = link.conn.host_capabilities().unwrap();
    link.conn.disconnect().unwrap();

    // Host changes its story between sessions.
    link.host.set_caps(hostlink::HostCaps::INJECT);
    let id = link.conn.connect(PROTOCOL_MAJOR, PROTOCOL_MINOR).unwrap();
    assert!(link.conn.client_id().is_some());
    assert_ne!(id, link.client, "host handed out a fresh client id");

    let second = link.conn.host_capabilities().unwrap();
    assert_ne!(first, second);
    assert_eq!(second.caps, hostlink::HostCaps::INJECT);
}

#[test]
fn double_connect_is_rejected() {
    let link = TestLink::connect_sync().unwrap();
    let err = link
        .conn
        .connect(PROTOCOL_MAJOR, PROTOCOL_MINOR)
        .unwrap_err();
    assert_eq!(err.code(), StatusCode::AlreadyConnected);
}

#[test]
fn disconnect_without_connect_fails() {
    let host = MockHost::new();
    let conn = Connection::new(host, ConnectorConfig::default()).unwrap();
    assert_eq!(
        conn.disconnect().unwrap_err().code(),
        StatusCode::NotConnected
    );
}

#[test]
fn host_heartbeat_is_observed() {
    let link = TestLink::connect_sync().unwrap();
    // map_region and every transact heartbeat the host side.
    link.conn.write_read(b"ping", 64).unwrap();
    assert!(link.conn.host_alive(Duration::from_secs(5)));
}

#[test]
fn exactly_once_across_mixed_outcomes() {
    let link = TestLink::connect_accel().unwrap();

    // Normal call.
    link.conn.write_read(b"one", 256).unwrap();
    // Overflow-retried call.
    link.host.set_fixed_response(vec![7; 2000]);
    link.conn.write_read(b"two", 64).unwrap();
    // Failed call.
    link.host.fail_completions(true);
    link.conn.write_read(b"three", 256).unwrap_err();
    link.host.fail_completions(false);
    // Fallback call.
    link.host.reject_submissions(true);
    link.host.set_fixed_response(b"four".to_vec());
    link.conn.write_read(b"four", 256).unwrap();

    let stats = link.conn.stats();
    assert_eq!(stats.calls, 4);
    assert_eq!(stats.completions, 4, "one completion per call, no more");
}
