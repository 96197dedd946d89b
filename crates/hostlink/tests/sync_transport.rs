//! Data-plane behavior over the synchronous backend.

use hostlink::{ConnectorConfig, HostCaps, RegionConfig, StatusCode};
use hostlink_testkit::{MockHost, TestLink};

#[test]
fn write_read_echoes_byte_for_byte() {
    let link = TestLink::connect_sync().unwrap();

    // Everything from empty up to the initial write-back sizing, plus one
    // size exceeding it to trigger cache growth.
    for size in [0usize, 1, 7, 8, 63, 255, 999, 1000, 4096] {
        let payload: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
        let reply = link.conn.write_read(&payload, 1000).unwrap();
        assert_eq!(reply, payload, "size {}", size);
    }

    let stats = link.conn.stats();
    assert_eq!(stats.calls, 9);
    assert_eq!(stats.completions, 9);
}

#[test]
fn oversized_response_is_recovered_with_one_completion() {
    let link = TestLink::connect_sync().unwrap();
    link.host.set_fixed_response(vec![0xEE; 4096]);

    // 64-byte request, 4096-byte response, 1000-byte write-back buffer.
    let reply = link.conn.write_read(&[b'x'; 64], 1000).unwrap();
    assert_eq!(reply.len(), 4096);
    assert!(reply.iter().all(|b| *b == 0xEE));

    let stats = link.conn.stats();
    assert_eq!(stats.calls, 1);
    assert_eq!(stats.completions, 1, "exactly one visible completion");
    assert_eq!(stats.overflow_retries, 1);
    // Nothing left parked on the host.
    assert_eq!(link.host.pending_responses(link.client.get()), 0);
}

#[test]
fn cache_growth_is_monotonic() {
    let link = TestLink::connect_sync().unwrap();

    // Grow the cache to 4096 via an overflow retry.
    link.host.set_fixed_response(vec![1; 4096]);
    link.conn.write_read(b"grow", 1000).unwrap();
    assert_eq!(link.conn.stats().overflow_retries, 1);

    // A slightly smaller response with a much smaller hint must reuse the
    // grown buffer: no second retry means the cache never shrank.
    link.host.set_fixed_response(vec![2; 4095]);
    let reply = link.conn.write_read(b"again", 10).unwrap();
    assert_eq!(reply.len(), 4095);
    assert_eq!(link.conn.stats().overflow_retries, 1);
}

#[test]
fn ring_streams_records_and_falls_back_on_overflow() {
    let host = MockHost::new();
    let config = ConnectorConfig {
        region: RegionConfig {
            ring_bytes: 64,
            ..RegionConfig::default()
        },
        ..ConnectorConfig::default()
    };
    let link = TestLink::connect_sync_with(host, config).unwrap();

    // Let the ring back up.
    link.host.set_drain_on_flush(false);
    for i in 0..8u8 {
        link.conn.write(&[i; 24]).unwrap();
    }
    let stats = link.conn.stats();
    assert!(stats.ring_overflows > 0, "ring never overflowed");
    assert!(stats.records_streamed > 0, "nothing streamed");

    // Overflowed records were written directly; once the host drains
    // again, the backlog comes out of the ring too.
    link.host.set_drain_on_flush(true);
    link.conn.write(&[8; 24]).unwrap();

    let commands = link.host.commands(link.client.get());
    assert_eq!(commands.len(), 9, "every record arrived exactly once");
    let mut seen: Vec<u8> = commands.iter().map(|(_, p)| p[0]).collect();
    seen.sort_unstable();
    assert_eq!(seen, (0..9).collect::<Vec<u8>>());
    for (_, payload) in &commands {
        assert_eq!(payload.len(), 24);
    }
}

#[test]
fn oversized_requests_are_chunked() {
    let link = TestLink::connect_sync().unwrap();
    link.host.set_max_transact_bytes(128);

    let payload: Vec<u8> = (0..1000).map(|i| (i % 241) as u8).collect();
    let reply = link.conn.write_read(&payload, 2048).unwrap();
    assert_eq!(reply, payload);

    let commands = link.host.commands(link.client.get());
    assert_eq!(commands.len(), 1);
    assert_eq!(commands[0].1, payload, "host reassembled the chunks");
}

#[test]
fn chunked_fire_and_forget_write() {
    let link = TestLink::connect_sync().unwrap();
    link.host.set_max_transact_bytes(128);
    // Ring caps records at ring_bytes, so this goes through the chunked
    // direct-write path.
    let payload = vec![0x5A; 100 * 1024];
    link.conn.write(&payload).unwrap();

    let commands = link.host.commands(link.client.get());
    assert_eq!(commands.len(), 1);
    assert_eq!(commands[0].1.len(), payload.len());
}

#[test]
fn inject_targets_another_session() {
    let host = MockHost::new();
    let a = TestLink::connect_sync_with(host.clone(), ConnectorConfig::default()).unwrap();
    let b_conn = hostlink::Connection::new(host.clone(), ConnectorConfig::default()).unwrap();
    let b_client = b_conn
        .connect(hostlink::PROTOCOL_MAJOR, hostlink::PROTOCOL_MINOR)
        .unwrap();

    a.conn.inject(b_client, b"cross-session").unwrap();

    let commands = host.commands(b_client.get());
    assert_eq!(commands.len(), 1);
    assert_eq!(commands[0].1, b"cross-session");
    assert!(host.commands(a.client.get()).is_empty());
}

#[test]
fn version_mismatch_allocates_no_client() {
    let host = MockHost::new();
    host.set_version(2, 0);
    let conn = hostlink::Connection::new(host.clone(), ConnectorConfig::default()).unwrap();

    let err = conn.connect(3, 0).unwrap_err();
    assert_eq!(err.code(), StatusCode::VersionMismatch);
    assert!(conn.client_id().is_none());
    assert_eq!(host.connected_clients(), 0);

    // The attempt is not fatal for the connection object itself.
    host.set_version(3, 0);
    assert!(conn.connect(3, 1).is_ok());
}

#[test]
fn capabilities_are_cached_and_identity_is_bound() {
    let link = TestLink::connect_sync().unwrap();

    let info = link.conn.host_capabilities().unwrap();
    assert!(info.caps.contains(HostCaps::INJECT));
    // Second query answers from the cache.
    assert_eq!(link.conn.host_capabilities().unwrap(), info);

    link.conn.set_process_identity(4242).unwrap();
    assert_eq!(link.host.pid_of(link.client.get()), Some(4242));
}

#[test]
fn read_with_nothing_pending_is_empty() {
    let link = TestLink::connect_sync().unwrap();
    let reply = link.conn.read(512).unwrap();
    assert!(reply.is_empty());
}

#[test]
fn data_plane_requires_connection() {
    let host = MockHost::new();
    let conn = hostlink::Connection::new(host, ConnectorConfig::default()).unwrap();
    let err = conn.write_read(b"hello", 64).unwrap_err();
    assert_eq!(err.code(), StatusCode::NotConnected);
}
