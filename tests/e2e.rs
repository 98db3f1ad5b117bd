//! End-to-end scenarios over real sockets: a server on an ephemeral
//! port, real clients, and (for the resume path) a byte-level relay the
//! test severs mid-stream.

use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use seqstream::{
    sequence_checksum, BackoffPolicy, Client, ClientError, ClientParams, FixedSequenceSource,
    InMemoryStore, InMemoryStoreParams, RandomSequenceSource, SequenceSource, Server,
    ServerConfig, ServerHandle, SessionStore, SharedSessionStore,
};

struct TestServer {
    handle: ServerHandle,
    store: SharedSessionStore<InMemoryStore>,
    addr: SocketAddr,
}

fn start_server(
    interval: Duration,
    expire_after_idle_secs: u64,
    source: Arc<dyn SequenceSource>,
) -> TestServer {
    let store = SharedSessionStore::new(InMemoryStore::new(InMemoryStoreParams {
        expire_after_idle_secs,
    }));
    let server = Server::new(
        store.clone(),
        ServerConfig {
            listen_addr: "127.0.0.1:0".to_string(),
            sequence_message_interval: interval,
        },
        source,
    );
    let handle = server.start().expect("server start");
    let addr = handle.local_addr();
    TestServer {
        handle,
        store,
        addr,
    }
}

fn client_params(addr: SocketAddr, client_id: &str, sequence_count: Option<u32>) -> ClientParams {
    ClientParams {
        server_host: addr.ip().to_string(),
        server_port: addr.port(),
        sequence_count,
        max_reconnect_attempts: 50,
        backoff: BackoffPolicy {
            base: Duration::from_millis(10),
            max: Duration::from_millis(100),
        },
        override_client_id: Some(client_id.to_string()),
        ..ClientParams::default()
    }
}

fn run_to_result(params: ClientParams) -> seqstream::RunResult {
    let mut client = Client::new(params);
    client.connect().expect("client connect");
    let result = client.result();
    client.shutdown();
    result
}

#[test]
fn s1_happy_path_small_sequence() {
    let server = start_server(
        Duration::from_millis(1),
        30,
        Arc::new(FixedSequenceSource::new(vec![1, 2, 3])),
    );

    let result = run_to_result(client_params(server.addr, "s1-client", Some(3)));

    assert_eq!(result.error, None);
    assert!(result.success);
    assert_eq!(
        result.checksum,
        "0a0a9f2a6772942557ab5355d76af442f8f65e01"
    );
    assert_eq!(
        result.server_checksum.as_deref(),
        Some("0a0a9f2a6772942557ab5355d76af442f8f65e01")
    );

    // Completion means every index was acknowledged. The final ack can
    // still be in flight when the client reports, so poll briefly.
    assert!(wait_until_fully_acknowledged(&server.store, "s1-client"));

    server.handle.shutdown();
}

#[test]
fn s2_missing_client_id_closes_4002() {
    let server = start_server(
        Duration::from_millis(1),
        30,
        Arc::new(RandomSequenceSource),
    );

    let result = run_to_result(client_params(server.addr, "", Some(3)));

    assert!(!result.success);
    match result.error {
        Some(ClientError::ServerClose { code, reason, .. }) => {
            assert_eq!(code, 4002);
            assert_eq!(reason, "missing client id");
        }
        other => panic!("expected 4002 close, got {other:?}"),
    }

    server.handle.shutdown();
}

#[test]
fn s3_invalid_sequence_count_closes_4003() {
    let server = start_server(
        Duration::from_millis(1),
        30,
        Arc::new(RandomSequenceSource),
    );

    let result = run_to_result(client_params(server.addr, "s3-client", Some(0xFFFF1)));

    match result.error {
        Some(ClientError::ServerClose { code, reason, .. }) => {
            assert_eq!(code, 4003);
            assert!(reason.contains("less than or equal to 0xffff"), "{reason}");
        }
        other => panic!("expected 4003 close, got {other:?}"),
    }

    server.handle.shutdown();
}

#[test]
fn s4_invalid_last_received_closes_4004() {
    let server = start_server(
        Duration::from_millis(1),
        30,
        Arc::new(RandomSequenceSource),
    );

    let result = run_to_result(ClientParams {
        send_last_received_index: true,
        override_last_received: Some(0xFFFF2),
        ..client_params(server.addr, "s4-client", Some(3))
    });

    match result.error {
        Some(ClientError::ServerClose { code, .. }) => assert_eq!(code, 4004),
        other => panic!("expected 4004 close, got {other:?}"),
    }

    server.handle.shutdown();
}

#[test]
fn s5_concurrent_clients_do_not_cross_contaminate() {
    let server = start_server(
        Duration::from_millis(1),
        60,
        Arc::new(RandomSequenceSource),
    );

    let handles: Vec<_> = (0..30)
        .map(|index| {
            let addr = server.addr;
            thread::spawn(move || {
                let client_id = format!("s5-client-{index}");
                let result = run_to_result(client_params(addr, &client_id, Some(200)));
                (client_id, result)
            })
        })
        .collect();

    let mut store = server.store.clone();
    for handle in handles {
        let (client_id, result) = handle.join().expect("client thread");
        assert_eq!(result.error, None, "{client_id}");
        assert!(result.success, "{client_id}");

        // The locally received values hash to the session's own sequence.
        let view = store.get(&client_id).expect("session");
        assert_eq!(result.checksum, sequence_checksum(view.sequence()), "{client_id}");
    }

    server.handle.shutdown();
}

#[test]
fn s6_resume_after_midstream_disconnect() {
    let sequence: Vec<u32> = (0..40u32).map(|value| value * 3 + 7).collect();
    let expected_checksum = sequence_checksum(&sequence);
    let server = start_server(
        Duration::from_millis(5),
        60,
        Arc::new(FixedSequenceSource::new(sequence.clone())),
    );

    // The client dials a relay; the first relayed connection is severed
    // mid-stream to force an abnormal transport loss.
    let relay_addr = start_severing_relay(server.addr, Duration::from_millis(80));

    let result = run_to_result(ClientParams {
        send_last_received_index: true,
        ..client_params(relay_addr, "s6-client", Some(40))
    });

    assert_eq!(result.error, None);
    assert!(result.success);
    assert_eq!(result.checksum, expected_checksum);
    assert_eq!(result.server_checksum.as_deref(), Some(expected_checksum.as_str()));

    assert!(wait_until_fully_acknowledged(&server.store, "s6-client"));

    server.handle.shutdown();
}

#[test]
fn zero_length_sequence_completes_immediately() {
    let server = start_server(
        Duration::from_millis(1),
        30,
        Arc::new(FixedSequenceSource::new(Vec::new())),
    );

    let result = run_to_result(client_params(server.addr, "empty-client", Some(0)));

    // No terminal frame exists; the server just closes 1000.
    assert_eq!(result.error, None);
    assert_eq!(result.checksum, sequence_checksum(&[]));
    assert_eq!(result.server_checksum, None);

    server.handle.shutdown();
}

#[test]
fn max_length_sequence_completes_without_overflow() {
    let server = start_server(Duration::ZERO, 120, Arc::new(RandomSequenceSource));

    let result = run_to_result(client_params(server.addr, "max-client", Some(0xFFFF)));

    assert_eq!(result.error, None);
    assert!(result.success);
    let view = server.store.clone().get("max-client").expect("session");
    assert_eq!(view.sequence().len(), 0xFFFF);
    assert_eq!(result.checksum, sequence_checksum(view.sequence()));

    server.handle.shutdown();
}

#[test]
fn last_received_at_final_index_gets_only_the_terminal_frame() {
    let sequence = vec![2u32, 4, 6, 8, 10];
    let full_checksum = sequence_checksum(&sequence);
    let server = start_server(
        Duration::from_millis(1),
        30,
        Arc::new(FixedSequenceSource::new(sequence)),
    );

    let result = run_to_result(ClientParams {
        send_last_received_index: true,
        override_last_received: Some(4),
        ..client_params(server.addr, "terminal-client", Some(5))
    });

    // Only the terminal frame arrived, so this fresh client holds one
    // value and its local checksum cannot match the full sequence.
    assert_eq!(result.checksum, sequence_checksum(&[10]));
    assert_eq!(result.server_checksum.as_deref(), Some(full_checksum.as_str()));
    assert!(!result.success);
    assert!(matches!(
        result.error,
        Some(ClientError::ChecksumMismatch { .. })
    ));

    server.handle.shutdown();
}

#[test]
fn expired_session_is_rejected_with_4001() {
    let server = start_server(
        Duration::from_millis(1),
        0,
        Arc::new(RandomSequenceSource),
    );

    server
        .store
        .clone()
        .initialise("stale-client", vec![1, 2, 3])
        .expect("initialise");
    thread::sleep(Duration::from_millis(1_200));

    let result = run_to_result(client_params(server.addr, "stale-client", Some(3)));

    match result.error {
        Some(ClientError::ServerClose { code, reason, .. }) => {
            assert_eq!(code, 4001);
            assert_eq!(reason, "session has expired");
        }
        other => panic!("expected 4001 close, got {other:?}"),
    }

    server.handle.shutdown();
}

fn wait_until_fully_acknowledged(
    store: &SharedSessionStore<InMemoryStore>,
    client_id: &str,
) -> bool {
    let mut store = store.clone();
    for _ in 0..200 {
        let view = store.get(client_id).expect("session");
        if view.acknowledged().iter().all(|acked| *acked) {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    false
}

/// TCP relay in front of `target`. The first relayed connection is cut
/// after `sever_after`; later connections pass through untouched.
fn start_severing_relay(target: SocketAddr, sever_after: Duration) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").expect("relay bind");
    let addr = listener.local_addr().expect("relay addr");

    thread::spawn(move || {
        let mut first = true;
        for inbound in listener.incoming() {
            let Ok(inbound) = inbound else { break };
            let Ok(outbound) = TcpStream::connect(target) else {
                let _ = inbound.shutdown(Shutdown::Both);
                continue;
            };

            if first {
                first = false;
                let inbound_cut = inbound.try_clone().expect("clone");
                let outbound_cut = outbound.try_clone().expect("clone");
                thread::spawn(move || {
                    thread::sleep(sever_after);
                    let _ = inbound_cut.shutdown(Shutdown::Both);
                    let _ = outbound_cut.shutdown(Shutdown::Both);
                });
            }

            let inbound_read = inbound.try_clone().expect("clone");
            let outbound_read = outbound.try_clone().expect("clone");
            thread::spawn(move || pipe(inbound_read, outbound));
            thread::spawn(move || pipe(outbound_read, inbound));
        }
    });

    addr
}

fn pipe(mut from: TcpStream, mut to: TcpStream) {
    let mut buf = [0u8; 4096];
    loop {
        match from.read(&mut buf) {
            Ok(0) | Err(_) => {
                let _ = to.shutdown(Shutdown::Both);
                break;
            }
            Ok(n) => {
                if to.write_all(&buf[..n]).is_err() {
                    let _ = from.shutdown(Shutdown::Both);
                    break;
                }
            }
        }
    }
}
