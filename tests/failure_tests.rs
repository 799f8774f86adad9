/// Failure tests
///
/// Requests that can only arrive through misuse break a server invariant.
/// The process then stops for good. Later requests are refused and shutdown
/// reports the failure.
/// Run with: cargo test --test failure_tests
mod common;

use common::*;
use passthrough_server::{ServerError, ServerMessage};

fn assert_worker_failed(node: &mut Node, detail: &str) {
    match node.server.shutdown() {
        Err(ServerError::WorkerFailed(message)) => {
            assert!(message.contains(detail), "unexpected failure: {}", message)
        }
        other => panic!("expected WorkerFailed, got {:?}", other),
    }
    // The failure is reported once; afterwards the process is just down.
    assert!(matches!(node.server.shutdown(), Err(ServerError::NotRunning)));
    assert!(matches!(node.server.snapshot(), Err(ServerError::NotRunning)));
}

#[test]
fn test_releasing_an_unheld_read_lock_stops_the_process() {
    let mut node = active_node("unheld-release");
    let orders = cache("orders");
    let client = node.server.connect(1).unwrap();
    client.create(&orders, CACHE_VERSION, b"orders").unwrap();

    client
        .send(ServerMessage::Release {
            entity: orders.clone(),
            client_instance_id: 9,
        })
        .unwrap();
    wait_until_stopped(&node.server);

    assert!(matches!(
        client.send(ServerMessage::Destroy { entity: orders.clone() }),
        Err(ServerError::NotRunning)
    ));
    assert!(matches!(node.server.connect(2), Err(ServerError::NotRunning)));
    assert!(matches!(node.server.promote_to_active(), Err(ServerError::Config(_))));
    assert_worker_failed(&mut node, "holds no read lock");
}

#[test]
fn test_reconnect_to_missing_entity_stops_the_process() {
    let mut node = active_node("reconnect-missing");
    let client = node.server.connect(3).unwrap();

    client
        .send(ServerMessage::Reconnect {
            entity: cache("ghost"),
            client_instance_id: 1,
            extended_data: Vec::new(),
        })
        .unwrap();
    wait_until_stopped(&node.server);

    assert!(matches!(
        client.send(ServerMessage::TryAcquireWriteLock { entity: cache("ghost") }),
        Err(ServerError::NotRunning)
    ));
    assert!(node.events.matching("active:reconnect").is_empty());
    assert_worker_failed(&mut node, "reconnect to missing entity");
}

#[test]
fn test_sync_traffic_on_an_active_stops_the_process() {
    let mut node = active_node("sync-on-active");
    let client = node.server.connect(0).unwrap();

    client
        .send(ServerMessage::SyncEntityStart {
            entity: cache("orders"),
            version: CACHE_VERSION,
            configuration: b"orders".to_vec(),
        })
        .unwrap();
    wait_until_stopped(&node.server);

    assert!(matches!(
        client.send(ServerMessage::SyncEntityEnd { entity: cache("orders") }),
        Err(ServerError::NotRunning)
    ));
    assert_worker_failed(&mut node, "not accepted by active server");
}

#[test]
fn test_fetch_on_a_passive_stops_the_process() {
    let mut node = passive_node("fetch-on-passive");
    let client = node.server.connect(4).unwrap();

    client
        .send(ServerMessage::Fetch {
            entity: cache("orders"),
            client_instance_id: 1,
            version: CACHE_VERSION,
        })
        .unwrap();
    wait_until_stopped(&node.server);

    assert!(matches!(node.server.connect(5), Err(ServerError::NotRunning)));
    assert_worker_failed(&mut node, "not accepted by passive server");
}
