//! Integration tests for flood and random-walk search over real TCP nodes.

use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

use peerdisco::{
    DispatcherConfig, FileStore, GatewayConfig, Node, NodeConfig, OverlayConfig, Retries, SearchConfig, Strategy,
};
use tokio::time::timeout;

static PORT_COUNTER: AtomicU16 = AtomicU16::new(32000);

fn next_port() -> u16 {
    PORT_COUNTER.fetch_add(1, Ordering::SeqCst)
}

fn test_config(name: &str, capacity: u32) -> NodeConfig {
    NodeConfig {
        name: name.to_string(),
        bind: format!("127.0.0.1:{}", next_port()),
        capacity,
        overlay: OverlayConfig {
            accept_threshold: 0.0,
            ..OverlayConfig::default()
        },
        gateway: GatewayConfig {
            timeout: Duration::from_millis(500),
            retries: Retries::Limited(1),
        },
        dispatcher: DispatcherConfig {
            idle_poll: Duration::from_millis(10),
        },
        search: SearchConfig {
            poll_interval: Duration::from_millis(150),
            ..SearchConfig::default()
        },
        ..NodeConfig::default()
    }
}

const TEST_TIMEOUT: Duration = Duration::from_secs(10);

async fn wait_for_neighbours(node: &Node, expected: usize) {
    timeout(TEST_TIMEOUT, async {
        loop {
            if node.neighbours().await.expect("nlist failed").len() == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("timed out waiting for neighbours");
}

/// Three nodes of capacity 2 joined by `hello`; A holds "bacon".
async fn bacon_ring() -> (Node, Node, Node) {
    let mut files = FileStore::new();
    files.insert("bacon", "crispy");
    let a = Node::bind(test_config("A", 2), files).await.unwrap();
    let b = Node::bind(test_config("B", 2), FileStore::new()).await.unwrap();
    let c = Node::bind(test_config("C", 2), FileStore::new()).await.unwrap();

    b.hello(&a.identity().address()).await.unwrap();
    c.hello(&b.identity().address()).await.unwrap();

    for node in [&a, &b, &c] {
        wait_for_neighbours(node, 2).await;
    }
    (a, b, c)
}

#[tokio::test]
async fn flood_search_in_ring_finds_holder() {
    let (a, b, c) = bacon_ring().await;

    let outcome = c.search("bacon", 4, Strategy::Flood).await.unwrap();
    assert!(outcome.found);
    assert_eq!(outcome.holder, Some(a.identity().address()));
    assert!(outcome.messages <= 4, "messages = {}", outcome.messages);

    for node in [&a, &b, &c] {
        node.shutdown().await;
    }
}

#[tokio::test]
async fn random_walk_in_ring_finds_holder() {
    let (a, b, c) = bacon_ring().await;

    let outcome = c
        .search("bacon", 4, Strategy::RandomWalk { walkers: 2 })
        .await
        .unwrap();
    assert!(outcome.found);
    assert_eq!(outcome.holder, Some(a.identity().address()));

    for node in [&a, &b, &c] {
        node.shutdown().await;
    }
}

#[tokio::test]
async fn search_held_locally_needs_no_messages() {
    let (a, b, c) = bacon_ring().await;

    let outcome = a.search("bacon", 4, Strategy::Flood).await.unwrap();
    assert!(outcome.found);
    assert_eq!(outcome.holder, Some(a.identity().address()));
    assert_eq!(outcome.messages, 0);

    for node in [&a, &b, &c] {
        node.shutdown().await;
    }
}

#[tokio::test]
async fn isolated_node_finds_nothing() {
    let node = Node::bind(test_config("lonely", 2), FileStore::new()).await.unwrap();

    let outcome = node.search("missing", 3, Strategy::Flood).await.unwrap();
    assert!(!outcome.found);
    assert_eq!(outcome.holder, None);
    assert_eq!(outcome.messages, 0);

    node.shutdown().await;
}

#[tokio::test]
async fn missing_file_in_ring_is_not_found() {
    let (a, b, c) = bacon_ring().await;

    let outcome = c.search("eggs", 2, Strategy::Flood).await.unwrap();
    assert!(!outcome.found);
    assert_eq!(outcome.holder, None);

    for node in [&a, &b, &c] {
        node.shutdown().await;
    }
}

#[tokio::test]
async fn single_walker_on_two_nodes_terminates() {
    let a = Node::bind(test_config("A", 1), FileStore::new()).await.unwrap();
    let b = Node::bind(test_config("B", 1), FileStore::new()).await.unwrap();
    a.hello(&b.identity().address()).await.unwrap();
    wait_for_neighbours(&a, 1).await;
    wait_for_neighbours(&b, 1).await;

    let outcome = timeout(
        TEST_TIMEOUT,
        a.search("missing", 10, Strategy::RandomWalk { walkers: 1 }),
    )
    .await
    .expect("walk did not terminate")
    .unwrap();

    assert!(!outcome.found);
    assert!(outcome.messages <= 2, "messages = {}", outcome.messages);

    a.shutdown().await;
    b.shutdown().await;
}
