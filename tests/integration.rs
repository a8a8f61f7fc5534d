//! Integration tests for minimeta: server nodes and client agents over HTTP

use minimeta::common::resources::{FixedProbe, ResourceUsage};
use minimeta::common::{
    attrs, find_available_port, keys, AttrMap, ClientConfig, MetaNamespace, MetaValue,
    ServerConfig, WalSyncPolicy,
};
use minimeta::{ClusterClient, ClusterServer, Error};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::time::Instant;

const WAIT: Duration = Duration::from_secs(10);

fn server_config(dir: &TempDir) -> ServerConfig {
    ServerConfig {
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        data_dir: dir.path().to_path_buf(),
        wal_sync: WalSyncPolicy::Never,
        election_timeout_ms: 150,
        heartbeat_interval_ms: 30,
        meta_publish_interval_ms: 100,
        ..ServerConfig::default()
    }
}

fn probe() -> Arc<FixedProbe> {
    Arc::new(FixedProbe(ResourceUsage {
        cpu_capacity: 8.0,
        cpu_used: 2.0,
        memory_capacity: 16 << 30,
        memory_used: 4 << 30,
    }))
}

fn client_for(servers: Vec<String>) -> ClusterClient {
    let config = ClientConfig {
        heartbeat_interval_ms: 100,
        retry_backoff_ms: 20,
        ..ClientConfig::new(servers)
    };
    ClusterClient::with_probe(config, probe()).unwrap()
}

/// Poll `check` until it returns true or `WAIT` elapses
async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + WAIT;
    while !check().await {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

fn process_registration() -> AttrMap {
    attrs([
        (keys::SERVER_HOST, MetaValue::from("127.0.0.1")),
        (keys::SERVER_PORT, MetaValue::Int(6000)),
        (keys::INTP_TSERVER_HOST, MetaValue::from("127.0.0.1")),
        (keys::INTP_TSERVER_PORT, MetaValue::Int(7000)),
        (keys::CPU_CAPACITY, MetaValue::Float(8.0)),
        (keys::CPU_USED, MetaValue::Int(10)),
        (keys::MEMORY_CAPACITY, MetaValue::Int(16 << 30)),
        (keys::MEMORY_USED, MetaValue::Int(1 << 30)),
    ])
}

#[tokio::test]
async fn test_single_node_cluster_meta() {
    let dir = TempDir::new().unwrap();
    let server = ClusterServer::start_with_probe(server_config(&dir), probe())
        .await
        .unwrap();
    let client = client_for(vec![server.identity().addr()]);

    let (server, client) = (&server, &client);
    eventually("server leadership", move || async move {
        server.is_cluster_leader() && server.raft_initialized()
    })
    .await;
    eventually("client sees a leader", move || async move {
        client.raft_initialized().await
    })
    .await;
    assert!(client.is_cluster_leader().await);

    // The server publishes itself under its node name
    let node_name = client.cluster_node_name().await.unwrap();
    assert_eq!(node_name, server.cluster_node_name());
    let node_name = &node_name;
    eventually("server meta", move || async move {
        let meta = client
            .get_cluster_meta(MetaNamespace::ServerMeta, "")
            .await
            .unwrap();
        meta.get(node_name).is_some_and(|attrs| !attrs.is_empty())
    })
    .await;
    let online = client.online_servers().await.unwrap();
    assert!(online.contains_key(node_name));
    assert_eq!(client.idle_server().await.unwrap().unwrap().0, *node_name);

    // Process meta round trip through consensus
    client
        .put_cluster_meta(MetaNamespace::ProcessMeta, "W1", process_registration())
        .await
        .unwrap();
    let meta = client
        .get_cluster_meta(MetaNamespace::ProcessMeta, "W1")
        .await
        .unwrap();
    let entry = &meta["W1"];
    assert_eq!(entry[keys::INTP_TSERVER_PORT], MetaValue::Int(7000));

    // Puts merge into the existing entry
    client
        .put_cluster_meta(
            MetaNamespace::ProcessMeta,
            "W1",
            attrs([(keys::CPU_USED, 20i64)]),
        )
        .await
        .unwrap();
    let meta = client
        .get_cluster_meta(MetaNamespace::ProcessMeta, "W1")
        .await
        .unwrap();
    assert_eq!(meta["W1"][keys::CPU_USED], MetaValue::Int(20));
    assert_eq!(meta["W1"][keys::SERVER_PORT], MetaValue::Int(6000));

    // Missing keys read as empty, not as an error
    assert!(client
        .get_cluster_meta(MetaNamespace::ProcessMeta, "nope")
        .await
        .unwrap()
        .is_empty());

    server.shutdown().await;
}

#[tokio::test]
async fn test_agent_registers_heartbeats_and_deregisters() {
    let dir = TempDir::new().unwrap();
    let server = ClusterServer::start_with_probe(server_config(&dir), probe())
        .await
        .unwrap();
    server.wait_ready(WAIT).await.unwrap();
    let client = client_for(vec![server.identity().addr()]);
    let server = &server;

    client.start("W1", process_registration()).await.unwrap();
    let registered = server
        .get_cluster_meta(MetaNamespace::ProcessMeta, "W1")
        .await
        .unwrap();
    assert_eq!(registered["W1"][keys::CPU_USED], MetaValue::Int(10));
    assert_eq!(registered["W1"][keys::MEMORY_USED], MetaValue::Int(1 << 30));
    let first = registered["W1"][keys::LATEST_HEARTBEAT].as_i64().unwrap();

    eventually("a later heartbeat", move || async move {
        let meta = server
            .get_cluster_meta(MetaNamespace::ProcessMeta, "W1")
            .await
            .unwrap();
        meta["W1"][keys::LATEST_HEARTBEAT].as_i64().unwrap() > first
    })
    .await;
    let meta = server
        .get_cluster_meta(MetaNamespace::ProcessMeta, "W1")
        .await
        .unwrap();
    assert_eq!(meta["W1"][keys::STATUS], MetaValue::from(keys::ONLINE_STATUS));
    assert_eq!(meta["W1"][keys::INTP_TSERVER_HOST], MetaValue::from("127.0.0.1"));
    assert_eq!(meta["W1"][keys::CPU_USED], MetaValue::Int(10));

    client.shutdown().await;
    eventually("deregistration", move || async move {
        server
            .get_cluster_meta(MetaNamespace::ProcessMeta, "W1")
            .await
            .unwrap()
            .is_empty()
    })
    .await;

    server.shutdown().await;
}

#[tokio::test]
async fn test_registered_values_survive_heartbeats() {
    let dir = TempDir::new().unwrap();
    let server = ClusterServer::start_with_probe(server_config(&dir), probe())
        .await
        .unwrap();
    server.wait_ready(WAIT).await.unwrap();
    let client = client_for(vec![server.identity().addr()]);
    let client = &client;

    client
        .start("W1", attrs([(keys::CPU_USED, MetaValue::Int(10))]))
        .await
        .unwrap();
    let meta = client
        .get_cluster_meta(MetaNamespace::ProcessMeta, "W1")
        .await
        .unwrap();
    assert_eq!(meta["W1"][keys::CPU_USED], MetaValue::Int(10));
    // Unset resource keys come from the sampler
    assert_eq!(meta["W1"][keys::CPU_CAPACITY], MetaValue::Float(8.0));

    client
        .put_cluster_meta(
            MetaNamespace::ProcessMeta,
            "W1",
            attrs([(keys::CPU_USED, MetaValue::Int(20))]),
        )
        .await
        .unwrap();
    let first = client
        .get_cluster_meta(MetaNamespace::ProcessMeta, "W1")
        .await
        .unwrap()["W1"][keys::LATEST_HEARTBEAT]
        .as_i64()
        .unwrap();

    // Two heartbeats later the explicit value still stands
    let mut last = first;
    for _ in 0..2 {
        let seen = last;
        eventually("a later heartbeat", move || async move {
            let meta = client
                .get_cluster_meta(MetaNamespace::ProcessMeta, "W1")
                .await
                .unwrap();
            meta["W1"][keys::LATEST_HEARTBEAT].as_i64().unwrap() > seen
        })
        .await;
        let meta = client
            .get_cluster_meta(MetaNamespace::ProcessMeta, "W1")
            .await
            .unwrap();
        assert_eq!(meta["W1"][keys::CPU_USED], MetaValue::Int(20));
        last = meta["W1"][keys::LATEST_HEARTBEAT].as_i64().unwrap();
    }

    client.shutdown().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_stale_process_is_evicted() {
    let dir = TempDir::new().unwrap();
    let config = ServerConfig {
        heartbeat_timeout_ms: 400,
        monitor_interval_ms: 50,
        ..server_config(&dir)
    };
    let server = ClusterServer::start_with_probe(config, probe()).await.unwrap();
    server.wait_ready(WAIT).await.unwrap();
    let server = &server;

    let mut registration = process_registration();
    registration.insert(
        keys::LATEST_HEARTBEAT.into(),
        MetaValue::Int(minimeta::common::timestamp_now_millis()),
    );
    server
        .put_cluster_meta(MetaNamespace::ProcessMeta, "W1", registration)
        .await
        .unwrap();
    // No heartbeat: never judged stale
    server
        .put_cluster_meta(MetaNamespace::ProcessMeta, "W2", process_registration())
        .await
        .unwrap();

    eventually("eviction of W1", move || async move {
        server
            .get_cluster_meta(MetaNamespace::ProcessMeta, "W1")
            .await
            .unwrap()
            .is_empty()
    })
    .await;
    assert!(!server
        .get_cluster_meta(MetaNamespace::ProcessMeta, "W2")
        .await
        .unwrap()
        .is_empty());

    // The server keeps publishing, so it stays online
    let own = server
        .get_cluster_meta(MetaNamespace::ServerMeta, server.cluster_node_name())
        .await
        .unwrap();
    assert_eq!(
        own[server.cluster_node_name()][keys::STATUS],
        MetaValue::from(keys::ONLINE_STATUS)
    );
    assert!(server.render_metrics().contains("evictions_total"));

    server.shutdown().await;
}

#[tokio::test]
async fn test_three_node_cluster_with_client_failover() {
    let ports: Vec<u16> = (0..3).map(|_| find_available_port().unwrap()).collect();
    let peers: Vec<String> = ports.iter().map(|p| format!("127.0.0.1:{}", p)).collect();
    let dirs: Vec<TempDir> = (0..3).map(|_| TempDir::new().unwrap()).collect();

    let mut servers = Vec::new();
    for (port, dir) in ports.iter().zip(&dirs) {
        let config = ServerConfig {
            bind_addr: format!("127.0.0.1:{}", port).parse().unwrap(),
            peers: peers.clone(),
            ..server_config(dir)
        };
        servers.push(ClusterServer::start_with_probe(config, probe()).await.unwrap());
    }
    for server in &servers {
        server.wait_ready(WAIT).await.unwrap();
    }

    // Every server publishes its own entry
    let client = client_for(peers.clone());
    let client = &client;
    eventually("three online servers", move || async move {
        client
            .online_servers()
            .await
            .map(|online| online.len() == 3)
            .unwrap_or(false)
    })
    .await;

    // Writes through a follower are redirected to the leader
    let leader = servers
        .iter()
        .position(|s| s.is_cluster_leader())
        .unwrap();
    let follower = (leader + 1) % 3;
    let via_follower = client_for(vec![peers[follower].clone()]);
    via_follower
        .put_cluster_meta(MetaNamespace::ProcessMeta, "W1", process_registration())
        .await
        .unwrap();
    assert_eq!(via_follower.target(), peers[leader]);
    let meta = via_follower
        .get_cluster_meta(MetaNamespace::ProcessMeta, "W1")
        .await
        .unwrap();
    assert!(!meta.is_empty());

    // Lose the leader; the client rotates to the survivors
    servers[leader].shutdown().await;
    via_follower
        .put_cluster_meta(
            MetaNamespace::ProcessMeta,
            "W1",
            attrs([(keys::CPU_USED, 30i64)]),
        )
        .await
        .unwrap();
    let survivor = &servers[follower];
    eventually("replicated update", move || async move {
        survivor
            .get_cluster_meta(MetaNamespace::ProcessMeta, "W1")
            .await
            .map(|m| m["W1"][keys::CPU_USED] == MetaValue::Int(30))
            .unwrap_or(false)
    })
    .await;

    for (i, server) in servers.iter().enumerate() {
        if i != leader {
            server.shutdown().await;
        }
    }
}

#[tokio::test]
async fn test_client_gives_up_without_servers() {
    let port = find_available_port().unwrap();
    let client = ClusterClient::new(ClientConfig {
        request_timeout_ms: 500,
        max_retries: 2,
        retry_backoff_ms: 10,
        ..ClientConfig::new(vec![format!("127.0.0.1:{}", port)])
    })
    .unwrap();
    let err = client
        .put_cluster_meta(MetaNamespace::ProcessMeta, "W1", process_registration())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ConsensusUnavailable(_)), "{:?}", err);
}
