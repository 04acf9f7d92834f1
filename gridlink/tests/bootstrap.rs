//! End-to-end bootstrap tests.
//!
//! Every test starts real nodes on loopback with OS-assigned ports, so they
//! run in parallel without colliding. Certificates are generated on the fly
//! with rcgen; registries are either temp files or a small axum server.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use gridlink::bootstrap::{BootstrapError, BootstrapStage, NodeBootstrap, NodeHandle};
use gridlink::certs::CertError;
use gridlink::node_config::NodeConfig;
use gridlink::peer::{PeerState, Provenance, ReconcileSummary};
use gridlink::registry::SourceStatus;
use gridlink::transport::{Connection, EndpointRole, LocalIdentity};

// ---------------------------------------------------------------------------
// Test Helpers
// ---------------------------------------------------------------------------

/// Minimal raw-transport config on ephemeral loopback ports.
fn raw_config(node_id: &str, extra: &str) -> String {
    format!(
        r#"
node_id = "{node_id}"
service_endpoint = "127.0.0.1:0"
network_endpoints = ["127.0.0.1:0"]
transport = "raw"
rest_api_endpoint = "127.0.0.1:0"
heartbeat = 1
{extra}
"#
    )
}

/// Fast retry settings so backoff behavior is observable in a test.
const FAST_CONNECTOR: &str = r#"
[connector]
connect_timeout_secs = 1
backoff_initial_ms = 20
backoff_max_ms = 2000
backoff_jitter = 0.0
max_attempts = 100
"#;

async fn start(toml: &str) -> Arc<NodeHandle> {
    let config = NodeConfig::from_toml_str(toml).expect("valid config");
    NodeBootstrap::new(config).start().await.expect("node starts")
}

fn network_addr(node: &NodeHandle) -> SocketAddr {
    node.listener_endpoints()
        .iter()
        .find(|b| b.role == EndpointRole::Network)
        .expect("network endpoint bound")
        .local_addr
}

/// A loopback port nothing is listening on.
fn dead_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

async fn eventually<F: Fn() -> bool>(check: F) -> bool {
    for _ in 0..300 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

/// A peer that answers the hello and then never says another word.
async fn mute_peer(node_id: &str) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let identity = LocalIdentity {
        node_id: node_id.to_string(),
        display_name: node_id.to_string(),
        endpoints: vec![],
    };
    tokio::spawn(async move {
        let (tcp, peer_addr) = listener.accept().await.unwrap();
        let mut conn = Connection::new(Box::new(tcp), peer_addr);
        conn.respond(&identity, Duration::from_secs(5)).await.unwrap();
        while conn.recv().await.is_ok() {}
    });
    addr
}

fn write(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, body).unwrap();
    path
}

/// CA plus one leaf signed by it, valid for localhost and 127.0.0.1.
struct TestPki {
    ca: PathBuf,
    cert: PathBuf,
    key: PathBuf,
}

fn generate_pki(dir: &Path) -> TestPki {
    use rcgen::{
        BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose,
        IsCa, KeyPair, KeyUsagePurpose,
    };

    let ca_key = KeyPair::generate().unwrap();
    let mut ca_params = CertificateParams::new(Vec::<String>::new()).unwrap();
    ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    ca_params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    let mut ca_dn = DistinguishedName::new();
    ca_dn.push(DnType::CommonName, "gridlink test ca");
    ca_params.distinguished_name = ca_dn;
    let ca_cert = ca_params.self_signed(&ca_key).unwrap();

    let leaf_key = KeyPair::generate().unwrap();
    let mut leaf_params =
        CertificateParams::new(vec!["localhost".to_string(), "127.0.0.1".to_string()]).unwrap();
    leaf_params.extended_key_usages = vec![
        ExtendedKeyUsagePurpose::ServerAuth,
        ExtendedKeyUsagePurpose::ClientAuth,
    ];
    let mut leaf_dn = DistinguishedName::new();
    leaf_dn.push(DnType::CommonName, "gridlink test node");
    leaf_params.distinguished_name = leaf_dn;
    let leaf_cert = leaf_params.signed_by(&leaf_key, &ca_cert, &ca_key).unwrap();

    TestPki {
        ca: write(dir, "ca.pem", &ca_cert.pem()),
        cert: write(dir, "node.crt", &leaf_cert.pem()),
        key: write(dir, "node.key", &leaf_key.serialize_pem()),
    }
}

fn tls_config(node_id: &str, pki: &TestPki, extra: &str) -> String {
    format!(
        r#"
node_id = "{node_id}"
service_endpoint = "127.0.0.1:0"
network_endpoints = ["127.0.0.1:0"]
transport = "tls"
rest_api_endpoint = "127.0.0.1:0"
heartbeat = 1
ca_certs = '{ca}'
tls_server_cert = '{cert}'
tls_server_key = '{key}'
tls_client_cert = '{cert}'
tls_client_key = '{key}'
{extra}
"#,
        ca = pki.ca.display(),
        cert = pki.cert.display(),
        key = pki.key.display(),
    )
}

// ---------------------------------------------------------------------------
// Startup
// ---------------------------------------------------------------------------

#[tokio::test]
async fn raw_node_without_peers_or_registries_becomes_ready() {
    let node = start(&raw_config("solo", "")).await;

    assert!(node.is_ready());
    assert_eq!(node.stage(), BootstrapStage::Ready);
    assert!(node.peer_status().is_empty());
    assert_eq!(node.listener_addrs().len(), 2);
    assert!(node.listener_addrs().iter().all(|a| a.port() != 0));
    assert!(node.ca_fingerprints().is_empty());

    let status = node.status_report();
    assert_eq!(status.node_id, "solo");
    assert_eq!(status.peers.total, 0);

    node.shutdown().await;
    assert_eq!(node.stage(), BootstrapStage::Stopped);
    assert!(!node.is_ready());
}

#[tokio::test]
async fn tls_with_missing_ca_fails_before_binding() {
    let dir = tempfile::tempdir().unwrap();
    let port = dead_port();
    let toml = format!(
        r#"
node_id = "tls-node"
service_endpoint = "127.0.0.1:{port}"
network_endpoints = ["127.0.0.1:0"]
transport = "tls"
rest_api_endpoint = "127.0.0.1:0"
ca_certs = '{}'
"#,
        dir.path().join("missing-ca.pem").display()
    );
    let config = NodeConfig::from_toml_str(&toml).unwrap();

    let err = NodeBootstrap::new(config).start().await.err().unwrap();
    assert!(matches!(err, BootstrapError::Cert(CertError::NotFound { .. })));
    assert_eq!(err.stage(), BootstrapStage::CertsReady);

    // Nothing was bound: the service port is still free.
    std::net::TcpListener::bind(("127.0.0.1", port)).unwrap();
}

#[tokio::test]
async fn occupied_service_port_is_a_bind_failure() {
    let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = taken.local_addr().unwrap().port();
    let toml = format!(
        r#"
node_id = "n"
service_endpoint = "127.0.0.1:{port}"
network_endpoints = ["127.0.0.1:0"]
transport = "raw"
rest_api_endpoint = "127.0.0.1:0"
"#
    );
    let config = NodeConfig::from_toml_str(&toml).unwrap();
    let err = NodeBootstrap::new(config).start().await.err().unwrap();
    assert_eq!(err.stage(), BootstrapStage::ListenerBound);
}

#[tokio::test]
async fn shutdown_is_idempotent_and_releases_ports() {
    let node = start(&raw_config("stopper", "")).await;
    let addrs = node.listener_addrs();

    node.shutdown().await;
    node.shutdown().await;
    assert_eq!(node.stage(), BootstrapStage::Stopped);

    for addr in addrs {
        std::net::TcpListener::bind(addr).unwrap();
    }
}

// ---------------------------------------------------------------------------
// Registries
// ---------------------------------------------------------------------------

#[tokio::test]
async fn one_unreachable_registry_is_reported_and_node_is_ready() {
    let dir = tempfile::tempdir().unwrap();
    let file = write(
        dir.path(),
        "registry.yaml",
        &format!(
            "- identity: listed-node\n  endpoints: [\"127.0.0.1:{}\"]\n",
            dead_port()
        ),
    );
    let file_uri = url::Url::from_file_path(&file).unwrap().to_string();
    let dead_uri = format!("http://127.0.0.1:{}/registry.yaml", dead_port());

    let extra = format!(
        r#"
registries = ["{dead_uri}", "{file_uri}"]

[resolver]
fetch_timeout_secs = 1
fetch_attempts = 2
retry_initial_ms = 10
"#
    );
    let node = start(&raw_config("partial", &extra)).await;
    assert!(node.is_ready());

    let snapshot = node.registry_snapshot();
    assert_eq!(snapshot.directory.len(), 1);
    let unavailable: Vec<_> = snapshot.unavailable().collect();
    assert_eq!(unavailable.len(), 1);
    assert_eq!(unavailable[0].uri, dead_uri);
    assert_eq!(unavailable[0].attempts, 2);
    assert_eq!(snapshot.sources[1].status, SourceStatus::Available);

    let peer = node.peer_state("listed-node").expect("registry peer tracked");
    assert_eq!(peer.provenance, Provenance::Registry);

    node.shutdown().await;
}

#[tokio::test]
async fn http_registry_is_fetched_and_its_nodes_dialed() {
    use axum::{routing::get, Router};

    let remote = start(&raw_config("remote-x", "")).await;
    let remote_addr = network_addr(&remote);

    let document = format!(
        "- identity: remote-x\n  endpoints: [\"{}\"]\n  display_name: Remote X\n",
        remote_addr
    );
    let app = Router::new().route("/nodes.yaml", get(move || async move { document.clone() }));
    let http = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let http_addr = http.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(http, app).await.unwrap();
    });

    let extra = format!(
        "registries = [\"http://{}/nodes.yaml\"]\n{}",
        http_addr, FAST_CONNECTOR
    );
    let node = start(&raw_config("local", &extra)).await;

    let snapshot = node.registry_snapshot();
    let entry = snapshot.directory.get("remote-x").expect("node resolved");
    assert_eq!(entry.node.display_name.as_deref(), Some("Remote X"));

    assert!(
        eventually(|| node
            .peer_state("remote-x")
            .map_or(false, |p| p.state == PeerState::Connected))
        .await
    );

    node.shutdown().await;
    remote.shutdown().await;
}

// ---------------------------------------------------------------------------
// Peers
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unreachable_peer_backs_off_while_node_stays_ready() {
    let peer = format!("127.0.0.1:{}", dead_port());
    let extra = format!("peers = [\"{peer}\"]\n{FAST_CONNECTOR}");
    let node = start(&raw_config("lonely", &extra)).await;
    assert!(node.is_ready());

    let mut delays = Vec::new();
    let reached = eventually(|| {
        node.peer_state(&peer)
            .map_or(false, |p| p.consecutive_failures >= 4)
    })
    .await;
    assert!(reached);

    for _ in 0..3 {
        if let Some(delay) = node.peer_state(&peer).and_then(|p| p.last_delay) {
            delays.push(delay);
        }
        tokio::time::sleep(Duration::from_millis(150)).await;
    }
    assert!(delays.windows(2).all(|w| w[0] <= w[1]), "{delays:?}");
    assert!(delays.last().unwrap() > &Duration::from_millis(20));

    let record = node.peer_state(&peer).unwrap();
    assert!(record.last_error.is_some());
    assert!(matches!(
        record.state,
        PeerState::Backoff { .. } | PeerState::Connecting | PeerState::Failed { .. }
    ));
    assert!(node.is_ready());

    node.shutdown().await;
}

#[tokio::test]
async fn static_peer_connects_and_is_queryable_by_node_id() {
    let remote = start(&raw_config("node-b", "")).await;
    let extra = format!(
        "peers = [\"{}\"]\n{}",
        network_addr(&remote),
        FAST_CONNECTOR
    );
    let node = start(&raw_config("node-a", &extra)).await;

    assert!(
        eventually(|| node
            .peer_state("node-b")
            .map_or(false, |p| p.state == PeerState::Connected))
        .await
    );
    let record = node.peer_state("node-b").unwrap();
    assert_eq!(record.provenance, Provenance::Static);
    assert_eq!(record.consecutive_failures, 0);
    assert!(remote.listener_stats().accepted >= 1);

    node.shutdown().await;
    remote.shutdown().await;
}

// ---------------------------------------------------------------------------
// TLS
// ---------------------------------------------------------------------------

#[tokio::test]
async fn tls_nodes_authenticate_each_other() {
    let dir = tempfile::tempdir().unwrap();
    let pki = generate_pki(dir.path());

    let remote = start(&tls_config("tls-b", &pki, "")).await;
    assert_eq!(remote.ca_fingerprints().len(), 1);

    let extra = format!(
        "peers = [\"{}\"]\n{}",
        network_addr(&remote),
        FAST_CONNECTOR
    );
    let node = start(&tls_config("tls-a", &pki, &extra)).await;

    assert!(
        eventually(|| node
            .peer_state("tls-b")
            .map_or(false, |p| p.state == PeerState::Connected))
        .await
    );
    assert_eq!(remote.listener_stats().handshake_failures, 0);

    node.shutdown().await;
    remote.shutdown().await;
}

#[tokio::test]
async fn garbage_on_a_tls_listener_is_counted_not_fatal() {
    use tokio::io::AsyncWriteExt;

    let dir = tempfile::tempdir().unwrap();
    let pki = generate_pki(dir.path());
    let node = start(&tls_config("tls-victim", &pki, "")).await;
    let addr = network_addr(&node);

    let mut junk = tokio::net::TcpStream::connect(addr).await.unwrap();
    junk.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();

    assert!(eventually(|| node.listener_stats().handshake_failures >= 1).await);
    assert!(node.is_ready());

    // The listener still accepts connections.
    tokio::net::TcpStream::connect(addr).await.unwrap();
    assert!(eventually(|| node.listener_stats().accepted >= 2).await);

    node.shutdown().await;
}

#[tokio::test]
async fn peer_that_goes_away_is_redialed() {
    let remote = start(&raw_config("node-d", "")).await;
    let extra = format!(
        "peers = [\"{}\"]\n{}",
        network_addr(&remote),
        FAST_CONNECTOR
    );
    let node = start(&raw_config("node-c", &extra)).await;
    assert!(
        eventually(|| node
            .peer_state("node-d")
            .map_or(false, |p| p.state == PeerState::Connected))
        .await
    );

    remote.shutdown().await;

    assert!(
        eventually(|| node
            .peer_state("node-d")
            .map_or(false, |p| p.state != PeerState::Connected && p.last_error.is_some()))
        .await
    );
    // The remote is gone for good, so the redial fails and backoff starts.
    assert!(
        eventually(|| node
            .peer_state("node-d")
            .map_or(false, |p| p.consecutive_failures >= 1))
        .await
    );
    assert!(node.is_ready());

    node.shutdown().await;
}

// ---------------------------------------------------------------------------
// Auto-refresh and shutdown
// ---------------------------------------------------------------------------

#[tokio::test]
async fn auto_refresh_follows_registry_changes() {
    let dir = tempfile::tempdir().unwrap();
    let listed = |id: &str| format!("- identity: {id}\n  endpoints: [\"127.0.0.1:{}\"]\n", dead_port());
    let file = write(dir.path(), "registry.yaml", &listed("first"));
    let file_uri = url::Url::from_file_path(&file).unwrap().to_string();

    let extra = format!(
        "registries = [\"{file_uri}\"]\n{FAST_CONNECTOR}\n[resolver]\nauto_refresh_secs = 1\n"
    );
    let node = start(&raw_config("watcher", &extra)).await;
    assert!(node.peer_state("first").is_some());

    std::fs::write(&file, listed("second")).unwrap();

    assert!(
        eventually(|| node.peer_state("second").is_some() && node.peer_state("first").is_none())
            .await
    );
    assert_eq!(
        node.peer_state("second").unwrap().provenance,
        Provenance::Registry
    );
    assert!(node.registry_snapshot().generation >= 2);

    node.shutdown().await;
}

#[tokio::test]
async fn shutdown_does_not_wait_for_hung_registry_or_silent_peer() {
    use axum::{routing::get, Router};
    use std::sync::atomic::{AtomicBool, Ordering};

    // Answers until `hang` is set, then accepts requests and never replies.
    let hang = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&hang);
    let document = format!(
        "- identity: listed\n  endpoints: [\"127.0.0.1:{}\"]\n",
        dead_port()
    );
    let app = Router::new().route(
        "/nodes.yaml",
        get(move || {
            let flag = Arc::clone(&flag);
            let document = document.clone();
            async move {
                if flag.load(Ordering::SeqCst) {
                    std::future::pending::<()>().await;
                }
                document
            }
        }),
    );
    let http = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let http_addr = http.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(http, app).await.unwrap();
    });

    let mute = mute_peer("mute").await;
    let extra = format!(
        r#"
peers = ["{mute}"]
registries = ["http://{http_addr}/nodes.yaml"]

[connector]
connect_timeout_secs = 8

[resolver]
fetch_timeout_secs = 3
fetch_attempts = 2
auto_refresh_secs = 1
"#
    );
    let node = start(&raw_config("drainer", &extra)).await;
    assert!(node.peer_state("listed").is_some());
    assert!(
        eventually(|| node
            .peer_state("mute")
            .map_or(false, |p| p.state == PeerState::Connected))
        .await
    );

    hang.store(true, Ordering::SeqCst);
    let manual = {
        let node = Arc::clone(&node);
        tokio::spawn(async move { node.refresh_registries().await })
    };
    // The auto-refresh round and a heartbeat are both in flight by now.
    tokio::time::sleep(Duration::from_millis(1500)).await;

    let started = std::time::Instant::now();
    node.shutdown().await;
    let took = started.elapsed();
    assert!(took < Duration::from_secs(1), "shutdown took {took:?}");
    assert_eq!(node.stage(), BootstrapStage::Stopped);

    let summary = tokio::time::timeout(Duration::from_secs(1), manual)
        .await
        .expect("manual refresh abandoned on shutdown")
        .unwrap();
    assert_eq!(summary, ReconcileSummary::default());
}
