//! Shared helpers for integration tests.

use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use std::time::Duration;

use ripple_store::client::Coordinator;
use ripple_store::{
    client_handler, spawn_embedded_node_from_config, EmbeddedNode, EmbeddedNodeConfig,
};
use tokio_util::sync::CancellationToken;

/// Deadline for cluster formation and end-to-end round-trips.
pub const TEST_DEADLINE: Duration = Duration::from_secs(20);

/// Pick an available local port by binding to port 0.
pub fn pick_free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind ephemeral port");
    listener.local_addr().expect("local addr").port()
}

/// A cluster of embedded replicas plus their storage directories.
pub struct TestCluster {
    pub nodes: Vec<EmbeddedNode>,
    pub members: Vec<String>,
    pub cancel: CancellationToken,
    _dirs: Vec<tempfile::TempDir>,
}

impl TestCluster {
    /// Start `n` replicas on fresh ports with the given view change period.
    pub async fn start(n: usize, view_change_period: Duration) -> Self {
        let ports: Vec<u16> = (0..n).map(|_| pick_free_port()).collect();
        let members: Vec<String> = ports
            .iter()
            .map(|port| format!("127.0.0.1:{port}"))
            .collect();
        let cluster = members.join(",");

        let mut nodes = Vec::with_capacity(n);
        let mut dirs = Vec::with_capacity(n);
        for port in &ports {
            let dir = tempfile::tempdir().expect("tempdir");
            let listen: SocketAddr = format!("127.0.0.1:{port}").parse().unwrap();
            let mut config =
                EmbeddedNodeConfig::new(cluster.clone(), listen, dir.path().to_path_buf());
            config.view_change_period = view_change_period;
            config.timeout = Duration::from_secs(2);
            config.request_timeout = Duration::from_secs(2);
            let node = spawn_embedded_node_from_config(&config)
                .await
                .expect("spawn node");
            nodes.push(node);
            dirs.push(dir);
        }

        let cluster = Self {
            nodes,
            members,
            cancel: CancellationToken::new(),
            _dirs: dirs,
        };
        cluster.wait_for_mesh().await;
        cluster
    }

    /// Wait until every node tracks every other node as a peer.
    async fn wait_for_mesh(&self) {
        let expected = self.nodes.len().saturating_sub(1);
        for node in &self.nodes {
            let engine = node.engine();
            let id = node.self_id().to_string();
            wait_for(&format!("{id} to see {expected} peers"), || {
                engine.peers_snapshot().len() >= expected
            })
            .await;
        }
    }

    /// Connect a coordinator to every member.
    pub async fn client(&self) -> Arc<Coordinator> {
        let coordinator = Coordinator::connect(
            &self.members,
            client_handler(),
            Duration::from_secs(2),
            Duration::from_secs(5),
            &self.cancel,
        )
        .await
        .expect("connect client");
        Arc::new(coordinator)
    }

    pub async fn shutdown(self) {
        self.cancel.cancel();
        for node in self.nodes {
            let _ = node.shutdown().await;
        }
    }
}

/// Poll `condition` until it holds or the test deadline passes.
pub async fn wait_for(what: &str, condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + TEST_DEADLINE;
    loop {
        if condition() {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
