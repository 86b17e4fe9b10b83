// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Common test utilities for chat server integration tests.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::codec::{Framed, LinesCodec};
use tokio_util::sync::CancellationToken;

use chathub_server::connection_registry::{ConnectionRegistry, DuplicateLoginPolicy};
use chathub_server::handler::ConnectionDeps;
use chathub_server::metrics::ChatMetrics;
use chathub_server::server;
use chathub_server::storage::{ChatStore, MemoryChatStore};

/// Password of every provisioned test account.
pub const PASSWORD: &str = "hunter2";

/// Accounts provisioned by [`start_server`].
pub const USERS: &[&str] = &["alice", "bob", "carol", "dave"];

/// A running test server.
#[allow(dead_code)]
pub struct TestServer {
    pub addr: SocketAddr,
    pub store: Arc<dyn ChatStore>,
    pub registry: Arc<ConnectionRegistry>,
    pub metrics: ChatMetrics,
    pub shutdown: CancellationToken,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Creates a memory store with fast password hashing and the test accounts.
pub fn create_test_store(extra_users: &[String]) -> Arc<dyn ChatStore> {
    let store = MemoryChatStore::with_hash_iterations(1_000);
    for user in USERS.iter().map(|u| u.to_string()).chain(extra_users.iter().cloned()) {
        store.provision_account(&user, PASSWORD).unwrap();
    }
    Arc::new(store)
}

/// Starts a chat server on an ephemeral port.
pub async fn start_server(policy: DuplicateLoginPolicy, queue_capacity: usize) -> TestServer {
    start_server_with_store(create_test_store(&[]), policy, queue_capacity).await
}

/// Starts a chat server over an existing store.
pub async fn start_server_with_store(
    store: Arc<dyn ChatStore>,
    policy: DuplicateLoginPolicy,
    queue_capacity: usize,
) -> TestServer {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind test listener");
    let addr = listener.local_addr().unwrap();

    let registry = Arc::new(ConnectionRegistry::with_options(policy, queue_capacity));
    let metrics = ChatMetrics::new().unwrap();
    let deps = ConnectionDeps::new(store.clone(), registry.clone(), metrics.clone());
    let shutdown = deps.shutdown.clone();

    tokio::spawn(server::serve(listener, deps, 1000));

    TestServer {
        addr,
        store,
        registry,
        metrics,
        shutdown,
    }
}

/// A line-protocol client.
pub struct TestClient {
    framed: Framed<TcpStream, LinesCodec>,
}

#[allow(dead_code)]
impl TestClient {
    pub async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.expect("connect failed");
        TestClient {
            framed: Framed::new(stream, LinesCodec::new()),
        }
    }

    /// Connects and logs in, asserting success.
    pub async fn login(addr: SocketAddr, user: &str) -> Self {
        let mut client = Self::connect(addr).await;
        client.send(&format!("LOGIN:{}:{}", user, PASSWORD)).await;
        assert_eq!(client.recv().await, "SUCCESS", "login as {} failed", user);
        client
    }

    pub async fn send(&mut self, line: &str) {
        self.framed.send(line.to_string()).await.expect("send failed");
    }

    /// Writes raw bytes, bypassing the line encoder.
    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.framed
            .get_mut()
            .write_all(bytes)
            .await
            .expect("send failed");
    }

    /// Receives the next line, failing the test after 3 seconds.
    pub async fn recv(&mut self) -> String {
        match timeout(Duration::from_secs(3), self.framed.next()).await {
            Ok(Some(Ok(line))) => line,
            Ok(Some(Err(e))) => panic!("read error: {}", e),
            Ok(None) => panic!("connection closed"),
            Err(_) => panic!("timed out waiting for a line"),
        }
    }

    /// Returns a line if one arrives within `wait`.
    pub async fn try_recv(&mut self, wait: Duration) -> Option<String> {
        match timeout(wait, self.framed.next()).await {
            Ok(Some(Ok(line))) => Some(line),
            _ => None,
        }
    }

    /// Asserts the server closes the connection.
    pub async fn expect_closed(&mut self) {
        match timeout(Duration::from_secs(3), self.framed.next()).await {
            Ok(None) | Ok(Some(Err(_))) => {}
            Ok(Some(Ok(line))) => panic!("expected close, got {:?}", line),
            Err(_) => panic!("timed out waiting for close"),
        }
    }

    /// Round-trips a `GET_ALL_UNREAD` so every earlier command from this
    /// client has been processed. Returns the payload.
    pub async fn sync(&mut self) -> String {
        self.send("GET_ALL_UNREAD").await;
        loop {
            let line = self.recv().await;
            if let Some(payload) = line.strip_prefix("ALL_UNREAD:") {
                return payload.to_string();
            }
        }
    }
}

/// Polls until `check` holds or two seconds pass.
#[allow(dead_code)]
pub async fn wait_until<F: Fn() -> bool>(check: F) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
