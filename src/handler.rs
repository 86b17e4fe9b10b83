// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Chat Connection Handler
//!
//! Handles individual client connections: one `LOGIN` line, then a command
//! loop until the peer goes away.

use std::sync::Arc;

use futures_util::{SinkExt, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{AnyDelimiterCodec, AnyDelimiterCodecError, Framed};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::connection_registry::{ConnectionRegistry, Registration, SessionId};
use crate::error::{AuthError, ProtocolError, RegistryError};
use crate::metrics::ChatMetrics;
use crate::protocol::{is_valid_username, Command, HistoryEntry, LoginRequest, Reply};
use crate::rate_limit::SendBudget;
use crate::router::{MessageRouter, Sender};
use crate::storage::ChatStore;
use crate::unread::UnreadTracker;

/// Default maximum length of one protocol line, in bytes.
pub const DEFAULT_MAX_LINE_LENGTH: usize = 64 * 1024;

/// Shared dependencies for handling a chat connection.
#[derive(Clone)]
pub struct ConnectionDeps {
    pub store: Arc<dyn ChatStore>,
    pub registry: Arc<ConnectionRegistry>,
    pub router: Arc<MessageRouter>,
    pub unread: Arc<UnreadTracker>,
    pub metrics: ChatMetrics,
    pub max_line_length: usize,
    /// `MSG` commands per minute per session; 0 disables the limit.
    pub rate_limit_per_min: u32,
    /// Cancelled on server shutdown; every session loop exits.
    pub shutdown: CancellationToken,
}

impl ConnectionDeps {
    /// Wires the router and unread tracker over one store and registry.
    pub fn new(
        store: Arc<dyn ChatStore>,
        registry: Arc<ConnectionRegistry>,
        metrics: ChatMetrics,
    ) -> Self {
        ConnectionDeps {
            router: Arc::new(MessageRouter::new(
                store.clone(),
                registry.clone(),
                metrics.clone(),
            )),
            unread: Arc::new(UnreadTracker::new(store.clone())),
            store,
            registry,
            metrics,
            max_line_length: DEFAULT_MAX_LINE_LENGTH,
            rate_limit_per_min: 0,
            shutdown: CancellationToken::new(),
        }
    }
}

/// State of one authenticated session.
struct Session {
    label: String,
    sender: Sender,
    session_id: SessionId,
    budget: SendBudget,
}

impl Session {
    /// Runs one command and returns the reply line, if the command has one.
    ///
    /// Store calls all happen here, before anything is written to the socket.
    fn handle_line(&mut self, line: &str, deps: &ConnectionDeps) -> Option<Reply> {
        let command = match Command::parse(line) {
            Ok(command) => command,
            Err(e) => {
                warn!("[{}] Dropping line: {}", self.label, e);
                deps.metrics.protocol_errors.inc();
                return None;
            }
        };

        let me = self.sender.username.as_str();
        match command {
            Command::Msg { recipient, text } => {
                if !self.budget.try_consume() {
                    warn!("[{}] Rate limited", self.label);
                    deps.metrics.messages_rejected.inc();
                    return None;
                }
                match deps.router.send(&self.sender, &recipient, &text) {
                    Ok(outcome) => debug!("[{}] MSG to {}: {:?}", self.label, recipient, outcome),
                    Err(e) => warn!("[{}] MSG to {} failed: {}", self.label, recipient, e),
                }
                None
            }
            Command::GetHistory { owner } => {
                if owner != me {
                    debug!(
                        "[{}] GET_HISTORY named {}, answering for session owner",
                        self.label, owner
                    );
                }
                let entries = match deps.store.query_history(me) {
                    Ok(history) => history.iter().map(HistoryEntry::from).collect(),
                    Err(e) => {
                        warn!("[{}] History query failed: {}", self.label, e);
                        Vec::new()
                    }
                };
                Some(Reply::History(entries))
            }
            Command::MarkRead { sender } => {
                deps.unread.mark_read(me, &sender);
                None
            }
            Command::GetUnreadCount { sender } => {
                let count = deps.unread.count_from(me, &sender);
                Some(Reply::UnreadCount { sender, count })
            }
            Command::GetAllUnread => Some(Reply::AllUnread(deps.unread.all_counts(me))),
        }
    }
}

/// Turns one raw frame into a line. A trailing `\r` is dropped.
fn decode_line(chunk: &[u8]) -> Result<String, ProtocolError> {
    let chunk = chunk.strip_suffix(b"\r").unwrap_or(chunk);
    std::str::from_utf8(chunk)
        .map(str::to_owned)
        .map_err(|_| ProtocolError::InvalidUtf8)
}

/// Reads the first line. `None` means the peer left before sending one.
async fn read_login<R, B>(read: &mut R, session: &str) -> Option<Result<LoginRequest, AuthError>>
where
    R: Stream<Item = Result<B, AnyDelimiterCodecError>> + Unpin,
    B: AsRef<[u8]>,
{
    match read.next().await {
        Some(Ok(chunk)) => match decode_line(chunk.as_ref()) {
            Ok(line) => Some(LoginRequest::parse(&line)),
            Err(e) => {
                warn!("[{}] Unreadable login line: {}", session, e);
                Some(Err(AuthError::MalformedLogin))
            }
        },
        Some(Err(AnyDelimiterCodecError::MaxChunkLengthExceeded)) => {
            warn!("[{}] Oversized login line", session);
            Some(Err(AuthError::MalformedLogin))
        }
        Some(Err(AnyDelimiterCodecError::Io(e))) => {
            debug!("[{}] Error reading login: {}", session, e);
            None
        }
        None => {
            debug!("[{}] Connection closed before login", session);
            None
        }
    }
}

/// Verifies credentials and registers the session.
async fn authenticate(
    login: LoginRequest,
    deps: &ConnectionDeps,
) -> Result<(Sender, Registration), AuthError> {
    if !is_valid_username(&login.username) {
        return Err(AuthError::InvalidCredentials);
    }

    // PBKDF2 is CPU-bound; keep it off the reactor threads
    let store = deps.store.clone();
    let LoginRequest { username, password } = login;
    let (username, found) = tokio::task::spawn_blocking(move || {
        let found = store.find_account(&username, &password);
        (username, found)
    })
    .await
    .map_err(|_| AuthError::Aborted)?;

    let account_id = found?.ok_or(AuthError::InvalidCredentials)?;
    let registration = deps
        .registry
        .register(&username)
        .map_err(|RegistryError::AlreadyOnline(_)| AuthError::AlreadyOnline)?;

    Ok((
        Sender {
            account_id,
            username,
        },
        registration,
    ))
}

/// Handles a chat connection.
pub async fn handle_connection<S>(stream: S, deps: ConnectionDeps)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // Short random label so log lines of one connection can be correlated
    let label = uuid::Uuid::new_v4().to_string()[..8].to_string();

    // Framed on raw bytes so a line that is not UTF-8 is a protocol error,
    // not a read failure
    let codec = AnyDelimiterCodec::new_with_max_length(
        b"\n".to_vec(),
        b"\n".to_vec(),
        deps.max_line_length,
    );
    let (mut write, mut read) = Framed::new(stream, codec).split::<String>();

    let accepted = match read_login(&mut read, &label).await {
        Some(Ok(login)) => authenticate(login, &deps).await,
        Some(Err(e)) => Err(e),
        None => return,
    };

    let (sender, mut registration) = match accepted {
        Ok(accepted) => accepted,
        Err(e) => {
            info!("[{}] Login rejected: {}", label, e);
            deps.metrics.logins_failed.inc();
            let _ = write.send(Reply::Fail(e.reason().to_string()).encode()).await;
            let _ = write.close().await;
            return;
        }
    };

    let mut session = Session {
        label,
        session_id: registration.session_id,
        budget: SendBudget::per_minute(deps.rate_limit_per_min),
        sender,
    };
    deps.metrics.logins_succeeded.inc();
    deps.metrics
        .sessions_online
        .set(deps.registry.connected_count() as i64);
    info!("[{}] {} logged in", session.label, session.sender.username);

    if write.send(Reply::Success.encode()).await.is_ok() {
        // Single writer: own replies and pushes from other sessions are both
        // written from this loop, one whole line at a time.
        loop {
            tokio::select! {
                _ = deps.shutdown.cancelled() => {
                    debug!("[{}] Server shutting down", session.label);
                    break;
                }
                pushed = registration.receiver.recv() => match pushed {
                    Some(msg) => {
                        if let Err(e) = write.send(msg.line).await {
                            warn!("[{}] Failed to push message: {}", session.label, e);
                            break;
                        }
                    }
                    None => {
                        info!("[{}] Replaced by a newer login", session.label);
                        break;
                    }
                },
                chunk = read.next() => match chunk {
                    Some(Ok(chunk)) => {
                        let reply = match decode_line(&chunk) {
                            Ok(line) => session.handle_line(&line, &deps),
                            Err(e) => {
                                warn!("[{}] Dropping line: {}", session.label, e);
                                deps.metrics.protocol_errors.inc();
                                None
                            }
                        };
                        if let Some(reply) = reply {
                            if let Err(e) = write.send(reply.encode()).await {
                                warn!("[{}] Failed to send reply: {}", session.label, e);
                                break;
                            }
                        }
                    }
                    Some(Err(AnyDelimiterCodecError::MaxChunkLengthExceeded)) => {
                        warn!("[{}] Dropping line: {}", session.label, ProtocolError::LineTooLong);
                        deps.metrics.protocol_errors.inc();
                    }
                    Some(Err(AnyDelimiterCodecError::Io(e))) => {
                        debug!("[{}] Read error: {}", session.label, e);
                        break;
                    }
                    None => {
                        debug!("[{}] Disconnected", session.label);
                        break;
                    }
                },
            }
        }
    } else {
        warn!("[{}] Failed to send login reply", session.label);
    }

    deps.registry
        .unregister_session(&session.sender.username, session.session_id);
    deps.metrics
        .sessions_online
        .set(deps.registry.connected_count() as i64);
    info!("[{}] {} logged out", session.label, session.sender.username);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection_registry::DuplicateLoginPolicy;
    use crate::protocol::parse_history_payload;
    use crate::storage::MemoryChatStore;
    use crate::test_support::FailingStore;
    use std::time::Duration;
    use tokio::io::{AsyncWriteExt, DuplexStream};
    use tokio::time::timeout;
    use tokio_util::codec::LinesCodec;

    type Client = Framed<DuplexStream, LinesCodec>;

    fn test_deps(policy: DuplicateLoginPolicy) -> ConnectionDeps {
        let store = MemoryChatStore::with_hash_iterations(1_000);
        store.provision_account("alice", "pass").unwrap();
        store.provision_account("bob", "pass").unwrap();
        ConnectionDeps::new(
            Arc::new(store),
            Arc::new(ConnectionRegistry::with_options(policy, 64)),
            ChatMetrics::new().unwrap(),
        )
    }

    async fn send_raw(client: &mut Client, bytes: &[u8]) {
        client.get_mut().write_all(bytes).await.unwrap();
    }

    fn connect(deps: &ConnectionDeps) -> Client {
        let (client, server) = tokio::io::duplex(64 * 1024);
        tokio::spawn(handle_connection(server, deps.clone()));
        Framed::new(client, LinesCodec::new())
    }

    async fn send(client: &mut Client, line: &str) {
        client.send(line.to_string()).await.unwrap();
    }

    async fn recv(client: &mut Client) -> Option<String> {
        timeout(Duration::from_secs(3), client.next())
            .await
            .expect("timed out waiting for a line")
            .map(|r| r.unwrap())
    }

    async fn login(deps: &ConnectionDeps, user: &str) -> Client {
        let mut client = connect(deps);
        send(&mut client, &format!("LOGIN:{}:pass", user)).await;
        assert_eq!(recv(&mut client).await.as_deref(), Some("SUCCESS"));
        client
    }

    #[tokio::test]
    async fn test_login_success_registers_session() {
        let deps = test_deps(DuplicateLoginPolicy::Evict);
        let _alice = login(&deps, "alice").await;
        assert!(deps.registry.is_online("alice"));
        assert_eq!(deps.metrics.logins_succeeded.get(), 1);
    }

    #[tokio::test]
    async fn test_login_failures_reply_and_close() {
        let deps = test_deps(DuplicateLoginPolicy::Evict);
        let cases = [
            ("HELLO", "FAIL: Expected LOGIN message"),
            ("LOGIN:alice", "FAIL: Invalid login format"),
            ("LOGIN:alice:wrong", "FAIL: Invalid credentials"),
            ("LOGIN:nobody:pass", "FAIL: Invalid credentials"),
            ("LOGIN:a|b:pass", "FAIL: Invalid credentials"),
        ];
        for (line, expected) in cases {
            let mut client = connect(&deps);
            send(&mut client, line).await;
            assert_eq!(recv(&mut client).await.as_deref(), Some(expected), "{}", line);
            assert_eq!(recv(&mut client).await, None, "{} should close", line);
        }
        assert_eq!(deps.registry.connected_count(), 0);
        assert_eq!(deps.metrics.logins_failed.get(), cases.len() as u64);
    }

    #[tokio::test]
    async fn test_close_before_login_is_silent() {
        let deps = test_deps(DuplicateLoginPolicy::Evict);
        let (client, server) = tokio::io::duplex(1024);
        drop(client);
        handle_connection(server, deps.clone()).await;
        assert_eq!(deps.metrics.logins_failed.get(), 0);
    }

    #[tokio::test]
    async fn test_username_is_case_normalized() {
        let deps = test_deps(DuplicateLoginPolicy::Evict);
        let mut client = connect(&deps);
        send(&mut client, "LOGIN:  ALICE :pass").await;
        assert_eq!(recv(&mut client).await.as_deref(), Some("SUCCESS"));
        assert!(deps.registry.is_online("alice"));
    }

    #[tokio::test]
    async fn test_malformed_commands_keep_connection_open() {
        let deps = test_deps(DuplicateLoginPolicy::Evict);
        let mut alice = login(&deps, "alice").await;

        for line in ["MSG:bob", "BOGUS", "GET_UNREAD_COUNT", "LOGIN:alice:pass", ""] {
            send(&mut alice, line).await;
        }
        send(&mut alice, "GET_ALL_UNREAD").await;
        assert_eq!(recv(&mut alice).await.as_deref(), Some("ALL_UNREAD:"));
        assert_eq!(deps.metrics.protocol_errors.get(), 5);
    }

    #[tokio::test]
    async fn test_history_and_unread_flow() {
        let deps = test_deps(DuplicateLoginPolicy::Evict);
        let mut alice = login(&deps, "alice").await;
        send(&mut alice, "MSG:bob:hi").await;
        send(&mut alice, "MSG:bob:   ").await;
        send(&mut alice, "GET_ALL_UNREAD").await;
        assert_eq!(recv(&mut alice).await.as_deref(), Some("ALL_UNREAD:"));

        let mut bob = login(&deps, "bob").await;
        send(&mut bob, "GET_HISTORY:bob").await;
        let history = recv(&mut bob).await.unwrap();
        let entries = parse_history_payload(history.strip_prefix("HISTORY:").unwrap());
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].sender, "alice");
        assert_eq!(entries[0].content, "hi");
        assert!(!entries[0].read);

        send(&mut bob, "GET_UNREAD_COUNT:alice").await;
        assert_eq!(recv(&mut bob).await.as_deref(), Some("UNREAD_COUNT:alice:1"));
        send(&mut bob, "MARK_READ:alice").await;
        send(&mut bob, "GET_UNREAD_COUNT:alice").await;
        assert_eq!(recv(&mut bob).await.as_deref(), Some("UNREAD_COUNT:alice:0"));
    }

    #[tokio::test]
    async fn test_live_push_between_sessions() {
        let deps = test_deps(DuplicateLoginPolicy::Evict);
        let mut alice = login(&deps, "alice").await;
        let mut bob = login(&deps, "bob").await;

        send(&mut alice, "MSG:bob:hello").await;
        let pushed = recv(&mut bob).await.unwrap();
        assert!(pushed.starts_with("RECEIVE:alice:["), "{}", pushed);
        assert!(pushed.ends_with("] alice: hello"), "{}", pushed);
    }

    #[tokio::test]
    async fn test_rate_limit_drops_excess_messages() {
        let mut deps = test_deps(DuplicateLoginPolicy::Evict);
        deps.rate_limit_per_min = 2;
        let mut alice = login(&deps, "alice").await;

        for i in 0..5 {
            send(&mut alice, &format!("MSG:bob:m{}", i)).await;
        }
        send(&mut alice, "GET_ALL_UNREAD").await;
        recv(&mut alice).await;

        assert_eq!(deps.store.query_history("bob").unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_eviction_closes_old_session() {
        let deps = test_deps(DuplicateLoginPolicy::Evict);
        let mut first = login(&deps, "alice").await;
        let mut second = login(&deps, "alice").await;

        assert_eq!(recv(&mut first).await, None);

        let mut bob = login(&deps, "bob").await;
        send(&mut bob, "MSG:alice:still there?").await;
        let pushed = recv(&mut second).await.unwrap();
        assert!(pushed.ends_with("bob: still there?"));
        assert!(deps.registry.is_online("alice"));
    }

    #[tokio::test]
    async fn test_reject_policy_refuses_second_login() {
        let deps = test_deps(DuplicateLoginPolicy::Reject);
        let _first = login(&deps, "alice").await;

        let mut second = connect(&deps);
        send(&mut second, "LOGIN:alice:pass").await;
        assert_eq!(
            recv(&mut second).await.as_deref(),
            Some("FAIL: Already logged in")
        );
        assert_eq!(recv(&mut second).await, None);
        assert!(deps.registry.is_online("alice"));
    }

    #[tokio::test]
    async fn test_shutdown_ends_session_and_unregisters() {
        let deps = test_deps(DuplicateLoginPolicy::Evict);
        let mut alice = login(&deps, "alice").await;

        deps.shutdown.cancel();
        assert_eq!(recv(&mut alice).await, None);
        assert!(!deps.registry.is_online("alice"));
    }

    #[tokio::test]
    async fn test_oversized_line_is_dropped() {
        let mut deps = test_deps(DuplicateLoginPolicy::Evict);
        deps.max_line_length = 64;
        let mut alice = login(&deps, "alice").await;

        send(&mut alice, &format!("MSG:bob:{}", "x".repeat(200))).await;
        send(&mut alice, "GET_ALL_UNREAD").await;
        assert_eq!(recv(&mut alice).await.as_deref(), Some("ALL_UNREAD:"));
        assert_eq!(deps.store.message_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_invalid_utf8_line_keeps_session_open() {
        let deps = test_deps(DuplicateLoginPolicy::Evict);
        let mut alice = login(&deps, "alice").await;

        send_raw(&mut alice, b"MSG:bob:caf\xe9\n").await;
        send(&mut alice, "GET_ALL_UNREAD").await;
        assert_eq!(recv(&mut alice).await.as_deref(), Some("ALL_UNREAD:"));

        assert!(deps.registry.is_online("alice"));
        assert_eq!(deps.metrics.protocol_errors.get(), 1);
        assert_eq!(deps.store.message_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_invalid_utf8_login_is_malformed() {
        let deps = test_deps(DuplicateLoginPolicy::Evict);
        let mut client = connect(&deps);

        send_raw(&mut client, b"LOGIN:al\xffice:pass\n").await;
        assert_eq!(
            recv(&mut client).await.as_deref(),
            Some("FAIL: Invalid login format")
        );
        assert_eq!(recv(&mut client).await, None);
        assert_eq!(deps.registry.connected_count(), 0);
    }

    #[tokio::test]
    async fn test_crlf_lines_are_accepted() {
        let deps = test_deps(DuplicateLoginPolicy::Evict);
        let mut client = connect(&deps);

        send_raw(&mut client, b"LOGIN:alice:pass\r\n").await;
        assert_eq!(recv(&mut client).await.as_deref(), Some("SUCCESS"));
        send_raw(&mut client, b"GET_UNREAD_COUNT:bob\r\n").await;
        assert_eq!(
            recv(&mut client).await.as_deref(),
            Some("UNREAD_COUNT:bob:0")
        );
    }

    #[tokio::test]
    async fn test_store_failures_degrade_read_commands() {
        let store = FailingStore::with_accounts(&[("alice", "pass")]);
        let deps = ConnectionDeps::new(
            Arc::new(store),
            Arc::new(ConnectionRegistry::new()),
            ChatMetrics::new().unwrap(),
        );
        let mut alice = login(&deps, "alice").await;

        send(&mut alice, "GET_HISTORY:alice").await;
        assert_eq!(recv(&mut alice).await.as_deref(), Some("HISTORY:"));
        send(&mut alice, "GET_UNREAD_COUNT:bob").await;
        assert_eq!(recv(&mut alice).await.as_deref(), Some("UNREAD_COUNT:bob:0"));

        // Failed writes are logged, not fatal
        send(&mut alice, "MSG:bob:lost").await;
        send(&mut alice, "MARK_READ:bob").await;
        send(&mut alice, "GET_ALL_UNREAD").await;
        assert_eq!(recv(&mut alice).await.as_deref(), Some("ALL_UNREAD:"));

        assert!(deps.registry.is_online("alice"));
        assert_eq!(deps.metrics.messages_rejected.get(), 1);
    }

    #[tokio::test]
    async fn test_store_failure_at_login_is_unavailable() {
        let deps = ConnectionDeps::new(
            Arc::new(FailingStore::new()),
            Arc::new(ConnectionRegistry::new()),
            ChatMetrics::new().unwrap(),
        );
        let mut client = connect(&deps);

        send(&mut client, "LOGIN:alice:pass").await;
        assert_eq!(
            recv(&mut client).await.as_deref(),
            Some("FAIL: Authentication unavailable")
        );
        assert_eq!(recv(&mut client).await, None);
    }
}
