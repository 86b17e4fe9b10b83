// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Connection Registry
//!
//! Tracks which users are online so the router can decide between live
//! delivery and store-only.
//!
//! The registry maps a logged-in username to the sending half of that
//! session's outbound queue. Only the session's own task drains the queue
//! and writes the socket, so pushes from other sessions never interleave
//! with its own replies.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};

use tokio::sync::mpsc;

use crate::error::{PushError, RegistryError};

/// Default capacity of each session's outbound queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Identifies one login, so a replaced session cannot remove its successor.
pub type SessionId = u64;

/// A pre-rendered line pushed to a connected session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryMessage {
    /// One protocol line, without the trailing newline.
    pub line: String,
}

/// What to do when a username logs in while already online.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DuplicateLoginPolicy {
    /// Replace the old session; its queue closes and it disconnects.
    #[default]
    Evict,
    /// Refuse the new login.
    Reject,
}

/// Registry entry for one online user.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub session_id: SessionId,
    sender: mpsc::Sender<RegistryMessage>,
}

impl SessionHandle {
    /// Queues a line without waiting.
    pub fn try_push(&self, msg: RegistryMessage) -> Result<(), PushError> {
        self.sender.try_send(msg).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => PushError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => PushError::Closed,
        })
    }
}

/// Returned to a session on successful registration.
#[derive(Debug)]
pub struct Registration {
    pub session_id: SessionId,
    /// Closed when the session is evicted or unregistered.
    pub receiver: mpsc::Receiver<RegistryMessage>,
}

/// Thread-safe registry of online users.
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<String, SessionHandle>>,
    next_session_id: AtomicU64,
    policy: DuplicateLoginPolicy,
    queue_capacity: usize,
}

impl ConnectionRegistry {
    /// Creates a new empty registry with the default policy and queue size.
    pub fn new() -> Self {
        Self::with_options(DuplicateLoginPolicy::default(), DEFAULT_QUEUE_CAPACITY)
    }

    /// Creates a registry with an explicit duplicate-login policy and
    /// per-session queue capacity.
    pub fn with_options(policy: DuplicateLoginPolicy, queue_capacity: usize) -> Self {
        ConnectionRegistry {
            connections: RwLock::new(HashMap::new()),
            next_session_id: AtomicU64::new(1),
            policy,
            queue_capacity: queue_capacity.max(1),
        }
    }

    /// Registers a logged-in user and returns the receiving end of its queue.
    ///
    /// Under [`DuplicateLoginPolicy::Evict`] an existing entry is replaced and
    /// the old receiver sees its channel close.
    pub fn register(&self, username: &str) -> Result<Registration, RegistryError> {
        let (sender, receiver) = mpsc::channel(self.queue_capacity);
        let session_id = self.next_session_id.fetch_add(1, Ordering::Relaxed);

        let mut connections = self
            .connections
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if self.policy == DuplicateLoginPolicy::Reject && connections.contains_key(username) {
            return Err(RegistryError::AlreadyOnline(username.to_string()));
        }
        connections.insert(username.to_string(), SessionHandle { session_id, sender });

        Ok(Registration {
            session_id,
            receiver,
        })
    }

    /// Removes a user regardless of which session owns the entry.
    /// No-op if absent.
    pub fn unregister(&self, username: &str) {
        let mut connections = self
            .connections
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        connections.remove(username);
    }

    /// Removes the entry only if it still belongs to `session_id`.
    /// Returns true if an entry was removed.
    pub fn unregister_session(&self, username: &str, session_id: SessionId) -> bool {
        let mut connections = self
            .connections
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        match connections.get(username) {
            Some(handle) if handle.session_id == session_id => {
                connections.remove(username);
                true
            }
            _ => false,
        }
    }

    /// Returns the handle of an online user.
    pub fn lookup(&self, username: &str) -> Option<SessionHandle> {
        let connections = self
            .connections
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        connections.get(username).cloned()
    }

    /// Queues a line for an online user without blocking.
    pub fn try_send(&self, username: &str, msg: RegistryMessage) -> Result<(), PushError> {
        let connections = self
            .connections
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        match connections.get(username) {
            Some(handle) => handle.try_push(msg),
            None => Err(PushError::Offline),
        }
    }

    /// Returns true if the user currently has a registered session.
    pub fn is_online(&self, username: &str) -> bool {
        let connections = self
            .connections
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        connections.contains_key(username)
    }

    /// Returns the number of currently online users.
    pub fn connected_count(&self) -> usize {
        let connections = self
            .connections
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        connections.len()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
