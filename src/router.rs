// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Message Router
//!
//! Store-and-forward delivery of directed messages: persist first, then push
//! live if the recipient is online. A message the store accepted is never
//! lost because a push failed, and nothing is pushed that was not stored.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, warn};

use crate::connection_registry::{ConnectionRegistry, RegistryMessage};
use crate::error::{DeliveryError, PushError};
use crate::metrics::ChatMetrics;
use crate::protocol::{format_receive_body, Reply};
use crate::storage::{AccountId, ChatStore, NewMessage};

/// The authenticated author of a send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sender {
    pub account_id: AccountId,
    pub username: String,
}

/// Result of an accepted send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Text was blank after trimming; nothing was stored.
    Empty,
    /// Stored and queued on the recipient's live session.
    Delivered,
    /// Stored; the recipient was offline.
    StoredOffline,
    /// Stored; the recipient was online but the push failed.
    StoredUndelivered,
}

/// Hands out creation timestamps that never go backwards, even if the wall
/// clock does.
#[derive(Debug, Default)]
pub struct MessageClock {
    last_ms: AtomicI64,
}

impl MessageClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `max(now, previous)`.
    pub fn next(&self) -> i64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as i64;
        let previous = self.last_ms.fetch_max(now, Ordering::SeqCst);
        previous.max(now)
    }
}

/// Routes directed messages between sessions.
pub struct MessageRouter {
    store: Arc<dyn ChatStore>,
    registry: Arc<ConnectionRegistry>,
    clock: MessageClock,
    metrics: ChatMetrics,
}

impl MessageRouter {
    pub fn new(
        store: Arc<dyn ChatStore>,
        registry: Arc<ConnectionRegistry>,
        metrics: ChatMetrics,
    ) -> Self {
        MessageRouter {
            store,
            registry,
            clock: MessageClock::new(),
            metrics,
        }
    }

    /// Persists a message from `sender` to `recipient` and pushes it live if
    /// the recipient is online.
    pub fn send(
        &self,
        sender: &Sender,
        recipient: &str,
        text: &str,
    ) -> Result<SendOutcome, DeliveryError> {
        let content = text.trim();
        if content.is_empty() {
            debug!("Ignoring empty message from {}", sender.username);
            self.metrics.messages_rejected.inc();
            return Ok(SendOutcome::Empty);
        }

        let created_at_ms = self.clock.next();
        if let Err(e) = self.store.insert_message(NewMessage {
            sender_id: sender.account_id,
            sender_name: sender.username.clone(),
            recipient: recipient.to_string(),
            content: content.to_string(),
            created_at_ms,
        }) {
            self.metrics.messages_rejected.inc();
            return Err(e.into());
        }
        self.metrics.messages_received.inc();

        let push = Reply::Receive {
            sender: sender.username.clone(),
            body: format_receive_body(created_at_ms, &sender.username, content),
        };
        match self
            .registry
            .try_send(recipient, RegistryMessage { line: push.encode() })
        {
            Ok(()) => {
                self.metrics.messages_delivered_live.inc();
                Ok(SendOutcome::Delivered)
            }
            Err(PushError::Offline) => {
                self.metrics.messages_stored_offline.inc();
                Ok(SendOutcome::StoredOffline)
            }
            Err(e) => {
                warn!(
                    "Live delivery to {} failed ({}); message kept in history",
                    recipient, e
                );
                self.metrics.messages_push_failed.inc();
                Ok(SendOutcome::StoredUndelivered)
            }
        }
    }
}
