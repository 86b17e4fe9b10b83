// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Unread Tracker
//!
//! Read/unread state derived from persisted messages. Store failures degrade
//! to "nothing unread" so a flaky store never ends a session.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::storage::ChatStore;

pub struct UnreadTracker {
    store: Arc<dyn ChatStore>,
}

impl UnreadTracker {
    pub fn new(store: Arc<dyn ChatStore>) -> Self {
        UnreadTracker { store }
    }

    /// Unread messages from `sender` addressed to `recipient`.
    pub fn count_from(&self, recipient: &str, sender: &str) -> u64 {
        self.store
            .count_unread(recipient, sender)
            .unwrap_or_else(|e| {
                warn!("Unread count for {} failed: {}", recipient, e);
                0
            })
    }

    /// Unread counts per sender, ordered by sender name. Senders with
    /// nothing unread are omitted.
    pub fn all_counts(&self, recipient: &str) -> Vec<(String, u64)> {
        match self.store.group_unread(recipient) {
            Ok(counts) => counts.into_iter().filter(|(_, n)| *n > 0).collect(),
            Err(e) => {
                warn!("Unread summary for {} failed: {}", recipient, e);
                Vec::new()
            }
        }
    }

    /// Marks everything currently unread from `sender` as read. Messages
    /// persisted afterwards stay unread.
    pub fn mark_read(&self, recipient: &str, sender: &str) -> usize {
        match self.store.mark_read(recipient, sender) {
            Ok(updated) => {
                debug!("Marked {} messages read", updated);
                updated
            }
            Err(e) => {
                warn!("Mark read for {} failed: {}", recipient, e);
                0
            }
        }
    }
}
