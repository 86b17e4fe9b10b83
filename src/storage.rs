// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Chat Storage
//!
//! Persistence gateway for accounts and directed messages.
//! Supports both in-memory (for testing) and SQLite (for production).

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::{params, Connection, OptionalExtension};

use crate::credentials::{self, DEFAULT_ITERATIONS};
use crate::error::StorageError;
use crate::protocol::{is_valid_username, normalize_username};

/// Store-assigned account identifier.
pub type AccountId = i64;
/// Store-assigned message identifier.
pub type MessageId = i64;

/// A message about to be persisted.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub sender_id: AccountId,
    pub sender_name: String,
    pub recipient: String,
    pub content: String,
    /// Server-assigned, milliseconds since the Unix epoch.
    pub created_at_ms: i64,
}

/// A persisted message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub id: MessageId,
    pub sender_id: AccountId,
    pub sender_name: String,
    pub recipient: String,
    pub content: String,
    pub created_at_ms: i64,
    pub read: bool,
}

/// Trait for chat storage backends.
///
/// Usernames passed in are expected to be normalized already; stores do not
/// re-normalize on the query side.
pub trait ChatStore: Send + Sync {
    /// Returns the account id when the username exists and the password
    /// verifies.
    fn find_account(&self, username: &str, password: &str)
        -> Result<Option<AccountId>, StorageError>;

    /// Creates an account. Fails if the username is taken or invalid.
    fn provision_account(&self, username: &str, password: &str) -> Result<AccountId, StorageError>;

    /// Persists a message with `read = false`.
    fn insert_message(&self, message: NewMessage) -> Result<MessageId, StorageError>;

    /// All messages addressed to `recipient`, oldest first.
    fn query_history(&self, recipient: &str) -> Result<Vec<StoredMessage>, StorageError>;

    /// Unread messages from `sender` to `recipient`.
    fn count_unread(&self, recipient: &str, sender: &str) -> Result<u64, StorageError>;

    /// Unread counts per sender for `recipient`. Senders with nothing unread
    /// are absent.
    fn group_unread(&self, recipient: &str) -> Result<BTreeMap<String, u64>, StorageError>;

    /// Marks everything currently unread from `sender` to `recipient` as
    /// read. Returns the number of messages updated.
    fn mark_read(&self, recipient: &str, sender: &str) -> Result<usize, StorageError>;

    /// Number of provisioned accounts.
    fn account_count(&self) -> Result<usize, StorageError>;

    /// Number of persisted messages.
    fn message_count(&self) -> Result<usize, StorageError>;
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

fn checked_username(raw: &str) -> Result<String, StorageError> {
    let username = normalize_username(raw);
    if is_valid_username(&username) {
        Ok(username)
    } else {
        Err(StorageError::InvalidUsername(username))
    }
}

// ============================================================================
// In-Memory Storage (for testing and development)
// ============================================================================

#[derive(Debug, Clone)]
struct MemoryAccount {
    id: AccountId,
    password_hash: String,
}

#[derive(Default)]
struct MemoryState {
    accounts: HashMap<String, MemoryAccount>,
    messages: Vec<StoredMessage>,
    next_account_id: AccountId,
    next_message_id: MessageId,
}

/// In-memory storage for accounts and messages.
pub struct MemoryChatStore {
    state: RwLock<MemoryState>,
    hash_iterations: u32,
}

impl MemoryChatStore {
    /// Creates a new empty in-memory store.
    pub fn new() -> Self {
        Self::with_hash_iterations(DEFAULT_ITERATIONS)
    }

    /// Creates a store whose new accounts use the given PBKDF2 iteration count.
    pub fn with_hash_iterations(hash_iterations: u32) -> Self {
        MemoryChatStore {
            state: RwLock::new(MemoryState::default()),
            hash_iterations,
        }
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, MemoryState>, StorageError> {
        self.state.read().map_err(|_| StorageError::Poisoned)
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, MemoryState>, StorageError> {
        self.state.write().map_err(|_| StorageError::Poisoned)
    }
}

impl Default for MemoryChatStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ChatStore for MemoryChatStore {
    fn find_account(
        &self,
        username: &str,
        password: &str,
    ) -> Result<Option<AccountId>, StorageError> {
        let account = { self.read()?.accounts.get(username).cloned() };
        match account {
            Some(account) if credentials::verify_password(password, &account.password_hash)? => {
                Ok(Some(account.id))
            }
            Some(_) => Ok(None),
            None => {
                credentials::verify_absent(password, self.hash_iterations);
                Ok(None)
            }
        }
    }

    fn provision_account(&self, username: &str, password: &str) -> Result<AccountId, StorageError> {
        let username = checked_username(username)?;
        let password_hash = credentials::hash_password(password, self.hash_iterations)?;

        let mut state = self.write()?;
        if state.accounts.contains_key(&username) {
            return Err(StorageError::DuplicateAccount(username));
        }
        state.next_account_id += 1;
        let id = state.next_account_id;
        state.accounts.insert(username, MemoryAccount { id, password_hash });
        Ok(id)
    }

    fn insert_message(&self, message: NewMessage) -> Result<MessageId, StorageError> {
        let mut state = self.write()?;
        state.next_message_id += 1;
        let id = state.next_message_id;
        state.messages.push(StoredMessage {
            id,
            sender_id: message.sender_id,
            sender_name: message.sender_name,
            recipient: message.recipient,
            content: message.content,
            created_at_ms: message.created_at_ms,
            read: false,
        });
        Ok(id)
    }

    fn query_history(&self, recipient: &str) -> Result<Vec<StoredMessage>, StorageError> {
        let state = self.read()?;
        let mut history: Vec<StoredMessage> = state
            .messages
            .iter()
            .filter(|m| m.recipient == recipient)
            .cloned()
            .collect();
        history.sort_by_key(|m| (m.created_at_ms, m.id));
        Ok(history)
    }

    fn count_unread(&self, recipient: &str, sender: &str) -> Result<u64, StorageError> {
        let state = self.read()?;
        Ok(state
            .messages
            .iter()
            .filter(|m| !m.read && m.recipient == recipient && m.sender_name == sender)
            .count() as u64)
    }

    fn group_unread(&self, recipient: &str) -> Result<BTreeMap<String, u64>, StorageError> {
        let state = self.read()?;
        let mut counts = BTreeMap::new();
        for m in state
            .messages
            .iter()
            .filter(|m| !m.read && m.recipient == recipient)
        {
            *counts.entry(m.sender_name.clone()).or_insert(0) += 1;
        }
        Ok(counts)
    }

    fn mark_read(&self, recipient: &str, sender: &str) -> Result<usize, StorageError> {
        let mut state = self.write()?;
        let mut updated = 0;
        for m in state
            .messages
            .iter_mut()
            .filter(|m| !m.read && m.recipient == recipient && m.sender_name == sender)
        {
            m.read = true;
            updated += 1;
        }
        Ok(updated)
    }

    fn account_count(&self) -> Result<usize, StorageError> {
        Ok(self.read()?.accounts.len())
    }

    fn message_count(&self) -> Result<usize, StorageError> {
        Ok(self.read()?.messages.len())
    }
}

// ============================================================================
// SQLite Storage (for production)
// ============================================================================

/// SQLite-backed persistent storage for accounts and messages.
pub struct SqliteChatStore {
    conn: Mutex<Connection>,
    hash_iterations: u32,
}

impl SqliteChatStore {
    /// Opens or creates a SQLite database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        Self::open_with_hash_iterations(path, DEFAULT_ITERATIONS)
    }

    /// Opens a database whose new accounts use the given PBKDF2 iteration count.
    pub fn open_with_hash_iterations<P: AsRef<Path>>(
        path: P,
        hash_iterations: u32,
    ) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;

        // WAL lets history queries run while a send is being written
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;
             PRAGMA cache_size=10000;",
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS accounts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                username TEXT NOT NULL UNIQUE,
                password_hash TEXT NOT NULL,
                created_at_ms INTEGER NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                sender_id INTEGER NOT NULL REFERENCES accounts(id),
                sender_name TEXT NOT NULL,
                recipient TEXT NOT NULL,
                content TEXT NOT NULL,
                created_at_ms INTEGER NOT NULL,
                read INTEGER NOT NULL DEFAULT 0
            )",
            [],
        )?;

        // History lookups
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_messages_recipient
             ON messages(recipient, created_at_ms)",
            [],
        )?;

        // Unread counting and bulk mark-read
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_messages_unread
             ON messages(recipient, sender_name, read)",
            [],
        )?;

        Ok(SqliteChatStore {
            conn: Mutex::new(conn),
            hash_iterations,
        })
    }

    /// Creates an in-memory SQLite database (for testing).
    #[cfg(test)]
    pub fn in_memory() -> Result<Self, StorageError> {
        Self::open_with_hash_iterations(":memory:", 1_000)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StorageError> {
        self.conn.lock().map_err(|_| StorageError::Poisoned)
    }
}

impl ChatStore for SqliteChatStore {
    fn find_account(
        &self,
        username: &str,
        password: &str,
    ) -> Result<Option<AccountId>, StorageError> {
        let row: Option<(AccountId, String)> = {
            let conn = self.conn()?;
            conn.query_row(
                "SELECT id, password_hash FROM accounts WHERE username = ?1",
                params![username],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?
        };

        // Hash verification runs outside the connection lock
        match row {
            Some((id, hash)) if credentials::verify_password(password, &hash)? => Ok(Some(id)),
            Some(_) => Ok(None),
            None => {
                credentials::verify_absent(password, self.hash_iterations);
                Ok(None)
            }
        }
    }

    fn provision_account(&self, username: &str, password: &str) -> Result<AccountId, StorageError> {
        let username = checked_username(username)?;
        let password_hash = credentials::hash_password(password, self.hash_iterations)?;

        let conn = self.conn()?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO accounts (username, password_hash, created_at_ms)
             VALUES (?1, ?2, ?3)",
            params![username, password_hash, now_ms()],
        )?;
        if inserted == 0 {
            return Err(StorageError::DuplicateAccount(username));
        }
        Ok(conn.last_insert_rowid())
    }

    fn insert_message(&self, message: NewMessage) -> Result<MessageId, StorageError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO messages (sender_id, sender_name, recipient, content, created_at_ms, read)
             VALUES (?1, ?2, ?3, ?4, ?5, 0)",
            params![
                message.sender_id,
                message.sender_name,
                message.recipient,
                message.content,
                message.created_at_ms
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn query_history(&self, recipient: &str) -> Result<Vec<StoredMessage>, StorageError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, sender_id, sender_name, recipient, content, created_at_ms, read
             FROM messages WHERE recipient = ?1
             ORDER BY created_at_ms ASC, id ASC",
        )?;

        let rows = stmt.query_map(params![recipient], |row| {
            Ok(StoredMessage {
                id: row.get(0)?,
                sender_id: row.get(1)?,
                sender_name: row.get(2)?,
                recipient: row.get(3)?,
                content: row.get(4)?,
                created_at_ms: row.get(5)?,
                read: row.get(6)?,
            })
        })?;

        let mut history = Vec::new();
        for row in rows {
            history.push(row?);
        }
        Ok(history)
    }

    fn count_unread(&self, recipient: &str, sender: &str) -> Result<u64, StorageError> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM messages
             WHERE recipient = ?1 AND sender_name = ?2 AND read = 0",
            params![recipient, sender],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    fn group_unread(&self, recipient: &str) -> Result<BTreeMap<String, u64>, StorageError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT sender_name, COUNT(*) FROM messages
             WHERE recipient = ?1 AND read = 0
             GROUP BY sender_name",
        )?;

        let rows = stmt.query_map(params![recipient], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;

        let mut counts = BTreeMap::new();
        for row in rows {
            let (sender, count) = row?;
            counts.insert(sender, count as u64);
        }
        Ok(counts)
    }

    fn mark_read(&self, recipient: &str, sender: &str) -> Result<usize, StorageError> {
        let conn = self.conn()?;
        Ok(conn.execute(
            "UPDATE messages SET read = 1
             WHERE recipient = ?1 AND sender_name = ?2 AND read = 0",
            params![recipient, sender],
        )?)
    }

    fn account_count(&self) -> Result<usize, StorageError> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM accounts", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    fn message_count(&self) -> Result<usize, StorageError> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

// ============================================================================
// Storage Factory
// ============================================================================

/// Storage backend type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StorageBackend {
    /// In-memory storage (lost on restart).
    Memory,
    /// SQLite persistent storage.
    #[default]
    Sqlite,
}

/// Creates a chat store based on the backend type.
pub fn create_chat_store(
    backend: StorageBackend,
    data_dir: &Path,
    hash_iterations: u32,
) -> Result<Box<dyn ChatStore>, StorageError> {
    match backend {
        StorageBackend::Memory => Ok(Box::new(MemoryChatStore::with_hash_iterations(
            hash_iterations,
        ))),
        StorageBackend::Sqlite => {
            std::fs::create_dir_all(data_dir)?;
            let path = data_dir.join("chat.db");
            Ok(Box::new(SqliteChatStore::open_with_hash_iterations(
                path,
                hash_iterations,
            )?))
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
