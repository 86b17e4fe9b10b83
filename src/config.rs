// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Chat Server Configuration
//!
//! Configuration loaded from environment variables. Unparseable values fall
//! back to the default.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;

use crate::connection_registry::{DuplicateLoginPolicy, DEFAULT_QUEUE_CAPACITY};
use crate::credentials::DEFAULT_ITERATIONS;
use crate::handler::DEFAULT_MAX_LINE_LENGTH;
use crate::storage::StorageBackend;

/// Chat server configuration.
#[derive(Debug, Clone)]
pub struct ChatConfig {
    /// Address the line protocol listens on.
    pub listen_addr: SocketAddr,
    /// Address for `/health` and `/metrics`; `None` disables the HTTP server.
    pub metrics_addr: Option<String>,
    /// Optional bearer token for `/metrics`.
    pub metrics_token: Option<String>,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Maximum protocol line length in bytes.
    pub max_line_length: usize,
    /// `MSG` commands per minute per session (0 = unlimited).
    pub rate_limit_per_min: u32,
    /// Per-session outbound push queue capacity.
    pub outbound_queue: usize,
    /// What happens when a user logs in twice.
    pub duplicate_login: DuplicateLoginPolicy,
    /// Storage backend (memory or sqlite).
    pub storage_backend: StorageBackend,
    /// Data directory for persistent storage.
    pub data_dir: PathBuf,
    /// PBKDF2 iterations for newly provisioned accounts.
    pub password_iterations: u32,
    /// Accounts created at startup if missing.
    pub provision_accounts: Vec<(String, String)>,
}

impl Default for ChatConfig {
    fn default() -> Self {
        ChatConfig {
            listen_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 8080)),
            metrics_addr: Some("127.0.0.1:8081".to_string()),
            metrics_token: None,
            max_connections: 1000,
            max_line_length: DEFAULT_MAX_LINE_LENGTH,
            rate_limit_per_min: 120,
            outbound_queue: DEFAULT_QUEUE_CAPACITY,
            duplicate_login: DuplicateLoginPolicy::Evict,
            storage_backend: StorageBackend::Sqlite, // Persistent by default
            data_dir: PathBuf::from("./data"),
            password_iterations: DEFAULT_ITERATIONS,
            provision_accounts: Vec::new(),
        }
    }
}

/// Parses `user:pass,user:pass`. Entries without a `:` or with an empty side
/// are skipped.
pub fn parse_account_list(value: &str) -> Vec<(String, String)> {
    value
        .split(',')
        .filter_map(|entry| {
            let (user, pass) = entry.trim().split_once(':')?;
            let user = user.trim();
            if user.is_empty() || pass.is_empty() {
                return None;
            }
            Some((user.to_string(), pass.to_string()))
        })
        .collect()
}

impl ChatConfig {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(addr) = lookup("CHAT_LISTEN_ADDR") {
            if let Ok(parsed) = addr.parse() {
                config.listen_addr = parsed;
            }
        }

        if let Some(addr) = lookup("CHAT_METRICS_ADDR") {
            let addr = addr.trim();
            config.metrics_addr = if addr.is_empty() {
                None
            } else {
                Some(addr.to_string())
            };
        }

        if let Some(token) = lookup("CHAT_METRICS_TOKEN") {
            if !token.is_empty() {
                config.metrics_token = Some(token);
            }
        }

        if let Some(val) = lookup("CHAT_MAX_CONNECTIONS") {
            if let Ok(parsed) = val.parse::<usize>() {
                // A zero-permit semaphore would refuse every connection
                config.max_connections = parsed.max(1);
            }
        }

        if let Some(val) = lookup("CHAT_MAX_LINE_LENGTH") {
            if let Ok(parsed) = val.parse::<usize>() {
                config.max_line_length = parsed.max(1);
            }
        }

        if let Some(val) = lookup("CHAT_RATE_LIMIT") {
            if let Ok(parsed) = val.parse() {
                config.rate_limit_per_min = parsed;
            }
        }

        if let Some(val) = lookup("CHAT_OUTBOUND_QUEUE") {
            if let Ok(parsed) = val.parse::<usize>() {
                // tokio mpsc channels need a capacity of at least one
                config.outbound_queue = parsed.max(1);
            }
        }

        if let Some(val) = lookup("CHAT_DUPLICATE_LOGIN") {
            config.duplicate_login = match val.to_lowercase().as_str() {
                "reject" => DuplicateLoginPolicy::Reject,
                _ => DuplicateLoginPolicy::Evict,
            };
        }

        if let Some(val) = lookup("CHAT_STORAGE_BACKEND") {
            config.storage_backend = match val.to_lowercase().as_str() {
                "memory" => StorageBackend::Memory,
                _ => StorageBackend::Sqlite,
            };
        }

        if let Some(val) = lookup("CHAT_DATA_DIR") {
            config.data_dir = PathBuf::from(val);
        }

        if let Some(val) = lookup("CHAT_PASSWORD_ITERATIONS") {
            if let Ok(parsed) = val.parse::<u32>() {
                config.password_iterations = parsed.max(1);
            }
        }

        if let Some(val) = lookup("CHAT_PROVISION_ACCOUNTS") {
            config.provision_accounts = parse_account_list(&val);
        }

        config
    }
}
