// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Error Types
//!
//! Every error here is scoped to a single connection or a single operation.
//! Only [`StartupError`] is allowed to end the process.

use thiserror::Error;

/// A client line that could not be turned into a command.
///
/// Logged and dropped; the connection stays open and no reply is sent.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("unknown command `{0}`")]
    UnknownCommand(String),

    #[error("`{command}` expects {expected}")]
    WrongArity {
        command: &'static str,
        expected: &'static str,
    },

    #[error("invalid username `{0}`")]
    InvalidUsername(String),

    #[error("already authenticated")]
    AlreadyAuthenticated,

    #[error("line exceeds maximum length")]
    LineTooLong,

    #[error("line is not valid UTF-8")]
    InvalidUtf8,
}

/// Login failures. Each one produces exactly one `FAIL:` reply, then the
/// connection is closed.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("first line was not a LOGIN command")]
    ExpectedLogin,

    #[error("malformed LOGIN command")]
    MalformedLogin,

    #[error("invalid credentials")]
    InvalidCredentials,

    #[error("user is already logged in")]
    AlreadyOnline,

    #[error("account lookup failed: {0}")]
    Unavailable(#[from] StorageError),

    #[error("credential check aborted")]
    Aborted,
}

impl AuthError {
    /// The reason carried by the `FAIL:` reply for this failure.
    pub fn reason(&self) -> &'static str {
        match self {
            AuthError::ExpectedLogin => "Expected LOGIN message",
            AuthError::MalformedLogin => "Invalid login format",
            AuthError::InvalidCredentials => "Invalid credentials",
            AuthError::AlreadyOnline => "Already logged in",
            AuthError::Unavailable(_) | AuthError::Aborted => "Authentication unavailable",
        }
    }
}

/// Persistence gateway failures.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("storage lock poisoned")]
    Poisoned,

    #[error("malformed password hash: {0}")]
    CredentialFormat(String),

    #[error("account `{0}` already exists")]
    DuplicateAccount(String),

    #[error("invalid username `{0}`")]
    InvalidUsername(String),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// A directed send that could not be accepted.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// The message was not persisted, so it is not delivered live either.
    #[error("message not persisted: {0}")]
    Persistence(#[from] StorageError),
}

/// Registry refusal at login.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("`{0}` already has an active session")]
    AlreadyOnline(String),
}

/// Live push failures. None of these affect persistence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PushError {
    #[error("recipient offline")]
    Offline,

    #[error("recipient outbound queue full")]
    QueueFull,

    #[error("recipient session closed")]
    Closed,
}

/// Bootstrap failures.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to open chat store: {0}")]
    Storage(#[from] StorageError),

    #[error("failed to register metrics: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("http server error: {0}")]
    Http(std::io::Error),
}
