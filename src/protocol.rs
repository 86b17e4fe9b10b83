// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Wire Protocol
//!
//! Newline-delimited UTF-8 text with `:`-separated fields. Raw lines are
//! parsed into [`LoginRequest`] / [`Command`] right at the connection
//! boundary; replies are built as [`Reply`] values and rendered back to
//! single lines. Nothing past the handler sees raw protocol strings.

use chrono::{DateTime, Local, Utc};

use crate::error::{AuthError, ProtocolError};
use crate::storage::StoredMessage;

/// Maximum username length in characters.
pub const MAX_USERNAME_LEN: usize = 50;

const HISTORY_ENTRY_SEPARATOR: char = '|';
const HISTORY_FIELD_SEPARATOR: &str = "###";
const UNREAD_ENTRY_SEPARATOR: char = ';';

/// Trims and lower-cases a username.
pub fn normalize_username(raw: &str) -> String {
    raw.trim().to_lowercase()
}

/// Checks that a (normalized) username can travel inside every reply
/// without escaping.
pub fn is_valid_username(name: &str) -> bool {
    let len = name.chars().count();
    (1..=MAX_USERNAME_LEN).contains(&len)
        && name
            .chars()
            .all(|c| !c.is_whitespace() && !matches!(c, ':' | ';' | '|' | '#' | '\\'))
}

fn parse_username(raw: &str) -> Result<String, ProtocolError> {
    let name = normalize_username(raw);
    if is_valid_username(&name) {
        Ok(name)
    } else {
        Err(ProtocolError::InvalidUsername(name))
    }
}

/// The first line of every connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginRequest {
    /// Normalized, but not yet validated: an invalid name is reported as
    /// bad credentials rather than a malformed line.
    pub username: String,
    pub password: String,
}

impl LoginRequest {
    /// Parses `LOGIN:<username>:<password>`. The password is everything
    /// after the second colon.
    pub fn parse(line: &str) -> Result<Self, AuthError> {
        let rest = line.strip_prefix("LOGIN:").ok_or(AuthError::ExpectedLogin)?;
        let (username, password) = rest.split_once(':').ok_or(AuthError::MalformedLogin)?;
        let username = normalize_username(username);
        if username.is_empty() || password.is_empty() {
            return Err(AuthError::MalformedLogin);
        }
        Ok(LoginRequest {
            username,
            password: password.to_string(),
        })
    }
}

/// Commands accepted from an authenticated session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `MSG:<recipient>:<text>`; text may contain colons and may be empty.
    Msg { recipient: String, text: String },
    /// `GET_HISTORY:<owner>`; the owner is informational only.
    GetHistory { owner: String },
    /// `MARK_READ:<sender>`
    MarkRead { sender: String },
    /// `GET_UNREAD_COUNT:<sender>`
    GetUnreadCount { sender: String },
    /// `GET_ALL_UNREAD`
    GetAllUnread,
}

impl Command {
    /// Parses one line from an authenticated session.
    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        let (token, args) = match line.split_once(':') {
            Some((token, args)) => (token, Some(args)),
            None => (line, None),
        };

        match token {
            "MSG" => {
                let (recipient, text) = args.and_then(|a| a.split_once(':')).ok_or(
                    ProtocolError::WrongArity {
                        command: "MSG",
                        expected: "a recipient and a text",
                    },
                )?;
                Ok(Command::Msg {
                    recipient: parse_username(recipient)?,
                    text: text.to_string(),
                })
            }
            "GET_HISTORY" => {
                let owner = single_arg("GET_HISTORY", args)?;
                Ok(Command::GetHistory {
                    owner: normalize_username(owner),
                })
            }
            "MARK_READ" => Ok(Command::MarkRead {
                sender: parse_username(single_arg("MARK_READ", args)?)?,
            }),
            "GET_UNREAD_COUNT" => Ok(Command::GetUnreadCount {
                sender: parse_username(single_arg("GET_UNREAD_COUNT", args)?)?,
            }),
            "GET_ALL_UNREAD" => match args {
                None | Some("") => Ok(Command::GetAllUnread),
                Some(_) => Err(ProtocolError::WrongArity {
                    command: "GET_ALL_UNREAD",
                    expected: "no arguments",
                }),
            },
            "LOGIN" => Err(ProtocolError::AlreadyAuthenticated),
            other => Err(ProtocolError::UnknownCommand(other.to_string())),
        }
    }
}

fn single_arg<'a>(command: &'static str, args: Option<&'a str>) -> Result<&'a str, ProtocolError> {
    match args {
        Some(arg) if !arg.trim().is_empty() && !arg.contains(':') => Ok(arg),
        _ => Err(ProtocolError::WrongArity {
            command,
            expected: "exactly one argument",
        }),
    }
}

/// One entry of a `HISTORY:` reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    pub sender: String,
    pub content: String,
    pub display_time: String,
    pub read: bool,
}

impl From<&StoredMessage> for HistoryEntry {
    fn from(msg: &StoredMessage) -> Self {
        HistoryEntry {
            sender: msg.sender_name.clone(),
            content: msg.content.clone(),
            display_time: format_history_time(msg.created_at_ms),
            read: msg.read,
        }
    }
}

/// Server replies and pushes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Success,
    Fail(String),
    /// `body` is already formatted by [`format_receive_body`].
    Receive { sender: String, body: String },
    History(Vec<HistoryEntry>),
    UnreadCount { sender: String, count: u64 },
    AllUnread(Vec<(String, u64)>),
}

impl Reply {
    /// Renders the reply as one line, without the trailing newline.
    pub fn encode(&self) -> String {
        match self {
            Reply::Success => "SUCCESS".to_string(),
            Reply::Fail(reason) => format!("FAIL: {}", reason),
            Reply::Receive { sender, body } => format!("RECEIVE:{}:{}", sender, body),
            Reply::History(entries) => {
                let payload = entries
                    .iter()
                    .map(encode_history_entry)
                    .collect::<Vec<_>>()
                    .join(&HISTORY_ENTRY_SEPARATOR.to_string());
                format!("HISTORY:{}", payload)
            }
            Reply::UnreadCount { sender, count } => format!("UNREAD_COUNT:{}:{}", sender, count),
            Reply::AllUnread(counts) => {
                let payload = counts
                    .iter()
                    .map(|(sender, count)| format!("{}:{}", sender, count))
                    .collect::<Vec<_>>()
                    .join(&UNREAD_ENTRY_SEPARATOR.to_string());
                format!("ALL_UNREAD:{}", payload)
            }
        }
    }
}

fn local_time(created_at_ms: i64) -> DateTime<Local> {
    DateTime::<Utc>::from_timestamp_millis(created_at_ms)
        .unwrap_or_default()
        .with_timezone(&Local)
}

/// `YYYY-MM-DD HH:MM:SS` in server local time.
pub fn format_history_time(created_at_ms: i64) -> String {
    local_time(created_at_ms)
        .format("%Y-%m-%d %H:%M:%S")
        .to_string()
}

/// The body of a `RECEIVE` push: `[HH:MM:SS] <sender>: <content>`.
pub fn format_receive_body(created_at_ms: i64, sender: &str, content: &str) -> String {
    format!(
        "[{}] {}: {}",
        local_time(created_at_ms).format("%H:%M:%S"),
        sender,
        content
    )
}

fn escape_field(field: &str, out: &mut String) {
    for c in field.chars() {
        if matches!(c, '\\' | '|' | '#') {
            out.push('\\');
        }
        out.push(c);
    }
}

fn encode_history_entry(entry: &HistoryEntry) -> String {
    let mut out = String::new();
    escape_field(&entry.sender, &mut out);
    out.push_str(HISTORY_FIELD_SEPARATOR);
    escape_field(&entry.content, &mut out);
    out.push_str(HISTORY_FIELD_SEPARATOR);
    escape_field(&entry.display_time, &mut out);
    out.push_str(HISTORY_FIELD_SEPARATOR);
    out.push(if entry.read { '1' } else { '0' });
    out
}

/// Splits an escaped entry into its unescaped fields.
fn split_history_fields(entry: &str) -> Vec<String> {
    let chars: Vec<char> = entry.chars().collect();
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '\\' if i + 1 < chars.len() => {
                current.push(chars[i + 1]);
                i += 2;
            }
            '#' if chars[i..].starts_with(&['#', '#', '#']) => {
                fields.push(std::mem::take(&mut current));
                i += 3;
            }
            c => {
                current.push(c);
                i += 1;
            }
        }
    }
    fields.push(current);
    fields
}

/// Decodes the payload of a `HISTORY:` line (without the prefix).
///
/// Entries that do not have exactly four fields are skipped.
pub fn parse_history_payload(payload: &str) -> Vec<HistoryEntry> {
    let mut raw_entries = Vec::new();
    let mut current = String::new();
    let mut escaped = false;
    for c in payload.chars() {
        if escaped {
            current.push(c);
            escaped = false;
        } else if c == '\\' {
            current.push(c);
            escaped = true;
        } else if c == HISTORY_ENTRY_SEPARATOR {
            raw_entries.push(std::mem::take(&mut current));
        } else {
            current.push(c);
        }
    }
    raw_entries.push(current);

    raw_entries
        .iter()
        .filter(|raw| !raw.is_empty())
        .filter_map(|raw| {
            let mut fields = split_history_fields(raw).into_iter();
            match (fields.next(), fields.next(), fields.next(), fields.next(), fields.next()) {
                (Some(sender), Some(content), Some(display_time), Some(flag), None) => {
                    Some(HistoryEntry {
                        sender,
                        content,
                        display_time,
                        read: flag == "1",
                    })
                }
                _ => None,
            }
        })
        .collect()
}

/// Decodes the payload of an `ALL_UNREAD:` line (without the prefix).
pub fn parse_unread_payload(payload: &str) -> Vec<(String, u64)> {
    payload
        .split(UNREAD_ENTRY_SEPARATOR)
        .filter_map(|item| {
            let (sender, count) = item.split_once(':')?;
            Some((sender.to_string(), count.parse().ok()?))
        })
        .collect()
}
