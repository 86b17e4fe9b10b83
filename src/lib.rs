// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

pub mod config;
pub mod connection_registry;
pub mod credentials;
pub mod error;
pub mod handler;
pub mod http;
pub mod metrics;
pub mod protocol;
pub mod rate_limit;
pub mod router;
pub mod server;
pub mod storage;
pub mod unread;

#[cfg(test)]
mod test_support;
