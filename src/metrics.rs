// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Prometheus Metrics for ChatHub
//!
//! Provides observability metrics for monitoring the chat server.

use prometheus::{IntCounter, IntGauge, Opts, Registry};
use std::sync::Arc;

/// Chat server metrics.
#[derive(Clone)]
pub struct ChatMetrics {
    /// Registry for all metrics.
    pub registry: Arc<Registry>,

    // Connection metrics
    /// Total TCP connections accepted.
    pub connections_total: IntCounter,
    /// Current open TCP connections.
    pub connections_active: IntGauge,
    /// Connections refused or failed before a session started.
    pub connection_errors: IntCounter,

    // Session metrics
    /// Successful logins.
    pub logins_succeeded: IntCounter,
    /// Failed logins (any `FAIL:` reply).
    pub logins_failed: IntCounter,
    /// Users currently registered as online.
    pub sessions_online: IntGauge,
    /// Lines dropped as malformed or unknown.
    pub protocol_errors: IntCounter,

    // Message metrics
    /// Messages accepted and persisted.
    pub messages_received: IntCounter,
    /// Messages pushed live to an online recipient.
    pub messages_delivered_live: IntCounter,
    /// Messages persisted for a recipient that was offline.
    pub messages_stored_offline: IntCounter,
    /// Messages persisted for an online recipient whose live push failed.
    pub messages_push_failed: IntCounter,
    /// Sends dropped (empty, rate limited, or not persisted).
    pub messages_rejected: IntCounter,
}

fn counter(registry: &Registry, name: &str, help: &str) -> prometheus::Result<IntCounter> {
    let counter = IntCounter::with_opts(Opts::new(name, help))?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}

fn gauge(registry: &Registry, name: &str, help: &str) -> prometheus::Result<IntGauge> {
    let gauge = IntGauge::with_opts(Opts::new(name, help))?;
    registry.register(Box::new(gauge.clone()))?;
    Ok(gauge)
}

impl ChatMetrics {
    /// Creates a new metrics instance with all counters registered.
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        Ok(ChatMetrics {
            connections_total: counter(
                &registry,
                "chat_connections_total",
                "Total TCP connections accepted",
            )?,
            connections_active: gauge(
                &registry,
                "chat_connections_active",
                "Current open TCP connections",
            )?,
            connection_errors: counter(
                &registry,
                "chat_connection_errors_total",
                "Connections refused or failed before a session started",
            )?,
            logins_succeeded: counter(
                &registry,
                "chat_logins_succeeded_total",
                "Successful logins",
            )?,
            logins_failed: counter(&registry, "chat_logins_failed_total", "Failed logins")?,
            sessions_online: gauge(
                &registry,
                "chat_sessions_online",
                "Users currently online",
            )?,
            protocol_errors: counter(
                &registry,
                "chat_protocol_errors_total",
                "Malformed or unknown command lines",
            )?,
            messages_received: counter(
                &registry,
                "chat_messages_received_total",
                "Messages accepted and persisted",
            )?,
            messages_delivered_live: counter(
                &registry,
                "chat_messages_delivered_live_total",
                "Messages pushed to an online recipient",
            )?,
            messages_stored_offline: counter(
                &registry,
                "chat_messages_stored_offline_total",
                "Messages stored for an offline recipient",
            )?,
            messages_push_failed: counter(
                &registry,
                "chat_messages_push_failed_total",
                "Messages stored but not pushed to an online recipient",
            )?,
            messages_rejected: counter(
                &registry,
                "chat_messages_rejected_total",
                "Sends dropped before or during persistence",
            )?,
            registry: Arc::new(registry),
        })
    }

    /// Encodes all metrics in Prometheus text format.
    pub fn encode(&self) -> prometheus::Result<String> {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}
