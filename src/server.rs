// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Accept Loop
//!
//! Accepts TCP connections and spawns one session task per connection.

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::handler::{handle_connection, ConnectionDeps};

/// Accepts connections until `deps.shutdown` is cancelled.
///
/// Connections beyond `max_connections` are closed immediately.
pub async fn serve(listener: TcpListener, deps: ConnectionDeps, max_connections: usize) {
    let slots = Arc::new(Semaphore::new(max_connections.max(1)));

    loop {
        let accepted = tokio::select! {
            _ = deps.shutdown.cancelled() => {
                info!("Accept loop stopped");
                break;
            }
            accepted = listener.accept() => accepted,
        };

        let (stream, addr) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                // Usually a transient resource error; the listener stays usable
                warn!("Accept failed: {}", e);
                deps.metrics.connection_errors.inc();
                continue;
            }
        };

        // Enforce connection limit
        let permit = match slots.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                warn!(
                    "Connection rejected: at max capacity ({})",
                    max_connections
                );
                deps.metrics.connection_errors.inc();
                drop(stream);
                continue;
            }
        };

        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY: {}", e);
        }

        let deps = deps.clone();
        tokio::spawn(async move {
            // Keep the permit alive for the duration of the connection
            let _permit = permit;
            deps.metrics.connections_total.inc();
            deps.metrics.connections_active.inc();
            debug!("Accepted connection from {}", addr);

            handle_connection(stream, deps.clone()).await;

            deps.metrics.connections_active.dec();
        });
    }
}
