// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! ChatHub Server
//!
//! A directed chat server over a line-oriented TCP protocol.
//! Provides:
//! - Authenticated sessions with one live connection per user
//! - Store-and-forward delivery with offline history
//! - Per-sender unread tracking
//! - HTTP endpoints for health checks and Prometheus metrics

use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{error, info, warn};

use chathub_server::config::ChatConfig;
use chathub_server::connection_registry::ConnectionRegistry;
use chathub_server::error::{StartupError, StorageError};
use chathub_server::handler::ConnectionDeps;
use chathub_server::http::{create_router, HttpState};
use chathub_server::metrics::ChatMetrics;
use chathub_server::server;
use chathub_server::storage::{create_chat_store, ChatStore};

#[tokio::main]
async fn main() {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("chathub_server=info".parse().unwrap()),
        )
        .init();

    if let Err(e) = run(ChatConfig::from_env()).await {
        error!("Fatal: {}", e);
        std::process::exit(1);
    }
}

/// Creates configured accounts that do not exist yet.
fn provision_accounts(store: &dyn ChatStore, accounts: &[(String, String)]) {
    for (username, password) in accounts {
        match store.provision_account(username, password) {
            Ok(_) => info!("Provisioned account {}", username),
            Err(StorageError::DuplicateAccount(_)) => {}
            Err(e) => warn!("Failed to provision account {}: {}", username, e),
        }
    }
}

async fn run(config: ChatConfig) -> Result<(), StartupError> {
    info!("Starting ChatHub Server v{}", env!("CARGO_PKG_VERSION"));
    info!("Chat protocol: {}", config.listen_addr);
    info!("Storage backend: {:?}", config.storage_backend);
    info!("Duplicate login policy: {:?}", config.duplicate_login);

    let store: Arc<dyn ChatStore> = Arc::from(create_chat_store(
        config.storage_backend,
        &config.data_dir,
        config.password_iterations,
    )?);
    provision_accounts(store.as_ref(), &config.provision_accounts);
    info!(
        "Chat store ready: {} accounts, {} messages",
        store.account_count()?,
        store.message_count()?
    );

    let metrics = ChatMetrics::new()?;
    let registry = Arc::new(ConnectionRegistry::with_options(
        config.duplicate_login,
        config.outbound_queue,
    ));

    let mut deps = ConnectionDeps::new(store, registry.clone(), metrics.clone());
    deps.max_line_length = config.max_line_length;
    deps.rate_limit_per_min = config.rate_limit_per_min;
    let shutdown = deps.shutdown.clone();

    // Start HTTP server for health/metrics
    if let Some(http_addr) = config.metrics_addr.clone() {
        if config.metrics_token.is_some() {
            info!("Metrics endpoint protected with bearer token");
        } else if !http_addr.starts_with("127.0.0.1") && !http_addr.starts_with("localhost") {
            warn!("Metrics exposed on non-localhost without auth token");
        }

        let http_router = create_router(HttpState {
            metrics: metrics.clone(),
            registry: registry.clone(),
            metrics_token: config.metrics_token.clone(),
        });
        let http_listener =
            TcpListener::bind(&http_addr)
                .await
                .map_err(|source| StartupError::Bind {
                    addr: http_addr.clone(),
                    source,
                })?;

        let http_shutdown = shutdown.clone();
        tokio::spawn(async move {
            info!("HTTP server listening on {}", http_addr);
            if let Err(e) = axum::serve(http_listener, http_router)
                .with_graceful_shutdown(http_shutdown.cancelled_owned())
                .await
            {
                error!("{}", StartupError::Http(e));
            }
        });
    }

    let listener = TcpListener::bind(config.listen_addr)
        .await
        .map_err(|source| StartupError::Bind {
            addr: config.listen_addr.to_string(),
            source,
        })?;
    info!("Chat server listening on {}", config.listen_addr);

    let ctrl_c_shutdown = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutdown requested");
                ctrl_c_shutdown.cancel();
            }
            Err(e) => warn!("Cannot listen for Ctrl-C: {}", e),
        }
    });

    server::serve(listener, deps, config.max_connections).await;
    info!("Server stopped");
    Ok(())
}
