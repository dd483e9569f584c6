// ===============================
// src/main.rs
// ===============================
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{error, info};

use txn_server_rust::audit::{self, AuditSink};
use txn_server_rust::config;
use txn_server_rust::engine::TransactionEngine;
use txn_server_rust::metrics;
use txn_server_rust::quote::CachedQuoteClient;
use txn_server_rust::server;
use txn_server_rust::store::MemoryStore;

#[tokio::main]
async fn main() {
    // ---- Logging ----
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()))
        .init();

    // ---- Load config ----
    let cfg = config::load();

    // ---- Metrics ----
    metrics::init();
    tokio::spawn(metrics::serve_metrics(cfg.metrics_port));

    info!(
        server_name = %cfg.server_name,
        listen = %cfg.listen_addr,
        quote = %cfg.quote_addr,
        audit = %cfg.audit_url,
        quote_cache_ttl_secs = cfg.quote_cache_ttl_secs,
        trigger_poll_ms = cfg.trigger_poll_ms,
        pending_ttl_secs = cfg.pending_ttl_secs,
        "startup config"
    );

    // ---- Audit forwarder ----
    let (audit_tx, audit_rx) = mpsc::channel(audit::CHANNEL_CAPACITY);
    tokio::spawn(audit::run(audit_rx, cfg.audit_url.clone()));
    let audit = AuditSink::new(audit_tx);

    // ---- Collaborators ----
    let store = Arc::new(MemoryStore::new());
    let quote = Arc::new(CachedQuoteClient::new(
        cfg.server_name.clone(),
        cfg.quote_addr.clone(),
        Duration::from_millis(cfg.quote_timeout_ms),
        Duration::from_secs(cfg.quote_cache_ttl_secs),
        audit.clone(),
    ));

    // ---- Transaction engine ----
    let engine = Arc::new(TransactionEngine::new(
        cfg.server_name.clone(),
        store,
        quote,
        audit,
        Duration::from_secs(cfg.pending_ttl_secs),
        Duration::from_millis(cfg.trigger_poll_ms),
    ));

    // ---- Command socket ----
    let listener = match TcpListener::bind(&cfg.listen_addr).await {
        Ok(l) => l,
        Err(e) => {
            error!(?e, addr = %cfg.listen_addr, "command socket bind failed");
            std::process::exit(1);
        }
    };
    server::run(engine, listener).await;
}
