// ===============================
// src/audit.rs
// ===============================
//
// Forwarder for audit events:
// - Handlers call AuditSink::record (non-blocking try_send).
// - One background task drains the channel and POSTs each event as JSON
//   to the audit service endpoint for its kind.
// - Delivery failures are logged and counted, never surfaced to handlers.
//
use chrono::Utc;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::domain::AuditEvent;
use crate::metrics::AUDIT_POSTS;

pub const CHANNEL_CAPACITY: usize = 8192;

#[derive(Clone)]
pub struct AuditSink {
    tx: mpsc::Sender<AuditEvent>,
}

impl AuditSink {
    pub fn new(tx: mpsc::Sender<AuditEvent>) -> Self {
        Self { tx }
    }

    /// Queue an event for delivery. Dropping on a full channel is preferable
    /// to stalling a command handler on the audit service.
    pub fn record(&self, event: AuditEvent) {
        if let Err(e) = self.tx.try_send(event) {
            warn!(?e, "audit: channel full, event dropped");
        }
    }
}

#[derive(Serialize)]
struct Envelope<'a> {
    timestamp: i64,
    #[serde(flatten)]
    event: &'a AuditEvent,
}

pub async fn run(mut rx: mpsc::Receiver<AuditEvent>, base_url: String) {
    info!(%base_url, "audit: started");
    let base = base_url.trim_end_matches('/').to_string();
    let http = reqwest::Client::new();

    while let Some(event) = rx.recv().await {
        let url = format!("{}{}", base, event.endpoint());
        let body = Envelope {
            timestamp: Utc::now().timestamp_millis(),
            event: &event,
        };
        match http.post(&url).json(&body).send().await {
            Ok(rsp) if rsp.status().is_success() => {
                AUDIT_POSTS.with_label_values(&[event.kind(), "ok"]).inc();
            }
            Ok(rsp) => {
                // keep the payload in the local log so the record survives
                let payload = serde_json::to_string(&body).unwrap_or_default();
                error!(code = %rsp.status(), kind = event.kind(), %payload, "audit: post rejected");
                AUDIT_POSTS.with_label_values(&[event.kind(), "err"]).inc();
            }
            Err(e) => {
                let payload = serde_json::to_string(&body).unwrap_or_default();
                error!(?e, kind = event.kind(), %payload, "audit: post failed");
                AUDIT_POSTS.with_label_values(&[event.kind(), "err"]).inc();
            }
        }
    }
    info!("audit: channel closed, stopped");
}
