// ===============================
// src/config.rs
// ===============================
//
// All knobs come from the environment (optionally via .env). Defaults match
// the legacy deployment: command socket on 8888, quote source on 4444,
// audit service on 8080.
//
use dotenvy::dotenv;
use std::env;

#[derive(Clone, Debug)]
pub struct Config {
    /// Name this server reports in audit events.
    pub server_name: String,

    /// Address the command socket listens on.
    pub listen_addr: String,

    /// Address of the external quote source (TCP request/reply).
    pub quote_addr: String,

    /// Base URL of the audit service.
    pub audit_url: String,

    pub metrics_port: u16,

    /// Connect timeout for one quote lookup. Must stay small: a hung quote
    /// source would otherwise stall every connection task waiting on it.
    pub quote_timeout_ms: u64,

    /// How long a fetched price stays valid in the quote cache.
    pub quote_cache_ttl_secs: u64,

    /// Poll interval of an armed trigger.
    pub trigger_poll_ms: u64,

    /// Validity window of a pending buy/sell before COMMIT fails.
    pub pending_ttl_secs: u64,
}

fn var_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key).ok().and_then(|s| s.parse().ok()).unwrap_or(default)
}

pub fn load() -> Config {
    let _ = dotenv();

    Config {
        server_name: var_or("SERVER_NAME", "transactionserve"),
        listen_addr: var_or("LISTEN_ADDR", "0.0.0.0:8888"),
        quote_addr: var_or("QUOTE_ADDR", "localhost:4444"),
        audit_url: var_or("AUDIT_URL", "http://localhost:8080"),
        metrics_port: parse_or("METRICS_PORT", 9898),
        quote_timeout_ms: parse_or("QUOTE_TIMEOUT_MS", 30),
        quote_cache_ttl_secs: parse_or("QUOTE_CACHE_TTL_SECS", 60),
        trigger_poll_ms: parse_or("TRIGGER_POLL_MS", 200),
        pending_ttl_secs: parse_or("PENDING_TTL_SECS", 60),
    }
}
