// ===============================
// src/domain.rs
// ===============================
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A proposed buy or sell awaiting COMMIT or CANCEL.
/// `cost` is the exact amount debited (buy) or credited on commit (sell);
/// the order is only valid for the configured window after `created_at`.
#[derive(Debug, Clone)]
pub struct PendingOrder {
    pub stock: String,
    pub cost: Decimal,
    pub shares: u64,
    pub created_at: DateTime<Utc>,
}

impl PendingOrder {
    pub fn new(stock: String, cost: Decimal, shares: u64) -> Self {
        Self {
            stock,
            cost,
            shares,
            created_at: Utc::now(),
        }
    }

    pub fn is_expired(&self, ttl: chrono::Duration) -> bool {
        Utc::now().signed_duration_since(self.created_at) >= ttl
    }
}

/// Trigger lifecycle. Terminal states absorb; `Armed` is only reachable
/// from `AmountSet`, and the transition into a terminal state is a CAS so
/// a firing poller and a cancel can never both win.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TriggerState {
    AmountSet = 0,
    Armed = 1,
    Executed = 2,
    Canceled = 3,
}

impl TriggerState {
    pub fn from_u8(v: u8) -> TriggerState {
        match v {
            0 => TriggerState::AmountSet,
            1 => TriggerState::Armed,
            2 => TriggerState::Executed,
            _ => TriggerState::Canceled,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TriggerState::Executed | TriggerState::Canceled)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TriggerKey {
    pub user: String,
    pub stock: String,
    pub side: Side,
}

/// Price answer from the quote layer. `from_cache` tells the caller whether
/// an external round trip (and hence a QuoteServer audit event) happened.
#[derive(Debug, Clone, Copy)]
pub struct PriceQuote {
    pub price: Decimal,
    pub from_cache: bool,
}

/// One line of the external quote protocol:
/// `price,stock,user,timestamp,key`.
#[derive(Debug, Clone)]
pub struct QuoteReply {
    pub price: Decimal,
    pub stock: String,
    pub user: String,
    pub timestamp: u64,
    pub key: String,
}

/// Closed set of audit events; each maps to one endpoint on the audit
/// service. Field names follow the audit service's wire contract.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum AuditEvent {
    AccountTransaction {
        server: String,
        #[serde(rename = "transactionNum")]
        transaction_num: u64,
        action: String,
        username: String,
        funds: Decimal,
    },
    SystemEvent {
        server: String,
        #[serde(rename = "transactionNum")]
        transaction_num: u64,
        command: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        username: Option<String>,
        #[serde(rename = "stockSymbol", skip_serializing_if = "Option::is_none")]
        stock: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        filename: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        funds: Option<Decimal>,
    },
    SystemError {
        server: String,
        #[serde(rename = "transactionNum")]
        transaction_num: u64,
        command: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        username: Option<String>,
        #[serde(rename = "stockSymbol", skip_serializing_if = "Option::is_none")]
        stock: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        filename: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        funds: Option<Decimal>,
        #[serde(rename = "errorMessage")]
        error_message: String,
    },
    QuoteServer {
        server: String,
        #[serde(rename = "transactionNum")]
        transaction_num: u64,
        price: Decimal,
        #[serde(rename = "stockSymbol")]
        stock: String,
        username: String,
        #[serde(rename = "quoteServerTime")]
        quote_server_time: u64,
        #[serde(rename = "cryptoKey")]
        crypto_key: String,
    },
    DumpLog {
        filename: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        username: Option<String>,
    },
}

impl AuditEvent {
    pub fn endpoint(&self) -> &'static str {
        match self {
            AuditEvent::AccountTransaction { .. } => "/accountTransaction",
            AuditEvent::SystemEvent { .. } => "/systemEvent",
            AuditEvent::SystemError { .. } => "/errorEvent",
            AuditEvent::QuoteServer { .. } => "/quoteServer",
            AuditEvent::DumpLog { .. } => "/dumpLog",
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            AuditEvent::AccountTransaction { .. } => "account_transaction",
            AuditEvent::SystemEvent { .. } => "system_event",
            AuditEvent::SystemError { .. } => "system_error",
            AuditEvent::QuoteServer { .. } => "quote_server",
            AuditEvent::DumpLog { .. } => "dump_log",
        }
    }
}
