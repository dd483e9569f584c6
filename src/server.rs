// ===============================
// src/server.rs
// ===============================
//
// Wire protocol: one comma-delimited ASCII command per connection, one
// single-token response written back, then the connection closes.
//
// The grammar below is deterministic: the leading token plus the token
// count select exactly one command, so no two patterns can match the same
// line. Amount fields stay raw strings here; the engine parses them so an
// unparsable number becomes a "-1" plus a SystemError audit event instead
// of a dropped line.
//
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{error, info, warn};

use crate::engine::TransactionEngine;
use crate::metrics::{COMMANDS, CONNECTIONS};
use crate::quote::QuoteSource;
use crate::store::AccountStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Add { user: String, amount: String },
    Quote { user: String, stock: String },
    Buy { user: String, stock: String, amount: String },
    CommitBuy { user: String },
    CancelBuy { user: String },
    Sell { user: String, stock: String, amount: String },
    CommitSell { user: String },
    CancelSell { user: String },
    SetBuyAmount { user: String, stock: String, amount: String },
    SetBuyTrigger { user: String, stock: String, amount: String },
    CancelSetBuy { user: String, stock: String },
    SetSellAmount { user: String, stock: String, amount: String },
    SetSellTrigger { user: String, stock: String, amount: String },
    CancelSetSell { user: String, stock: String },
    DumpLogUser { user: String, filename: String },
    DumpLog { filename: String },
    DisplaySummary { user: String },
}

impl Command {
    pub fn parse(line: &str) -> Option<Command> {
        let tokens: Vec<&str> = line.split(',').map(str::trim).collect();
        if tokens.iter().skip(1).any(|t| t.is_empty()) {
            return None;
        }
        let arg = |i: usize| tokens[i].to_string();

        match (tokens[0], tokens.len()) {
            ("ADD", 3) => Some(Command::Add { user: arg(1), amount: arg(2) }),
            ("QUOTE", 3) => Some(Command::Quote { user: arg(1), stock: arg(2) }),
            ("BUY", 4) => Some(Command::Buy { user: arg(1), stock: arg(2), amount: arg(3) }),
            ("COMMIT_BUY", 2) => Some(Command::CommitBuy { user: arg(1) }),
            ("CANCEL_BUY", 2) => Some(Command::CancelBuy { user: arg(1) }),
            ("SELL", 4) => Some(Command::Sell { user: arg(1), stock: arg(2), amount: arg(3) }),
            ("COMMIT_SELL", 2) => Some(Command::CommitSell { user: arg(1) }),
            ("CANCEL_SELL", 2) => Some(Command::CancelSell { user: arg(1) }),
            ("SET_BUY_AMOUNT", 4) => {
                Some(Command::SetBuyAmount { user: arg(1), stock: arg(2), amount: arg(3) })
            }
            ("SET_BUY_TRIGGER", 4) => {
                Some(Command::SetBuyTrigger { user: arg(1), stock: arg(2), amount: arg(3) })
            }
            ("CANCEL_SET_BUY", 3) => Some(Command::CancelSetBuy { user: arg(1), stock: arg(2) }),
            ("SET_SELL_AMOUNT", 4) => {
                Some(Command::SetSellAmount { user: arg(1), stock: arg(2), amount: arg(3) })
            }
            ("SET_SELL_TRIGGER", 4) => {
                Some(Command::SetSellTrigger { user: arg(1), stock: arg(2), amount: arg(3) })
            }
            ("CANCEL_SET_SELL", 3) => Some(Command::CancelSetSell { user: arg(1), stock: arg(2) }),
            ("DUMPLOG", 3) => Some(Command::DumpLogUser { user: arg(1), filename: arg(2) }),
            ("DUMPLOG", 2) => Some(Command::DumpLog { filename: arg(1) }),
            ("DISPLAY_SUMMARY", 2) => Some(Command::DisplaySummary { user: arg(1) }),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Command::Add { .. } => "ADD",
            Command::Quote { .. } => "QUOTE",
            Command::Buy { .. } => "BUY",
            Command::CommitBuy { .. } => "COMMIT_BUY",
            Command::CancelBuy { .. } => "CANCEL_BUY",
            Command::Sell { .. } => "SELL",
            Command::CommitSell { .. } => "COMMIT_SELL",
            Command::CancelSell { .. } => "CANCEL_SELL",
            Command::SetBuyAmount { .. } => "SET_BUY_AMOUNT",
            Command::SetBuyTrigger { .. } => "SET_BUY_TRIGGER",
            Command::CancelSetBuy { .. } => "CANCEL_SET_BUY",
            Command::SetSellAmount { .. } => "SET_SELL_AMOUNT",
            Command::SetSellTrigger { .. } => "SET_SELL_TRIGGER",
            Command::CancelSetSell { .. } => "CANCEL_SET_SELL",
            Command::DumpLogUser { .. } => "DUMPLOG",
            Command::DumpLog { .. } => "DUMPLOG",
            Command::DisplaySummary { .. } => "DISPLAY_SUMMARY",
        }
    }
}

/// Accept loop. Each connection is served by its own task so one slow
/// command never blocks unrelated clients.
pub async fn run<S: AccountStore, Q: QuoteSource>(
    engine: Arc<TransactionEngine<S, Q>>,
    listener: TcpListener,
) {
    match listener.local_addr() {
        Ok(addr) => info!(%addr, "command socket listening"),
        Err(e) => warn!(?e, "command socket listening (addr unknown)"),
    }
    let next_txn = Arc::new(AtomicU64::new(0));

    loop {
        let (socket, _) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                error!(?e, "accept failed");
                continue;
            }
        };
        CONNECTIONS.inc();
        let engine = engine.clone();
        let next_txn = next_txn.clone();
        tokio::spawn(async move {
            handle_conn(socket, engine, next_txn).await;
        });
    }
}

async fn handle_conn<S: AccountStore, Q: QuoteSource>(
    mut socket: TcpStream,
    engine: Arc<TransactionEngine<S, Q>>,
    next_txn: Arc<AtomicU64>,
) {
    let mut buf = vec![0u8; 1024];
    let n = match socket.read(&mut buf).await {
        Ok(0) => return,
        Ok(n) => n,
        Err(e) => {
            warn!(?e, "request read failed");
            return;
        }
    };

    let raw = String::from_utf8_lossy(&buf[..n]);
    let line = raw.trim_matches(|c: char| c == '\0' || c.is_whitespace());

    let Some(cmd) = Command::parse(line) else {
        // unmatched lines are dropped: local diagnostic, no response
        warn!(%line, "unmatched command line");
        return;
    };

    let txn = next_txn.fetch_add(1, Ordering::Relaxed) + 1;
    let name = cmd.name();
    let response = engine.dispatch(cmd, txn).await;

    let outcome = if response == "-1" { "err" } else { "ok" };
    COMMANDS.with_label_values(&[name, outcome]).inc();

    if let Err(e) = socket.write_all(response.as_bytes()).await {
        warn!(?e, "response write failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_command_parses() {
        let cases = [
            ("ADD,alice,100.00", "ADD"),
            ("QUOTE,alice,XYZ", "QUOTE"),
            ("BUY,alice,XYZ,50.00", "BUY"),
            ("COMMIT_BUY,alice", "COMMIT_BUY"),
            ("CANCEL_BUY,alice", "CANCEL_BUY"),
            ("SELL,alice,XYZ,50.00", "SELL"),
            ("COMMIT_SELL,alice", "COMMIT_SELL"),
            ("CANCEL_SELL,alice", "CANCEL_SELL"),
            ("SET_BUY_AMOUNT,alice,XYZ,30.00", "SET_BUY_AMOUNT"),
            ("SET_BUY_TRIGGER,alice,XYZ,9.00", "SET_BUY_TRIGGER"),
            ("CANCEL_SET_BUY,alice,XYZ", "CANCEL_SET_BUY"),
            ("SET_SELL_AMOUNT,alice,XYZ,30.00", "SET_SELL_AMOUNT"),
            ("SET_SELL_TRIGGER,alice,XYZ,12.00", "SET_SELL_TRIGGER"),
            ("CANCEL_SET_SELL,alice,XYZ", "CANCEL_SET_SELL"),
            ("DUMPLOG,alice,out.log", "DUMPLOG"),
            ("DUMPLOG,out.log", "DUMPLOG"),
            ("DISPLAY_SUMMARY,alice", "DISPLAY_SUMMARY"),
        ];
        for (line, name) in cases {
            let cmd = Command::parse(line).unwrap_or_else(|| panic!("{line} did not parse"));
            assert_eq!(cmd.name(), name, "{line}");
        }
    }

    #[test]
    fn dumplog_arity_disambiguates() {
        assert_eq!(
            Command::parse("DUMPLOG,alice,out.log"),
            Some(Command::DumpLogUser { user: "alice".into(), filename: "out.log".into() })
        );
        assert_eq!(
            Command::parse("DUMPLOG,out.log"),
            Some(Command::DumpLog { filename: "out.log".into() })
        );
    }

    #[test]
    fn bad_lines_are_rejected() {
        for line in [
            "",
            "NOPE,alice",
            "ADD,alice",              // missing amount
            "ADD,alice,1.00,extra",   // too many tokens
            "BUY,alice,XYZ",          // missing amount
            "COMMIT_BUY",             // missing user
            "ADD,,1.00",              // empty placeholder
        ] {
            assert_eq!(Command::parse(line), None, "{line:?}");
        }
    }
}
