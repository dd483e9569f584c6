// ===============================
// src/engine.rs
// ===============================
//
// One handler per wire command, composing the quote client, the account
// store, the order controller and the trigger engine. Every outcome emits
// exactly one audit event: AccountTransaction when the cash balance moved,
// SystemEvent for other successes, SystemError for any failure. No error
// propagates past dispatch(); failures become the "-1" token.
//
use rust_decimal::Decimal;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::audit::AuditSink;
use crate::domain::{AuditEvent, Side};
use crate::error::{Result, ServerError};
use crate::orders::{max_purchase, OrderController};
use crate::quote::QuoteSource;
use crate::server::Command;
use crate::store::{AccountStore, UserLocks};
use crate::triggers::TriggerEngine;

pub struct TransactionEngine<S, Q> {
    server_name: String,
    store: Arc<S>,
    quote: Arc<Q>,
    audit: AuditSink,
    orders: OrderController<S>,
    triggers: TriggerEngine<S, Q>,
    locks: Arc<UserLocks>,
}

impl<S: AccountStore, Q: QuoteSource> TransactionEngine<S, Q> {
    pub fn new(
        server_name: String,
        store: Arc<S>,
        quote: Arc<Q>,
        audit: AuditSink,
        pending_ttl: Duration,
        trigger_poll: Duration,
    ) -> Self {
        let locks = Arc::new(UserLocks::new());
        let orders = OrderController::new(store.clone(), pending_ttl);
        let triggers = TriggerEngine::new(
            server_name.clone(),
            store.clone(),
            quote.clone(),
            audit.clone(),
            locks.clone(),
            trigger_poll,
        );
        Self {
            server_name,
            store,
            quote,
            audit,
            orders,
            triggers,
            locks,
        }
    }

    pub fn triggers(&self) -> &TriggerEngine<S, Q> {
        &self.triggers
    }

    /// Run one command to completion and produce its response token.
    pub async fn dispatch(&self, cmd: Command, txn: u64) -> String {
        match cmd {
            Command::Add { user, amount } => {
                let funds = Decimal::from_str(&amount).ok();
                let res = self.add(&user, &amount, txn).await;
                self.complete("ADD", txn, Some(user), None, None, funds, res)
            }
            Command::Quote { user, stock } => {
                let res = self.quote_cmd(&user, &stock, txn).await;
                self.complete("QUOTE", txn, Some(user), Some(stock), None, None, res)
            }
            Command::Buy { user, stock, amount } => {
                let funds = Decimal::from_str(&amount).ok();
                let res = self.buy(&user, &stock, &amount, txn).await;
                self.complete("BUY", txn, Some(user), Some(stock), None, funds, res)
            }
            Command::CommitBuy { user } => {
                let res = self.commit_buy(&user, txn).await;
                self.complete("COMMIT_BUY", txn, Some(user), None, None, None, res)
            }
            Command::CancelBuy { user } => {
                let res = self.cancel_buy(&user, txn).await;
                self.complete("CANCEL_BUY", txn, Some(user), None, None, None, res)
            }
            Command::Sell { user, stock, amount } => {
                let funds = Decimal::from_str(&amount).ok();
                let res = self.sell(&user, &stock, &amount, txn).await;
                self.complete("SELL", txn, Some(user), Some(stock), None, funds, res)
            }
            Command::CommitSell { user } => {
                let res = self.commit_sell(&user, txn).await;
                self.complete("COMMIT_SELL", txn, Some(user), None, None, None, res)
            }
            Command::CancelSell { user } => {
                let res = self.cancel_sell(&user, txn).await;
                self.complete("CANCEL_SELL", txn, Some(user), None, None, None, res)
            }
            Command::SetBuyAmount { user, stock, amount } => {
                let funds = Decimal::from_str(&amount).ok();
                let res = self.set_amount(&user, &stock, Side::Buy, &amount, txn).await;
                self.complete("SET_BUY_AMOUNT", txn, Some(user), Some(stock), None, funds, res)
            }
            Command::SetBuyTrigger { user, stock, amount } => {
                let funds = Decimal::from_str(&amount).ok();
                let res = self.set_trigger(&user, &stock, Side::Buy, &amount, txn).await;
                self.complete("SET_BUY_TRIGGER", txn, Some(user), Some(stock), None, funds, res)
            }
            Command::CancelSetBuy { user, stock } => {
                let res = self.cancel_set(&user, &stock, Side::Buy, txn).await;
                self.complete("CANCEL_SET_BUY", txn, Some(user), Some(stock), None, None, res)
            }
            Command::SetSellAmount { user, stock, amount } => {
                let funds = Decimal::from_str(&amount).ok();
                let res = self.set_amount(&user, &stock, Side::Sell, &amount, txn).await;
                self.complete("SET_SELL_AMOUNT", txn, Some(user), Some(stock), None, funds, res)
            }
            Command::SetSellTrigger { user, stock, amount } => {
                let funds = Decimal::from_str(&amount).ok();
                let res = self.set_trigger(&user, &stock, Side::Sell, &amount, txn).await;
                self.complete("SET_SELL_TRIGGER", txn, Some(user), Some(stock), None, funds, res)
            }
            Command::CancelSetSell { user, stock } => {
                let res = self.cancel_set(&user, &stock, Side::Sell, txn).await;
                self.complete("CANCEL_SET_SELL", txn, Some(user), Some(stock), None, None, res)
            }
            Command::DumpLogUser { user, filename } => {
                let res = self.dump_log(Some(&user), &filename).await;
                self.complete("DUMPLOG", txn, Some(user), None, Some(filename), None, res)
            }
            Command::DumpLog { filename } => {
                let res = self.dump_log(None, &filename).await;
                self.complete("DUMPLOG", txn, None, None, Some(filename), None, res)
            }
            Command::DisplaySummary { user } => {
                let res = self.display_summary(&user, txn).await;
                self.complete("DISPLAY_SUMMARY", txn, Some(user), None, None, None, res)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn complete(
        &self,
        command: &'static str,
        txn: u64,
        username: Option<String>,
        stock: Option<String>,
        filename: Option<String>,
        funds: Option<Decimal>,
        res: Result<String>,
    ) -> String {
        match res {
            Ok(token) => token,
            Err(e) => {
                warn!(command, user = username.as_deref().unwrap_or("-"), %e, "command failed");
                self.audit.record(AuditEvent::SystemError {
                    server: self.server_name.clone(),
                    transaction_num: txn,
                    command: command.to_string(),
                    username,
                    stock,
                    filename,
                    funds,
                    error_message: e.to_string(),
                });
                "-1".to_string()
            }
        }
    }

    async fn add(&self, user: &str, amount: &str, txn: u64) -> Result<String> {
        let amount = parse_amount(amount)?;
        let lock = self.locks.for_user(user);
        let _guard = lock.lock().await;

        self.store.add_funds(user, amount).await?;
        self.audit.record(AuditEvent::AccountTransaction {
            server: self.server_name.clone(),
            transaction_num: txn,
            action: "add".to_string(),
            username: user.to_string(),
            funds: amount,
        });
        Ok("1".to_string())
    }

    async fn quote_cmd(&self, user: &str, stock: &str, txn: u64) -> Result<String> {
        let quote = self.quote.query(user, stock, txn).await?;
        if quote.from_cache {
            // fresh fetches are audited by the quote client itself
            self.audit.record(AuditEvent::SystemEvent {
                server: self.server_name.clone(),
                transaction_num: txn,
                command: "QUOTE".to_string(),
                username: Some(user.to_string()),
                stock: Some(stock.to_string()),
                filename: None,
                funds: Some(quote.price),
            });
        }
        Ok(format!("{:.2}", quote.price))
    }

    async fn buy(&self, user: &str, stock: &str, amount: &str, txn: u64) -> Result<String> {
        let amount = parse_amount(amount)?;
        let lock = self.locks.for_user(user);
        let _guard = lock.lock().await;

        if self.store.funds(user).await? < amount {
            return Err(ServerError::InsufficientFunds);
        }
        let quote = self.quote.query(user, stock, txn).await?;
        let (cost, shares) = max_purchase(amount, quote.price);
        if shares == 0 {
            return Err(ServerError::InvalidArgument(
                "amount buys zero shares at the current price".into(),
            ));
        }

        self.orders.propose(user, Side::Buy, stock, cost, shares).await?;
        self.audit.record(AuditEvent::AccountTransaction {
            server: self.server_name.clone(),
            transaction_num: txn,
            action: "remove".to_string(),
            username: user.to_string(),
            funds: cost,
        });
        Ok("1".to_string())
    }

    async fn commit_buy(&self, user: &str, txn: u64) -> Result<String> {
        let lock = self.locks.for_user(user);
        let _guard = lock.lock().await;

        let order = self.orders.commit(user, Side::Buy).await?;
        self.audit.record(AuditEvent::SystemEvent {
            server: self.server_name.clone(),
            transaction_num: txn,
            command: "COMMIT_BUY".to_string(),
            username: Some(user.to_string()),
            stock: Some(order.stock),
            filename: None,
            funds: Some(order.cost),
        });
        Ok("1".to_string())
    }

    async fn cancel_buy(&self, user: &str, txn: u64) -> Result<String> {
        let lock = self.locks.for_user(user);
        let _guard = lock.lock().await;

        let order = self.orders.cancel(user, Side::Buy).await?;
        self.audit.record(AuditEvent::AccountTransaction {
            server: self.server_name.clone(),
            transaction_num: txn,
            action: "add".to_string(),
            username: user.to_string(),
            funds: order.cost,
        });
        Ok("1".to_string())
    }

    async fn sell(&self, user: &str, stock: &str, amount: &str, txn: u64) -> Result<String> {
        let amount = parse_amount(amount)?;
        let lock = self.locks.for_user(user);
        let _guard = lock.lock().await;

        let quote = self.quote.query(user, stock, txn).await?;
        let (cost, shares) = max_purchase(amount, quote.price);
        if shares == 0 {
            return Err(ServerError::InvalidArgument(
                "amount sells zero shares at the current price".into(),
            ));
        }

        self.orders.propose(user, Side::Sell, stock, cost, shares).await?;
        self.audit.record(AuditEvent::SystemEvent {
            server: self.server_name.clone(),
            transaction_num: txn,
            command: "SELL".to_string(),
            username: Some(user.to_string()),
            stock: Some(stock.to_string()),
            filename: None,
            funds: Some(cost),
        });
        Ok("1".to_string())
    }

    async fn commit_sell(&self, user: &str, txn: u64) -> Result<String> {
        let lock = self.locks.for_user(user);
        let _guard = lock.lock().await;

        let order = self.orders.commit(user, Side::Sell).await?;
        self.audit.record(AuditEvent::AccountTransaction {
            server: self.server_name.clone(),
            transaction_num: txn,
            action: "add".to_string(),
            username: user.to_string(),
            funds: order.cost,
        });
        Ok("1".to_string())
    }

    async fn cancel_sell(&self, user: &str, txn: u64) -> Result<String> {
        let lock = self.locks.for_user(user);
        let _guard = lock.lock().await;

        let order = self.orders.cancel(user, Side::Sell).await?;
        self.audit.record(AuditEvent::SystemEvent {
            server: self.server_name.clone(),
            transaction_num: txn,
            command: "CANCEL_SELL".to_string(),
            username: Some(user.to_string()),
            stock: Some(order.stock),
            filename: None,
            funds: Some(order.cost),
        });
        Ok("1".to_string())
    }

    async fn set_amount(
        &self,
        user: &str,
        stock: &str,
        side: Side,
        amount: &str,
        txn: u64,
    ) -> Result<String> {
        let amount = parse_amount(amount)?;
        let lock = self.locks.for_user(user);
        let _guard = lock.lock().await;

        self.triggers.set_amount(user, stock, side, amount, txn).await?;
        self.audit.record(AuditEvent::SystemEvent {
            server: self.server_name.clone(),
            transaction_num: txn,
            command: match side {
                Side::Buy => "SET_BUY_AMOUNT".to_string(),
                Side::Sell => "SET_SELL_AMOUNT".to_string(),
            },
            username: Some(user.to_string()),
            stock: Some(stock.to_string()),
            filename: None,
            funds: Some(amount),
        });
        Ok("1".to_string())
    }

    async fn set_trigger(
        &self,
        user: &str,
        stock: &str,
        side: Side,
        threshold: &str,
        txn: u64,
    ) -> Result<String> {
        let threshold = parse_amount(threshold)?;
        let lock = self.locks.for_user(user);
        let _guard = lock.lock().await;

        self.triggers.set_trigger(user, stock, side, threshold, txn).await?;
        self.audit.record(AuditEvent::SystemEvent {
            server: self.server_name.clone(),
            transaction_num: txn,
            command: match side {
                Side::Buy => "SET_BUY_TRIGGER".to_string(),
                Side::Sell => "SET_SELL_TRIGGER".to_string(),
            },
            username: Some(user.to_string()),
            stock: Some(stock.to_string()),
            filename: None,
            funds: Some(threshold),
        });
        Ok("1".to_string())
    }

    async fn cancel_set(&self, user: &str, stock: &str, side: Side, txn: u64) -> Result<String> {
        let lock = self.locks.for_user(user);
        let _guard = lock.lock().await;

        self.triggers.cancel(user, stock, side).await?;
        self.audit.record(AuditEvent::SystemEvent {
            server: self.server_name.clone(),
            transaction_num: txn,
            command: match side {
                Side::Buy => "CANCEL_SET_BUY".to_string(),
                Side::Sell => "CANCEL_SET_SELL".to_string(),
            },
            username: Some(user.to_string()),
            stock: Some(stock.to_string()),
            filename: None,
            funds: None,
        });
        Ok("1".to_string())
    }

    async fn dump_log(&self, user: Option<&str>, filename: &str) -> Result<String> {
        self.audit.record(AuditEvent::DumpLog {
            filename: filename.to_string(),
            username: user.map(str::to_string),
        });
        Ok("1".to_string())
    }

    async fn display_summary(&self, user: &str, txn: u64) -> Result<String> {
        let lock = self.locks.for_user(user);
        let _guard = lock.lock().await;

        let snapshot = self.store.snapshot(user).await?;
        let triggers = self.triggers.user_triggers(user);
        debug!(
            user,
            balance = %snapshot.balance,
            reserve = %snapshot.reserve_balance,
            holdings = ?snapshot.holdings,
            triggers = ?triggers,
            "account summary"
        );

        self.audit.record(AuditEvent::SystemEvent {
            server: self.server_name.clone(),
            transaction_num: txn,
            command: "DISPLAY_SUMMARY".to_string(),
            username: Some(user.to_string()),
            stock: None,
            filename: None,
            funds: Some(snapshot.balance),
        });
        Ok("1".to_string())
    }
}

fn parse_amount(raw: &str) -> Result<Decimal> {
    let amount = Decimal::from_str(raw)
        .map_err(|_| ServerError::InvalidArgument(format!("bad amount '{raw}'")))?;
    if amount <= Decimal::ZERO {
        return Err(ServerError::InvalidArgument(format!(
            "amount must be positive, got '{raw}'"
        )));
    }
    Ok(amount)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quote::testing::MockQuoteSource;
    use crate::store::MemoryStore;
    use tokio::sync::mpsc;

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    struct Fixture {
        store: Arc<MemoryStore>,
        quote: Arc<MockQuoteSource>,
        engine: TransactionEngine<MemoryStore, MockQuoteSource>,
        audit_rx: mpsc::Receiver<AuditEvent>,
    }

    fn fixture(price: &str) -> Fixture {
        let (tx, rx) = mpsc::channel(256);
        let store = Arc::new(MemoryStore::new());
        let quote = Arc::new(MockQuoteSource::at(dec(price)));
        let engine = TransactionEngine::new(
            "testserve".into(),
            store.clone(),
            quote.clone(),
            AuditSink::new(tx),
            Duration::from_secs(60),
            Duration::from_millis(10),
        );
        Fixture {
            store,
            quote,
            engine,
            audit_rx: rx,
        }
    }

    async fn send(f: &Fixture, line: &str, txn: u64) -> String {
        let cmd = Command::parse(line).unwrap_or_else(|| panic!("{line} did not parse"));
        f.engine.dispatch(cmd, txn).await
    }

    fn drain(f: &mut Fixture) -> Vec<AuditEvent> {
        let mut events = Vec::new();
        while let Ok(ev) = f.audit_rx.try_recv() {
            events.push(ev);
        }
        events
    }

    #[tokio::test]
    async fn add_increases_balance_with_one_event() {
        let mut f = fixture("10.00");
        assert_eq!(send(&f, "ADD,alice,100.00", 1).await, "1");
        assert_eq!(f.store.funds("alice").await.unwrap(), dec("100.00"));

        let events = drain(&mut f);
        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            AuditEvent::AccountTransaction { action, funds, .. }
                if action == "add" && *funds == dec("100.00")
        ));
    }

    #[tokio::test]
    async fn unparsable_amount_is_minus_one_with_system_error() {
        let mut f = fixture("10.00");
        assert_eq!(send(&f, "ADD,alice,abc", 1).await, "-1");
        assert_eq!(f.store.funds("alice").await.unwrap(), Decimal::ZERO);

        let events = drain(&mut f);
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], AuditEvent::SystemError { command, .. } if command == "ADD"));
    }

    #[tokio::test]
    async fn buy_commit_scenario() {
        // alice: 100.00, BUY 50.00 of XYZ at 9.99 -> 5 shares for 49.95
        let f = fixture("9.99");
        send(&f, "ADD,alice,100.00", 1).await;

        assert_eq!(send(&f, "BUY,alice,XYZ,50.00", 2).await, "1");
        assert_eq!(f.store.funds("alice").await.unwrap(), dec("50.05"));
        assert_eq!(f.store.shares("alice", "XYZ").await.unwrap(), 0);

        assert_eq!(send(&f, "COMMIT_BUY,alice", 3).await, "1");
        assert_eq!(f.store.shares("alice", "XYZ").await.unwrap(), 5);
        assert_eq!(f.store.funds("alice").await.unwrap(), dec("50.05"));
    }

    #[tokio::test]
    async fn buy_cancel_restores_exactly() {
        let f = fixture("9.99");
        send(&f, "ADD,alice,100.00", 1).await;
        send(&f, "BUY,alice,XYZ,50.00", 2).await;

        assert_eq!(send(&f, "CANCEL_BUY,alice", 3).await, "1");
        assert_eq!(f.store.funds("alice").await.unwrap(), dec("100.00"));
        assert_eq!(f.store.shares("alice", "XYZ").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn buy_more_than_balance_fails() {
        let f = fixture("9.99");
        send(&f, "ADD,alice,40.00", 1).await;
        assert_eq!(send(&f, "BUY,alice,XYZ,50.00", 2).await, "-1");
        assert_eq!(f.store.funds("alice").await.unwrap(), dec("40.00"));
    }

    #[tokio::test]
    async fn commit_without_pending_fails() {
        let f = fixture("9.99");
        assert_eq!(send(&f, "COMMIT_BUY,alice", 1).await, "-1");
        assert_eq!(send(&f, "CANCEL_SELL,alice", 2).await, "-1");
    }

    #[tokio::test]
    async fn sell_commit_credits_cash() {
        let f = fixture("10.00");
        f.store.add_shares("bob", "ABC", 10).await.unwrap();

        assert_eq!(send(&f, "SELL,bob,ABC,30.00", 1).await, "1");
        assert_eq!(f.store.shares("bob", "ABC").await.unwrap(), 7);

        assert_eq!(send(&f, "COMMIT_SELL,bob", 2).await, "1");
        assert_eq!(f.store.funds("bob").await.unwrap(), dec("30.00"));
    }

    #[tokio::test]
    async fn quote_returns_two_decimal_price() {
        let f = fixture("9.9");
        assert_eq!(send(&f, "QUOTE,alice,XYZ", 1).await, "9.90");
    }

    #[tokio::test]
    async fn set_buy_amount_and_cancel_round_trip() {
        let mut f = fixture("10.00");
        send(&f, "ADD,bob,100.00", 1).await;
        drain(&mut f);

        assert_eq!(send(&f, "SET_BUY_AMOUNT,bob,XYZ,30.00", 2).await, "1");
        assert_eq!(f.store.funds("bob").await.unwrap(), dec("70.00"));
        assert_eq!(f.store.reserve_funds("bob").await.unwrap(), dec("30.00"));

        assert_eq!(send(&f, "CANCEL_SET_BUY,bob,XYZ", 3).await, "1");
        assert_eq!(f.store.funds("bob").await.unwrap(), dec("100.00"));
        assert_eq!(f.store.reserve_funds("bob").await.unwrap(), dec("0.00"));

        // one success SystemEvent per command
        let events = drain(&mut f);
        assert_eq!(events.len(), 2);
        assert!(events
            .iter()
            .all(|e| matches!(e, AuditEvent::SystemEvent { .. })));
    }

    #[tokio::test]
    async fn trigger_fires_through_the_engine() {
        let f = fixture("20.00");
        send(&f, "ADD,alice,100.00", 1).await;
        assert_eq!(send(&f, "SET_BUY_AMOUNT,alice,XYZ,50.00", 2).await, "1");
        assert_eq!(send(&f, "SET_BUY_TRIGGER,alice,XYZ,10.00", 3).await, "1");

        f.quote.set_price(dec("9.99"));
        let trig = f.engine.triggers().trigger("alice", "XYZ", Side::Buy).unwrap();
        for _ in 0..200 {
            if trig.state().is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert_eq!(f.store.shares("alice", "XYZ").await.unwrap(), 5);
        assert_eq!(f.store.funds("alice").await.unwrap(), dec("50.05"));
        assert_eq!(f.store.reserve_funds("alice").await.unwrap(), dec("0.00"));
    }

    #[tokio::test]
    async fn dumplog_and_summary() {
        let mut f = fixture("10.00");
        send(&f, "ADD,alice,10.00", 1).await;
        drain(&mut f);

        assert_eq!(send(&f, "DUMPLOG,alice,audit.log", 2).await, "1");
        assert_eq!(send(&f, "DUMPLOG,audit.log", 3).await, "1");
        assert_eq!(send(&f, "DISPLAY_SUMMARY,alice", 4).await, "1");

        let events = drain(&mut f);
        assert_eq!(events.len(), 3);
        assert!(matches!(
            &events[0],
            AuditEvent::DumpLog { username: Some(u), .. } if u == "alice"
        ));
        assert!(matches!(&events[1], AuditEvent::DumpLog { username: None, .. }));
        assert!(matches!(&events[2], AuditEvent::SystemEvent { command, .. } if command == "DISPLAY_SUMMARY"));
    }
}
