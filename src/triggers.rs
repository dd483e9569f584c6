// ===============================
// src/triggers.rs
// ===============================
//
// Conditional orders. Lifecycle per (user, stock, side):
//
//   SET_*_AMOUNT   -> AmountSet   (buy: dollars moved to reserve)
//   SET_*_TRIGGER  -> Armed       (sell: shares moved to reserve; poller starts)
//   CANCEL_SET_*   -> Canceled    (reservation returned)
//   poller fires   -> Executed    (settlement at the firing price)
//
// The transition into a terminal state is a compare-and-swap on the
// trigger's state word; a cancel racing a firing poller therefore resolves
// to exactly one winner, and only the winner touches the account. The
// poller exits whenever the state leaves Armed, for any reason.
//
// Callers of set_amount/set_trigger/cancel hold the user's exclusive lock;
// pollers take it themselves for the settlement.
//
use ahash::AHashMap as HashMap;
use rust_decimal::Decimal;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::audit::AuditSink;
use crate::domain::{AuditEvent, Side, TriggerKey, TriggerState};
use crate::error::{Result, ServerError};
use crate::metrics::{TRIGGERS_ARMED, TRIGGERS_RESOLVED};
use crate::orders::max_purchase;
use crate::quote::QuoteSource;
use crate::store::{AccountStore, UserLocks};

pub struct Trigger {
    pub user: String,
    pub stock: String,
    pub side: Side,
    /// Dollar basis of the trigger: the reserved amount for a buy, the
    /// sell-up-to amount for a sell.
    pub reserved_amount: Decimal,
    /// Shares actually withheld when a sell trigger armed.
    reserved_shares: AtomicU64,
    threshold: OnceLock<Decimal>,
    transaction_num: AtomicU64,
    state: AtomicU8,
}

impl Trigger {
    fn new(user: String, stock: String, side: Side, reserved_amount: Decimal, txn: u64) -> Self {
        Self {
            user,
            stock,
            side,
            reserved_amount,
            reserved_shares: AtomicU64::new(0),
            threshold: OnceLock::new(),
            transaction_num: AtomicU64::new(txn),
            state: AtomicU8::new(TriggerState::AmountSet as u8),
        }
    }

    pub fn state(&self) -> TriggerState {
        TriggerState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn threshold(&self) -> Option<Decimal> {
        self.threshold.get().copied()
    }

    pub fn reserved_shares(&self) -> u64 {
        self.reserved_shares.load(Ordering::Acquire)
    }

    fn transaction_num(&self) -> u64 {
        self.transaction_num.load(Ordering::Relaxed)
    }

    /// Single atomic state step; returns whether this caller won it.
    fn try_transition(&self, from: TriggerState, to: TriggerState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

#[derive(Debug, Clone)]
pub struct TriggerView {
    pub stock: String,
    pub side: Side,
    pub state: TriggerState,
    pub reserved_amount: Decimal,
    pub threshold: Option<Decimal>,
}

pub struct TriggerEngine<S, Q> {
    inner: Arc<Inner<S, Q>>,
}

impl<S, Q> Clone for TriggerEngine<S, Q> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct Inner<S, Q> {
    server_name: String,
    store: Arc<S>,
    quote: Arc<Q>,
    audit: AuditSink,
    locks: Arc<UserLocks>,
    poll_interval: Duration,
    /// Live (non-terminal) triggers only; terminal ones are removed as
    /// part of the winning transition.
    triggers: Mutex<HashMap<TriggerKey, Arc<Trigger>>>,
}

impl<S: AccountStore, Q: QuoteSource> TriggerEngine<S, Q> {
    pub fn new(
        server_name: String,
        store: Arc<S>,
        quote: Arc<Q>,
        audit: AuditSink,
        locks: Arc<UserLocks>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                server_name,
                store,
                quote,
                audit,
                locks,
                poll_interval,
                triggers: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn trigger(&self, user: &str, stock: &str, side: Side) -> Option<Arc<Trigger>> {
        let key = TriggerKey {
            user: user.to_string(),
            stock: stock.to_string(),
            side,
        };
        self.inner.triggers.lock().unwrap().get(&key).cloned()
    }

    pub fn user_triggers(&self, user: &str) -> Vec<TriggerView> {
        self.inner
            .triggers
            .lock()
            .unwrap()
            .values()
            .filter(|t| t.user == user)
            .map(|t| TriggerView {
                stock: t.stock.clone(),
                side: t.side,
                state: t.state(),
                reserved_amount: t.reserved_amount,
                threshold: t.threshold(),
            })
            .collect()
    }

    /// First phase: reserve the trigger's basis. Buy moves `amount` from
    /// balance to reserve; sell only verifies the derived share count is
    /// covered (shares move at arm time).
    pub async fn set_amount(
        &self,
        user: &str,
        stock: &str,
        side: Side,
        amount: Decimal,
        txn: u64,
    ) -> Result<()> {
        if self.trigger(user, stock, side).is_some() {
            return Err(ServerError::DuplicateTrigger);
        }

        match side {
            Side::Buy => {
                if self.inner.store.funds(user).await? < amount {
                    return Err(ServerError::InsufficientFunds);
                }
                self.inner.store.remove_funds(user, amount).await?;
                self.inner.store.add_reserve_funds(user, amount).await?;
            }
            Side::Sell => {
                let quote = self.inner.quote.query(user, stock, txn).await?;
                let (_, shares) = max_purchase(amount, quote.price);
                if shares == 0 {
                    return Err(ServerError::InvalidArgument(
                        "amount covers zero shares at the current price".into(),
                    ));
                }
                if self.inner.store.shares(user, stock).await? < shares {
                    return Err(ServerError::InsufficientShares);
                }
            }
        }

        let key = TriggerKey {
            user: user.to_string(),
            stock: stock.to_string(),
            side,
        };
        let trig = Arc::new(Trigger::new(
            user.to_string(),
            stock.to_string(),
            side,
            amount,
            txn,
        ));
        self.inner.triggers.lock().unwrap().insert(key, trig);
        Ok(())
    }

    /// Second phase: store the threshold, take the sell-side share
    /// reservation at the current price, and start the poller.
    pub async fn set_trigger(
        &self,
        user: &str,
        stock: &str,
        side: Side,
        threshold: Decimal,
        txn: u64,
    ) -> Result<()> {
        let trig = self
            .trigger(user, stock, side)
            .ok_or(ServerError::NoActiveTrigger)?;
        if trig.state() != TriggerState::AmountSet {
            return Err(ServerError::NoActiveTrigger);
        }

        let mut reserved_shares = 0u64;
        if side == Side::Sell {
            let quote = self.inner.quote.query(user, stock, txn).await?;
            let (_, shares) = max_purchase(trig.reserved_amount, quote.price);
            if shares == 0 {
                return Err(ServerError::InvalidArgument(
                    "amount covers zero shares at the current price".into(),
                ));
            }
            if self.inner.store.shares(user, stock).await? < shares {
                return Err(ServerError::InsufficientShares);
            }
            self.inner.store.remove_shares(user, stock, shares).await?;
            self.inner.store.add_reserve_shares(user, stock, shares).await?;
            reserved_shares = shares;
        }

        let _ = trig.threshold.set(threshold);
        trig.reserved_shares.store(reserved_shares, Ordering::Release);
        trig.transaction_num.store(txn, Ordering::Relaxed);

        if !trig.try_transition(TriggerState::AmountSet, TriggerState::Armed) {
            // Lost the slot while reserving; hand the shares back.
            if reserved_shares > 0 {
                let _ = self
                    .inner
                    .store
                    .remove_reserve_shares(user, stock, reserved_shares)
                    .await;
                let _ = self.inner.store.add_shares(user, stock, reserved_shares).await;
            }
            return Err(ServerError::NoActiveTrigger);
        }

        TRIGGERS_ARMED.inc();
        info!(user, stock, side = %side, %threshold, "trigger armed");

        let inner = self.inner.clone();
        tokio::spawn(async move {
            poll_loop(inner, trig).await;
        });
        Ok(())
    }

    /// Destroy the trigger from AmountSet or Armed, returning whatever was
    /// reserved. A trigger that already executed (or was already canceled)
    /// reports NoActiveTrigger and changes nothing.
    pub async fn cancel(&self, user: &str, stock: &str, side: Side) -> Result<()> {
        let trig = self
            .trigger(user, stock, side)
            .ok_or(ServerError::NoActiveTrigger)?;

        let was_armed = if trig.try_transition(TriggerState::AmountSet, TriggerState::Canceled) {
            false
        } else if trig.try_transition(TriggerState::Armed, TriggerState::Canceled) {
            true
        } else {
            return Err(ServerError::NoActiveTrigger);
        };

        // This caller won the CAS: the trigger is dead whatever happens to
        // the release below.
        self.remove(trig.as_ref());
        if was_armed {
            TRIGGERS_ARMED.dec();
        }
        TRIGGERS_RESOLVED
            .with_label_values(&[side.as_str(), "canceled"])
            .inc();

        match side {
            Side::Buy => {
                self.inner
                    .store
                    .remove_reserve_funds(user, trig.reserved_amount)
                    .await?;
                self.inner.store.add_funds(user, trig.reserved_amount).await?;
            }
            Side::Sell => {
                let shares = trig.reserved_shares();
                if was_armed && shares > 0 {
                    self.inner.store.remove_reserve_shares(user, stock, shares).await?;
                    self.inner.store.add_shares(user, stock, shares).await?;
                }
            }
        }

        info!(user, stock, side = %side, "trigger canceled");
        Ok(())
    }

    fn remove(&self, trig: &Trigger) {
        self.inner.remove(trig);
    }
}

impl<S: AccountStore, Q: QuoteSource> Inner<S, Q> {
    fn remove(&self, trig: &Trigger) {
        let key = TriggerKey {
            user: trig.user.clone(),
            stock: trig.stock.clone(),
            side: trig.side,
        };
        self.triggers.lock().unwrap().remove(&key);
    }

    /// Exactly-once settlement; only ever entered by the CAS winner.
    async fn settle(&self, trig: &Trigger, price: Decimal) {
        let lock = self.locks.for_user(&trig.user);
        let _guard = lock.lock().await;

        let settled = match trig.side {
            Side::Buy => self.settle_buy(trig, price).await,
            Side::Sell => self.settle_sell(trig, price).await,
        };

        match settled {
            Ok(cost) => {
                info!(
                    user = %trig.user,
                    stock = %trig.stock,
                    side = %trig.side,
                    %price,
                    %cost,
                    "trigger executed"
                );
                self.audit.record(AuditEvent::SystemEvent {
                    server: self.server_name.clone(),
                    transaction_num: trig.transaction_num(),
                    command: match trig.side {
                        Side::Buy => "BUY_TRIGGER_EXECUTED".to_string(),
                        Side::Sell => "SELL_TRIGGER_EXECUTED".to_string(),
                    },
                    username: Some(trig.user.clone()),
                    stock: Some(trig.stock.clone()),
                    filename: None,
                    funds: Some(cost),
                });
                TRIGGERS_RESOLVED
                    .with_label_values(&[trig.side.as_str(), "executed"])
                    .inc();
            }
            Err(e) => {
                // The trigger is terminal either way; a partial settlement
                // is surfaced loudly for reconciliation.
                error!(user = %trig.user, stock = %trig.stock, ?e, "trigger settlement failed");
                self.audit.record(AuditEvent::SystemError {
                    server: self.server_name.clone(),
                    transaction_num: trig.transaction_num(),
                    command: match trig.side {
                        Side::Buy => "BUY_TRIGGER_EXECUTED".to_string(),
                        Side::Sell => "SELL_TRIGGER_EXECUTED".to_string(),
                    },
                    username: Some(trig.user.clone()),
                    stock: Some(trig.stock.clone()),
                    filename: None,
                    funds: Some(trig.reserved_amount),
                    error_message: e.to_string(),
                });
            }
        }

        self.remove(trig);
        TRIGGERS_ARMED.dec();
    }

    /// Buy at the firing price from the reserved dollars; the unspent
    /// remainder of the reservation goes back to the balance.
    async fn settle_buy(&self, trig: &Trigger, price: Decimal) -> Result<Decimal> {
        let (cost, shares) = max_purchase(trig.reserved_amount, price);
        self.store
            .remove_reserve_funds(&trig.user, trig.reserved_amount)
            .await?;
        self.store
            .add_funds(&trig.user, trig.reserved_amount - cost)
            .await?;
        self.store.add_shares(&trig.user, &trig.stock, shares).await?;
        Ok(cost)
    }

    /// Sell at the firing price, never more than was reserved; the
    /// over-reserved remainder returns to the holdings.
    async fn settle_sell(&self, trig: &Trigger, price: Decimal) -> Result<Decimal> {
        let reserved = trig.reserved_shares();
        let (_, computed) = max_purchase(trig.reserved_amount, price);
        let shares = computed.min(reserved);
        let cost = (price * Decimal::from(shares)).round_dp(2);

        self.store
            .remove_reserve_shares(&trig.user, &trig.stock, reserved)
            .await?;
        self.store
            .add_shares(&trig.user, &trig.stock, reserved - shares)
            .await?;
        self.store.add_funds(&trig.user, cost).await?;
        Ok(cost)
    }
}

async fn poll_loop<S: AccountStore, Q: QuoteSource>(inner: Arc<Inner<S, Q>>, trig: Arc<Trigger>) {
    let mut tick = interval(inner.poll_interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tick.tick().await;

        if trig.state() != TriggerState::Armed {
            break;
        }

        let quote = match inner
            .quote
            .query(&trig.user, &trig.stock, trig.transaction_num())
            .await
        {
            Ok(q) => q,
            Err(e) => {
                // Transient; the next tick retries.
                warn!(user = %trig.user, stock = %trig.stock, ?e, "trigger quote failed");
                continue;
            }
        };

        let Some(threshold) = trig.threshold() else {
            continue;
        };
        let crossed = match trig.side {
            Side::Buy => quote.price <= threshold,
            Side::Sell => quote.price >= threshold,
        };
        if !crossed {
            continue;
        }

        if !trig.try_transition(TriggerState::Armed, TriggerState::Executed) {
            // A cancel won the race; it owns the release.
            break;
        }
        inner.settle(&trig, quote.price).await;
        break;
    }
}
