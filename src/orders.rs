// ===============================
// src/orders.rs
// ===============================
//
// Two-phase order protocol: BUY/SELL propose an order into the user's
// single pending slot per side, COMMIT_*/CANCEL_* resolve it. An order
// past its validity window can no longer be committed; it is refunded the
// moment it is observed (commit, cancel, or a new propose), so reserved
// money/shares are never silently lost.
//
// Callers hold the user's exclusive lock across every call here.
//
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::info;

use crate::domain::{PendingOrder, Side};
use crate::error::{Result, ServerError, StoreError};
use crate::store::AccountStore;

/// Largest whole-share purchase `amount` can pay for at `price`:
/// `shares = floor(amount / price)`, `cost = round(price * shares, 2)`.
/// Guarantees `cost <= amount`; the fractional remainder stays with the
/// payer.
pub fn max_purchase(amount: Decimal, price: Decimal) -> (Decimal, u64) {
    if price <= Decimal::ZERO {
        return (Decimal::ZERO, 0);
    }
    let shares = (amount / price).floor().to_u64().unwrap_or(0);
    let cost = (price * Decimal::from(shares)).round_dp(2);
    (cost, shares)
}

pub struct OrderController<S> {
    store: Arc<S>,
    pending_ttl: chrono::Duration,
}

impl<S: AccountStore> OrderController<S> {
    pub fn new(store: Arc<S>, pending_ttl: std::time::Duration) -> Self {
        Self {
            store,
            pending_ttl: chrono::Duration::from_std(pending_ttl)
                .unwrap_or_else(|_| chrono::Duration::seconds(60)),
        }
    }

    /// Reserve the order's resources and place it in the pending slot.
    /// Buy: debits `cost` from the balance. Sell: removes `shares` from
    /// holdings (caller has verified the user owns them).
    pub async fn propose(
        &self,
        user: &str,
        side: Side,
        stock: &str,
        cost: Decimal,
        shares: u64,
    ) -> Result<()> {
        self.clear_slot(user, side).await?;

        match side {
            Side::Buy => self.store.remove_funds(user, cost).await?,
            Side::Sell => {
                if self.store.shares(user, stock).await? < shares {
                    return Err(ServerError::InsufficientShares);
                }
                self.store.remove_shares(user, stock, shares).await?;
            }
        }

        let order = PendingOrder::new(stock.to_string(), cost, shares);
        if let Err(e) = self.store.push_pending(user, side, order).await {
            // Compensate the reservation so no money/shares leak if the
            // slot write fails after the debit.
            let refund = match side {
                Side::Buy => self.store.add_funds(user, cost).await,
                Side::Sell => self.store.add_shares(user, stock, shares).await,
            };
            if let Err(r) = refund {
                return Err(ServerError::Store(StoreError::Unavailable(format!(
                    "pending push failed ({e}) and refund failed ({r})"
                ))));
            }
            return Err(e.into());
        }
        Ok(())
    }

    /// Settle the pending order: buy credits shares, sell credits cash.
    pub async fn commit(&self, user: &str, side: Side) -> Result<PendingOrder> {
        let order = self
            .store
            .pop_pending(user, side)
            .await?
            .ok_or(ServerError::NoPendingOrder(side))?;

        if order.is_expired(self.pending_ttl) {
            self.refund(user, side, &order).await?;
            return Err(ServerError::OrderExpired(side));
        }

        match side {
            Side::Buy => {
                self.store.add_shares(user, &order.stock, order.shares).await?;
            }
            Side::Sell => {
                self.store.add_funds(user, order.cost).await?;
            }
        }
        Ok(order)
    }

    /// Undo the pending order, restoring what propose reserved. Works on
    /// expired orders too; cancel is how stale reservations come back.
    pub async fn cancel(&self, user: &str, side: Side) -> Result<PendingOrder> {
        let order = self
            .store
            .pop_pending(user, side)
            .await?
            .ok_or(ServerError::NoPendingOrder(side))?;
        self.refund(user, side, &order).await?;
        Ok(order)
    }

    async fn refund(&self, user: &str, side: Side, order: &PendingOrder) -> Result<()> {
        match side {
            Side::Buy => self.store.add_funds(user, order.cost).await?,
            Side::Sell => self.store.add_shares(user, &order.stock, order.shares).await?,
        }
        Ok(())
    }

    /// Make room in the pending slot. A live order rejects the new one; an
    /// expired order is refunded and discarded.
    async fn clear_slot(&self, user: &str, side: Side) -> Result<()> {
        if let Some(existing) = self.store.pop_pending(user, side).await? {
            if !existing.is_expired(self.pending_ttl) {
                self.store.push_pending(user, side, existing).await?;
                return Err(ServerError::OrderPending(side));
            }
            info!(user, side = %side, stock = %existing.stock, "expired pending order refunded");
            self.refund(user, side, &existing).await?;
        }
        Ok(())
    }
}
