// ===============================
// src/store.rs
// ===============================
//
// Read/write contract of the account store, plus:
// - MemoryStore: the in-process reference implementation.
// - UserLocks: per-user exclusive locks. Every mutation of one user's
//   account (foreground handler or trigger settlement) must run under
//   that user's lock; the store itself only guarantees atomicity of a
//   single call.
//
use ahash::AHashMap as HashMap;
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::domain::{PendingOrder, Side};
use crate::error::StoreError;

#[derive(Debug, Clone, Default)]
pub struct AccountSnapshot {
    pub balance: Decimal,
    pub reserve_balance: Decimal,
    pub holdings: Vec<(String, u64)>,
    pub reserve_holdings: Vec<(String, u64)>,
    pub pending_buy: Option<PendingOrder>,
    pub pending_sell: Option<PendingOrder>,
}

#[async_trait]
pub trait AccountStore: Send + Sync + 'static {
    async fn add_funds(&self, user: &str, amount: Decimal) -> Result<(), StoreError>;
    async fn funds(&self, user: &str) -> Result<Decimal, StoreError>;
    async fn remove_funds(&self, user: &str, amount: Decimal) -> Result<(), StoreError>;

    async fn add_reserve_funds(&self, user: &str, amount: Decimal) -> Result<(), StoreError>;
    async fn reserve_funds(&self, user: &str) -> Result<Decimal, StoreError>;
    async fn remove_reserve_funds(&self, user: &str, amount: Decimal) -> Result<(), StoreError>;

    async fn add_shares(&self, user: &str, stock: &str, shares: u64) -> Result<(), StoreError>;
    async fn shares(&self, user: &str, stock: &str) -> Result<u64, StoreError>;
    async fn remove_shares(&self, user: &str, stock: &str, shares: u64) -> Result<(), StoreError>;

    async fn add_reserve_shares(&self, user: &str, stock: &str, shares: u64)
        -> Result<(), StoreError>;
    async fn reserve_shares(&self, user: &str, stock: &str) -> Result<u64, StoreError>;
    async fn remove_reserve_shares(
        &self,
        user: &str,
        stock: &str,
        shares: u64,
    ) -> Result<(), StoreError>;

    /// Place a pending order in the user's single slot for `side`.
    /// Fails if the slot is occupied.
    async fn push_pending(
        &self,
        user: &str,
        side: Side,
        order: PendingOrder,
    ) -> Result<(), StoreError>;

    /// Take the pending order out of the slot, if any.
    async fn pop_pending(&self, user: &str, side: Side) -> Result<Option<PendingOrder>, StoreError>;

    async fn snapshot(&self, user: &str) -> Result<AccountSnapshot, StoreError>;
}

#[derive(Debug, Default)]
struct AccountRecord {
    balance: Decimal,
    reserve_balance: Decimal,
    holdings: HashMap<String, u64>,
    reserve_holdings: HashMap<String, u64>,
    pending_buy: Option<PendingOrder>,
    pending_sell: Option<PendingOrder>,
}

/// Accounts are created on first touch; reads of unknown users see zeroes,
/// matching the store the legacy deployment ran against.
#[derive(Default)]
pub struct MemoryStore {
    accounts: Mutex<HashMap<String, AccountRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn with_account<T>(
        &self,
        user: &str,
        f: impl FnOnce(&mut AccountRecord) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut accounts = self.accounts.lock().await;
        let record = accounts.entry(user.to_string()).or_default();
        f(record)
    }
}

fn debit(balance: &mut Decimal, amount: Decimal, what: &'static str) -> Result<(), StoreError> {
    if *balance < amount {
        return Err(StoreError::Conflict(what));
    }
    *balance -= amount;
    Ok(())
}

fn debit_shares(
    held: &mut HashMap<String, u64>,
    stock: &str,
    shares: u64,
    what: &'static str,
) -> Result<(), StoreError> {
    let current = held.get_mut(stock).ok_or(StoreError::Conflict(what))?;
    if *current < shares {
        return Err(StoreError::Conflict(what));
    }
    *current -= shares;
    Ok(())
}

#[async_trait]
impl AccountStore for MemoryStore {
    async fn add_funds(&self, user: &str, amount: Decimal) -> Result<(), StoreError> {
        self.with_account(user, |a| {
            a.balance += amount;
            Ok(())
        })
        .await
    }

    async fn funds(&self, user: &str) -> Result<Decimal, StoreError> {
        self.with_account(user, |a| Ok(a.balance)).await
    }

    async fn remove_funds(&self, user: &str, amount: Decimal) -> Result<(), StoreError> {
        self.with_account(user, |a| debit(&mut a.balance, amount, "balance overdraw"))
            .await
    }

    async fn add_reserve_funds(&self, user: &str, amount: Decimal) -> Result<(), StoreError> {
        self.with_account(user, |a| {
            a.reserve_balance += amount;
            Ok(())
        })
        .await
    }

    async fn reserve_funds(&self, user: &str) -> Result<Decimal, StoreError> {
        self.with_account(user, |a| Ok(a.reserve_balance)).await
    }

    async fn remove_reserve_funds(&self, user: &str, amount: Decimal) -> Result<(), StoreError> {
        self.with_account(user, |a| {
            debit(&mut a.reserve_balance, amount, "reserve balance overdraw")
        })
        .await
    }

    async fn add_shares(&self, user: &str, stock: &str, shares: u64) -> Result<(), StoreError> {
        self.with_account(user, |a| {
            *a.holdings.entry(stock.to_string()).or_default() += shares;
            Ok(())
        })
        .await
    }

    async fn shares(&self, user: &str, stock: &str) -> Result<u64, StoreError> {
        self.with_account(user, |a| Ok(a.holdings.get(stock).copied().unwrap_or(0)))
            .await
    }

    async fn remove_shares(&self, user: &str, stock: &str, shares: u64) -> Result<(), StoreError> {
        self.with_account(user, |a| {
            debit_shares(&mut a.holdings, stock, shares, "holdings overdraw")
        })
        .await
    }

    async fn add_reserve_shares(
        &self,
        user: &str,
        stock: &str,
        shares: u64,
    ) -> Result<(), StoreError> {
        self.with_account(user, |a| {
            *a.reserve_holdings.entry(stock.to_string()).or_default() += shares;
            Ok(())
        })
        .await
    }

    async fn reserve_shares(&self, user: &str, stock: &str) -> Result<u64, StoreError> {
        self.with_account(user, |a| {
            Ok(a.reserve_holdings.get(stock).copied().unwrap_or(0))
        })
        .await
    }

    async fn remove_reserve_shares(
        &self,
        user: &str,
        stock: &str,
        shares: u64,
    ) -> Result<(), StoreError> {
        self.with_account(user, |a| {
            debit_shares(&mut a.reserve_holdings, stock, shares, "reserve holdings overdraw")
        })
        .await
    }

    async fn push_pending(
        &self,
        user: &str,
        side: Side,
        order: PendingOrder,
    ) -> Result<(), StoreError> {
        self.with_account(user, |a| {
            let slot = match side {
                Side::Buy => &mut a.pending_buy,
                Side::Sell => &mut a.pending_sell,
            };
            if slot.is_some() {
                return Err(StoreError::Conflict("pending order slot occupied"));
            }
            *slot = Some(order);
            Ok(())
        })
        .await
    }

    async fn pop_pending(&self, user: &str, side: Side) -> Result<Option<PendingOrder>, StoreError> {
        self.with_account(user, |a| {
            Ok(match side {
                Side::Buy => a.pending_buy.take(),
                Side::Sell => a.pending_sell.take(),
            })
        })
        .await
    }

    async fn snapshot(&self, user: &str) -> Result<AccountSnapshot, StoreError> {
        self.with_account(user, |a| {
            Ok(AccountSnapshot {
                balance: a.balance,
                reserve_balance: a.reserve_balance,
                holdings: a.holdings.iter().map(|(k, v)| (k.clone(), *v)).collect(),
                reserve_holdings: a
                    .reserve_holdings
                    .iter()
                    .map(|(k, v)| (k.clone(), *v))
                    .collect(),
                pending_buy: a.pending_buy.clone(),
                pending_sell: a.pending_sell.clone(),
            })
        })
        .await
    }
}

/// One exclusive async lock per user-id. Guards are acquired for the whole
/// of a command handler or a trigger settlement so multi-call store
/// sequences on one account never interleave.
#[derive(Default)]
pub struct UserLocks {
    inner: std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl UserLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_user(&self, user: &str) -> Arc<Mutex<()>> {
        let mut map = self.inner.lock().unwrap();
        map.entry(user.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn unknown_user_reads_zero() {
        let store = MemoryStore::new();
        assert_eq!(store.funds("nobody").await.unwrap(), Decimal::ZERO);
        assert_eq!(store.shares("nobody", "XYZ").await.unwrap(), 0);
        assert!(store.pop_pending("nobody", Side::Buy).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn fund_arithmetic_and_overdraw() {
        let store = MemoryStore::new();
        store.add_funds("alice", dec("100.00")).await.unwrap();
        store.remove_funds("alice", dec("49.95")).await.unwrap();
        assert_eq!(store.funds("alice").await.unwrap(), dec("50.05"));

        let err = store.remove_funds("alice", dec("50.06")).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
        // failed debit leaves the balance untouched
        assert_eq!(store.funds("alice").await.unwrap(), dec("50.05"));
    }

    #[tokio::test]
    async fn share_arithmetic_and_overdraw() {
        let store = MemoryStore::new();
        store.add_shares("bob", "ABC", 10).await.unwrap();
        store.remove_shares("bob", "ABC", 4).await.unwrap();
        assert_eq!(store.shares("bob", "ABC").await.unwrap(), 6);

        assert!(store.remove_shares("bob", "ABC", 7).await.is_err());
        assert!(store.remove_shares("bob", "ZZZ", 1).await.is_err());
        assert_eq!(store.shares("bob", "ABC").await.unwrap(), 6);
    }

    #[tokio::test]
    async fn pending_slot_is_single() {
        let store = MemoryStore::new();
        let order = PendingOrder::new("XYZ".into(), dec("49.95"), 5);
        store.push_pending("alice", Side::Buy, order.clone()).await.unwrap();

        let err = store
            .push_pending("alice", Side::Buy, order.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));

        // sell slot is independent
        store.push_pending("alice", Side::Sell, order).await.unwrap();

        let popped = store.pop_pending("alice", Side::Buy).await.unwrap().unwrap();
        assert_eq!(popped.stock, "XYZ");
        assert!(store.pop_pending("alice", Side::Buy).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn snapshot_reflects_account() {
        let store = MemoryStore::new();
        store.add_funds("carol", dec("10.00")).await.unwrap();
        store.add_reserve_funds("carol", dec("5.00")).await.unwrap();
        store.add_shares("carol", "XYZ", 3).await.unwrap();

        let snap = store.snapshot("carol").await.unwrap();
        assert_eq!(snap.balance, dec("10.00"));
        assert_eq!(snap.reserve_balance, dec("5.00"));
        assert_eq!(snap.holdings, vec![("XYZ".to_string(), 3)]);
        assert!(snap.pending_buy.is_none());
    }
}
