//! In-Memory Order Store Adapter
//!
//! Implements the `OrderStore` port with a `DashMap` keyed by order id.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::domain::model::{OrderId, OrderTicket, UserId, VoucherId};
use crate::domain::ports::{InsertOutcome, OrderStore};

/// In-memory durable-store stand-in.
///
/// `fail_next` makes the next N inserts fail, for exercising retry and
/// dead-letter paths.
#[derive(Debug, Default)]
pub struct InMemoryOrderStore {
    orders: DashMap<i64, OrderTicket>,
    fail_next: AtomicU32,
    fail_always: AtomicBool,
    insert_calls: AtomicU64,
}

impl InMemoryOrderStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` insert calls.
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Fail every insert until switched off.
    pub fn fail_always(&self, on: bool) {
        self.fail_always.store(on, Ordering::SeqCst);
    }

    /// Number of stored orders.
    pub fn len(&self) -> usize {
        self.orders.len()
    }

    /// Check if the store is empty.
    pub fn is_empty(&self) -> bool {
        self.orders.is_empty()
    }

    /// Total insert calls, failed ones included.
    pub fn insert_calls(&self) -> u64 {
        self.insert_calls.load(Ordering::Relaxed)
    }

    /// Count orders placed by a user for a voucher.
    pub fn count_for(&self, user_id: UserId, voucher_id: VoucherId) -> usize {
        self.orders
            .iter()
            .filter(|o| o.user_id == user_id && o.voucher_id == voucher_id)
            .count()
    }

    /// All stored orders.
    pub fn orders(&self) -> Vec<OrderTicket> {
        self.orders.iter().map(|o| o.value().clone()).collect()
    }

    fn should_fail(&self) -> bool {
        if self.fail_always.load(Ordering::SeqCst) {
            return true;
        }
        self.fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl OrderStore for InMemoryOrderStore {
    async fn insert(&self, ticket: &OrderTicket) -> anyhow::Result<InsertOutcome> {
        self.insert_calls.fetch_add(1, Ordering::Relaxed);
        if self.should_fail() {
            anyhow::bail!("order store unavailable");
        }

        match self.orders.entry(ticket.order_id.as_i64()) {
            Entry::Occupied(_) => Ok(InsertOutcome::AlreadyExists),
            Entry::Vacant(e) => {
                e.insert(ticket.clone());
                Ok(InsertOutcome::Inserted)
            }
        }
    }

    async fn find(&self, order_id: OrderId) -> anyhow::Result<Option<OrderTicket>> {
        Ok(self.orders.get(&order_id.as_i64()).map(|o| o.value().clone()))
    }
}
