//! Shared LLM token budget
//!
//! One row per (user, provider) pair with a reserve/commit/release ritual:
//! lock the row, check `quota - used - reserved >= needed`, add to reserved;
//! on run success move reserved to used, on failure hand the reservation
//! back. Every reservation is eventually committed or released, so the
//! reserved column sums to zero over a run's lifecycle.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct UsageRow {
    pub tokens_used: u64,
    pub tokens_reserved: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Reservation {
    Granted,
    Denied { needed: u64, available: u64 },
}

impl Reservation {
    pub fn is_granted(&self) -> bool {
        matches!(self, Reservation::Granted)
    }
}

/// Transactional budget operations, serialized per row.
#[async_trait]
pub trait UsageLedger: Send + Sync {
    async fn usage(&self, user: u64, provider: u64) -> UsageRow;

    /// Try to reserve `tokens` against `quota`.
    async fn reserve(&self, user: u64, provider: u64, quota: u64, tokens: u64) -> Reservation;

    /// Move a prior reservation into used.
    async fn commit(&self, user: u64, provider: u64, tokens: u64);

    /// Hand a prior reservation back.
    async fn release(&self, user: u64, provider: u64, tokens: u64);
}

/// In-process ledger with one async lock per row.
#[derive(Default)]
pub struct MemoryLedger {
    rows: DashMap<(u64, u64), Arc<Mutex<UsageRow>>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a row, e.g. with pre-existing usage.
    pub fn set_usage(&self, user: u64, provider: u64, row: UsageRow) {
        self.rows.insert((user, provider), Arc::new(Mutex::new(row)));
    }

    fn row(&self, user: u64, provider: u64) -> Arc<Mutex<UsageRow>> {
        self.rows
            .entry((user, provider))
            .or_insert_with(|| Arc::new(Mutex::new(UsageRow::default())))
            .clone()
    }
}

#[async_trait]
impl UsageLedger for MemoryLedger {
    async fn usage(&self, user: u64, provider: u64) -> UsageRow {
        *self.row(user, provider).lock().await
    }

    async fn reserve(&self, user: u64, provider: u64, quota: u64, tokens: u64) -> Reservation {
        let row = self.row(user, provider);
        let mut row = row.lock().await;
        let available = quota.saturating_sub(row.tokens_used + row.tokens_reserved);
        if available < tokens {
            debug!(user, provider, tokens, available, "reservation denied");
            return Reservation::Denied {
                needed: tokens,
                available,
            };
        }
        row.tokens_reserved += tokens;
        Reservation::Granted
    }

    async fn commit(&self, user: u64, provider: u64, tokens: u64) {
        let row = self.row(user, provider);
        let mut row = row.lock().await;
        row.tokens_reserved = row.tokens_reserved.saturating_sub(tokens);
        row.tokens_used += tokens;
    }

    async fn release(&self, user: u64, provider: u64, tokens: u64) {
        let row = self.row(user, provider);
        let mut row = row.lock().await;
        row.tokens_reserved = row.tokens_reserved.saturating_sub(tokens);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reserve_commit_moves_tokens_to_used() {
        let ledger = MemoryLedger::new();
        assert!(ledger.reserve(1, 1, 10_000, 2048).await.is_granted());
        assert_eq!(
            ledger.usage(1, 1).await,
            UsageRow {
                tokens_used: 0,
                tokens_reserved: 2048
            }
        );
        ledger.commit(1, 1, 2048).await;
        assert_eq!(
            ledger.usage(1, 1).await,
            UsageRow {
                tokens_used: 2048,
                tokens_reserved: 0
            }
        );
    }

    #[tokio::test]
    async fn reserve_release_restores_the_row() {
        let ledger = MemoryLedger::new();
        ledger.reserve(1, 1, 10_000, 2048).await;
        ledger.release(1, 1, 2048).await;
        assert_eq!(ledger.usage(1, 1).await, UsageRow::default());
    }

    #[tokio::test]
    async fn reservation_counts_both_used_and_reserved() {
        let ledger = MemoryLedger::new();
        ledger.set_usage(
            1,
            1,
            UsageRow {
                tokens_used: 9_000,
                tokens_reserved: 500,
            },
        );
        // 10_000 - 9_000 - 500 = 500 available
        assert_eq!(
            ledger.reserve(1, 1, 10_000, 1024).await,
            Reservation::Denied {
                needed: 1024,
                available: 500
            }
        );
        assert!(ledger.reserve(1, 1, 10_000, 500).await.is_granted());
    }
}
