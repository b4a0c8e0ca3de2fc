//! Persistence layer.
//!
//! The journal is the durable copy of the ledger: an append-only
//! transaction log plus the latest record of every bet. On startup the
//! ledger is rebuilt by replaying the log (see `Ledger::restore`).
//!
//! Two backends are provided: an in-process `MemoryJournal` and a SQLite
//! journal built on sqlx.

pub mod sqlite;

use async_trait::async_trait;
use std::sync::{Mutex, PoisonError};
use tracing::debug;

use crate::types::{
    Bet, Transaction, TransactionId, TransactionStatus, WalletError, WalletResult,
};

pub use sqlite::SqliteJournal;

/// Everything a journal holds, in write order.
#[derive(Debug, Clone, Default)]
pub struct JournalContents {
    pub transactions: Vec<Transaction>,
    pub bets: Vec<Bet>,
}

/// Durable store behind the ledger.
///
/// Every write either fully succeeds or returns `WalletError::Storage`
/// with nothing recorded.
#[async_trait]
pub trait Journal: Send + Sync {
    /// Append a new transaction to the log.
    async fn append(&self, tx: &Transaction) -> WalletResult<()>;

    /// Move a pending transaction to its final status.
    async fn update_status(
        &self,
        transaction_id: TransactionId,
        status: TransactionStatus,
    ) -> WalletResult<()>;

    /// Upsert a bet and, in the same unit, append the transaction that
    /// accompanies the bet's state change.
    async fn record_bet(&self, bet: &Bet, tx: Option<&Transaction>) -> WalletResult<()>;

    /// Read back the whole journal.
    async fn load(&self) -> WalletResult<JournalContents>;

    /// Backend name for logging.
    fn name(&self) -> &str;
}

// ---------------------------------------------------------------------------
// In-memory journal
// ---------------------------------------------------------------------------

/// Journal kept in process memory. Used by tests and the `memory` backend.
#[derive(Debug, Default)]
pub struct MemoryJournal {
    inner: Mutex<JournalContents>,
}

impl MemoryJournal {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, JournalContents> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Journal for MemoryJournal {
    async fn append(&self, tx: &Transaction) -> WalletResult<()> {
        let mut inner = self.lock();
        if inner
            .transactions
            .iter()
            .any(|t| t.transaction_id == tx.transaction_id)
        {
            return Err(WalletError::Storage(format!(
                "duplicate transaction id {}",
                tx.transaction_id
            )));
        }
        inner.transactions.push(tx.clone());
        debug!(transaction_id = %tx.transaction_id, kind = %tx.kind, "Journal append");
        Ok(())
    }

    async fn update_status(
        &self,
        transaction_id: TransactionId,
        status: TransactionStatus,
    ) -> WalletResult<()> {
        let mut inner = self.lock();
        let tx = inner
            .transactions
            .iter_mut()
            .find(|t| t.transaction_id == transaction_id && !t.status.is_final())
            .ok_or_else(|| {
                WalletError::Storage(format!("no pending transaction {transaction_id}"))
            })?;
        tx.status = status;
        Ok(())
    }

    async fn record_bet(&self, bet: &Bet, tx: Option<&Transaction>) -> WalletResult<()> {
        let mut inner = self.lock();
        if let Some(tx) = tx {
            if inner
                .transactions
                .iter()
                .any(|t| t.transaction_id == tx.transaction_id)
            {
                return Err(WalletError::Storage(format!(
                    "duplicate transaction id {}",
                    tx.transaction_id
                )));
            }
            inner.transactions.push(tx.clone());
        }
        match inner.bets.iter_mut().find(|b| b.bet_id == bet.bet_id) {
            Some(existing) => *existing = bet.clone(),
            None => inner.bets.push(bet.clone()),
        }
        Ok(())
    }

    async fn load(&self) -> WalletResult<JournalContents> {
        Ok(self.lock().clone())
    }

    fn name(&self) -> &str {
        "memory"
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Memory journal whose writes can be switched to fail.
    #[derive(Debug, Default)]
    pub struct FlakyJournal {
        inner: MemoryJournal,
        failing: AtomicBool,
    }

    impl FlakyJournal {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn fail_writes(&self, failing: bool) {
            self.failing.store(failing, Ordering::SeqCst);
        }

        fn check(&self) -> WalletResult<()> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(WalletError::Storage("injected write failure".into()));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl Journal for FlakyJournal {
        async fn append(&self, tx: &Transaction) -> WalletResult<()> {
            self.check()?;
            self.inner.append(tx).await
        }

        async fn update_status(
            &self,
            transaction_id: TransactionId,
            status: TransactionStatus,
        ) -> WalletResult<()> {
            self.check()?;
            self.inner.update_status(transaction_id, status).await
        }

        async fn record_bet(&self, bet: &Bet, tx: Option<&Transaction>) -> WalletResult<()> {
            self.check()?;
            self.inner.record_bet(bet, tx).await
        }

        async fn load(&self) -> WalletResult<JournalContents> {
            self.inner.load().await
        }

        fn name(&self) -> &str {
            "flaky"
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BetStatus, Outcome, TransactionKind};
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn deposit(amount: rust_decimal::Decimal) -> Transaction {
        Transaction::new(
            "u1",
            TransactionKind::Deposit,
            amount,
            TransactionStatus::Completed,
            Some("pay-1".into()),
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn test_append_and_load() {
        let journal = MemoryJournal::new();
        journal.append(&deposit(dec!(10))).await.unwrap();
        journal.append(&deposit(dec!(20))).await.unwrap();

        let contents = journal.load().await.unwrap();
        assert_eq!(contents.transactions.len(), 2);
        assert_eq!(contents.transactions[1].amount, dec!(20));
    }

    #[tokio::test]
    async fn test_duplicate_append_rejected() {
        let journal = MemoryJournal::new();
        let tx = deposit(dec!(10));
        journal.append(&tx).await.unwrap();
        let err = journal.append(&tx).await.unwrap_err();
        assert!(matches!(err, WalletError::Storage(_)));
    }

    #[tokio::test]
    async fn test_update_status() {
        let journal = MemoryJournal::new();
        let mut tx = deposit(dec!(10));
        tx.kind = TransactionKind::Withdrawal;
        tx.status = TransactionStatus::Pending;
        journal.append(&tx).await.unwrap();

        journal
            .update_status(tx.transaction_id, TransactionStatus::Failed)
            .await
            .unwrap();
        let contents = journal.load().await.unwrap();
        assert_eq!(contents.transactions[0].status, TransactionStatus::Failed);

        // Final statuses are immutable.
        let again = journal
            .update_status(tx.transaction_id, TransactionStatus::Completed)
            .await;
        assert!(again.is_err());
    }

    #[tokio::test]
    async fn test_update_status_unknown() {
        let journal = MemoryJournal::new();
        let result = journal
            .update_status(uuid::Uuid::new_v4(), TransactionStatus::Completed)
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_record_bet_upserts() {
        let journal = MemoryJournal::new();
        let bet = Bet::new("u1", "e1", Outcome::Home, dec!(10), dec!(2), Utc::now());
        journal.record_bet(&bet, None).await.unwrap();

        let lost = bet.settled(BetStatus::Lost, Utc::now());
        journal.record_bet(&lost, None).await.unwrap();

        let contents = journal.load().await.unwrap();
        assert_eq!(contents.bets.len(), 1);
        assert_eq!(contents.bets[0].status, BetStatus::Lost);
    }
}
