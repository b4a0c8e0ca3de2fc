//! SQLite journal.
//!
//! Decimals and timestamps are stored as TEXT (decimal string and RFC 3339)
//! so values read back compare equal to what was written.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Executor, Row, Sqlite};
use std::fmt::Display;
use std::str::FromStr;
use tracing::{debug, info};
use uuid::Uuid;

use super::{Journal, JournalContents};
use crate::types::{
    Bet, Transaction, TransactionId, TransactionStatus, WalletError, WalletResult,
};

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS transactions (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        transaction_id TEXT NOT NULL UNIQUE,
        user_id TEXT NOT NULL,
        kind TEXT NOT NULL,
        amount TEXT NOT NULL,
        stake TEXT,
        resulting_total_balance TEXT NOT NULL,
        status TEXT NOT NULL,
        created_at TEXT NOT NULL,
        reference_id TEXT
    )",
    "CREATE INDEX IF NOT EXISTS idx_transactions_user ON transactions (user_id)",
    "CREATE INDEX IF NOT EXISTS idx_transactions_reference ON transactions (reference_id)",
    "CREATE TABLE IF NOT EXISTS bets (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        bet_id TEXT NOT NULL UNIQUE,
        user_id TEXT NOT NULL,
        event_id TEXT NOT NULL,
        outcome TEXT NOT NULL,
        stake TEXT NOT NULL,
        coefficient TEXT NOT NULL,
        potential_payout TEXT NOT NULL,
        status TEXT NOT NULL,
        placed_at TEXT NOT NULL,
        settled_at TEXT
    )",
    "CREATE INDEX IF NOT EXISTS idx_bets_event ON bets (event_id)",
];

const INSERT_TRANSACTION: &str = "INSERT INTO transactions
    (transaction_id, user_id, kind, amount, stake, resulting_total_balance, status, created_at, reference_id)
    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)";

// Only the lifecycle columns may change; stake and odds are frozen.
const UPSERT_BET: &str = "INSERT INTO bets
    (bet_id, user_id, event_id, outcome, stake, coefficient, potential_payout, status, placed_at, settled_at)
    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
    ON CONFLICT (bet_id) DO UPDATE SET status = excluded.status, settled_at = excluded.settled_at";

/// Journal persisted in a SQLite database.
pub struct SqliteJournal {
    pool: SqlitePool,
}

impl SqliteJournal {
    /// Open (creating if missing) the database at `url` and apply the schema.
    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .with_context(|| format!("Invalid SQLite URL: {url}"))?
            .create_if_missing(true);

        // An in-memory database lives and dies with its single connection.
        let in_memory = url.contains(":memory:");
        let pool = SqlitePoolOptions::new()
            .max_connections(if in_memory { 1 } else { 5 })
            .min_connections(if in_memory { 1 } else { 0 })
            .idle_timeout(if in_memory { None } else { Some(std::time::Duration::from_secs(600)) })
            .max_lifetime(if in_memory { None } else { Some(std::time::Duration::from_secs(1800)) })
            .connect_with(options)
            .await
            .with_context(|| format!("Failed to open SQLite journal at {url}"))?;

        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&pool)
                .await
                .context("Failed to apply journal schema")?;
        }

        info!(in_memory, "SQLite journal ready");
        Ok(Self { pool })
    }
}

fn storage_err(e: impl Display) -> WalletError {
    WalletError::Storage(e.to_string())
}

fn parse_decimal(row: &SqliteRow, column: &str) -> WalletResult<Decimal> {
    let raw: String = row.try_get(column).map_err(storage_err)?;
    Decimal::from_str(&raw).map_err(|e| storage_err(format!("{column}: {e}")))
}

fn parse_optional_decimal(row: &SqliteRow, column: &str) -> WalletResult<Option<Decimal>> {
    let raw: Option<String> = row.try_get(column).map_err(storage_err)?;
    raw.map(|s| Decimal::from_str(&s).map_err(|e| storage_err(format!("{column}: {e}"))))
        .transpose()
}

fn parse_time(raw: &str) -> WalletResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| storage_err(format!("timestamp {raw}: {e}")))
}

fn parse_uuid(row: &SqliteRow, column: &str) -> WalletResult<Uuid> {
    let raw: String = row.try_get(column).map_err(storage_err)?;
    Uuid::parse_str(&raw).map_err(|e| storage_err(format!("{column}: {e}")))
}

fn parse_enum<T: FromStr>(row: &SqliteRow, column: &str) -> WalletResult<T>
where
    T::Err: Display,
{
    let raw: String = row.try_get(column).map_err(storage_err)?;
    raw.parse::<T>().map_err(storage_err)
}

fn row_to_transaction(row: &SqliteRow) -> WalletResult<Transaction> {
    let created_at: String = row.try_get("created_at").map_err(storage_err)?;
    Ok(Transaction {
        transaction_id: parse_uuid(row, "transaction_id")?,
        user_id: row.try_get("user_id").map_err(storage_err)?,
        kind: parse_enum(row, "kind")?,
        amount: parse_decimal(row, "amount")?,
        stake: parse_optional_decimal(row, "stake")?,
        resulting_total_balance: parse_decimal(row, "resulting_total_balance")?,
        status: parse_enum(row, "status")?,
        created_at: parse_time(&created_at)?,
        reference_id: row.try_get("reference_id").map_err(storage_err)?,
    })
}

fn row_to_bet(row: &SqliteRow) -> WalletResult<Bet> {
    let placed_at: String = row.try_get("placed_at").map_err(storage_err)?;
    let settled_at: Option<String> = row.try_get("settled_at").map_err(storage_err)?;
    Ok(Bet {
        bet_id: parse_uuid(row, "bet_id")?,
        user_id: row.try_get("user_id").map_err(storage_err)?,
        event_id: row.try_get("event_id").map_err(storage_err)?,
        outcome: parse_enum(row, "outcome")?,
        stake: parse_decimal(row, "stake")?,
        coefficient: parse_decimal(row, "coefficient")?,
        potential_payout: parse_decimal(row, "potential_payout")?,
        status: parse_enum(row, "status")?,
        placed_at: parse_time(&placed_at)?,
        settled_at: settled_at.as_deref().map(parse_time).transpose()?,
    })
}

async fn insert_transaction<'e, E>(executor: E, tx: &Transaction) -> WalletResult<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query(INSERT_TRANSACTION)
        .bind(tx.transaction_id.to_string())
        .bind(&tx.user_id)
        .bind(tx.kind.as_str())
        .bind(tx.amount.to_string())
        .bind(tx.stake.map(|s| s.to_string()))
        .bind(tx.resulting_total_balance.to_string())
        .bind(tx.status.as_str())
        .bind(tx.created_at.to_rfc3339())
        .bind(tx.reference_id.clone())
        .execute(executor)
        .await
        .map_err(storage_err)?;
    Ok(())
}

#[async_trait]
impl Journal for SqliteJournal {
    async fn append(&self, tx: &Transaction) -> WalletResult<()> {
        insert_transaction(&self.pool, tx).await?;
        debug!(transaction_id = %tx.transaction_id, kind = %tx.kind, "Journal append");
        Ok(())
    }

    async fn update_status(
        &self,
        transaction_id: TransactionId,
        status: TransactionStatus,
    ) -> WalletResult<()> {
        let result = sqlx::query(
            "UPDATE transactions SET status = ? WHERE transaction_id = ? AND status = 'pending'",
        )
        .bind(status.as_str())
        .bind(transaction_id.to_string())
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        if result.rows_affected() == 0 {
            return Err(WalletError::Storage(format!(
                "no pending transaction {transaction_id}"
            )));
        }
        Ok(())
    }

    async fn record_bet(&self, bet: &Bet, tx: Option<&Transaction>) -> WalletResult<()> {
        let mut db = self.pool.begin().await.map_err(storage_err)?;

        if let Some(tx) = tx {
            insert_transaction(&mut *db, tx).await?;
        }

        sqlx::query(UPSERT_BET)
            .bind(bet.bet_id.to_string())
            .bind(&bet.user_id)
            .bind(&bet.event_id)
            .bind(bet.outcome.as_str())
            .bind(bet.stake.to_string())
            .bind(bet.coefficient.to_string())
            .bind(bet.potential_payout.to_string())
            .bind(bet.status.as_str())
            .bind(bet.placed_at.to_rfc3339())
            .bind(bet.settled_at.map(|t| t.to_rfc3339()))
            .execute(&mut *db)
            .await
            .map_err(storage_err)?;

        db.commit().await.map_err(storage_err)?;
        Ok(())
    }

    async fn load(&self) -> WalletResult<JournalContents> {
        let tx_rows = sqlx::query("SELECT * FROM transactions ORDER BY seq")
            .fetch_all(&self.pool)
            .await
            .map_err(storage_err)?;
        let bet_rows = sqlx::query("SELECT * FROM bets ORDER BY seq")
            .fetch_all(&self.pool)
            .await
            .map_err(storage_err)?;

        Ok(JournalContents {
            transactions: tx_rows
                .iter()
                .map(row_to_transaction)
                .collect::<WalletResult<_>>()?,
            bets: bet_rows.iter().map(row_to_bet).collect::<WalletResult<_>>()?,
        })
    }

    fn name(&self) -> &str {
        "sqlite"
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BetStatus, Outcome, TransactionKind};
    use rust_decimal_macros::dec;

    async fn journal() -> SqliteJournal {
        SqliteJournal::connect("sqlite::memory:").await.unwrap()
    }

    fn withdrawal() -> Transaction {
        let mut tx = Transaction::new(
            "u1",
            TransactionKind::Withdrawal,
            dec!(25.50),
            TransactionStatus::Pending,
            Some("wd-1".into()),
            Utc::now(),
        );
        tx.resulting_total_balance = dec!(74.50);
        tx
    }

    #[tokio::test]
    async fn test_append_and_load_roundtrip() {
        let journal = journal().await;
        let tx = withdrawal();
        journal.append(&tx).await.unwrap();

        let contents = journal.load().await.unwrap();
        assert_eq!(contents.transactions, vec![tx]);
        assert_eq!(journal.name(), "sqlite");
    }

    #[tokio::test]
    async fn test_update_status_only_from_pending() {
        let journal = journal().await;
        let tx = withdrawal();
        journal.append(&tx).await.unwrap();

        journal
            .update_status(tx.transaction_id, TransactionStatus::Completed)
            .await
            .unwrap();
        let again = journal
            .update_status(tx.transaction_id, TransactionStatus::Failed)
            .await;
        assert!(matches!(again, Err(WalletError::Storage(_))));

        let contents = journal.load().await.unwrap();
        assert_eq!(contents.transactions[0].status, TransactionStatus::Completed);
    }

    #[tokio::test]
    async fn test_record_bet_with_transaction() {
        let journal = journal().await;
        let bet = Bet::new("u1", "e1", Outcome::Away, dec!(100), dec!(2.5), Utc::now());
        let mut placed = Transaction::new(
            "u1",
            TransactionKind::BetPlaced,
            bet.stake,
            TransactionStatus::Completed,
            Some(bet.bet_id.to_string()),
            bet.placed_at,
        );
        placed.stake = Some(bet.stake);
        journal.record_bet(&bet, Some(&placed)).await.unwrap();

        let contents = journal.load().await.unwrap();
        assert_eq!(contents.bets, vec![bet.clone()]);
        assert_eq!(contents.transactions[0].bet_id(), Some(bet.bet_id));
    }

    #[tokio::test]
    async fn test_record_bet_keeps_odds_frozen() {
        let journal = journal().await;
        let bet = Bet::new("u1", "e1", Outcome::Home, dec!(10), dec!(1.90), Utc::now());
        journal.record_bet(&bet, None).await.unwrap();

        let mut tampered = bet.settled(BetStatus::Won, Utc::now());
        tampered.coefficient = dec!(9.99);
        journal.record_bet(&tampered, None).await.unwrap();

        let stored = &journal.load().await.unwrap().bets[0];
        assert_eq!(stored.status, BetStatus::Won);
        assert_eq!(stored.coefficient, dec!(1.90));
    }

    #[tokio::test]
    async fn test_record_bet_is_atomic() {
        let journal = journal().await;
        let tx = withdrawal();
        journal.append(&tx).await.unwrap();

        // Reusing a transaction id fails the insert, so the bet must not land either.
        let bet = Bet::new("u1", "e1", Outcome::Home, dec!(10), dec!(2), Utc::now());
        let result = journal.record_bet(&bet, Some(&tx)).await;
        assert!(result.is_err());

        let contents = journal.load().await.unwrap();
        assert!(contents.bets.is_empty());
        assert_eq!(contents.transactions.len(), 1);
    }
}
