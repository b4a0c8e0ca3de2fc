//! Settlement engine.
//!
//! Resolves every open bet on a finished or voided event. Users are
//! settled concurrently, each in its own lock domain; bets of one user are
//! settled one after another. A bet that fails to settle is reported and
//! never stops its siblings. Re-running settlement for an event is a no-op
//! for bets that already reached a terminal status.

use futures::future::join_all;
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::SettlementConfig;
use crate::engine::ledger::{Ledger, Release};
use crate::types::{BetId, BetStatus, EventId, Resolution, SettlementTrigger, UserId, WalletResult};

/// A bet that could not be settled in this run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailedSettlement {
    pub bet_id: BetId,
    pub user_id: UserId,
    pub error: String,
    pub retryable: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SettlementReport {
    pub event_id: EventId,
    pub resolution: Resolution,
    pub won: usize,
    pub lost: usize,
    pub refunded: usize,
    /// Bets already terminal before this run.
    pub skipped: usize,
    pub failed: Vec<FailedSettlement>,
    /// Sum of `bet_won` payouts credited in this run.
    pub paid_out: Decimal,
    /// Sum of stakes forfeited in this run.
    pub forfeited: Decimal,
}

impl SettlementReport {
    fn new(event_id: &str, resolution: Resolution) -> Self {
        Self {
            event_id: event_id.to_string(),
            resolution,
            won: 0,
            lost: 0,
            refunded: 0,
            skipped: 0,
            failed: Vec::new(),
            paid_out: Decimal::ZERO,
            forfeited: Decimal::ZERO,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn settled(&self) -> usize {
        self.won + self.lost + self.refunded
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Settled {
    Won(Decimal),
    Lost(Decimal),
    Refunded,
    Skipped,
}

pub struct SettlementEngine {
    ledger: Arc<Ledger>,
}

impl SettlementEngine {
    pub fn new(ledger: Arc<Ledger>) -> Self {
        Self { ledger }
    }

    /// Settle every open bet on `event_id` according to `resolution`.
    pub async fn settle_event(&self, event_id: &str, resolution: Resolution) -> SettlementReport {
        // Recorded first so a placement racing this run either lands in the
        // index read below or sees the resolution and backs out.
        self.ledger.mark_resolved(event_id, resolution).await;

        let mut by_user: BTreeMap<UserId, Vec<BetId>> = BTreeMap::new();
        for (user_id, bet_id) in self.ledger.bets_for_event(event_id).await {
            by_user.entry(user_id).or_default().push(bet_id);
        }
        debug!(event_id, users = by_user.len(), "Settling event");

        let runs = by_user
            .into_iter()
            .map(|(user_id, bets)| self.settle_user(user_id, bets, resolution));
        let results = join_all(runs).await;

        let mut report = SettlementReport::new(event_id, resolution);
        for (user_id, bet_id, result) in results.into_iter().flatten() {
            match result {
                Ok(Settled::Won(payout)) => {
                    report.won += 1;
                    report.paid_out += payout;
                }
                Ok(Settled::Lost(stake)) => {
                    report.lost += 1;
                    report.forfeited += stake;
                }
                Ok(Settled::Refunded) => report.refunded += 1,
                Ok(Settled::Skipped) => report.skipped += 1,
                Err(e) => {
                    warn!(event_id, %user_id, %bet_id, error = %e, "Bet settlement failed");
                    report.failed.push(FailedSettlement {
                        bet_id,
                        user_id,
                        retryable: e.is_retryable(),
                        error: e.to_string(),
                    });
                }
            }
        }

        info!(
            event_id,
            resolution = %resolution,
            won = report.won,
            lost = report.lost,
            refunded = report.refunded,
            skipped = report.skipped,
            failed = report.failed.len(),
            paid_out = %report.paid_out,
            "Event settled"
        );
        report
    }

    async fn settle_user(
        &self,
        user_id: UserId,
        bets: Vec<BetId>,
        resolution: Resolution,
    ) -> Vec<(UserId, BetId, WalletResult<Settled>)> {
        let mut results = Vec::with_capacity(bets.len());
        for bet_id in bets {
            let result = self.settle_bet(&user_id, bet_id, resolution).await;
            results.push((user_id.clone(), bet_id, result));
        }
        results
    }

    async fn settle_bet(
        &self,
        user_id: &str,
        bet_id: BetId,
        resolution: Resolution,
    ) -> WalletResult<Settled> {
        let mut guard = self.ledger.lock(user_id).await?;
        let Some(bet) = guard.bet(bet_id).cloned() else {
            // Indexed by a placement that was rolled back.
            debug!(user_id, %bet_id, "Bet no longer exists, skipping");
            return Ok(Settled::Skipped);
        };
        if !bet.is_open() {
            debug!(user_id, %bet_id, status = %bet.status, "Bet already terminal, skipping");
            return Ok(Settled::Skipped);
        }

        let (mode, status, settled) = match resolution {
            Resolution::Finished(outcome) if outcome == bet.outcome => (
                Release::Won {
                    payout: bet.potential_payout,
                },
                BetStatus::Won,
                Settled::Won(bet.potential_payout),
            ),
            Resolution::Finished(_) => (Release::Lost, BetStatus::Lost, Settled::Lost(bet.stake)),
            Resolution::Voided => (Release::Refund, BetStatus::Cancelled, Settled::Refunded),
        };

        let now = self.ledger.now();
        let tx = guard.release(bet_id, bet.stake, mode, now)?;
        let closed = bet.settled(status, now);
        guard.upsert_bet(closed.clone());

        if let Err(e) = self.ledger.journal().record_bet(&closed, tx.as_ref()).await {
            guard.upsert_bet(bet);
            if tx.is_some() {
                guard.undo();
            }
            error!(user_id, %bet_id, error = %e, "Journal write failed, settlement rolled back");
            return Err(e);
        }

        info!(
            user_id,
            %bet_id,
            event_id = %closed.event_id,
            status = %status,
            stake = %closed.stake,
            payout = %closed.potential_payout,
            "Bet settled"
        );
        Ok(settled)
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

/// Runs settlement for incoming triggers and re-enqueues incomplete runs.
pub struct SettlementWorker {
    engine: Arc<SettlementEngine>,
    requeue: mpsc::Sender<SettlementTrigger>,
    max_retries: u32,
    retry_delay: Duration,
}

impl SettlementWorker {
    pub fn new(
        engine: Arc<SettlementEngine>,
        requeue: mpsc::Sender<SettlementTrigger>,
        cfg: &SettlementConfig,
    ) -> Self {
        Self {
            engine,
            requeue,
            max_retries: cfg.max_retries,
            retry_delay: Duration::from_secs(cfg.retry_delay_secs),
        }
    }

    pub async fn handle(&self, trigger: SettlementTrigger) -> SettlementReport {
        let report = self
            .engine
            .settle_event(&trigger.event_id, trigger.resolution)
            .await;
        if report.is_complete() {
            return report;
        }

        if trigger.attempt >= self.max_retries {
            error!(
                event_id = %trigger.event_id,
                attempts = trigger.attempt + 1,
                failed = report.failed.len(),
                "Settlement retries exhausted"
            );
            return report;
        }

        let next = SettlementTrigger {
            attempt: trigger.attempt + 1,
            ..trigger
        };
        warn!(
            event_id = %next.event_id,
            attempt = next.attempt,
            delay_secs = self.retry_delay.as_secs(),
            "Settlement incomplete, scheduling retry"
        );
        let requeue = self.requeue.clone();
        let delay = self.retry_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if requeue.send(next).await.is_err() {
                warn!("Settlement channel closed, retry dropped");
            }
        });
        report
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::engine::ledger::LedgerPolicy;
    use crate::engine::placement::BetPlacement;
    use crate::engine::testing::{catalog_with, ledger_on, memory_ledger};
    use crate::storage::testing::FlakyJournal;
    use crate::storage::MemoryJournal;
    use crate::types::{Bet, Outcome, TransactionKind};
    use rust_decimal_macros::dec;

    async fn place(ledger: &Arc<Ledger>, user: &str, outcome: Outcome, stake: Decimal) -> Bet {
        if ledger.get_balance(user).await.available_balance < stake {
            ledger
                .deposit(user, dec!(1000), &format!("seed-{user}"))
                .await
                .unwrap();
        }
        BetPlacement::new(ledger.clone(), catalog_with(&["e1"]))
            .place_bet(user, "e1", outcome, stake)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_winning_bet() {
        let ledger = memory_ledger();
        let bet = place(&ledger, "u1", Outcome::Home, dec!(100)).await;

        let report = SettlementEngine::new(ledger.clone())
            .settle_event("e1", Resolution::Finished(Outcome::Home))
            .await;
        assert_eq!(report.won, 1);
        assert_eq!(report.paid_out, dec!(250));

        let view = ledger.view("u1").await;
        assert_eq!(view.account.total_balance, dec!(1150));
        assert_eq!(view.account.available_balance, dec!(1050));
        assert_eq!(view.account.locked_balance, Decimal::ZERO);
        assert_eq!(view.bets[&bet.bet_id].status, BetStatus::Won);
        let won = view.transactions.last().unwrap();
        assert_eq!(won.kind, TransactionKind::BetWon);
        assert_eq!(won.amount, dec!(250));
    }

    #[tokio::test]
    async fn test_losing_bet() {
        let ledger = memory_ledger();
        let bet = place(&ledger, "u1", Outcome::Home, dec!(100)).await;

        let report = SettlementEngine::new(ledger.clone())
            .settle_event("e1", Resolution::Finished(Outcome::Away))
            .await;
        assert_eq!(report.lost, 1);
        assert_eq!(report.forfeited, dec!(100));

        let view = ledger.view("u1").await;
        assert_eq!(view.account.total_balance, dec!(900));
        assert_eq!(view.account.available_balance, dec!(900));
        assert_eq!(view.bets[&bet.bet_id].status, BetStatus::Lost);
        let lost = view.transactions.last().unwrap();
        assert_eq!(lost.kind, TransactionKind::BetLost);
        assert_eq!(lost.amount, dec!(100));
    }

    #[tokio::test]
    async fn test_voided_event_refunds() {
        let ledger = memory_ledger();
        place(&ledger, "u1", Outcome::Home, dec!(100)).await;
        place(&ledger, "u2", Outcome::Draw, dec!(40)).await;

        let report = SettlementEngine::new(ledger.clone())
            .settle_event("e1", Resolution::Voided)
            .await;
        assert_eq!(report.refunded, 2);

        for user in ["u1", "u2"] {
            let account = ledger.get_balance(user).await;
            assert_eq!(account.total_balance, dec!(1000));
            assert_eq!(account.locked_balance, Decimal::ZERO);
        }
    }

    #[tokio::test]
    async fn test_settle_twice_is_noop() {
        let ledger = memory_ledger();
        place(&ledger, "u1", Outcome::Home, dec!(100)).await;
        place(&ledger, "u1", Outcome::Away, dec!(50)).await;
        let engine = SettlementEngine::new(ledger.clone());

        let first = engine.settle_event("e1", Resolution::Finished(Outcome::Home)).await;
        assert_eq!((first.won, first.lost), (1, 1));
        let before = ledger.view("u1").await;

        let second = engine.settle_event("e1", Resolution::Finished(Outcome::Away)).await;
        assert_eq!(second.skipped, 2);
        assert_eq!(second.settled(), 0);

        let after = ledger.view("u1").await;
        assert_eq!(after.account, before.account);
        assert_eq!(after.transactions.len(), before.transactions.len());
    }

    #[tokio::test]
    async fn test_failure_does_not_block_other_users() {
        let policy = LedgerPolicy {
            lock_timeout: Duration::from_millis(10),
            busy_retries: 0,
            ..LedgerPolicy::default()
        };
        let ledger = Arc::new(Ledger::new(
            Arc::new(MemoryJournal::new()),
            Arc::new(SystemClock),
            policy,
        ));
        place(&ledger, "u1", Outcome::Home, dec!(100)).await;
        let blocked = place(&ledger, "u2", Outcome::Home, dec!(100)).await;

        let held = ledger.lock("u2").await.unwrap();
        let report = SettlementEngine::new(ledger.clone())
            .settle_event("e1", Resolution::Finished(Outcome::Home))
            .await;
        drop(held);

        assert_eq!(report.won, 1);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].bet_id, blocked.bet_id);
        assert!(report.failed[0].retryable);
        assert_eq!(ledger.get_balance("u1").await.total_balance, dec!(1150));
        assert_eq!(ledger.get_balance("u2").await.locked_balance, dec!(100));
    }

    #[tokio::test]
    async fn test_journal_failure_leaves_bet_open() {
        let journal = Arc::new(FlakyJournal::new());
        let ledger = ledger_on(journal.clone());
        let bet = place(&ledger, "u1", Outcome::Home, dec!(100)).await;

        journal.fail_writes(true);
        let report = SettlementEngine::new(ledger.clone())
            .settle_event("e1", Resolution::Finished(Outcome::Home))
            .await;
        assert_eq!(report.failed.len(), 1);
        assert!(!report.failed[0].retryable);

        let view = ledger.view("u1").await;
        assert!(view.bets[&bet.bet_id].is_open());
        assert_eq!(view.account.locked_balance, dec!(100));
        assert_eq!(view.account.total_balance, dec!(1000));
    }

    #[tokio::test]
    async fn test_worker_requeues_incomplete_run() {
        let journal = Arc::new(FlakyJournal::new());
        let ledger = ledger_on(journal.clone());
        place(&ledger, "u1", Outcome::Home, dec!(100)).await;

        let (tx, mut rx) = mpsc::channel(4);
        let cfg = SettlementConfig {
            max_retries: 1,
            retry_delay_secs: 0,
        };
        let worker = SettlementWorker::new(Arc::new(SettlementEngine::new(ledger.clone())), tx, &cfg);

        journal.fail_writes(true);
        let trigger = SettlementTrigger::new("e1", Resolution::Finished(Outcome::Home));
        assert!(!worker.handle(trigger).await.is_complete());

        let retry = rx.recv().await.unwrap();
        assert_eq!(retry.attempt, 1);

        // Out of retries: nothing is scheduled.
        worker.handle(retry.clone()).await;
        journal.fail_writes(false);
        let report = worker.handle(retry).await;
        assert!(report.is_complete());
        assert_eq!(report.won, 1);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unknown_event_is_empty() {
        let report = SettlementEngine::new(memory_ledger())
            .settle_event("nothing", Resolution::Voided)
            .await;
        assert!(report.is_complete());
        assert_eq!(report.settled() + report.skipped, 0);
    }
}
