//! Reconciliation pass.
//!
//! Walks every book under its lock. Reservations with no open bet behind
//! them (a crash between reserving and recording the bet) are released;
//! everything else that looks wrong is reported, never auto-corrected.

use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::engine::ledger::{Ledger, Release};
use crate::types::{BetId, BetStatus, UserId, WalletResult};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Anomaly {
    /// `total != available + locked`.
    Unbalanced {
        user_id: UserId,
        total: Decimal,
        available: Decimal,
        locked: Decimal,
    },
    /// `locked` differs from the stakes of open bets.
    LockedMismatch {
        user_id: UserId,
        locked: Decimal,
        open_stakes: Decimal,
    },
    OpenBetWithoutReservation { user_id: UserId, bet_id: BetId },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReleasedLock {
    pub user_id: UserId,
    pub bet_id: BetId,
    pub amount: Decimal,
    pub release: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReconcileReport {
    pub users_checked: usize,
    pub released: Vec<ReleasedLock>,
    pub anomalies: Vec<Anomaly>,
    /// Users that could not be checked this pass.
    pub skipped_users: Vec<UserId>,
}

impl ReconcileReport {
    pub fn is_clean(&self) -> bool {
        self.released.is_empty() && self.anomalies.is_empty() && self.skipped_users.is_empty()
    }
}

pub struct Reconciler {
    ledger: Arc<Ledger>,
}

impl Reconciler {
    pub fn new(ledger: Arc<Ledger>) -> Self {
        Self { ledger }
    }

    pub async fn run(&self) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        for user_id in self.ledger.users().await {
            match self.reconcile_user(&user_id, &mut report).await {
                Ok(()) => report.users_checked += 1,
                Err(e) => {
                    warn!(%user_id, error = %e, "Reconciliation skipped user");
                    report.skipped_users.push(user_id);
                }
            }
        }

        if report.is_clean() {
            info!(users = report.users_checked, "Reconciliation clean");
        } else {
            warn!(
                users = report.users_checked,
                released = report.released.len(),
                anomalies = report.anomalies.len(),
                skipped = report.skipped_users.len(),
                "Reconciliation found issues"
            );
        }
        report
    }

    async fn reconcile_user(&self, user_id: &str, report: &mut ReconcileReport) -> WalletResult<()> {
        let mut guard = self.ledger.lock(user_id).await?;
        let now = self.ledger.now();

        for (bet_id, amount) in guard.reservations() {
            // A terminal bet whose stake is still locked is closed the way
            // the bet itself was resolved.
            let release = match guard.bet(bet_id) {
                Some(bet) => match bet.status {
                    BetStatus::Open => continue,
                    BetStatus::Won => Release::Won {
                        payout: bet.potential_payout,
                    },
                    BetStatus::Lost => Release::Lost,
                    BetStatus::Cancelled => Release::Refund,
                },
                None => Release::Refund,
            };

            let Some(tx) = guard.release(bet_id, amount, release, now)? else {
                continue;
            };
            if let Err(e) = self.ledger.journal().append(&tx).await {
                guard.undo();
                error!(user_id, %bet_id, error = %e, "Journal write failed, orphan release rolled back");
                return Err(e);
            }
            warn!(user_id, %bet_id, amount = %amount, kind = %tx.kind, "Released orphaned reservation");
            report.released.push(ReleasedLock {
                user_id: user_id.to_string(),
                bet_id,
                amount,
                release: tx.kind.to_string(),
            });
        }

        let account = guard.account().clone();
        if !account.is_consistent() {
            report.anomalies.push(Anomaly::Unbalanced {
                user_id: user_id.to_string(),
                total: account.total_balance,
                available: account.available_balance,
                locked: account.locked_balance,
            });
        }
        let open_stakes = guard.open_stake();
        if account.locked_balance != open_stakes {
            report.anomalies.push(Anomaly::LockedMismatch {
                user_id: user_id.to_string(),
                locked: account.locked_balance,
                open_stakes,
            });
        }
        for bet in guard.bets().filter(|b| b.is_open()) {
            if guard.reservation(bet.bet_id).is_none() {
                report.anomalies.push(Anomaly::OpenBetWithoutReservation {
                    user_id: user_id.to_string(),
                    bet_id: bet.bet_id,
                });
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::placement::BetPlacement;
    use crate::engine::testing::{catalog_with, memory_ledger};
    use crate::types::{Bet, Outcome, TransactionKind};
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_clean_ledger() {
        let ledger = memory_ledger();
        ledger.deposit("u1", dec!(500), "seed").await.unwrap();
        BetPlacement::new(ledger.clone(), catalog_with(&["e1"]))
            .place_bet("u1", "e1", Outcome::Home, dec!(100))
            .await
            .unwrap();

        let report = Reconciler::new(ledger).run().await;
        assert!(report.is_clean(), "{report:?}");
        assert_eq!(report.users_checked, 1);
    }

    #[tokio::test]
    async fn test_orphaned_reservation_is_refunded() {
        let ledger = memory_ledger();
        ledger.deposit("u1", dec!(500), "seed").await.unwrap();
        // Crash between reserving and recording the bet.
        let orphan = Uuid::new_v4();
        ledger.reserve("u1", dec!(100), orphan).await.unwrap();

        let report = Reconciler::new(ledger.clone()).run().await;
        assert_eq!(report.released.len(), 1);
        assert_eq!(report.released[0].bet_id, orphan);
        assert_eq!(report.released[0].release, "bet_cancelled");
        assert!(report.anomalies.is_empty());

        let account = ledger.get_balance("u1").await;
        assert_eq!(account.available_balance, dec!(500));
        assert_eq!(account.locked_balance, Decimal::ZERO);

        // Second pass has nothing to do.
        assert!(Reconciler::new(ledger).run().await.is_clean());
    }

    #[tokio::test]
    async fn test_lost_bet_with_lock_is_forfeited() {
        let ledger = memory_ledger();
        ledger.deposit("u1", dec!(500), "seed").await.unwrap();
        let bet = Bet::new("u1", "e1", Outcome::Home, dec!(100), dec!(2), Utc::now());
        ledger.reserve("u1", dec!(100), bet.bet_id).await.unwrap();
        ledger
            .lock("u1")
            .await
            .unwrap()
            .upsert_bet(bet.settled(BetStatus::Lost, Utc::now()));

        let report = Reconciler::new(ledger.clone()).run().await;
        assert_eq!(report.released[0].release, TransactionKind::BetLost.as_str());
        assert_eq!(ledger.get_balance("u1").await.total_balance, dec!(400));
    }

    #[tokio::test]
    async fn test_open_bet_without_reservation_is_reported() {
        let ledger = memory_ledger();
        ledger.deposit("u1", dec!(500), "seed").await.unwrap();
        let bet = Bet::new("u1", "e1", Outcome::Draw, dec!(50), dec!(3), Utc::now());
        ledger.lock("u1").await.unwrap().upsert_bet(bet.clone());

        let report = Reconciler::new(ledger.clone()).run().await;
        assert!(report.released.is_empty());
        assert!(report.anomalies.contains(&Anomaly::OpenBetWithoutReservation {
            user_id: "u1".into(),
            bet_id: bet.bet_id,
        }));
        assert!(report.anomalies.contains(&Anomaly::LockedMismatch {
            user_id: "u1".into(),
            locked: Decimal::ZERO,
            open_stakes: dec!(50),
        }));
        // Reported only: the balance is untouched.
        assert_eq!(ledger.get_balance("u1").await.available_balance, dec!(500));
    }
}
