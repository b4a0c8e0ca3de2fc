//! Bet placement and cancellation.
//!
//! Placing a bet reserves the stake, records the bet and journals both in
//! one unit under the user's lock. If the journal write fails, the bet and
//! the reservation are both rolled back, so no stake is ever left locked
//! without an open bet behind it.

use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::engine::ledger::{Ledger, Release};
use crate::events::EventCatalog;
use crate::types::{
    is_money, Bet, BetId, BetStatus, EventSnapshot, EventStatus, Outcome, WalletError,
    WalletResult, MONEY_SCALE,
};

pub struct BetPlacement {
    ledger: Arc<Ledger>,
    catalog: Arc<dyn EventCatalog>,
}

impl BetPlacement {
    pub fn new(ledger: Arc<Ledger>, catalog: Arc<dyn EventCatalog>) -> Self {
        Self { ledger, catalog }
    }

    /// Snapshot of an event that still accepts bets.
    async fn open_snapshot(&self, event_id: &str) -> WalletResult<EventSnapshot> {
        let snapshot = self
            .catalog
            .snapshot(event_id)
            .await?
            .ok_or_else(|| WalletError::EventNotFound(event_id.to_string()))?;

        if snapshot.status != EventStatus::Scheduled {
            return Err(WalletError::EventNotOpen {
                event_id: event_id.to_string(),
                status: snapshot.status,
            });
        }
        if snapshot.start_time <= self.ledger.now() {
            return Err(WalletError::EventStartedOrFinished(event_id.to_string()));
        }
        Ok(snapshot)
    }

    /// Place a fixed-odds bet. The coefficient is taken from the snapshot
    /// read here and never changes afterwards.
    pub async fn place_bet(
        &self,
        user_id: &str,
        event_id: &str,
        outcome: Outcome,
        stake: Decimal,
    ) -> WalletResult<Bet> {
        let snapshot = self.open_snapshot(event_id).await?;

        if stake <= Decimal::ZERO {
            return Err(WalletError::InvalidStake(format!("{stake} must be positive")));
        }
        if !is_money(stake) {
            return Err(WalletError::InvalidStake(format!(
                "{stake} has more than {MONEY_SCALE} decimal places"
            )));
        }

        let coefficient = snapshot
            .coefficient(outcome)
            .filter(|c| *c > Decimal::ONE)
            .ok_or_else(|| WalletError::InvalidOutcome {
                event_id: event_id.to_string(),
                outcome,
            })?;

        let bet = Bet::new(user_id, event_id, outcome, stake, coefficient, self.ledger.now());

        let mut guard = self.ledger.lock(user_id).await?;
        let tx = match guard.reserve(stake, bet.bet_id, bet.placed_at) {
            Ok(Some(tx)) => tx,
            Ok(None) => {
                return Err(WalletError::DuplicateOperation(bet.bet_id.to_string()));
            }
            Err(e) => {
                warn!(user_id, event_id, stake = %stake, error = %e, "Bet rejected");
                return Err(e);
            }
        };
        guard.upsert_bet(bet.clone());
        self.ledger.index_bet(&bet).await;

        // The snapshot was read before the lock. A settlement run that began
        // since then may have missed this bet, so it must not stay open.
        if let Some(resolution) = self.ledger.resolution(event_id).await {
            guard.remove_bet(bet.bet_id);
            guard.undo();
            self.ledger.unindex_bet(&bet).await;
            warn!(
                user_id,
                event_id,
                resolution = %resolution,
                "Event resolved during placement, bet withdrawn"
            );
            return Err(WalletError::EventNotOpen {
                event_id: event_id.to_string(),
                status: resolution.status(),
            });
        }

        if let Err(e) = self.ledger.journal().record_bet(&bet, Some(&tx)).await {
            guard.remove_bet(bet.bet_id);
            guard.undo();
            self.ledger.unindex_bet(&bet).await;
            error!(
                user_id,
                bet_id = %bet.bet_id,
                error = %e,
                "Journal write failed, bet and reservation rolled back"
            );
            return Err(e);
        }

        info!(
            user_id,
            bet_id = %bet.bet_id,
            event_id,
            outcome = %outcome,
            stake = %stake,
            coefficient = %coefficient,
            potential_payout = %bet.potential_payout,
            "Bet placed"
        );
        Ok(bet)
    }

    /// Cancel an open bet before its event starts, refunding the stake.
    pub async fn cancel_bet(&self, user_id: &str, bet_id: BetId) -> WalletResult<Bet> {
        let view = self.ledger.view(user_id).await;
        let bet = view
            .bets
            .get(&bet_id)
            .cloned()
            .ok_or(WalletError::BetNotFound(bet_id))?;
        ensure_cancellable(&bet)?;

        let now = self.ledger.now();
        match self.catalog.snapshot(&bet.event_id).await? {
            Some(s) if s.status == EventStatus::Scheduled && s.start_time > now => {}
            _ => {
                debug!(user_id, %bet_id, event_id = %bet.event_id, "Event no longer accepts cancellations");
                return Err(WalletError::BetNotCancellable(bet_id));
            }
        }

        let mut guard = self.ledger.lock(user_id).await?;
        // Settlement may have reached the bet while the snapshot was read.
        let current = guard
            .bet(bet_id)
            .cloned()
            .ok_or(WalletError::BetNotFound(bet_id))?;
        ensure_cancellable(&current)?;

        let tx = guard
            .release(bet_id, current.stake, Release::Refund, now)?
            .ok_or(WalletError::BetNotCancellable(bet_id))?;
        let cancelled = current.settled(BetStatus::Cancelled, now);
        guard.upsert_bet(cancelled.clone());

        if let Err(e) = self.ledger.journal().record_bet(&cancelled, Some(&tx)).await {
            guard.upsert_bet(current);
            guard.undo();
            error!(user_id, %bet_id, error = %e, "Journal write failed, cancellation rolled back");
            return Err(e);
        }

        info!(user_id, %bet_id, refund = %cancelled.stake, "Bet cancelled");
        Ok(cancelled)
    }
}

fn ensure_cancellable(bet: &Bet) -> WalletResult<()> {
    match bet.status {
        BetStatus::Open => Ok(()),
        BetStatus::Won | BetStatus::Lost => Err(WalletError::AlreadySettled(bet.bet_id)),
        BetStatus::Cancelled => Err(WalletError::BetNotCancellable(bet.bet_id)),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
