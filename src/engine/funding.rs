//! Funding gateway adapter.
//!
//! Turns payment-provider confirmations into ledger transactions. Every
//! entry point is keyed by the provider's `reference_id`, so webhook
//! redelivery never double-credits or double-settles a payout.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::engine::ledger::Ledger;
use crate::types::{
    Transaction, TransactionKind, TransactionStatus, UserId, WalletError, WalletResult,
};

/// A deposit the payment provider has confirmed for a verified user.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DepositConfirmation {
    pub user_id: UserId,
    pub reference_id: String,
    pub amount: Decimal,
}

/// What the provider reports for a withdrawal payout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayoutResult {
    Paid,
    Failed,
}

impl PayoutResult {
    fn status(self) -> TransactionStatus {
        match self {
            PayoutResult::Paid => TransactionStatus::Completed,
            PayoutResult::Failed => TransactionStatus::Failed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", content = "transaction", rename_all = "snake_case")]
pub enum ConfirmOutcome {
    /// The pending withdrawal moved to its final status.
    Applied(Transaction),
    /// The withdrawal was already final; nothing changed.
    AlreadyFinal(Transaction),
    /// No withdrawal carries this reference. Reported, never fatal.
    UnknownReference,
}

pub struct FundingGateway {
    ledger: Arc<Ledger>,
}

impl FundingGateway {
    pub fn new(ledger: Arc<Ledger>) -> Self {
        Self { ledger }
    }

    /// Credit a confirmed deposit. A redelivered confirmation returns the
    /// original transaction.
    pub async fn confirm_deposit(&self, confirmation: &DepositConfirmation) -> WalletResult<Transaction> {
        self.ledger
            .deposit(
                &confirmation.user_id,
                confirmation.amount,
                &confirmation.reference_id,
            )
            .await
    }

    /// Debit `available` now and leave a pending withdrawal for the
    /// provider to confirm.
    pub async fn request_withdrawal(
        &self,
        user_id: &str,
        amount: Decimal,
        reference_id: &str,
    ) -> WalletResult<Transaction> {
        self.ledger.withdraw(user_id, amount, reference_id).await
    }

    /// Finalize a pending withdrawal. A failed payout restores the funds.
    pub async fn confirm_withdrawal(
        &self,
        reference_id: &str,
        result: PayoutResult,
    ) -> WalletResult<ConfirmOutcome> {
        let Some(user_id) = self.ledger.reference_owner(reference_id).await else {
            warn!(reference_id, result = ?result, "Payout confirmation for unknown reference");
            return Ok(ConfirmOutcome::UnknownReference);
        };

        let mut guard = self.ledger.lock(&user_id).await?;
        let Some(tx) = guard.find_reference(reference_id).cloned() else {
            warn!(reference_id, %user_id, "Reference indexed but missing from book");
            return Ok(ConfirmOutcome::UnknownReference);
        };
        if tx.kind != TransactionKind::Withdrawal {
            warn!(reference_id, kind = %tx.kind, "Payout confirmation for a non-withdrawal");
            return Err(WalletError::ReferenceConflict(reference_id.to_string()));
        }

        let status = result.status();
        if tx.status.is_final() {
            if tx.status == status {
                debug!(reference_id, status = %status, "Payout already confirmed");
            } else {
                warn!(
                    reference_id,
                    recorded = %tx.status,
                    reported = %status,
                    "Conflicting payout confirmation ignored"
                );
            }
            return Ok(ConfirmOutcome::AlreadyFinal(tx));
        }

        guard.set_status(tx.transaction_id, status);
        if let Err(e) = self
            .ledger
            .journal()
            .update_status(tx.transaction_id, status)
            .await
        {
            guard.set_status(tx.transaction_id, tx.status);
            error!(reference_id, error = %e, "Journal write failed, payout confirmation rolled back");
            return Err(e);
        }

        let mut updated = tx;
        updated.status = status;
        info!(
            %user_id,
            reference_id,
            amount = %updated.amount,
            status = %status,
            available = %guard.account().available_balance,
            "Withdrawal finalized"
        );
        Ok(ConfirmOutcome::Applied(updated))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
