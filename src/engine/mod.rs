//! Wallet engine: the ledger and the services that drive it.
//!
//! `ledger` is the only writer of balances. Placement, settlement, funding
//! and reconciliation all mutate accounts through a user's `UserGuard`, so
//! every change for one user happens inside one critical section.

pub mod funding;
pub mod history;
pub mod ledger;
pub mod placement;
pub mod reconcile;
pub mod settlement;

pub use funding::{ConfirmOutcome, DepositConfirmation, FundingGateway, PayoutResult};
pub use ledger::{Ledger, LedgerPolicy, LedgerView, Release};
pub use placement::BetPlacement;
pub use reconcile::{ReconcileReport, Reconciler};
pub use settlement::{SettlementEngine, SettlementReport, SettlementWorker};
