//! Shared types for the wallet ledger and settlement engine.
//!
//! These types form the data model used across all modules. Every
//! closed set (transaction kind, statuses, outcomes) is an enum that is
//! matched exhaustively wherever it is consumed.

use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Opaque user identifier, owned by the identity collaborator.
pub type UserId = String;
/// Identifier assigned by the event catalog.
pub type EventId = String;
pub type BetId = Uuid;
pub type TransactionId = Uuid;

/// Fraction digits carried by every monetary amount.
pub const MONEY_SCALE: u32 = 2;

/// Round a computed amount (e.g. `stake * coefficient`) to money precision.
pub fn round_money(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(MONEY_SCALE, RoundingStrategy::MidpointAwayFromZero)
}

/// Whether `value` can be represented with at most two fraction digits.
pub fn is_money(value: Decimal) -> bool {
    value.normalize().scale() <= MONEY_SCALE
}

// ---------------------------------------------------------------------------
// Account
// ---------------------------------------------------------------------------

/// Per-user balance record. Mutated only by the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub user_id: UserId,
    pub total_balance: Decimal,
    pub available_balance: Decimal,
    pub locked_balance: Decimal,
}

impl Account {
    pub fn new(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            total_balance: Decimal::ZERO,
            available_balance: Decimal::ZERO,
            locked_balance: Decimal::ZERO,
        }
    }

    /// `total == available + locked` and no field is negative.
    pub fn is_consistent(&self) -> bool {
        self.total_balance == self.available_balance + self.locked_balance
            && self.available_balance >= Decimal::ZERO
            && self.locked_balance >= Decimal::ZERO
    }

    pub fn apply(&mut self, delta: BalanceDelta) {
        self.total_balance += delta.total;
        self.available_balance += delta.available;
        self.locked_balance += delta.locked;
    }

    pub fn revert(&mut self, delta: BalanceDelta) {
        self.total_balance -= delta.total;
        self.available_balance -= delta.available;
        self.locked_balance -= delta.locked;
    }
}

impl fmt::Display for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] total={:.2} available={:.2} locked={:.2}",
            self.user_id, self.total_balance, self.available_balance, self.locked_balance,
        )
    }
}

/// Change a single transaction applies to the three balance fields.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BalanceDelta {
    pub total: Decimal,
    pub available: Decimal,
    pub locked: Decimal,
}

impl BalanceDelta {
    pub const ZERO: BalanceDelta = BalanceDelta {
        total: Decimal::ZERO,
        available: Decimal::ZERO,
        locked: Decimal::ZERO,
    };

    pub fn new(total: Decimal, available: Decimal, locked: Decimal) -> Self {
        Self { total, available, locked }
    }
}

// ---------------------------------------------------------------------------
// Transactions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    Deposit,
    Withdrawal,
    BetPlaced,
    BetWon,
    BetLost,
    BetCancelled,
}

impl TransactionKind {
    pub const ALL: &'static [TransactionKind] = &[
        TransactionKind::Deposit,
        TransactionKind::Withdrawal,
        TransactionKind::BetPlaced,
        TransactionKind::BetWon,
        TransactionKind::BetLost,
        TransactionKind::BetCancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionKind::Deposit => "deposit",
            TransactionKind::Withdrawal => "withdrawal",
            TransactionKind::BetPlaced => "bet_placed",
            TransactionKind::BetWon => "bet_won",
            TransactionKind::BetLost => "bet_lost",
            TransactionKind::BetCancelled => "bet_cancelled",
        }
    }

    /// Whether the transaction's reference is a bet id.
    pub fn is_bet(&self) -> bool {
        match self {
            TransactionKind::Deposit | TransactionKind::Withdrawal => false,
            TransactionKind::BetPlaced
            | TransactionKind::BetWon
            | TransactionKind::BetLost
            | TransactionKind::BetCancelled => true,
        }
    }
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TransactionKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TransactionKind::ALL
            .iter()
            .copied()
            .find(|k| k.as_str() == s.to_lowercase())
            .ok_or_else(|| anyhow::anyhow!("Unknown transaction type: {s}"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    Pending,
    Completed,
    Failed,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "pending",
            TransactionStatus::Completed => "completed",
            TransactionStatus::Failed => "failed",
        }
    }

    /// `pending` may still move; the other two are terminal.
    pub fn is_final(&self) -> bool {
        !matches!(self, TransactionStatus::Pending)
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TransactionStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(TransactionStatus::Pending),
            "completed" => Ok(TransactionStatus::Completed),
            "failed" => Ok(TransactionStatus::Failed),
            _ => Err(anyhow::anyhow!("Unknown transaction status: {s}")),
        }
    }
}

/// One row of the append-only ledger log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub transaction_id: TransactionId,
    pub user_id: UserId,
    #[serde(rename = "type")]
    pub kind: TransactionKind,
    /// Magnitude only; the direction is implied by `kind`.
    pub amount: Decimal,
    /// Stake moved out of (or into) the locked balance. Set on bet transactions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stake: Option<Decimal>,
    pub resulting_total_balance: Decimal,
    pub status: TransactionStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference_id: Option<String>,
}

impl Transaction {
    pub fn new(
        user_id: &str,
        kind: TransactionKind,
        amount: Decimal,
        status: TransactionStatus,
        reference_id: Option<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            transaction_id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            kind,
            amount,
            stake: None,
            resulting_total_balance: Decimal::ZERO,
            status,
            created_at,
            reference_id,
        }
    }

    /// The bet this transaction belongs to, for bet kinds.
    pub fn bet_id(&self) -> Option<BetId> {
        if !self.kind.is_bet() {
            return None;
        }
        self.reference_id
            .as_deref()
            .and_then(|r| Uuid::parse_str(r).ok())
    }

    /// Stake released from (or moved into) `locked` by a bet transaction.
    pub fn released_stake(&self) -> Decimal {
        self.stake.unwrap_or(self.amount)
    }

    /// Balance effect of this transaction in its current status.
    pub fn delta(&self) -> BalanceDelta {
        let a = self.amount;
        let zero = Decimal::ZERO;
        match self.kind {
            TransactionKind::Deposit => match self.status {
                TransactionStatus::Completed => BalanceDelta::new(a, a, zero),
                TransactionStatus::Pending | TransactionStatus::Failed => BalanceDelta::ZERO,
            },
            // Funds leave `available` as soon as the request is pending.
            TransactionKind::Withdrawal => match self.status {
                TransactionStatus::Pending | TransactionStatus::Completed => {
                    BalanceDelta::new(-a, -a, zero)
                }
                TransactionStatus::Failed => BalanceDelta::ZERO,
            },
            TransactionKind::BetPlaced => BalanceDelta::new(zero, -a, a),
            TransactionKind::BetWon => {
                let stake = self.released_stake();
                BalanceDelta::new(a - stake, a, -stake)
            }
            TransactionKind::BetLost => BalanceDelta::new(-a, zero, -a),
            TransactionKind::BetCancelled => BalanceDelta::new(zero, a, -a),
        }
    }
}

impl fmt::Display for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {:.2} ({}) total={:.2} [{}]",
            self.user_id,
            self.kind,
            self.amount,
            self.status,
            self.resulting_total_balance,
            self.reference_id.as_deref().unwrap_or("-"),
        )
    }
}

// ---------------------------------------------------------------------------
// Outcomes & events
// ---------------------------------------------------------------------------

/// Three-way result of a sporting event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Outcome {
    Home,
    Draw,
    Away,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Home => "HOME",
            Outcome::Draw => "DRAW",
            Outcome::Away => "AWAY",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Accepts both the `HOME/DRAW/AWAY` and the legacy `1/X/2` spellings.
impl std::str::FromStr for Outcome {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "HOME" | "1" | "П1" | "W1" => Ok(Outcome::Home),
            "DRAW" | "X" => Ok(Outcome::Draw),
            "AWAY" | "2" | "П2" | "W2" => Ok(Outcome::Away),
            _ => Err(anyhow::anyhow!("Unknown outcome: {s}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    Scheduled,
    Live,
    Finished,
    Voided,
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventStatus::Scheduled => write!(f, "scheduled"),
            EventStatus::Live => write!(f, "live"),
            EventStatus::Finished => write!(f, "finished"),
            EventStatus::Voided => write!(f, "voided"),
        }
    }
}

/// Read-only view of an event at the moment it is consulted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventSnapshot {
    pub event_id: EventId,
    #[serde(default)]
    pub name: String,
    pub odds: BTreeMap<Outcome, Decimal>,
    pub start_time: DateTime<Utc>,
    pub status: EventStatus,
    /// Declared once the event is finished.
    #[serde(default)]
    pub outcome: Option<Outcome>,
}

impl EventSnapshot {
    pub fn coefficient(&self, outcome: Outcome) -> Option<Decimal> {
        self.odds.get(&outcome).copied()
    }

    /// The settlement this snapshot calls for, if any.
    pub fn resolution(&self) -> Option<Resolution> {
        match (self.status, self.outcome) {
            (EventStatus::Finished, Some(outcome)) => Some(Resolution::Finished(outcome)),
            (EventStatus::Voided, _) => Some(Resolution::Voided),
            (EventStatus::Scheduled | EventStatus::Live | EventStatus::Finished, _) => None,
        }
    }
}

impl fmt::Display for EventSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let odds: Vec<String> = self
            .odds
            .iter()
            .map(|(o, c)| format!("{o}={c:.2}"))
            .collect();
        write!(
            f,
            "[{}] {} ({}) starts {} | {}",
            self.event_id,
            self.name,
            self.status,
            self.start_time.to_rfc3339(),
            odds.join(" "),
        )
    }
}

/// How an event concluded, as far as bets are concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    Finished(Outcome),
    Voided,
}

impl Resolution {
    /// Event status implied by this resolution.
    pub fn status(&self) -> EventStatus {
        match self {
            Resolution::Finished(_) => EventStatus::Finished,
            Resolution::Voided => EventStatus::Voided,
        }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resolution::Finished(outcome) => write!(f, "finished:{outcome}"),
            Resolution::Voided => write!(f, "voided"),
        }
    }
}

/// Request to settle every open bet on an event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementTrigger {
    pub event_id: EventId,
    pub resolution: Resolution,
    /// Delivery attempt, starting at 0.
    #[serde(default)]
    pub attempt: u32,
}

impl SettlementTrigger {
    pub fn new(event_id: &str, resolution: Resolution) -> Self {
        Self {
            event_id: event_id.to_string(),
            resolution,
            attempt: 0,
        }
    }
}

// ---------------------------------------------------------------------------
// Bets
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BetStatus {
    Open,
    Won,
    Lost,
    Cancelled,
}

impl BetStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BetStatus::Open => "open",
            BetStatus::Won => "won",
            BetStatus::Lost => "lost",
            BetStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, BetStatus::Open)
    }
}

impl fmt::Display for BetStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BetStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "open" => Ok(BetStatus::Open),
            "won" => Ok(BetStatus::Won),
            "lost" => Ok(BetStatus::Lost),
            "cancelled" | "canceled" => Ok(BetStatus::Cancelled),
            _ => Err(anyhow::anyhow!("Unknown bet status: {s}")),
        }
    }
}

/// A fixed-odds wager on one outcome of one event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bet {
    pub bet_id: BetId,
    pub user_id: UserId,
    pub event_id: EventId,
    pub outcome: Outcome,
    pub stake: Decimal,
    /// Frozen at placement.
    pub coefficient: Decimal,
    pub potential_payout: Decimal,
    pub status: BetStatus,
    pub placed_at: DateTime<Utc>,
    #[serde(default)]
    pub settled_at: Option<DateTime<Utc>>,
}

impl Bet {
    pub fn new(
        user_id: &str,
        event_id: &str,
        outcome: Outcome,
        stake: Decimal,
        coefficient: Decimal,
        placed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            bet_id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            event_id: event_id.to_string(),
            outcome,
            stake,
            coefficient,
            potential_payout: round_money(stake * coefficient),
            status: BetStatus::Open,
            placed_at,
            settled_at: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.status == BetStatus::Open
    }

    /// Copy of this bet moved into a terminal status.
    pub fn settled(&self, status: BetStatus, at: DateTime<Utc>) -> Bet {
        Bet {
            status,
            settled_at: Some(at),
            ..self.clone()
        }
    }
}

impl fmt::Display for Bet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} on {} {:.2} @ {:.2} -> {:.2} ({})",
            self.bet_id,
            self.outcome,
            self.event_id,
            self.stake,
            self.coefficient,
            self.potential_payout,
            self.status,
        )
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Domain errors returned by the ledger and the services built on it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WalletError {
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Insufficient funds: need {needed:.2}, available {available:.2}")]
    InsufficientFunds { needed: Decimal, available: Decimal },

    #[error("Limit exceeded: {0}")]
    LimitExceeded(String),

    #[error("Event not found: {0}")]
    EventNotFound(EventId),

    #[error("Event {event_id} is not open for betting ({status})")]
    EventNotOpen { event_id: EventId, status: EventStatus },

    #[error("Event {0} has already started or finished")]
    EventStartedOrFinished(EventId),

    #[error("Invalid stake: {0}")]
    InvalidStake(String),

    #[error("Outcome {outcome} is not offered on event {event_id}")]
    InvalidOutcome { event_id: EventId, outcome: Outcome },

    #[error("Bet not found: {0}")]
    BetNotFound(BetId),

    #[error("Bet {0} can no longer be cancelled")]
    BetNotCancellable(BetId),

    #[error("Bet {0} is already settled")]
    AlreadySettled(BetId),

    #[error("Account {0} is busy, retry later")]
    Busy(UserId),

    #[error("Duplicate operation: {0}")]
    DuplicateOperation(String),

    #[error("Unknown payment reference: {0}")]
    UnknownReference(String),

    #[error("Reference {0} was already used for a different operation")]
    ReferenceConflict(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Event catalog error: {0}")]
    Catalog(String),
}

impl WalletError {
    /// Lock contention is the only condition worth retrying verbatim.
    pub fn is_retryable(&self) -> bool {
        matches!(self, WalletError::Busy(_))
    }
}

pub type WalletResult<T> = std::result::Result<T, WalletError>;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn tx(kind: TransactionKind, amount: Decimal, status: TransactionStatus) -> Transaction {
        Transaction::new("u1", kind, amount, status, None, Utc::now())
    }

    #[test]
    fn test_round_money() {
        assert_eq!(round_money(dec!(100) * dec!(2.555)), dec!(255.50));
        assert_eq!(round_money(dec!(0.005)), dec!(0.01));
        assert_eq!(round_money(dec!(33.333)), dec!(33.33));
    }

    #[test]
    fn test_is_money() {
        assert!(is_money(dec!(10)));
        assert!(is_money(dec!(10.50)));
        assert!(is_money(dec!(10.500)));
        assert!(!is_money(dec!(10.505)));
    }

    #[test]
    fn test_account_new_is_consistent() {
        let account = Account::new("u1");
        assert!(account.is_consistent());
        assert_eq!(account.total_balance, Decimal::ZERO);
    }

    #[test]
    fn test_account_detects_inconsistency() {
        let mut account = Account::new("u1");
        account.total_balance = dec!(10);
        assert!(!account.is_consistent());
        account.available_balance = dec!(15);
        account.locked_balance = dec!(-5);
        assert!(!account.is_consistent());
    }

    #[test]
    fn test_deposit_delta() {
        let d = tx(TransactionKind::Deposit, dec!(50), TransactionStatus::Completed).delta();
        assert_eq!(d, BalanceDelta::new(dec!(50), dec!(50), Decimal::ZERO));
        let d = tx(TransactionKind::Deposit, dec!(50), TransactionStatus::Failed).delta();
        assert_eq!(d, BalanceDelta::ZERO);
    }

    #[test]
    fn test_withdrawal_delta_by_status() {
        let pending = tx(TransactionKind::Withdrawal, dec!(20), TransactionStatus::Pending);
        assert_eq!(pending.delta().available, dec!(-20));
        let completed = tx(TransactionKind::Withdrawal, dec!(20), TransactionStatus::Completed);
        assert_eq!(completed.delta(), pending.delta());
        let failed = tx(TransactionKind::Withdrawal, dec!(20), TransactionStatus::Failed);
        assert_eq!(failed.delta(), BalanceDelta::ZERO);
    }

    #[test]
    fn test_bet_won_delta_uses_stake() {
        let mut won = tx(TransactionKind::BetWon, dec!(250), TransactionStatus::Completed);
        won.stake = Some(dec!(100));
        assert_eq!(
            won.delta(),
            BalanceDelta::new(dec!(150), dec!(250), dec!(-100))
        );
    }

    #[test]
    fn test_bet_deltas_preserve_identity() {
        let mut account = Account::new("u1");
        account.apply(tx(TransactionKind::Deposit, dec!(1000), TransactionStatus::Completed).delta());
        account.apply(tx(TransactionKind::BetPlaced, dec!(100), TransactionStatus::Completed).delta());
        assert!(account.is_consistent());
        assert_eq!(account.locked_balance, dec!(100));
        account.apply(tx(TransactionKind::BetLost, dec!(100), TransactionStatus::Completed).delta());
        assert!(account.is_consistent());
        assert_eq!(account.total_balance, dec!(900));
        assert_eq!(account.available_balance, dec!(900));
    }

    #[test]
    fn test_bet_id_only_for_bet_kinds() {
        let id = Uuid::new_v4();
        let mut placed = tx(TransactionKind::BetPlaced, dec!(10), TransactionStatus::Completed);
        placed.reference_id = Some(id.to_string());
        assert_eq!(placed.bet_id(), Some(id));

        let mut deposit = tx(TransactionKind::Deposit, dec!(10), TransactionStatus::Completed);
        deposit.reference_id = Some(id.to_string());
        assert_eq!(deposit.bet_id(), None);
    }

    #[test]
    fn test_outcome_from_str_aliases() {
        assert_eq!("HOME".parse::<Outcome>().unwrap(), Outcome::Home);
        assert_eq!("1".parse::<Outcome>().unwrap(), Outcome::Home);
        assert_eq!("x".parse::<Outcome>().unwrap(), Outcome::Draw);
        assert_eq!("2".parse::<Outcome>().unwrap(), Outcome::Away);
        assert_eq!("П2".parse::<Outcome>().unwrap(), Outcome::Away);
        assert!("3".parse::<Outcome>().is_err());
    }

    #[test]
    fn test_outcome_serialization() {
        assert_eq!(serde_json::to_string(&Outcome::Draw).unwrap(), "\"DRAW\"");
        let o: Outcome = serde_json::from_str("\"AWAY\"").unwrap();
        assert_eq!(o, Outcome::Away);
    }

    #[test]
    fn test_transaction_kind_from_str() {
        for kind in TransactionKind::ALL {
            assert_eq!(kind.as_str().parse::<TransactionKind>().unwrap(), *kind);
        }
        assert!("refund".parse::<TransactionKind>().is_err());
    }

    #[test]
    fn test_transaction_serializes_type_field() {
        let t = tx(TransactionKind::BetWon, dec!(1), TransactionStatus::Completed);
        let json = serde_json::to_value(&t).unwrap();
        assert_eq!(json["type"], "bet_won");
        assert_eq!(json["status"], "completed");
    }

    #[test]
    fn test_bet_new_computes_payout() {
        let bet = Bet::new("u1", "e1", Outcome::Home, dec!(100), dec!(2.5), Utc::now());
        assert_eq!(bet.potential_payout, dec!(250));
        assert!(bet.is_open());
    }

    #[test]
    fn test_payout_keeps_exact_coefficient() {
        let bet = Bet::new("u1", "e1", Outcome::Away, dec!(3), dec!(2.375), Utc::now());
        assert_eq!(bet.coefficient, dec!(2.375));
        assert_eq!(bet.potential_payout, dec!(7.13));
    }

    #[test]
    fn test_bet_settled_copy() {
        let bet = Bet::new("u1", "e1", Outcome::Home, dec!(10), dec!(1.85), Utc::now());
        let won = bet.settled(BetStatus::Won, Utc::now());
        assert_eq!(won.status, BetStatus::Won);
        assert!(won.settled_at.is_some());
        assert_eq!(won.coefficient, bet.coefficient);
        assert!(bet.is_open());
    }

    #[test]
    fn test_snapshot_resolution() {
        let mut snap = EventSnapshot {
            event_id: "e1".into(),
            name: "A vs B".into(),
            odds: BTreeMap::from([(Outcome::Home, dec!(2.0))]),
            start_time: Utc::now(),
            status: EventStatus::Scheduled,
            outcome: None,
        };
        assert_eq!(snap.resolution(), None);
        snap.status = EventStatus::Finished;
        assert_eq!(snap.resolution(), None);
        snap.outcome = Some(Outcome::Draw);
        assert_eq!(snap.resolution(), Some(Resolution::Finished(Outcome::Draw)));
        snap.status = EventStatus::Voided;
        assert_eq!(snap.resolution(), Some(Resolution::Voided));
    }

    #[test]
    fn test_snapshot_odds_roundtrip() {
        let json = r#"{
            "event_id": "e7",
            "odds": {"HOME": 2.1, "DRAW": 3.4, "AWAY": 3.0},
            "start_time": "2030-01-01T18:00:00Z",
            "status": "scheduled"
        }"#;
        let snap: EventSnapshot = serde_json::from_str(json).unwrap();
        assert_eq!(snap.coefficient(Outcome::Draw), Some(dec!(3.4)));
        assert_eq!(snap.outcome, None);
    }

    #[test]
    fn test_resolution_serialization() {
        let json = serde_json::to_string(&Resolution::Finished(Outcome::Home)).unwrap();
        assert_eq!(json, r#"{"finished":"HOME"}"#);
        let voided: Resolution = serde_json::from_str("\"voided\"").unwrap();
        assert_eq!(voided, Resolution::Voided);
        assert_eq!(voided.status(), EventStatus::Voided);
        assert_eq!(Resolution::Finished(Outcome::Home).status(), EventStatus::Finished);
    }

    #[test]
    fn test_only_busy_is_retryable() {
        assert!(WalletError::Busy("u1".into()).is_retryable());
        assert!(!WalletError::InvalidAmount("x".into()).is_retryable());
        assert!(!WalletError::Storage("x".into()).is_retryable());
    }

    #[test]
    fn test_error_display() {
        let e = WalletError::InsufficientFunds {
            needed: dec!(600),
            available: dec!(400),
        };
        assert_eq!(e.to_string(), "Insufficient funds: need 600.00, available 400.00");
    }
}
