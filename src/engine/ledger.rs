//! Ledger store: the single writer of account balances.
//!
//! Each user owns a `UserBook` behind its own async mutex, so mutations
//! for one user are serialized while different users never contend.
//! Every mutation is recorded in memory, written to the journal, and
//! undone again if the journal write fails, so a caller only ever
//! observes all-or-nothing changes.
//!
//! Readers go through a published `LedgerView` that is swapped in when a
//! writer releases its guard; they never wait on the book mutex.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, PoisonError, RwLock as StdRwLock};
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::config::LedgerConfig;
use crate::engine::history::{HistoryFilter, HistoryPage, Page};
use crate::storage::Journal;
use crate::types::{
    is_money, Account, Bet, BetId, EventId, Resolution, Transaction, TransactionId, TransactionKind,
    TransactionStatus, UserId, WalletError, WalletResult, MONEY_SCALE,
};

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

/// Limits and lock behaviour applied by the ledger.
#[derive(Debug, Clone)]
pub struct LedgerPolicy {
    pub min_withdrawal: Decimal,
    pub max_withdrawal: Decimal,
    /// Cap on pending + completed withdrawals inside any rolling 24 h window.
    pub daily_withdrawal_limit: Decimal,
    pub max_deposit: Decimal,
    /// How long a single attempt waits for a user's lock.
    pub lock_timeout: Duration,
    /// Extra attempts after the first timeout before failing with `Busy`.
    pub busy_retries: u32,
}

impl Default for LedgerPolicy {
    fn default() -> Self {
        Self {
            min_withdrawal: dec!(1),
            max_withdrawal: dec!(100000),
            daily_withdrawal_limit: dec!(50000),
            max_deposit: dec!(100000),
            lock_timeout: Duration::from_millis(250),
            busy_retries: 3,
        }
    }
}

impl From<&LedgerConfig> for LedgerPolicy {
    fn from(cfg: &LedgerConfig) -> Self {
        Self {
            min_withdrawal: cfg.min_withdrawal,
            max_withdrawal: cfg.max_withdrawal,
            daily_withdrawal_limit: cfg.daily_withdrawal_limit,
            max_deposit: cfg.max_deposit,
            lock_timeout: Duration::from_millis(cfg.lock_timeout_ms),
            busy_retries: cfg.busy_retries,
        }
    }
}

/// How a bet reservation leaves the locked balance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Release {
    /// Stake plus winnings (`payout - stake`) become available.
    Won { payout: Decimal },
    /// Stake is forfeited: `total` and `locked` shrink together.
    Lost,
    /// Stake returns to `available` unchanged.
    Refund,
}

impl Release {
    pub fn kind(&self) -> TransactionKind {
        match self {
            Release::Won { .. } => TransactionKind::BetWon,
            Release::Lost => TransactionKind::BetLost,
            Release::Refund => TransactionKind::BetCancelled,
        }
    }
}

// ---------------------------------------------------------------------------
// Per-user book
// ---------------------------------------------------------------------------

/// Everything the ledger knows about one user.
#[derive(Debug)]
pub struct UserBook {
    account: Account,
    transactions: Arc<Vec<Transaction>>,
    bets: Arc<HashMap<BetId, Bet>>,
    /// Stake currently locked per bet.
    reservations: HashMap<BetId, Decimal>,
    /// How each released bet left the locked balance.
    released: HashMap<BetId, TransactionKind>,
    /// Funding reference -> index into `transactions`.
    references: HashMap<String, usize>,
}

impl UserBook {
    fn new(user_id: &str) -> Self {
        Self {
            account: Account::new(user_id),
            transactions: Arc::new(Vec::new()),
            bets: Arc::new(HashMap::new()),
            reservations: HashMap::new(),
            released: HashMap::new(),
            references: HashMap::new(),
        }
    }

    pub fn account(&self) -> &Account {
        &self.account
    }

    pub fn user_id(&self) -> &str {
        &self.account.user_id
    }

    pub fn transactions(&self) -> &[Transaction] {
        &self.transactions
    }

    pub fn bet(&self, bet_id: BetId) -> Option<&Bet> {
        self.bets.get(&bet_id)
    }

    pub fn bets(&self) -> impl Iterator<Item = &Bet> {
        self.bets.values()
    }

    pub fn reservation(&self, bet_id: BetId) -> Option<Decimal> {
        self.reservations.get(&bet_id).copied()
    }

    pub fn reservations(&self) -> Vec<(BetId, Decimal)> {
        self.reservations.iter().map(|(id, s)| (*id, *s)).collect()
    }

    /// Funding transaction recorded under `reference_id`, if any.
    pub fn find_reference(&self, reference_id: &str) -> Option<&Transaction> {
        self.references
            .get(reference_id)
            .and_then(|i| self.transactions.get(*i))
    }

    /// Sum of stakes on bets that are still open.
    pub fn open_stake(&self) -> Decimal {
        self.bets
            .values()
            .filter(|b| b.is_open())
            .map(|b| b.stake)
            .sum()
    }

    fn view(&self) -> LedgerView {
        LedgerView {
            account: self.account.clone(),
            transactions: Arc::clone(&self.transactions),
            bets: Arc::clone(&self.bets),
        }
    }

    /// Apply a transaction exactly as recorded (used by replay).
    fn apply(&mut self, tx: Transaction) -> Transaction {
        self.account.apply(tx.delta());
        match (tx.kind, tx.bet_id()) {
            (TransactionKind::BetPlaced, Some(bet_id)) => {
                self.reservations.insert(bet_id, tx.released_stake());
            }
            (
                TransactionKind::BetWon | TransactionKind::BetLost | TransactionKind::BetCancelled,
                Some(bet_id),
            ) => {
                self.reservations.remove(&bet_id);
                self.released.insert(bet_id, tx.kind);
            }
            _ => {}
        }
        if !tx.kind.is_bet() {
            if let Some(reference) = &tx.reference_id {
                self.references
                    .insert(reference.clone(), self.transactions.len());
            }
        }
        Arc::make_mut(&mut self.transactions).push(tx.clone());
        debug_assert!(self.account.is_consistent(), "ledger identity broken");
        tx
    }

    /// Stamp the resulting balance and apply a new transaction.
    fn record(&mut self, mut tx: Transaction) -> Transaction {
        tx.resulting_total_balance = self.account.total_balance + tx.delta().total;
        self.apply(tx)
    }

    /// Roll back the most recent transaction.
    pub(crate) fn undo(&mut self) -> Option<Transaction> {
        let tx = Arc::make_mut(&mut self.transactions).pop()?;
        self.account.revert(tx.delta());
        match (tx.kind, tx.bet_id()) {
            (TransactionKind::BetPlaced, Some(bet_id)) => {
                self.reservations.remove(&bet_id);
            }
            (
                TransactionKind::BetWon | TransactionKind::BetLost | TransactionKind::BetCancelled,
                Some(bet_id),
            ) => {
                self.released.remove(&bet_id);
                self.reservations.insert(bet_id, tx.released_stake());
            }
            _ => {}
        }
        if !tx.kind.is_bet() {
            if let Some(reference) = &tx.reference_id {
                self.references.remove(reference);
            }
        }
        Some(tx)
    }

    /// Move `available` into `locked` for a bet. `None` if the bet was
    /// already reserved (or already released).
    pub(crate) fn reserve(
        &mut self,
        amount: Decimal,
        bet_id: BetId,
        now: DateTime<Utc>,
    ) -> WalletResult<Option<Transaction>> {
        if self.reservations.contains_key(&bet_id) || self.released.contains_key(&bet_id) {
            debug!(user_id = %self.user_id(), %bet_id, "Reservation already recorded");
            return Ok(None);
        }
        validate_amount(amount)?;
        if amount > self.account.available_balance {
            return Err(WalletError::InsufficientFunds {
                needed: amount,
                available: self.account.available_balance,
            });
        }

        let mut tx = Transaction::new(
            self.user_id(),
            TransactionKind::BetPlaced,
            amount,
            TransactionStatus::Completed,
            Some(bet_id.to_string()),
            now,
        );
        tx.stake = Some(amount);
        Ok(Some(self.record(tx)))
    }

    /// Take a bet's stake out of `locked`. `None` if the same release was
    /// already applied.
    pub(crate) fn release(
        &mut self,
        bet_id: BetId,
        stake: Decimal,
        mode: Release,
        now: DateTime<Utc>,
    ) -> WalletResult<Option<Transaction>> {
        if let Some(kind) = self.released.get(&bet_id) {
            if *kind == mode.kind() {
                debug!(user_id = %self.user_id(), %bet_id, kind = %kind, "Release already applied");
                return Ok(None);
            }
            return Err(WalletError::AlreadySettled(bet_id));
        }

        let reserved = self
            .reservations
            .get(&bet_id)
            .copied()
            .ok_or(WalletError::BetNotFound(bet_id))?;
        if reserved != stake {
            return Err(WalletError::InvalidAmount(format!(
                "release of {stake:.2} does not match the {reserved:.2} reserved for bet {bet_id}"
            )));
        }

        let amount = match mode {
            Release::Won { payout } => {
                if payout < stake {
                    return Err(WalletError::InvalidAmount(format!(
                        "payout {payout:.2} is below stake {stake:.2}"
                    )));
                }
                payout
            }
            Release::Lost | Release::Refund => stake,
        };

        let mut tx = Transaction::new(
            self.user_id(),
            mode.kind(),
            amount,
            TransactionStatus::Completed,
            Some(bet_id.to_string()),
            now,
        );
        tx.stake = Some(stake);
        Ok(Some(self.record(tx)))
    }

    /// Change a pending transaction's status, re-applying its balance effect.
    /// Returns the previous status.
    pub(crate) fn set_status(
        &mut self,
        transaction_id: TransactionId,
        status: TransactionStatus,
    ) -> Option<TransactionStatus> {
        let transactions = Arc::make_mut(&mut self.transactions);
        let tx = transactions
            .iter_mut()
            .rev()
            .find(|t| t.transaction_id == transaction_id)?;
        let before = tx.delta();
        let previous = tx.status;
        tx.status = status;
        let after = tx.delta();
        self.account.revert(before);
        self.account.apply(after);
        Some(previous)
    }

    pub(crate) fn upsert_bet(&mut self, bet: Bet) -> Option<Bet> {
        Arc::make_mut(&mut self.bets).insert(bet.bet_id, bet)
    }

    pub(crate) fn remove_bet(&mut self, bet_id: BetId) -> Option<Bet> {
        Arc::make_mut(&mut self.bets).remove(&bet_id)
    }

    /// Withdrawals still counting against the cap since `since`.
    fn withdrawn_since(&self, since: DateTime<Utc>) -> Decimal {
        self.transactions
            .iter()
            .filter(|t| {
                t.kind == TransactionKind::Withdrawal
                    && t.status != TransactionStatus::Failed
                    && t.created_at > since
            })
            .map(|t| t.amount)
            .sum()
    }
}

/// Last committed state of one user, as seen by readers.
#[derive(Debug, Clone)]
pub struct LedgerView {
    pub account: Account,
    pub transactions: Arc<Vec<Transaction>>,
    pub bets: Arc<HashMap<BetId, Bet>>,
}

impl LedgerView {
    /// Bets ordered newest first.
    pub fn bets_newest_first(&self) -> Vec<Bet> {
        let mut bets: Vec<Bet> = self.bets.values().cloned().collect();
        bets.sort_by(|a, b| b.placed_at.cmp(&a.placed_at));
        bets
    }
}

struct UserSlot {
    book: Arc<Mutex<UserBook>>,
    view: StdRwLock<LedgerView>,
}

impl UserSlot {
    fn new(user_id: &str) -> Self {
        let book = UserBook::new(user_id);
        let view = StdRwLock::new(book.view());
        Self {
            book: Arc::new(Mutex::new(book)),
            view,
        }
    }

    fn view(&self) -> LedgerView {
        self.view
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Exclusive access to one user's book. Publishes the book's state to
/// readers when dropped.
pub struct UserGuard {
    book: OwnedMutexGuard<UserBook>,
    slot: Arc<UserSlot>,
}

impl Deref for UserGuard {
    type Target = UserBook;

    fn deref(&self) -> &UserBook {
        &self.book
    }
}

impl DerefMut for UserGuard {
    fn deref_mut(&mut self) -> &mut UserBook {
        &mut self.book
    }
}

impl Drop for UserGuard {
    fn drop(&mut self) {
        let view = self.book.view();
        *self
            .slot
            .view
            .write()
            .unwrap_or_else(PoisonError::into_inner) = view;
    }
}

// ---------------------------------------------------------------------------
// Ledger
// ---------------------------------------------------------------------------

pub struct Ledger {
    slots: RwLock<HashMap<UserId, Arc<UserSlot>>>,
    /// Event -> bets placed on it, for settlement lookup.
    event_index: RwLock<HashMap<EventId, Vec<(UserId, BetId)>>>,
    /// Funding reference -> owning user, unique across users.
    references: RwLock<HashMap<String, UserId>>,
    /// Events a settlement run has started on. No new bet may join them.
    resolved: RwLock<HashMap<EventId, Resolution>>,
    journal: Arc<dyn Journal>,
    clock: Arc<dyn Clock>,
    policy: LedgerPolicy,
}

impl Ledger {
    /// An empty ledger writing to `journal`.
    pub fn new(journal: Arc<dyn Journal>, clock: Arc<dyn Clock>, policy: LedgerPolicy) -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
            event_index: RwLock::new(HashMap::new()),
            references: RwLock::new(HashMap::new()),
            resolved: RwLock::new(HashMap::new()),
            journal,
            clock,
            policy,
        }
    }

    /// Rebuild the ledger by replaying everything in `journal`.
    pub async fn restore(
        journal: Arc<dyn Journal>,
        clock: Arc<dyn Clock>,
        policy: LedgerPolicy,
    ) -> WalletResult<Self> {
        let contents = journal.load().await?;
        let ledger = Self::new(journal, clock, policy);

        let mut by_user: HashMap<UserId, Vec<Transaction>> = HashMap::new();
        for tx in contents.transactions.iter().cloned() {
            by_user.entry(tx.user_id.clone()).or_default().push(tx);
        }

        for (user_id, transactions) in by_user {
            let mut guard = ledger.lock(&user_id).await?;
            for tx in transactions {
                if let (false, Some(reference)) = (tx.kind.is_bet(), &tx.reference_id) {
                    ledger
                        .references
                        .write()
                        .await
                        .insert(reference.clone(), user_id.clone());
                }
                guard.apply(tx);
            }
            if !guard.account().is_consistent() {
                warn!(account = %guard.account(), "Replayed account is inconsistent");
            }
        }

        for bet in contents.bets {
            let mut guard = ledger.lock(&bet.user_id).await?;
            ledger.index_bet(&bet).await;
            guard.upsert_bet(bet);
        }

        info!(
            journal = ledger.journal.name(),
            transactions = contents.transactions.len(),
            users = ledger.slots.read().await.len(),
            "Ledger restored from journal"
        );
        Ok(ledger)
    }

    pub fn policy(&self) -> &LedgerPolicy {
        &self.policy
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub(crate) fn journal(&self) -> &dyn Journal {
        self.journal.as_ref()
    }

    async fn slot(&self, user_id: &str) -> Arc<UserSlot> {
        if let Some(slot) = self.slots.read().await.get(user_id) {
            return Arc::clone(slot);
        }
        let mut slots = self.slots.write().await;
        Arc::clone(
            slots
                .entry(user_id.to_string())
                .or_insert_with(|| Arc::new(UserSlot::new(user_id))),
        )
    }

    /// Enter a user's critical section, failing with `Busy` once every
    /// bounded attempt has timed out.
    pub(crate) async fn lock(&self, user_id: &str) -> WalletResult<UserGuard> {
        let slot = self.slot(user_id).await;
        for attempt in 0..=self.policy.busy_retries {
            let acquire = Arc::clone(&slot.book).lock_owned();
            match tokio::time::timeout(self.policy.lock_timeout, acquire).await {
                Ok(book) => return Ok(UserGuard { book, slot }),
                Err(_) => debug!(user_id, attempt, "Account lock timed out"),
            }
        }
        warn!(user_id, retries = self.policy.busy_retries, "Account busy");
        Err(WalletError::Busy(user_id.to_string()))
    }

    /// Latest committed state for a user. Unknown users read as an empty
    /// book without being registered.
    pub async fn view(&self, user_id: &str) -> LedgerView {
        match self.slots.read().await.get(user_id) {
            Some(slot) => slot.view(),
            None => UserBook::new(user_id).view(),
        }
    }

    /// Every user the ledger has touched.
    pub async fn users(&self) -> Vec<UserId> {
        let mut users: Vec<UserId> = self.slots.read().await.keys().cloned().collect();
        users.sort();
        users
    }

    /// Record `tx` in the book and the journal, or in neither.
    async fn commit(&self, guard: &mut UserGuard, tx: Transaction) -> WalletResult<Transaction> {
        let tx = guard.record(tx);
        if let Err(e) = self.journal.append(&tx).await {
            guard.undo();
            error!(
                user_id = %tx.user_id,
                transaction_id = %tx.transaction_id,
                kind = %tx.kind,
                error = %e,
                "Journal write failed, mutation rolled back"
            );
            return Err(e);
        }
        Ok(tx)
    }

    // -- Funding ------------------------------------------------------------

    /// Credit `amount` to the user. A repeated `reference_id` returns the
    /// original transaction without crediting again.
    pub async fn deposit(
        &self,
        user_id: &str,
        amount: Decimal,
        reference_id: &str,
    ) -> WalletResult<Transaction> {
        validate_reference(reference_id)?;
        validate_amount(amount)?;
        if amount > self.policy.max_deposit {
            return Err(WalletError::LimitExceeded(format!(
                "deposit of {amount:.2} exceeds the per-transaction maximum of {:.2}",
                self.policy.max_deposit
            )));
        }

        let mut guard = self.lock(user_id).await?;
        if let Some(existing) = guard.find_reference(reference_id) {
            return replay_existing(existing, TransactionKind::Deposit, amount, reference_id);
        }

        self.claim_reference(reference_id, user_id).await?;
        let tx = Transaction::new(
            user_id,
            TransactionKind::Deposit,
            amount,
            TransactionStatus::Completed,
            Some(reference_id.to_string()),
            self.now(),
        );
        match self.commit(&mut guard, tx).await {
            Ok(tx) => {
                info!(
                    user_id,
                    reference_id,
                    amount = %amount,
                    total = %tx.resulting_total_balance,
                    "Deposit credited"
                );
                Ok(tx)
            }
            Err(e) => {
                self.unclaim_reference(reference_id).await;
                Err(e)
            }
        }
    }

    /// Debit `amount` from `available` right away and record a pending
    /// withdrawal for the payment provider to confirm or reverse.
    pub async fn withdraw(
        &self,
        user_id: &str,
        amount: Decimal,
        reference_id: &str,
    ) -> WalletResult<Transaction> {
        validate_reference(reference_id)?;
        validate_amount(amount)?;
        if amount < self.policy.min_withdrawal {
            return Err(WalletError::InvalidAmount(format!(
                "minimum withdrawal is {:.2}",
                self.policy.min_withdrawal
            )));
        }
        if amount > self.policy.max_withdrawal {
            return Err(WalletError::LimitExceeded(format!(
                "withdrawal of {amount:.2} exceeds the per-request maximum of {:.2}",
                self.policy.max_withdrawal
            )));
        }

        let mut guard = self.lock(user_id).await?;
        if let Some(existing) = guard.find_reference(reference_id) {
            return replay_existing(existing, TransactionKind::Withdrawal, amount, reference_id);
        }

        let available = guard.account().available_balance;
        if amount > available {
            warn!(user_id, amount = %amount, available = %available, "Withdrawal rejected");
            return Err(WalletError::InsufficientFunds {
                needed: amount,
                available,
            });
        }

        let now = self.now();
        let used = guard.withdrawn_since(now - ChronoDuration::hours(24));
        if used + amount > self.policy.daily_withdrawal_limit {
            warn!(user_id, amount = %amount, used = %used, "Daily withdrawal cap reached");
            return Err(WalletError::LimitExceeded(format!(
                "daily withdrawal limit {:.2} reached ({:.2} remaining)",
                self.policy.daily_withdrawal_limit,
                (self.policy.daily_withdrawal_limit - used).max(Decimal::ZERO)
            )));
        }

        self.claim_reference(reference_id, user_id).await?;
        let tx = Transaction::new(
            user_id,
            TransactionKind::Withdrawal,
            amount,
            TransactionStatus::Pending,
            Some(reference_id.to_string()),
            now,
        );
        match self.commit(&mut guard, tx).await {
            Ok(tx) => {
                info!(user_id, reference_id, amount = %amount, "Withdrawal pending");
                Ok(tx)
            }
            Err(e) => {
                self.unclaim_reference(reference_id).await;
                Err(e)
            }
        }
    }

    // -- Reservations -------------------------------------------------------

    /// Lock `amount` of the user's available funds against `bet_id`.
    /// Reserving the same bet twice is a no-op.
    pub async fn reserve(&self, user_id: &str, amount: Decimal, bet_id: BetId) -> WalletResult<()> {
        let mut guard = self.lock(user_id).await?;
        let now = self.now();
        let Some(tx) = guard.reserve(amount, bet_id, now)? else {
            return Ok(());
        };
        if let Err(e) = self.journal.append(&tx).await {
            guard.undo();
            error!(user_id, %bet_id, error = %e, "Journal write failed, reservation rolled back");
            return Err(e);
        }
        debug!(user_id, %bet_id, amount = %amount, "Funds reserved");
        Ok(())
    }

    /// Release a bet's reservation. Replaying the same release is a no-op
    /// returning `None`.
    pub async fn release(
        &self,
        user_id: &str,
        bet_id: BetId,
        stake: Decimal,
        mode: Release,
    ) -> WalletResult<Option<Transaction>> {
        let mut guard = self.lock(user_id).await?;
        let now = self.now();
        let Some(tx) = guard.release(bet_id, stake, mode, now)? else {
            return Ok(None);
        };
        if let Err(e) = self.journal.append(&tx).await {
            guard.undo();
            error!(user_id, %bet_id, error = %e, "Journal write failed, release rolled back");
            return Err(e);
        }
        debug!(user_id, %bet_id, kind = %tx.kind, amount = %tx.amount, "Reservation released");
        Ok(Some(tx))
    }

    // -- Reads --------------------------------------------------------------

    pub async fn get_balance(&self, user_id: &str) -> Account {
        self.view(user_id).await.account
    }

    /// Transactions newest first, filtered and paginated.
    pub async fn get_history(
        &self,
        user_id: &str,
        filter: &HistoryFilter,
        page: Page,
    ) -> HistoryPage<Transaction> {
        let view = self.view(user_id).await;
        let items: Vec<Transaction> = view
            .transactions
            .iter()
            .rev()
            .filter(|t| filter.matches(t))
            .cloned()
            .collect();
        HistoryPage::paginate(items, page)
    }

    // -- Indices --------------------------------------------------------------

    pub(crate) async fn index_bet(&self, bet: &Bet) {
        let mut index = self.event_index.write().await;
        let entries = index.entry(bet.event_id.clone()).or_default();
        if !entries.iter().any(|(_, id)| *id == bet.bet_id) {
            entries.push((bet.user_id.clone(), bet.bet_id));
        }
    }

    pub(crate) async fn unindex_bet(&self, bet: &Bet) {
        let mut index = self.event_index.write().await;
        if let Some(entries) = index.get_mut(&bet.event_id) {
            entries.retain(|(_, id)| *id != bet.bet_id);
        }
    }

    /// Every bet ever placed on `event_id`, with its owner.
    pub(crate) async fn bets_for_event(&self, event_id: &str) -> Vec<(UserId, BetId)> {
        self.event_index
            .read()
            .await
            .get(event_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Record that `event_id` is being settled. Must happen before the
    /// settlement run reads `bets_for_event`.
    pub(crate) async fn mark_resolved(&self, event_id: &str, resolution: Resolution) {
        self.resolved
            .write()
            .await
            .insert(event_id.to_string(), resolution);
    }

    /// Resolution a settlement run has recorded for `event_id`. Checked by
    /// placement after indexing its bet.
    pub(crate) async fn resolution(&self, event_id: &str) -> Option<Resolution> {
        self.resolved.read().await.get(event_id).copied()
    }

    /// User a funding reference belongs to.
    pub(crate) async fn reference_owner(&self, reference_id: &str) -> Option<UserId> {
        self.references.read().await.get(reference_id).cloned()
    }

    async fn claim_reference(&self, reference_id: &str, user_id: &str) -> WalletResult<()> {
        let mut references = self.references.write().await;
        match references.get(reference_id) {
            Some(owner) if owner != user_id => {
                warn!(reference_id, user_id, owner = %owner, "Reference belongs to another user");
                Err(WalletError::ReferenceConflict(reference_id.to_string()))
            }
            Some(_) => Ok(()),
            None => {
                references.insert(reference_id.to_string(), user_id.to_string());
                Ok(())
            }
        }
    }

    async fn unclaim_reference(&self, reference_id: &str) {
        self.references.write().await.remove(reference_id);
    }
}

/// Rebuild an account by applying `transactions` in order to an empty one.
pub fn replay(user_id: &str, transactions: &[Transaction]) -> Account {
    let mut book = UserBook::new(user_id);
    for tx in transactions {
        book.apply(tx.clone());
    }
    book.account
}

fn validate_amount(amount: Decimal) -> WalletResult<()> {
    if amount <= Decimal::ZERO {
        return Err(WalletError::InvalidAmount(format!(
            "{amount} must be positive"
        )));
    }
    if !is_money(amount) {
        return Err(WalletError::InvalidAmount(format!(
            "{amount} has more than {MONEY_SCALE} decimal places"
        )));
    }
    Ok(())
}

fn validate_reference(reference_id: &str) -> WalletResult<()> {
    if reference_id.trim().is_empty() {
        return Err(WalletError::UnknownReference(
            "missing payment reference".to_string(),
        ));
    }
    Ok(())
}

/// Idempotent short-circuit for a reused funding reference.
fn replay_existing(
    existing: &Transaction,
    kind: TransactionKind,
    amount: Decimal,
    reference_id: &str,
) -> WalletResult<Transaction> {
    if existing.kind == kind && existing.amount == amount {
        debug!(
            reference_id,
            transaction_id = %existing.transaction_id,
            "{}",
            WalletError::DuplicateOperation(reference_id.to_string())
        );
        Ok(existing.clone())
    } else {
        warn!(
            reference_id,
            existing_kind = %existing.kind,
            existing_amount = %existing.amount,
            "Reference reused with different parameters"
        );
        Err(WalletError::ReferenceConflict(reference_id.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
