//! History queries, betting statistics and CSV statement export.
//!
//! Everything here reads the published ledger views, so none of it ever
//! waits on a writer.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;

use crate::engine::ledger::Ledger;
use crate::types::{round_money, Bet, BetStatus, EventId, Transaction, TransactionKind, TransactionStatus};

// ---------------------------------------------------------------------------
// Filters and pagination
// ---------------------------------------------------------------------------

/// Transaction history filter. Bounds are inclusive.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HistoryFilter {
    #[serde(default, rename = "type")]
    pub kind: Option<TransactionKind>,
    #[serde(default)]
    pub status: Option<TransactionStatus>,
    #[serde(default)]
    pub from: Option<DateTime<Utc>>,
    #[serde(default)]
    pub to: Option<DateTime<Utc>>,
}

impl HistoryFilter {
    pub fn matches(&self, tx: &Transaction) -> bool {
        self.kind.map_or(true, |k| tx.kind == k)
            && self.status.map_or(true, |s| tx.status == s)
            && in_range(tx.created_at, self.from, self.to)
    }
}

/// Bet history filter, applied to `placed_at`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BetFilter {
    #[serde(default)]
    pub status: Option<BetStatus>,
    #[serde(default)]
    pub event_id: Option<EventId>,
    #[serde(default)]
    pub from: Option<DateTime<Utc>>,
    #[serde(default)]
    pub to: Option<DateTime<Utc>>,
}

impl BetFilter {
    pub fn matches(&self, bet: &Bet) -> bool {
        self.status.map_or(true, |s| bet.status == s)
            && self.event_id.as_ref().map_or(true, |e| &bet.event_id == e)
            && in_range(bet.placed_at, self.from, self.to)
    }
}

fn in_range(at: DateTime<Utc>, from: Option<DateTime<Utc>>, to: Option<DateTime<Utc>>) -> bool {
    from.map_or(true, |f| at >= f) && to.map_or(true, |t| at <= t)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub limit: usize,
    pub offset: usize,
}

impl Page {
    pub const DEFAULT_LIMIT: usize = 50;
    pub const MAX_LIMIT: usize = 100;

    /// `limit` is clamped to `1..=MAX_LIMIT`.
    pub fn new(limit: usize, offset: usize) -> Self {
        Self {
            limit: limit.clamp(1, Self::MAX_LIMIT),
            offset,
        }
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::new(Self::DEFAULT_LIMIT, 0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryPage<T> {
    pub items: Vec<T>,
    /// Matching items before pagination.
    pub total: usize,
    pub limit: usize,
    pub offset: usize,
}

impl<T> HistoryPage<T> {
    /// Cut one page out of an already ordered list.
    pub fn paginate(items: Vec<T>, page: Page) -> Self {
        let total = items.len();
        let items = items
            .into_iter()
            .skip(page.offset)
            .take(page.limit)
            .collect();
        Self {
            items,
            total,
            limit: page.limit,
            offset: page.offset,
        }
    }
}

// ---------------------------------------------------------------------------
// Bets and statistics
// ---------------------------------------------------------------------------

/// Bets newest first, filtered and paginated.
pub async fn bet_history(
    ledger: &Ledger,
    user_id: &str,
    filter: &BetFilter,
    page: Page,
) -> HistoryPage<Bet> {
    let bets = ledger
        .view(user_id)
        .await
        .bets_newest_first()
        .into_iter()
        .filter(|b| filter.matches(b))
        .collect();
    HistoryPage::paginate(bets, page)
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BettingStats {
    pub total_bets: usize,
    pub open: usize,
    pub won: usize,
    pub lost: usize,
    pub cancelled: usize,
    /// Stakes of every bet that was not cancelled.
    pub total_staked: Decimal,
    /// Payouts of won bets.
    pub total_returned: Decimal,
    /// Returns minus the stakes of settled bets.
    pub net_profit: Decimal,
    /// Won as a percentage of settled bets.
    pub win_rate: Decimal,
}

impl BettingStats {
    pub fn from_bets<'a>(bets: impl IntoIterator<Item = &'a Bet>) -> Self {
        let mut stats = Self::default();
        let mut settled_stake = Decimal::ZERO;

        for bet in bets {
            stats.total_bets += 1;
            match bet.status {
                BetStatus::Open => {
                    stats.open += 1;
                    stats.total_staked += bet.stake;
                }
                BetStatus::Won => {
                    stats.won += 1;
                    stats.total_staked += bet.stake;
                    stats.total_returned += bet.potential_payout;
                    settled_stake += bet.stake;
                }
                BetStatus::Lost => {
                    stats.lost += 1;
                    stats.total_staked += bet.stake;
                    settled_stake += bet.stake;
                }
                BetStatus::Cancelled => stats.cancelled += 1,
            }
        }

        stats.net_profit = stats.total_returned - settled_stake;
        let settled = stats.won + stats.lost;
        if settled > 0 {
            stats.win_rate =
                round_money(Decimal::from(stats.won) * dec!(100) / Decimal::from(settled));
        }
        stats
    }
}

pub async fn betting_stats(ledger: &Ledger, user_id: &str) -> BettingStats {
    let view = ledger.view(user_id).await;
    BettingStats::from_bets(view.bets.values())
}

// ---------------------------------------------------------------------------
// Statement export
// ---------------------------------------------------------------------------

/// Flat CSV statement: a header block, then BETS, TRANSACTIONS and
/// STATISTICS sections separated by blank lines. The date bounds of
/// `filter` also apply to bets.
pub async fn export_statement(
    ledger: &Ledger,
    user_id: &str,
    filter: &HistoryFilter,
    currency: &str,
) -> String {
    let view = ledger.view(user_id).await;
    let bets: Vec<Bet> = view
        .bets_newest_first()
        .into_iter()
        .filter(|b| in_range(b.placed_at, filter.from, filter.to))
        .collect();
    let transactions: Vec<&Transaction> = view
        .transactions
        .iter()
        .rev()
        .filter(|t| filter.matches(t))
        .collect();
    let stats = BettingStats::from_bets(&bets);

    let mut out = String::new();
    row(&mut out, &["STATEMENT", user_id]);
    row(&mut out, &["CURRENCY", currency]);
    row(&mut out, &["GENERATED_AT", &ledger.now().to_rfc3339()]);
    row(&mut out, &["TOTAL_BALANCE", &money(view.account.total_balance)]);
    row(&mut out, &["AVAILABLE_BALANCE", &money(view.account.available_balance)]);
    row(&mut out, &["LOCKED_BALANCE", &money(view.account.locked_balance)]);

    out.push_str("\nBETS\n");
    row(
        &mut out,
        &[
            "bet_id",
            "event_id",
            "outcome",
            "stake",
            "coefficient",
            "potential_payout",
            "status",
            "placed_at",
            "settled_at",
        ],
    );
    for bet in &bets {
        row(
            &mut out,
            &[
                &bet.bet_id.to_string(),
                &bet.event_id,
                bet.outcome.as_str(),
                &money(bet.stake),
                &money(bet.coefficient),
                &money(bet.potential_payout),
                bet.status.as_str(),
                &bet.placed_at.to_rfc3339(),
                &bet.settled_at.map(|t| t.to_rfc3339()).unwrap_or_default(),
            ],
        );
    }

    out.push_str("\nTRANSACTIONS\n");
    row(
        &mut out,
        &[
            "transaction_id",
            "type",
            "amount",
            "status",
            "resulting_total_balance",
            "reference_id",
            "created_at",
        ],
    );
    for tx in transactions {
        row(
            &mut out,
            &[
                &tx.transaction_id.to_string(),
                tx.kind.as_str(),
                &money(tx.amount),
                tx.status.as_str(),
                &money(tx.resulting_total_balance),
                tx.reference_id.as_deref().unwrap_or(""),
                &tx.created_at.to_rfc3339(),
            ],
        );
    }

    out.push_str("\nSTATISTICS\n");
    row(&mut out, &["total_bets", &stats.total_bets.to_string()]);
    row(&mut out, &["won", &stats.won.to_string()]);
    row(&mut out, &["lost", &stats.lost.to_string()]);
    row(&mut out, &["open", &stats.open.to_string()]);
    row(&mut out, &["cancelled", &stats.cancelled.to_string()]);
    row(&mut out, &["total_staked", &money(stats.total_staked)]);
    row(&mut out, &["total_returned", &money(stats.total_returned)]);
    row(&mut out, &["net_profit", &money(stats.net_profit)]);
    row(&mut out, &["win_rate", &money(stats.win_rate)]);
    out
}

fn money(value: Decimal) -> String {
    format!("{:.2}", value)
}

fn row(out: &mut String, fields: &[&str]) {
    let line: Vec<String> = fields.iter().map(|f| escape(f)).collect();
    let _ = writeln!(out, "{}", line.join(","));
}

/// Quote a CSV field when it holds a delimiter, quote or line break.
fn escape(field: &str) -> String {
    if field.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
