//! API route handlers.
//!
//! Wallet and bet endpoints act for the user named in the `x-user-id`
//! header, which the identity gateway sets after authenticating the
//! caller. Payment and settlement endpoints are called by the payment
//! provider and the event catalog respectively.

use axum::{
    async_trait,
    extract::{FromRequestParts, Path, Query, State},
    http::{header, request::Parts, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::warn;

use crate::engine::funding::{ConfirmOutcome, DepositConfirmation, FundingGateway, PayoutResult};
use crate::engine::history::{self, BetFilter, BettingStats, HistoryFilter, HistoryPage, Page};
use crate::engine::{BetPlacement, Ledger};
use crate::types::{
    Bet, BetId, BetStatus, EventId, Outcome, SettlementTrigger, Transaction, TransactionKind,
    TransactionStatus, UserId, WalletError,
};

pub const USER_HEADER: &str = "x-user-id";
pub const IDEMPOTENCY_HEADER: &str = "idempotency-key";

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

pub struct ApiState {
    pub ledger: Arc<Ledger>,
    pub placement: Arc<BetPlacement>,
    pub funding: Arc<FundingGateway>,
    pub triggers: mpsc::Sender<SettlementTrigger>,
    pub currency: String,
}

pub type AppState = Arc<ApiState>;

// ---------------------------------------------------------------------------
// Identity and errors
// ---------------------------------------------------------------------------

/// User id handed over by the identity gateway.
#[derive(Debug, Clone)]
pub struct VerifiedUser(pub UserId);

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for VerifiedUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(USER_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(|v| VerifiedUser(v.to_string()))
            .ok_or(ApiError::Unauthorized)
    }
}

#[derive(Debug)]
pub enum ApiError {
    Unauthorized,
    BadRequest(String),
    Unavailable(String),
    Wallet(WalletError),
}

impl From<WalletError> for ApiError {
    fn from(e: WalletError) -> Self {
        ApiError::Wallet(e)
    }
}

/// HTTP status and stable error code for a domain error.
pub fn classify(e: &WalletError) -> (StatusCode, &'static str) {
    match e {
        WalletError::InvalidAmount(_) => (StatusCode::UNPROCESSABLE_ENTITY, "invalid_amount"),
        WalletError::InvalidStake(_) => (StatusCode::UNPROCESSABLE_ENTITY, "invalid_stake"),
        WalletError::InvalidOutcome { .. } => (StatusCode::UNPROCESSABLE_ENTITY, "invalid_outcome"),
        WalletError::InsufficientFunds { .. } => {
            (StatusCode::UNPROCESSABLE_ENTITY, "insufficient_funds")
        }
        WalletError::LimitExceeded(_) => (StatusCode::UNPROCESSABLE_ENTITY, "limit_exceeded"),
        WalletError::EventNotFound(_) => (StatusCode::NOT_FOUND, "event_not_found"),
        WalletError::BetNotFound(_) => (StatusCode::NOT_FOUND, "bet_not_found"),
        WalletError::UnknownReference(_) => (StatusCode::NOT_FOUND, "unknown_reference"),
        WalletError::EventNotOpen { .. } => (StatusCode::CONFLICT, "event_not_open"),
        WalletError::EventStartedOrFinished(_) => (StatusCode::CONFLICT, "event_started"),
        WalletError::BetNotCancellable(_) => (StatusCode::CONFLICT, "bet_not_cancellable"),
        WalletError::AlreadySettled(_) => (StatusCode::CONFLICT, "already_settled"),
        WalletError::DuplicateOperation(_) => (StatusCode::CONFLICT, "duplicate_operation"),
        WalletError::ReferenceConflict(_) => (StatusCode::CONFLICT, "reference_conflict"),
        WalletError::Busy(_) => (StatusCode::SERVICE_UNAVAILABLE, "busy"),
        WalletError::Storage(_) => (StatusCode::INTERNAL_SERVER_ERROR, "storage"),
        WalletError::Catalog(_) => (StatusCode::BAD_GATEWAY, "event_catalog"),
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            ApiError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                "unauthorized",
                format!("missing {USER_HEADER} header"),
            ),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg),
            ApiError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, "unavailable", msg),
            ApiError::Wallet(e) => {
                let (status, code) = classify(&e);
                if status.is_server_error() {
                    warn!(code, error = %e, "Request failed");
                }
                (status, code, e.to_string())
            }
        };

        let body = Json(json!({ "error": code, "message": message }));
        if status == StatusCode::SERVICE_UNAVAILABLE {
            return (status, [(header::RETRY_AFTER, "1")], body).into_response();
        }
        (status, body).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct BalanceResponse {
    pub user_id: UserId,
    pub currency: String,
    pub total_balance: Decimal,
    pub available_balance: Decimal,
    pub locked_balance: Decimal,
}

/// Query string for transaction history and statements.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HistoryQuery {
    #[serde(default, rename = "type")]
    pub kind: Option<TransactionKind>,
    #[serde(default)]
    pub status: Option<TransactionStatus>,
    #[serde(default)]
    pub from: Option<DateTime<Utc>>,
    #[serde(default)]
    pub to: Option<DateTime<Utc>>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: Option<usize>,
}

impl HistoryQuery {
    fn filter(&self) -> HistoryFilter {
        HistoryFilter {
            kind: self.kind,
            status: self.status,
            from: self.from,
            to: self.to,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BetsQuery {
    #[serde(default)]
    pub status: Option<BetStatus>,
    #[serde(default)]
    pub event_id: Option<EventId>,
    #[serde(default)]
    pub from: Option<DateTime<Utc>>,
    #[serde(default)]
    pub to: Option<DateTime<Utc>>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: Option<usize>,
}

fn page(limit: Option<usize>, offset: Option<usize>) -> Page {
    Page::new(limit.unwrap_or(Page::DEFAULT_LIMIT), offset.unwrap_or(0))
}

#[derive(Debug, Clone, Deserialize)]
pub struct WithdrawalRequest {
    pub amount: Decimal,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlaceBetRequest {
    pub event_id: EventId,
    /// `HOME`/`DRAW`/`AWAY` or `1`/`X`/`2`.
    pub outcome: String,
    pub stake: Decimal,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PayoutRequest {
    pub result: PayoutResult,
}

// ---------------------------------------------------------------------------
// Route handlers
// ---------------------------------------------------------------------------

/// GET /health
pub async fn health() -> StatusCode {
    StatusCode::OK
}

/// GET /api/wallet/balance
pub async fn get_balance(
    State(state): State<AppState>,
    VerifiedUser(user_id): VerifiedUser,
) -> Json<BalanceResponse> {
    let account = state.ledger.get_balance(&user_id).await;
    Json(BalanceResponse {
        user_id: account.user_id,
        currency: state.currency.clone(),
        total_balance: account.total_balance,
        available_balance: account.available_balance,
        locked_balance: account.locked_balance,
    })
}

/// GET /api/wallet/history
pub async fn get_history(
    State(state): State<AppState>,
    VerifiedUser(user_id): VerifiedUser,
    Query(query): Query<HistoryQuery>,
) -> Json<HistoryPage<Transaction>> {
    let page = page(query.limit, query.offset);
    Json(state.ledger.get_history(&user_id, &query.filter(), page).await)
}

/// GET /api/wallet/statement
pub async fn get_statement(
    State(state): State<AppState>,
    VerifiedUser(user_id): VerifiedUser,
    Query(query): Query<HistoryQuery>,
) -> impl IntoResponse {
    let csv =
        history::export_statement(&state.ledger, &user_id, &query.filter(), &state.currency).await;
    (
        [
            (header::CONTENT_TYPE, "text/csv; charset=utf-8"),
            (
                header::CONTENT_DISPOSITION,
                "attachment; filename=\"statement.csv\"",
            ),
        ],
        csv,
    )
}

/// POST /api/wallet/withdrawals
///
/// The `Idempotency-Key` header becomes the withdrawal's reference id.
pub async fn request_withdrawal(
    State(state): State<AppState>,
    VerifiedUser(user_id): VerifiedUser,
    headers: HeaderMap,
    Json(req): Json<WithdrawalRequest>,
) -> ApiResult<(StatusCode, Json<Transaction>)> {
    let reference_id = headers
        .get(IDEMPOTENCY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ApiError::BadRequest(format!("missing {IDEMPOTENCY_HEADER} header")))?;
    let tx = state
        .funding
        .request_withdrawal(&user_id, req.amount, reference_id)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(tx)))
}

/// GET /api/bets
pub async fn list_bets(
    State(state): State<AppState>,
    VerifiedUser(user_id): VerifiedUser,
    Query(query): Query<BetsQuery>,
) -> Json<HistoryPage<Bet>> {
    let filter = BetFilter {
        status: query.status,
        event_id: query.event_id.clone(),
        from: query.from,
        to: query.to,
    };
    let page = page(query.limit, query.offset);
    Json(history::bet_history(&state.ledger, &user_id, &filter, page).await)
}

/// GET /api/bets/stats
pub async fn bet_stats(
    State(state): State<AppState>,
    VerifiedUser(user_id): VerifiedUser,
) -> Json<BettingStats> {
    Json(history::betting_stats(&state.ledger, &user_id).await)
}

/// POST /api/bets
pub async fn place_bet(
    State(state): State<AppState>,
    VerifiedUser(user_id): VerifiedUser,
    Json(req): Json<PlaceBetRequest>,
) -> ApiResult<(StatusCode, Json<Bet>)> {
    let outcome: Outcome = req
        .outcome
        .parse()
        .map_err(|e: anyhow::Error| ApiError::BadRequest(e.to_string()))?;
    let bet = state
        .placement
        .place_bet(&user_id, &req.event_id, outcome, req.stake)
        .await?;
    Ok((StatusCode::CREATED, Json(bet)))
}

/// POST /api/bets/:bet_id/cancel
pub async fn cancel_bet(
    State(state): State<AppState>,
    VerifiedUser(user_id): VerifiedUser,
    Path(bet_id): Path<BetId>,
) -> ApiResult<Json<Bet>> {
    Ok(Json(state.placement.cancel_bet(&user_id, bet_id).await?))
}

/// POST /api/payments/deposits
pub async fn confirm_deposit(
    State(state): State<AppState>,
    Json(confirmation): Json<DepositConfirmation>,
) -> ApiResult<Json<Transaction>> {
    Ok(Json(state.funding.confirm_deposit(&confirmation).await?))
}

/// POST /api/payments/withdrawals/:reference_id
pub async fn confirm_withdrawal(
    State(state): State<AppState>,
    Path(reference_id): Path<String>,
    Json(req): Json<PayoutRequest>,
) -> ApiResult<Json<ConfirmOutcome>> {
    Ok(Json(
        state
            .funding
            .confirm_withdrawal(&reference_id, req.result)
            .await?,
    ))
}

/// POST /api/settlements
pub async fn enqueue_settlement(
    State(state): State<AppState>,
    Json(trigger): Json<SettlementTrigger>,
) -> ApiResult<StatusCode> {
    state
        .triggers
        .send(trigger)
        .await
        .map_err(|_| ApiError::Unavailable("settlement queue closed".to_string()))?;
    Ok(StatusCode::ACCEPTED)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
