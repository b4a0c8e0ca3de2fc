//! HTTP event catalog.
//!
//! Reads event snapshots from the sports event service.
//!
//! Endpoint: `GET {base_url}/events/{event_id}`
//! A 404 means the event is unknown; any other non-success status is a
//! catalog error.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use reqwest::{Client, StatusCode};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::BTreeMap;
use tracing::{debug, warn};

use super::EventCatalog;
use crate::types::{EventSnapshot, EventStatus, Outcome, WalletError, WalletResult};

const CATALOG_NAME: &str = "http";

// ---------------------------------------------------------------------------
// API response types
// ---------------------------------------------------------------------------

/// Event ids arrive as numbers from some deployments and strings from others.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ApiId {
    Int(i64),
    Text(String),
}

impl ApiId {
    fn into_string(self) -> String {
        match self {
            ApiId::Int(n) => n.to_string(),
            ApiId::Text(s) => s,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ApiOdds {
    /// "1", "X", "2" or the HOME/DRAW/AWAY spellings.
    bet_type: String,
    coefficient: f64,
}

#[derive(Debug, Deserialize)]
struct ApiEvent {
    event_id: ApiId,
    #[serde(default)]
    home_team: String,
    #[serde(default)]
    away_team: String,
    /// "scheduled", "live", "finished", "cancelled", "postponed".
    status: String,
    event_datetime: String,
    #[serde(default)]
    home_score: Option<i64>,
    #[serde(default)]
    away_score: Option<i64>,
    #[serde(default)]
    odds: Vec<ApiOdds>,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct HttpCatalog {
    http: Client,
    base_url: String,
}

impl HttpCatalog {
    pub fn new(base_url: &str) -> Result<Self> {
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .user_agent("looseline-wallet/0.1.0")
            .build()
            .context("Failed to build HTTP client for event catalog")?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn fetch(&self, event_id: &str) -> Result<Option<ApiEvent>> {
        let url = format!("{}/events/{}", self.base_url, urlencoding::encode(event_id));
        debug!(url = %url, "Fetching event snapshot");

        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .context("Event catalog request failed")?;

        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("Event catalog error {status}: {body}");
        }

        let event: ApiEvent = resp
            .json()
            .await
            .context("Failed to parse event catalog response")?;
        Ok(Some(event))
    }

    /// Accepts RFC 3339 or a naive timestamp, which is taken as UTC.
    fn parse_datetime(raw: &str) -> Result<DateTime<Utc>> {
        if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
            return Ok(dt.with_timezone(&Utc));
        }
        let naive = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
            .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S"))
            .with_context(|| format!("Unrecognised event datetime: {raw}"))?;
        Ok(naive.and_utc())
    }

    fn to_snapshot(event: ApiEvent) -> Result<EventSnapshot> {
        let event_id = event.event_id.into_string();
        let start_time = Self::parse_datetime(&event.event_datetime)?;

        let mut odds = BTreeMap::new();
        for quote in &event.odds {
            let outcome: Outcome = match quote.bet_type.parse() {
                Ok(o) => o,
                Err(_) => {
                    debug!(event_id = %event_id, bet_type = %quote.bet_type, "Skipping non 1X2 market");
                    continue;
                }
            };
            let Some(coefficient) = Decimal::from_f64(quote.coefficient) else {
                warn!(event_id = %event_id, coefficient = quote.coefficient, "Unrepresentable coefficient");
                continue;
            };
            // Frozen as quoted; only payouts are rounded.
            odds.insert(outcome, coefficient);
        }

        let (status, outcome) = match event.status.to_lowercase().as_str() {
            "scheduled" | "upcoming" => (EventStatus::Scheduled, None),
            "live" | "in_progress" => (EventStatus::Live, None),
            "finished" | "completed" => {
                let outcome = match (event.home_score, event.away_score) {
                    (Some(h), Some(a)) if h > a => Some(Outcome::Home),
                    (Some(h), Some(a)) if h < a => Some(Outcome::Away),
                    (Some(_), Some(_)) => Some(Outcome::Draw),
                    _ => None,
                };
                (EventStatus::Finished, outcome)
            }
            "cancelled" | "canceled" | "postponed" | "voided" => (EventStatus::Voided, None),
            other => anyhow::bail!("Unknown event status: {other}"),
        };

        let name = match (event.home_team.is_empty(), event.away_team.is_empty()) {
            (false, false) => format!("{} vs {}", event.home_team, event.away_team),
            _ => String::new(),
        };

        Ok(EventSnapshot {
            event_id,
            name,
            odds,
            start_time,
            status,
            outcome,
        })
    }
}

#[async_trait]
impl EventCatalog for HttpCatalog {
    async fn snapshot(&self, event_id: &str) -> WalletResult<Option<EventSnapshot>> {
        let event = self
            .fetch(event_id)
            .await
            .map_err(|e| WalletError::Catalog(format!("{e:#}")))?;
        event
            .map(Self::to_snapshot)
            .transpose()
            .map_err(|e| WalletError::Catalog(format!("{e:#}")))
    }

    fn name(&self) -> &str {
        CATALOG_NAME
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Resolution;
    use rust_decimal_macros::dec;

    fn parse(json: &str) -> EventSnapshot {
        let event: ApiEvent = serde_json::from_str(json).unwrap();
        HttpCatalog::to_snapshot(event).unwrap()
    }

    #[test]
    fn test_scheduled_event() {
        let snap = parse(
            r#"{
                "event_id": 42,
                "home_team": "Spartak",
                "away_team": "CSKA",
                "status": "scheduled",
                "event_datetime": "2030-05-01T17:00:00",
                "odds": [
                    {"bet_type": "1", "coefficient": 2.5},
                    {"bet_type": "X", "coefficient": 3.2},
                    {"bet_type": "2", "coefficient": 2.375},
                    {"bet_type": "total_over_2.5", "coefficient": 1.9}
                ]
            }"#,
        );
        assert_eq!(snap.event_id, "42");
        assert_eq!(snap.name, "Spartak vs CSKA");
        assert_eq!(snap.status, EventStatus::Scheduled);
        assert_eq!(snap.odds.len(), 3);
        assert_eq!(snap.coefficient(Outcome::Home), Some(dec!(2.5)));
        // Three-decimal odds are kept exactly as quoted.
        assert_eq!(snap.coefficient(Outcome::Away), Some(dec!(2.375)));
        assert_eq!(snap.start_time.to_rfc3339(), "2030-05-01T17:00:00+00:00");
    }

    #[test]
    fn test_finished_event_outcome_from_score() {
        let snap = parse(
            r#"{
                "event_id": "e-7",
                "status": "finished",
                "event_datetime": "2024-03-01T18:00:00Z",
                "home_score": 1,
                "away_score": 3
            }"#,
        );
        assert_eq!(snap.resolution(), Some(Resolution::Finished(Outcome::Away)));

        let draw = parse(
            r#"{"event_id": 8, "status": "finished", "event_datetime": "2024-03-01 18:00:00",
                "home_score": 2, "away_score": 2}"#,
        );
        assert_eq!(draw.outcome, Some(Outcome::Draw));
    }

    #[test]
    fn test_cancelled_event_is_voided() {
        let snap = parse(
            r#"{"event_id": 9, "status": "postponed", "event_datetime": "2024-03-01T18:00:00Z"}"#,
        );
        assert_eq!(snap.status, EventStatus::Voided);
        assert_eq!(snap.resolution(), Some(Resolution::Voided));
    }

    #[test]
    fn test_unknown_status_rejected() {
        let event: ApiEvent = serde_json::from_str(
            r#"{"event_id": 9, "status": "abandoned?", "event_datetime": "2024-03-01T18:00:00Z"}"#,
        )
        .unwrap();
        assert!(HttpCatalog::to_snapshot(event).is_err());
    }

    #[test]
    fn test_base_url_trimmed() {
        let catalog = HttpCatalog::new("http://localhost:8000/").unwrap();
        assert_eq!(catalog.base_url, "http://localhost:8000");
        assert_eq!(catalog.name(), "http");
    }
}
