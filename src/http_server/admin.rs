//! Operator routes for the dead-letter list.

use super::error::IngressError;
use super::AppState;
use crate::coordination::with_timeout;
use crate::types::{DeadLetterEntry, EventStatus};
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap};
use axum::Json;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use tracing::{info, warn};

const DEFAULT_LIMIT: usize = 50;
const MAX_LIMIT: usize = 1_000;

#[derive(Debug, Default, Deserialize)]
pub struct LimitQuery {
    limit: Option<usize>,
}

impl LimitQuery {
    fn limit(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT)
    }
}

#[derive(Debug, Serialize)]
pub struct DeadLetterList {
    pub total: usize,
    pub entries: Vec<DeadLetterEntry>,
}

#[derive(Debug, Serialize)]
pub struct ReplayResponse {
    pub replayed: usize,
    pub remaining: usize,
}

fn authorize(state: &AppState, headers: &HeaderMap) -> Result<(), IngressError> {
    let expected = state.admin_token().ok_or(IngressError::NotFound)?;
    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim);

    match presented {
        Some(token) if tokens_match(token, expected) => Ok(()),
        _ => {
            warn!("admin request with missing or invalid token");
            Err(IngressError::Unauthorized)
        }
    }
}

/// Constant-time, so response timing says nothing about how much of a guess
/// was right.
fn tokens_match(presented: &str, expected: &str) -> bool {
    presented.as_bytes().ct_eq(expected.as_bytes()).into()
}

pub async fn list_dead_letters(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<LimitQuery>,
) -> Result<Json<DeadLetterList>, IngressError> {
    authorize(&state, &headers)?;
    let (store, keys, timeout) = (state.store(), state.keys(), state.config().store_timeout);
    let list = keys.dead_letter();

    let total = with_timeout(timeout, store.len(&list)).await?;
    let raw = with_timeout(timeout, store.range(&list, query.limit())).await?;
    let entries = raw
        .iter()
        .filter_map(|r| match serde_json::from_str::<DeadLetterEntry>(r) {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!(error = %e, "skipping undecodable dead-letter entry");
                None
            }
        })
        .collect();

    Ok(Json(DeadLetterList { total, entries }))
}

/// Move up to `limit` dead letters, oldest first, back onto the work queue
/// with a fresh retry budget.
///
/// Each entry moves in one store step that also checks it is still at the
/// head. A failed or timed-out step leaves the entry in exactly one of the
/// two lists, so retrying the request neither loses nor duplicates it.
pub async fn replay_dead_letters(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<LimitQuery>,
) -> Result<Json<ReplayResponse>, IngressError> {
    authorize(&state, &headers)?;
    let (store, keys, timeout) = (state.store(), state.keys(), state.config().store_timeout);
    let (dead_letter, queue, poison) = (keys.dead_letter(), keys.queue(), keys.poison());

    let mut replayed = 0;
    while replayed < query.limit() {
        let Some(raw) = with_timeout(timeout, store.range(&dead_letter, 1))
            .await?
            .into_iter()
            .next()
        else {
            break;
        };

        let decoded = serde_json::from_str::<DeadLetterEntry>(&raw)
            .map_err(|e| e.to_string())
            .and_then(|entry| {
                let mut event = entry.event;
                event.retry_count = 0;
                event.status = EventStatus::Queued;
                event.to_json().map(|json| (event, json)).map_err(|e| e.to_string())
            });

        match decoded {
            Ok((event, json)) => {
                let moved =
                    with_timeout(timeout, store.replace_head(&dead_letter, &raw, &queue, &json))
                        .await?;
                if moved {
                    info!(event_id = %event.event_id, module = %event.module, "dead letter replayed");
                    replayed += 1;
                }
            }
            Err(e) => {
                warn!(error = %e, "undecodable dead-letter entry; quarantining");
                with_timeout(timeout, store.replace_head(&dead_letter, &raw, &poison, &raw)).await?;
            }
        }
    }

    let remaining = with_timeout(timeout, store.len(&dead_letter)).await?;
    Ok(Json(ReplayResponse {
        replayed,
        remaining,
    }))
}
