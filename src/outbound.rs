//! Bot-side outbound-message processor (spec §4.I).
//!
//! Every 2s, if the transport is connected, requests the next batch of
//! unsent messages over `messages.outbound.get`, attempts transmission via a
//! `ConnectionAdapter`, and reports the outcome — success publishes
//! `messages.outbound.mark_sent`; failures are the caller's classification
//! (spec §7) communicated back as an `OutboundFailure`, which this module
//! turns into the right database-side bookkeeping call.

use crate::ancillary::{publish_mark_failed, publish_mark_sent};
use crate::bus::BusClient;
use crate::error::{DbError, DbResult};
use crate::normalize::{ConnectionAdapter, ConnectionError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

const POLL_INTERVAL: Duration = Duration::from_secs(2);
const FETCH_TIMEOUT: Duration = Duration::from_secs(2);
const DEFAULT_LIMIT: i64 = 20;
const DEFAULT_MAX_RETRIES: i64 = 3;

#[derive(Debug, Clone)]
pub struct OutboundRow {
    pub id: i64,
    pub message: String,
}

/// Permanent vs. transient is the transmitter's call (spec §7) — the
/// database is only ever told the resulting state.
#[derive(Debug, Clone)]
pub enum OutboundFailure {
    /// Permission denied, muted, flood control — never re-offered.
    Permanent(String),
    /// Network hiccup, rate limit — left alone for backoff-gated retry.
    Transient(String),
}

impl OutboundFailure {
    /// Classify a raw `ConnectionError` as permanent or transient. Adapters
    /// that need finer-grained classification (permission denied vs. flood
    /// control, say) should return the distinction some other way; this is
    /// the default the processor falls back to for the generic error shape
    /// the `ConnectionAdapter` trait exposes.
    fn classify(err: &ConnectionError) -> Self {
        match err {
            ConnectionError::NotConnected => OutboundFailure::Transient(err.to_string()),
            ConnectionError::SendFailed(_) => OutboundFailure::Transient(err.to_string()),
            ConnectionError::ConnectFailed(_) => OutboundFailure::Transient(err.to_string()),
        }
    }

    pub fn message(&self) -> &str {
        match self {
            OutboundFailure::Permanent(m) | OutboundFailure::Transient(m) => m,
        }
    }
}

/// One polling pass: fetch a batch, transmit each, report outcomes. Returns
/// the number of rows processed.
pub async fn poll_once(
    bus: &BusClient,
    adapter: &impl ConnectionAdapter,
    limit: i64,
    max_retries: i64,
) -> DbResult<usize> {
    if !adapter.is_connected() {
        return Ok(0);
    }

    let response = bus
        .request(
            "rosey.db.messages.outbound.get",
            serde_json::json!({ "limit": limit, "max_retries": max_retries }),
            FETCH_TIMEOUT,
        )
        .await?;

    if response.get("success").and_then(|v| v.as_bool()) != Some(true) {
        return Err(DbError::Database("messages.outbound.get returned an error".to_string()));
    }

    let rows: Vec<OutboundRow> = response
        .get("messages")
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|row| {
                    let id = row.get("id")?.as_i64()?;
                    let message = row.get("message")?.as_str()?.to_string();
                    Some(OutboundRow { id, message })
                })
                .collect()
        })
        .unwrap_or_default();

    let count = rows.len();
    for row in rows {
        match adapter.send_message(&row.message).await {
            Ok(()) => {
                publish_mark_sent(bus, row.id).await?;
            }
            Err(e) => {
                let failure = OutboundFailure::classify(&e);
                match &failure {
                    OutboundFailure::Permanent(msg) => {
                        tracing::warn!(id = row.id, error = %msg, "outbound transmission permanently failed");
                        publish_mark_failed(bus, row.id, msg, true).await?;
                    }
                    OutboundFailure::Transient(msg) => {
                        tracing::debug!(id = row.id, error = %msg, "outbound transmission transiently failed, will retry");
                        publish_mark_failed(bus, row.id, msg, false).await?;
                    }
                }
            }
        }
    }
    Ok(count)
}

/// Spawn the 2s polling loop. `shutdown` is observed at every suspension
/// point, per spec §5's background-task cooperation contract.
pub fn spawn_processor(
    bus: Arc<BusClient>,
    adapter: Arc<dyn ConnectionAdapter>,
    shutdown: Arc<AtomicBool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(POLL_INTERVAL).await;
            if shutdown.load(Ordering::Relaxed) {
                break;
            }
            if let Err(e) = poll_once(&bus, adapter.as_ref(), DEFAULT_LIMIT, DEFAULT_MAX_RETRIES).await {
                tracing::error!(error = %e, "outbound processor pass failed");
            }
        }
        tracing::info!("outbound processor shut down");
    })
}
