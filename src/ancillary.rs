//! Bot-side ancillary state writers (spec §4.H): thin fire-and-forget
//! publish helpers over `BusClient::publish`, one per pub/sub subject in
//! spec §6's pub/sub table. No platform polling loop produces their inputs
//! in this crate (out of scope per spec §1) — the helpers and their wire
//! contracts are the deliverable.

use crate::bus::BusClient;
use crate::error::DbResult;

pub async fn publish_user_joined(bus: &BusClient, username: &str) -> DbResult<()> {
    bus.publish("rosey.db.user.joined", serde_json::json!({ "username": username })).await
}

pub async fn publish_user_left(bus: &BusClient, username: &str) -> DbResult<()> {
    bus.publish("rosey.db.user.left", serde_json::json!({ "username": username })).await
}

pub async fn publish_message_log(bus: &BusClient, username: &str, message: &str) -> DbResult<()> {
    bus.publish(
        "rosey.db.message.log",
        serde_json::json!({ "username": username, "message": message }),
    )
    .await
}

pub async fn publish_user_count(bus: &BusClient, chat_count: i64, connected_count: i64) -> DbResult<()> {
    bus.publish(
        "rosey.db.stats.user_count",
        serde_json::json!({ "chat_count": chat_count, "connected_count": connected_count }),
    )
    .await
}

pub async fn publish_high_water(bus: &BusClient, chat_count: i64, connected_count: Option<i64>) -> DbResult<()> {
    bus.publish(
        "rosey.db.stats.high_water",
        serde_json::json!({ "chat_count": chat_count, "connected_count": connected_count }),
    )
    .await
}

/// Only the allowed fields (`stats::ALLOWED_STATUS_FIELDS` on the receiving
/// side) survive; this helper doesn't filter client-side — the database
/// service is the single source of truth for what's allowed.
pub async fn publish_status_update(bus: &BusClient, status_data: serde_json::Value) -> DbResult<()> {
    bus.publish(
        "rosey.db.status.update",
        serde_json::json!({ "status_data": status_data }),
    )
    .await
}

pub async fn publish_mark_sent(bus: &BusClient, message_id: i64) -> DbResult<()> {
    bus.publish(
        "rosey.db.messages.outbound.mark_sent",
        serde_json::json!({ "message_id": message_id }),
    )
    .await
}

/// Reports an `OutboundFailure` classification back to the database service
/// so it can apply spec §3's outbound-message state transition — `permanent`
/// sets the terminal `sent_flag`, otherwise `retry_count` is incremented for
/// backoff-gated retry. The classification itself stays the transmitter's
/// call (spec §7); this only carries the verdict across the bus, since the
/// bot process has no direct database access (spec §5).
pub async fn publish_mark_failed(bus: &BusClient, message_id: i64, error: &str, permanent: bool) -> DbResult<()> {
    bus.publish(
        "rosey.db.messages.outbound.mark_failed",
        serde_json::json!({ "message_id": message_id, "error": error, "permanent": permanent }),
    )
    .await
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PmCommandResult {
    Pending,
    Success,
    Error,
}

impl PmCommandResult {
    fn as_str(&self) -> &'static str {
        match self {
            PmCommandResult::Pending => "pending",
            PmCommandResult::Success => "success",
            PmCommandResult::Error => "error",
        }
    }
}

pub async fn publish_pm_command(
    bus: &BusClient,
    timestamp: i64,
    username: &str,
    command: &str,
    args: &str,
    result: PmCommandResult,
    error: Option<&str>,
) -> DbResult<()> {
    bus.publish(
        "rosey.db.action.pm_command",
        serde_json::json!({
            "timestamp": timestamp,
            "username": username,
            "command": command,
            "args": args,
            "result": result.as_str(),
            "error": error,
        }),
    )
    .await
}
