//! Thin wrapper over the NATS pub/sub + request/reply broker (spec §4.A).
//!
//! Wraps `async_nats::Client`: `connect` configures bounded reconnect
//! backoff and a connection timeout and hands back a client that queues
//! publishes transparently across a brief disconnect (async-nats' own
//! behavior); `publish`/`subscribe`/`request`/`respond` are direct, thin
//! pass-throughs so callers see the spec's four verbs and nothing else.

use crate::error::{DbError, DbResult};
use futures::StreamExt;
use std::time::Duration;

/// Capped exponential backoff: `delay = min(initial * 2^(attempt-1), 60s)`
/// (spec §4.B). `attempt` is 1-based, matching async-nats' callback contract.
fn reconnect_backoff(initial: Duration, attempt: usize) -> Duration {
    let max = Duration::from_secs(60);
    let factor = 1u32.checked_shl(attempt.saturating_sub(1) as u32).unwrap_or(u32::MAX);
    initial.saturating_mul(factor).min(max)
}

#[derive(Clone)]
pub struct BusClient {
    inner: async_nats::Client,
}

impl BusClient {
    /// Connect with bounded reconnect attempts/delay and a connect timeout.
    /// Reconnection after a successful initial connect is transparent to
    /// callers — async-nats queues publishes and resubscribes automatically.
    pub async fn connect(
        servers: &str,
        max_reconnect_attempts: usize,
        reconnect_delay: Duration,
        connect_timeout: Duration,
    ) -> DbResult<Self> {
        let options = async_nats::ConnectOptions::new()
            .max_reconnects(Some(max_reconnect_attempts))
            .reconnect_delay_callback(move |attempt| reconnect_backoff(reconnect_delay, attempt))
            .connection_timeout(connect_timeout)
            .event_callback(|event| async move {
                match event {
                    async_nats::Event::Disconnected => tracing::warn!("nats disconnected"),
                    async_nats::Event::Connected => tracing::info!("nats (re)connected"),
                    async_nats::Event::ClientError(e) => tracing::error!(error = %e, "nats client error"),
                    other => tracing::debug!(?other, "nats event"),
                }
            });

        let inner = tokio::time::timeout(connect_timeout, options.connect(servers))
            .await
            .map_err(|_| DbError::Timeout)?
            .map_err(|e| DbError::Database(format!("nats connect failed: {e}")))?;

        Ok(Self { inner })
    }

    /// Fire-and-forget publish. At-least-once; no delivery confirmation.
    pub async fn publish(&self, subject: impl Into<String>, payload: serde_json::Value) -> DbResult<()> {
        let bytes = serde_json::to_vec(&payload)?;
        self.inner
            .publish(subject.into(), bytes.into())
            .await
            .map_err(|e| DbError::Database(format!("publish failed: {e}")))
    }

    /// Subscribe to a subject (or single-token-wildcard pattern like
    /// `rosey.db.row.*.insert`) and spawn a task invoking `handler` once per
    /// message. Pub/sub deliveries on one subject to this subscriber are
    /// serialized by async-nats; handlers across subjects run concurrently.
    pub async fn subscribe<F, Fut>(&self, subject_pattern: impl Into<String>, handler: F) -> DbResult<()>
    where
        F: Fn(BusMessage) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let subject_pattern = subject_pattern.into();
        let mut sub = self
            .inner
            .subscribe(subject_pattern.clone())
            .await
            .map_err(|e| DbError::Database(format!("subscribe to {subject_pattern} failed: {e}")))?;

        let client = self.inner.clone();
        tokio::spawn(async move {
            while let Some(msg) = sub.next().await {
                let reply = msg.reply.clone();
                let bus_msg = BusMessage {
                    subject: msg.subject.to_string(),
                    payload: msg.payload.to_vec(),
                    reply,
                    client: client.clone(),
                };
                tokio::spawn(handler(bus_msg));
            }
        });
        Ok(())
    }

    /// Request/reply: write a private inbox subject, await the first
    /// response within `timeout`. No implicit retries — the caller decides.
    pub async fn request(
        &self,
        subject: impl Into<String>,
        payload: serde_json::Value,
        timeout: Duration,
    ) -> DbResult<serde_json::Value> {
        let bytes = serde_json::to_vec(&payload)?;
        let fut = self.inner.request(subject.into(), bytes.into());
        let msg = tokio::time::timeout(timeout, fut)
            .await
            .map_err(|_| DbError::Timeout)?
            .map_err(|e| DbError::Database(format!("request failed: {e}")))?;
        serde_json::from_slice(&msg.payload).map_err(DbError::from)
    }

    /// Flush any outstanding publishes before the process exits.
    pub async fn close(&self) {
        if let Err(e) = self.inner.flush().await {
            tracing::warn!(error = %e, "nats flush on shutdown failed");
        }
    }
}

/// An inbound message handed to a subscription callback: the raw subject
/// (for wildcard plugin-name extraction), the raw payload, and — for
/// request/reply — the reply subject to `respond` to.
pub struct BusMessage {
    pub subject: String,
    pub payload: Vec<u8>,
    reply: Option<async_nats::Subject>,
    client: async_nats::Client,
}

impl BusMessage {
    pub fn json(&self) -> DbResult<serde_json::Value> {
        serde_json::from_slice(&self.payload).map_err(|e| DbError::InvalidJson(e.to_string()))
    }

    /// Respond exactly once, publishing to the message's private reply
    /// subject. A no-op (logged) if the message carried no reply subject —
    /// i.e. it arrived via plain pub/sub, not request/reply.
    pub async fn respond(&self, payload: serde_json::Value) {
        let Some(reply) = self.reply.clone() else {
            tracing::warn!(subject = %self.subject, "respond() called on a pub/sub message with no reply subject");
            return;
        };
        let bytes = match serde_json::to_vec(&payload) {
            Ok(b) => b,
            Err(e) => {
                tracing::error!(error = %e, "failed to serialize response");
                return;
            }
        };
        if let Err(e) = self.client.publish(reply, bytes.into()).await {
            tracing::error!(error = %e, "failed to publish response");
        }
    }
}
