//! HTTP call-record sink.
//!
//! One JSON POST per completed call, at-least-once. The `Idempotency-Key`
//! header carries the call uuid so the receiving side can dedupe replays.
//! Tickets (from rejected transfers and error paths) go to the same
//! endpoint with a `kind` discriminator.

use super::CallRecord;
use crate::error::RecordError;
use serde::Serialize;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

const FLUSH_RETRIES: u32 = 3;
const RETRY_BASE: Duration = Duration::from_millis(500);

/// A follow-up ticket created when a transfer was rejected or the call
/// aborted.
#[derive(Debug, Clone, Serialize)]
pub struct Ticket {
    pub kind: &'static str,
    pub call_uuid: Uuid,
    pub tenant_id: String,
    pub caller_id: String,
    pub reason: String,
    pub summary: String,
}

impl Ticket {
    pub fn new(call_uuid: Uuid, tenant_id: &str, caller_id: &str, reason: &str, summary: &str) -> Self {
        Self {
            kind: "ticket",
            call_uuid,
            tenant_id: tenant_id.to_string(),
            caller_id: caller_id.to_string(),
            reason: reason.to_string(),
            summary: summary.to_string(),
        }
    }
}

pub struct RecordSink {
    client: reqwest::Client,
    url: String,
}

impl RecordSink {
    pub fn new(url: &str) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
            url: url.to_string(),
        }
    }

    /// POST the record, retrying transient failures with backoff. The
    /// idempotency key makes replays safe.
    pub async fn flush(&self, record: &CallRecord) -> Result<(), RecordError> {
        self.post_with_retries(record, record.call_uuid).await?;
        info!(
            "call {}: record flushed to sink",
            crate::bus::short_id(&record.call_uuid)
        );
        Ok(())
    }

    pub async fn create_ticket(&self, ticket: &Ticket) -> Result<(), RecordError> {
        // Ticket idempotency key is derived from the call so a retried
        // rejection path can't open duplicates.
        self.post_with_retries(ticket, ticket.call_uuid).await?;
        info!(
            "call {}: ticket created ({})",
            crate::bus::short_id(&ticket.call_uuid),
            ticket.reason
        );
        Ok(())
    }

    async fn post_with_retries<T: Serialize>(
        &self,
        body: &T,
        idempotency_key: Uuid,
    ) -> Result<(), RecordError> {
        let mut last: Option<RecordError> = None;
        for attempt in 0..FLUSH_RETRIES {
            if attempt > 0 {
                tokio::time::sleep(RETRY_BASE * 2u32.pow(attempt - 1)).await;
            }
            let result = self
                .client
                .post(&self.url)
                .header("Idempotency-Key", idempotency_key.to_string())
                .json(body)
                .send()
                .await;

            match result {
                Ok(response) if response.status().is_success() => return Ok(()),
                Ok(response) => {
                    let status = response.status().as_u16();
                    let body = response.text().await.unwrap_or_default();
                    // 4xx won't improve on retry.
                    if (400..500).contains(&status) {
                        return Err(RecordError::Rejected { status, body });
                    }
                    warn!("record sink returned {status}, attempt {}", attempt + 1);
                    last = Some(RecordError::Rejected { status, body });
                }
                Err(e) => {
                    warn!("record sink unreachable, attempt {}: {e}", attempt + 1);
                    last = Some(RecordError::Http(e));
                }
            }
        }
        Err(last.unwrap_or(RecordError::AlreadyFlushed))
    }
}
