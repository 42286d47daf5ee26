use std::{
    collections::HashSet,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use bcast_core::{
    domain::{MessageId, OutboundMessage, RecipientAddress},
    ports::{SendOptions, SendReceipt, Transport},
    Error, Result,
};
use chrono::Utc;

/// In-process transport: latency grows with batch size, oversized batches
/// and blocked recipients are refused.
pub struct SimulatedTransport {
    base_latency: Duration,
    per_recipient: Duration,
    max_batch: usize,
    blocked: HashSet<RecipientAddress>,
    next_id: AtomicU64,
}

impl SimulatedTransport {
    pub fn new(max_batch: usize) -> Self {
        Self {
            base_latency: Duration::from_millis(40),
            per_recipient: Duration::from_micros(200),
            max_batch,
            blocked: HashSet::new(),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn block(mut self, addr: RecipientAddress) -> Self {
        self.blocked.insert(addr);
        self
    }
}

#[async_trait]
impl Transport for SimulatedTransport {
    async fn send(
        &self,
        channel: &RecipientAddress,
        _message: &OutboundMessage,
        opts: SendOptions,
    ) -> Result<SendReceipt> {
        let n = opts.recipients.len();
        let latency = self.base_latency + self.per_recipient * n as u32;
        tokio::time::sleep(latency).await;

        if n > self.max_batch {
            return Err(Error::External(format!(
                "batch of {n} exceeds transport limit {}",
                self.max_batch
            )));
        }
        if let Some(bad) = opts.recipients.iter().find(|r| self.blocked.contains(*r)) {
            return Err(Error::External(format!("recipient {bad} refused")));
        }

        let id = opts.anchor_id.unwrap_or_else(|| {
            MessageId(format!(
                "SIM{:08X}",
                self.next_id.fetch_add(1, Ordering::Relaxed)
            ))
        });
        tracing::debug!(%channel, recipients = n, id = %id, latency_ms = latency.as_millis() as u64, "simulated send");
        Ok(SendReceipt {
            id: Some(id),
            timestamp: Utc::now(),
        })
    }

    async fn is_ready(&self) -> bool {
        true
    }
}
