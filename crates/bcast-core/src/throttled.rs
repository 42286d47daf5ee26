use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};

use crate::{
    domain::{OutboundMessage, RecipientAddress},
    ports::{SendOptions, SendReceipt, Transport},
    Result,
};

/// Hands out send slots at least `spacing` apart.
#[derive(Debug)]
struct SlotPacer {
    spacing: Duration,
    free_at: Option<Instant>,
}

impl SlotPacer {
    fn new(spacing: Duration) -> Self {
        Self {
            spacing,
            free_at: None,
        }
    }

    /// Claim the earliest free slot; returns how long to wait for it.
    fn claim(&mut self) -> Duration {
        let now = Instant::now();
        let slot = self.free_at.map_or(now, |t| t.max(now));
        self.free_at = Some(slot + self.spacing);
        slot - now
    }
}

/// Transport decorator that spaces outbound calls at least `interval` apart.
///
/// Readiness checks pass straight through.
pub struct ThrottledTransport {
    inner: Arc<dyn Transport>,
    pacer: Mutex<SlotPacer>,
}

impl ThrottledTransport {
    pub fn new(inner: Arc<dyn Transport>, interval: Duration) -> Self {
        Self {
            inner,
            pacer: Mutex::new(SlotPacer::new(interval)),
        }
    }

    async fn throttle(&self) {
        let wait = self.pacer.lock().await.claim();
        if !wait.is_zero() {
            tracing::trace!(wait_ms = wait.as_millis() as u64, "waiting for send slot");
            sleep(wait).await;
        }
    }
}

#[async_trait]
impl Transport for ThrottledTransport {
    async fn send(
        &self,
        channel: &RecipientAddress,
        message: &OutboundMessage,
        opts: SendOptions,
    ) -> Result<SendReceipt> {
        self.throttle().await;
        self.inner.send(channel, message, opts).await
    }

    async fn is_ready(&self) -> bool {
        self.inner.is_ready().await
    }
}
