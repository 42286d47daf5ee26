//! Anchor-based send protocol.
//!
//! Small audiences get one direct transport call. Larger ones first send to a
//! single recipient to obtain a message id (the anchor), then deliver the rest
//! in planned batches that all carry that id, so the transport attributes every
//! batch to one logical message.

use std::sync::Arc;

use serde::Serialize;
use tokio::time::Instant;

use crate::{
    batcher::AdaptiveBatcher,
    config::Config,
    domain::{MessageAnchor, OutboundMessage, RecipientAddress, SessionId},
    errors::Error,
    learning::{LearningStore, SessionLearningRecord},
    ports::{SendOptions, Transport},
    Result,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    Direct,
    Anchored,
}

/// Lifecycle of one broadcast.
///
/// `Resolving -> Planning -> [Anchoring ->] Batching -> Completed`, with any
/// failure ending in `Aborted`. `Planning` picks the strategy; the batch plan
/// itself is only computed once an anchor exists.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BroadcastPhase {
    Resolving,
    Planning,
    Anchoring,
    Batching,
    Completed,
    Aborted,
}

/// Phase tracker for a single broadcast.
#[derive(Debug)]
pub struct BroadcastRun {
    session: SessionId,
    phase: BroadcastPhase,
}

impl BroadcastRun {
    pub fn new(session: SessionId) -> Self {
        Self {
            session,
            phase: BroadcastPhase::Resolving,
        }
    }

    pub fn session(&self) -> &SessionId {
        &self.session
    }

    pub fn phase(&self) -> BroadcastPhase {
        self.phase
    }

    pub fn advance(&mut self, next: BroadcastPhase) {
        tracing::debug!(session = %self.session, from = ?self.phase, to = ?next, "broadcast phase");
        self.phase = next;
    }

    /// Move to `Aborted` and hand the error back for propagation.
    pub fn abort(&mut self, err: Error) -> Error {
        tracing::warn!(session = %self.session, phase = ?self.phase, error = %err, "broadcast aborted");
        self.phase = BroadcastPhase::Aborted;
        err
    }
}

/// Outcome of one transport call.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DeliveryResult {
    pub batch_size: usize,
    pub duration_ms: u64,
    pub success: bool,
    pub error: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DeliveryReport {
    pub strategy: Strategy,
    pub anchor: Option<MessageAnchor>,
    pub total_recipients: usize,
    pub batch_count: usize,
    pub batch_sizes: Vec<usize>,
    pub batches: Vec<DeliveryResult>,
    pub total_duration_ms: u64,
    pub avg_batch_duration_ms: f64,
    /// Learning state after the last batch.
    pub learning: Option<SessionLearningRecord>,
}

impl DeliveryReport {
    fn new(
        strategy: Strategy,
        anchor: Option<MessageAnchor>,
        total_recipients: usize,
        batches: Vec<DeliveryResult>,
        started: Instant,
        learning: Option<SessionLearningRecord>,
    ) -> Self {
        let batch_sizes: Vec<usize> = batches.iter().map(|b| b.batch_size).collect();
        let avg_batch_duration_ms = if batches.is_empty() {
            0.0
        } else {
            batches.iter().map(|b| b.duration_ms as f64).sum::<f64>() / batches.len() as f64
        };
        Self {
            strategy,
            anchor,
            total_recipients,
            batch_count: batches.len(),
            batch_sizes,
            batches,
            total_duration_ms: millis(started.elapsed()),
            avg_batch_duration_ms,
            learning,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct BroadcastOptions {
    /// Transport channel to post to; defaults to the configured broadcast channel.
    pub channel: Option<RecipientAddress>,
}

/// Sends one broadcast over a session's transport.
pub struct AnchoredSender {
    batcher: AdaptiveBatcher,
    learning: Arc<LearningStore>,
    min_smart_send: usize,
    channel: RecipientAddress,
}

impl AnchoredSender {
    pub fn new(cfg: &Config, learning: Arc<LearningStore>) -> Self {
        Self {
            batcher: AdaptiveBatcher::from_config(cfg),
            learning,
            min_smart_send: cfg.min_smart_send,
            channel: cfg.broadcast_channel.clone(),
        }
    }

    /// Deliver `message` to `recipients`, strictly one transport call at a time.
    ///
    /// Any failure aborts the broadcast; retrying is left to the caller.
    pub async fn send(
        &self,
        transport: &dyn Transport,
        message: &OutboundMessage,
        recipients: &[RecipientAddress],
        opts: &BroadcastOptions,
        run: &mut BroadcastRun,
    ) -> Result<DeliveryReport> {
        let started = Instant::now();
        let session = run.session().clone();
        let channel = opts.channel.as_ref().unwrap_or(&self.channel);
        run.advance(BroadcastPhase::Planning);

        if recipients.is_empty() {
            tracing::info!(session = %session, "no recipients, nothing to send");
            run.advance(BroadcastPhase::Completed);
            return Ok(DeliveryReport::new(
                Strategy::Direct,
                None,
                0,
                Vec::new(),
                started,
                self.learning.get(&session).await,
            ));
        }

        if recipients.len() < self.min_smart_send {
            return self
                .send_direct(transport, channel, message, recipients, started, run)
                .await;
        }

        // Anchor: one recipient, no id yet. Without an id nothing else can be attributed.
        run.advance(BroadcastPhase::Anchoring);
        let anchor_started = Instant::now();
        let receipt = transport
            .send(
                channel,
                message,
                SendOptions {
                    recipients: vec![recipients[0].clone()],
                    anchor_id: None,
                },
            )
            .await
            .map_err(|e| run.abort(Error::FatalAnchor { reason: e.to_string() }))?;
        let Some(id) = receipt.id else {
            return Err(run.abort(Error::FatalAnchor {
                reason: "transport returned no message id".to_string(),
            }));
        };
        let anchor = MessageAnchor::new(id, receipt.timestamp);
        tracing::info!(
            session = %session,
            anchor = %anchor.id(),
            duration_ms = millis(anchor_started.elapsed()),
            recipients = recipients.len(),
            "anchor established"
        );

        run.advance(BroadcastPhase::Batching);
        let learned = self.learning.get(&session).await;
        let plan = self.batcher.plan(&recipients[1..], learned.as_ref());
        tracing::info!(
            session = %session,
            sizes = ?plan.sizes(),
            proven = learned.as_ref().map(|r| r.max_proven_batch_size),
            "batch plan ready"
        );

        let mut results = Vec::with_capacity(plan.len());
        let mut delivered = 1usize;
        let mut snapshot = learned;
        for (index, batch) in plan.into_batches().into_iter().enumerate() {
            let batch_size = batch.len();
            let batch_started = Instant::now();
            let sent = transport
                .send(
                    channel,
                    message,
                    SendOptions {
                        recipients: batch,
                        anchor_id: Some(anchor.id().clone()),
                    },
                )
                .await;
            let elapsed = batch_started.elapsed();

            if let Err(e) = sent {
                self.learning.record_failure(&session).await;
                return Err(run.abort(Error::BatchTransport {
                    batch_index: index,
                    batch_size,
                    delivered,
                    batches_completed: index,
                    anchor: Some(anchor.id().clone()),
                    reason: e.to_string(),
                }));
            }

            delivered += batch_size;
            let record = self
                .learning
                .record_success(&session, batch_size, elapsed)
                .await;
            tracing::info!(
                session = %session,
                batch = index,
                batch_size,
                duration_ms = millis(elapsed),
                delivered,
                "batch delivered"
            );
            if let Some(next) = self.batcher.skip_ahead_hint(batch_size, elapsed) {
                tracing::debug!(
                    session = %session,
                    batch_size,
                    suggested = next,
                    "fast batch, could skip ahead (advisory)"
                );
            }
            snapshot = Some(record);
            results.push(DeliveryResult {
                batch_size,
                duration_ms: millis(elapsed),
                success: true,
                error: None,
            });
        }

        run.advance(BroadcastPhase::Completed);
        let report = DeliveryReport::new(
            Strategy::Anchored,
            Some(anchor),
            recipients.len(),
            results,
            started,
            snapshot,
        );
        tracing::info!(
            session = %session,
            recipients = report.total_recipients,
            batches = report.batch_count,
            duration_ms = report.total_duration_ms,
            "broadcast completed"
        );
        Ok(report)
    }

    async fn send_direct(
        &self,
        transport: &dyn Transport,
        channel: &RecipientAddress,
        message: &OutboundMessage,
        recipients: &[RecipientAddress],
        started: Instant,
        run: &mut BroadcastRun,
    ) -> Result<DeliveryReport> {
        run.advance(BroadcastPhase::Batching);
        let session = run.session().clone();
        let sent = transport
            .send(
                channel,
                message,
                SendOptions {
                    recipients: recipients.to_vec(),
                    anchor_id: None,
                },
            )
            .await;

        if let Err(e) = sent {
            return Err(run.abort(Error::BatchTransport {
                batch_index: 0,
                batch_size: recipients.len(),
                delivered: 0,
                batches_completed: 0,
                anchor: None,
                reason: e.to_string(),
            }));
        }

        let elapsed = started.elapsed();
        tracing::info!(
            session = %session,
            recipients = recipients.len(),
            duration_ms = millis(elapsed),
            "direct send delivered"
        );
        run.advance(BroadcastPhase::Completed);
        Ok(DeliveryReport::new(
            Strategy::Direct,
            None,
            recipients.len(),
            vec![DeliveryResult {
                batch_size: recipients.len(),
                duration_ms: millis(elapsed),
                success: true,
                error: None,
            }],
            started,
            self.learning.get(&session).await,
        ))
    }
}

fn millis(d: std::time::Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
