//! Session registry and broadcast entry points.
//!
//! Each registered session owns a lane: its transport, a retry queue and a
//! send gate. Every transport-touching operation of a session (direct
//! broadcasts, queued broadcasts, fault isolation) runs under the lane's gate,
//! so the transport never sees two calls of the same session at once.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::{
    audience::{AudienceSpec, RecipientResolver},
    broadcast::{AnchoredSender, BroadcastOptions, BroadcastRun, DeliveryReport},
    config::Config,
    domain::{AccountContext, MessageId, OutboundMessage, RecipientAddress, SessionId},
    errors::Error,
    isolation::{BatchAttempt, FaultIsolator, IsolationReport},
    learning::LearningStore,
    ports::{ContactStore, SendOptions, Transport},
    queue::{QueueJob, QueueTicket, QueuedItemView, RetryPolicy, RetryQueue},
    throttled::ThrottledTransport,
    Result,
};

struct SessionLane {
    context: AccountContext,
    transport: Arc<dyn Transport>,
    queue: RetryQueue,
    gate: Arc<Mutex<()>>,
}

struct EngineInner {
    cfg: Arc<Config>,
    learning: Arc<LearningStore>,
    resolver: RecipientResolver,
    sender: AnchoredSender,
    isolator: FaultIsolator,
    retry: RetryPolicy,
    sessions: Mutex<HashMap<SessionId, Arc<SessionLane>>>,
    /// Outlives lanes: a replaced lane may still be draining its queue.
    gates: Mutex<HashMap<SessionId, Arc<Mutex<()>>>>,
}

#[derive(Clone)]
pub struct BroadcastEngine {
    inner: Arc<EngineInner>,
}

impl BroadcastEngine {
    pub fn new(cfg: Arc<Config>, contacts: Arc<dyn ContactStore>) -> Self {
        let learning = Arc::new(LearningStore::new(cfg.learning_ttl, cfg.latency_smoothing));
        Self::with_learning(cfg, contacts, learning)
    }

    /// Share a learning store, e.g. one restored from a snapshot.
    pub fn with_learning(
        cfg: Arc<Config>,
        contacts: Arc<dyn ContactStore>,
        learning: Arc<LearningStore>,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                resolver: RecipientResolver::from_config(&cfg, contacts),
                sender: AnchoredSender::new(&cfg, learning.clone()),
                isolator: FaultIsolator::from_config(&cfg),
                retry: RetryPolicy::from_config(&cfg),
                learning,
                cfg,
                sessions: Mutex::new(HashMap::new()),
                gates: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.inner.cfg
    }

    pub fn learning(&self) -> &Arc<LearningStore> {
        &self.inner.learning
    }

    /// Register (or replace) a session and its transport.
    ///
    /// A replacement lane shares the send gate of the one it replaces, so
    /// items still draining on the old queue never overlap new sends.
    pub async fn register_session(&self, context: AccountContext, transport: Arc<dyn Transport>) {
        let session = context.session_id.clone();
        let interval = self.inner.cfg.send_interval;
        let transport: Arc<dyn Transport> = if interval.is_zero() {
            transport
        } else {
            Arc::new(ThrottledTransport::new(transport, interval))
        };
        let gate = self
            .inner
            .gates
            .lock()
            .await
            .entry(session.clone())
            .or_default()
            .clone();
        let lane = Arc::new(SessionLane {
            queue: RetryQueue::new(session.clone(), transport.clone(), self.inner.retry),
            context,
            transport,
            gate,
        });

        let mut sessions = self.inner.sessions.lock().await;
        if sessions.insert(session.clone(), lane).is_some() {
            tracing::warn!(session = %session, "session re-registered, previous lane replaced");
        } else {
            tracing::info!(session = %session, "session registered");
        }
    }

    /// Drop a session. Items already queued on it still drain.
    pub async fn unregister_session(&self, session: &SessionId) -> bool {
        let removed = self.inner.sessions.lock().await.remove(session).is_some();
        if removed {
            tracing::info!(session = %session, "session unregistered");
        }
        removed
    }

    pub async fn sessions(&self) -> Vec<SessionId> {
        let mut ids: Vec<_> = self.inner.sessions.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn broadcast(
        &self,
        message: &OutboundMessage,
        audience: &AudienceSpec,
        session: &SessionId,
    ) -> Result<DeliveryReport> {
        self.broadcast_with(message, audience, session, &BroadcastOptions::default())
            .await
    }

    /// Resolve the audience and deliver immediately, without retries.
    pub async fn broadcast_with(
        &self,
        message: &OutboundMessage,
        audience: &AudienceSpec,
        session: &SessionId,
        opts: &BroadcastOptions,
    ) -> Result<DeliveryReport> {
        let lane = self.lane(session).await?;
        self.run_on(&lane, message, audience, opts).await
    }

    /// Queue a broadcast on the session's retry queue.
    ///
    /// The audience is resolved on every attempt, so contact changes made
    /// between retries are picked up.
    pub async fn enqueue_broadcast(
        &self,
        message: OutboundMessage,
        audience: AudienceSpec,
        session: &SessionId,
        max_retries: u32,
    ) -> Result<QueueTicket> {
        let lane = self.lane(session).await?;
        let job = Arc::new(BroadcastJob {
            engine: self.clone(),
            lane: lane.clone(),
            message,
            audience,
        });
        Ok(lane.queue.enqueue(job, max_retries).await)
    }

    /// Same as [`Self::enqueue_broadcast`] with the configured retry limit.
    pub async fn enqueue_broadcast_default(
        &self,
        message: OutboundMessage,
        audience: AudienceSpec,
        session: &SessionId,
    ) -> Result<QueueTicket> {
        let retries = self.inner.cfg.queue_max_retries;
        self.enqueue_broadcast(message, audience, session, retries)
            .await
    }

    pub async fn queue_snapshot(&self, session: &SessionId) -> Result<Vec<QueuedItemView>> {
        Ok(self.lane(session).await?.queue.snapshot().await)
    }

    /// Re-send `message` to `recipients` and narrow failures down to single
    /// addresses by bisection.
    ///
    /// The whole set is tried once first; `attempts` in the report includes
    /// that call. With an anchor every attempt is attributed to it.
    pub async fn isolate_failures(
        &self,
        session: &SessionId,
        message: &OutboundMessage,
        recipients: &[RecipientAddress],
        anchor: Option<MessageId>,
    ) -> Result<IsolationReport> {
        let lane = self.lane(session).await?;
        if recipients.is_empty() {
            return Ok(IsolationReport::default());
        }

        let _gate = lane.gate.lock().await;
        if !lane.transport.is_ready().await {
            return Err(Error::SessionUnavailable(session.clone()));
        }
        let attempt = TransportAttempt {
            transport: lane.transport.as_ref(),
            channel: &self.inner.cfg.broadcast_channel,
            message,
            anchor,
        };

        if attempt.attempt(recipients).await.is_ok() {
            return Ok(IsolationReport {
                succeeded: recipients.to_vec(),
                attempts: 1,
                ..IsolationReport::default()
            });
        }
        tracing::info!(session = %session, recipients = recipients.len(), "batch failed, isolating");

        let delay = self.inner.cfg.isolation_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let mut report = self.inner.isolator.isolate(recipients, &attempt).await;
        report.attempts += 1;
        Ok(report)
    }

    async fn lane(&self, session: &SessionId) -> Result<Arc<SessionLane>> {
        self.inner
            .sessions
            .lock()
            .await
            .get(session)
            .cloned()
            .ok_or_else(|| Error::UnknownSession(session.clone()))
    }

    async fn run_on(
        &self,
        lane: &SessionLane,
        message: &OutboundMessage,
        audience: &AudienceSpec,
        opts: &BroadcastOptions,
    ) -> Result<DeliveryReport> {
        let session = &lane.context.session_id;
        let mut run = BroadcastRun::new(session.clone());
        let recipients = self
            .inner
            .resolver
            .resolve(audience, &lane.context)
            .await
            .map_err(|e| run.abort(e))?;

        let _gate = lane.gate.lock().await;
        self.inner
            .sender
            .send(lane.transport.as_ref(), message, &recipients, opts, &mut run)
            .await
    }
}

struct BroadcastJob {
    engine: BroadcastEngine,
    lane: Arc<SessionLane>,
    message: OutboundMessage,
    audience: AudienceSpec,
}

#[async_trait]
impl QueueJob for BroadcastJob {
    fn kind(&self) -> &'static str {
        "broadcast"
    }

    async fn run(&self) -> Result<DeliveryReport> {
        self.engine
            .run_on(
                &self.lane,
                &self.message,
                &self.audience,
                &BroadcastOptions::default(),
            )
            .await
    }
}

struct TransportAttempt<'a> {
    transport: &'a dyn Transport,
    channel: &'a RecipientAddress,
    message: &'a OutboundMessage,
    anchor: Option<MessageId>,
}

#[async_trait]
impl<'a> BatchAttempt for TransportAttempt<'a> {
    async fn attempt(&self, batch: &[RecipientAddress]) -> Result<()> {
        self.transport
            .send(
                self.channel,
                self.message,
                SendOptions {
                    recipients: batch.to_vec(),
                    anchor_id: self.anchor.clone(),
                },
            )
            .await
            .map(|_| ())
    }
}
