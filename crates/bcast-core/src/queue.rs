//! Per-session retry queue.
//!
//! Items run strictly FIFO on a single drain task per session. The head item
//! stays in the queue while it is being sent and is only removed once it is
//! settled, so a later item never starts before the earlier one resolved or
//! was rejected.
//!
//! Item lifecycle: `Pending -> Sending -> {Done | Retrying -> Sending | Failed}`.

use std::{collections::VecDeque, sync::Arc, time::Duration};

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{oneshot, Mutex};
use tokio::time::sleep;

use crate::{
    broadcast::DeliveryReport, config::Config, domain::SessionId, errors::Error,
    ports::Transport, Result,
};

/// Unit of work the queue can retry.
#[async_trait]
pub trait QueueJob: Send + Sync {
    /// Short label for logs and snapshots.
    fn kind(&self) -> &'static str;

    async fn run(&self) -> Result<DeliveryReport>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemState {
    Pending,
    Sending,
    Retrying,
    Done,
    Failed,
}

/// Exponential backoff between attempts of one item.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base: Duration,
    pub cap: Duration,
}

impl RetryPolicy {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            base: cfg.backoff_base,
            cap: cfg.backoff_cap,
        }
    }

    /// `min(base * 2^retry_count, cap)`.
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let factor = 1u32.checked_shl(retry_count).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .map_or(self.cap, |d| d.min(self.cap))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(1000),
            cap: Duration::from_millis(10_000),
        }
    }
}

struct QueueItem {
    id: u64,
    kind: &'static str,
    job: Arc<dyn QueueJob>,
    retry_count: u32,
    max_retries: u32,
    state: ItemState,
    reply: Option<oneshot::Sender<Result<DeliveryReport>>>,
}

/// Read-only view of a queued item.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct QueuedItemView {
    pub id: u64,
    pub kind: &'static str,
    pub state: ItemState,
    pub retry_count: u32,
    pub max_retries: u32,
}

#[derive(Default)]
struct QueueState {
    items: VecDeque<QueueItem>,
    processing: bool,
    next_id: u64,
}

struct QueueInner {
    session: SessionId,
    transport: Arc<dyn Transport>,
    policy: RetryPolicy,
    state: Mutex<QueueState>,
}

/// Handle to the eventual result of an enqueued item.
#[derive(Debug)]
pub struct QueueTicket {
    id: u64,
    session: SessionId,
    rx: oneshot::Receiver<Result<DeliveryReport>>,
}

impl QueueTicket {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait until the item is delivered or rejected.
    pub async fn wait(self) -> Result<DeliveryReport> {
        let Self { session, rx, .. } = self;
        rx.await.map_err(|_| Error::QueueClosed(session))?
    }

    /// The result, if the item has already settled.
    pub fn try_result(&mut self) -> Option<Result<DeliveryReport>> {
        match self.rx.try_recv() {
            Ok(res) => Some(res),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => {
                Some(Err(Error::QueueClosed(self.session.clone())))
            }
        }
    }
}

#[derive(Clone)]
pub struct RetryQueue {
    inner: Arc<QueueInner>,
}

impl RetryQueue {
    pub fn new(session: SessionId, transport: Arc<dyn Transport>, policy: RetryPolicy) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                session,
                transport,
                policy,
                state: Mutex::new(QueueState::default()),
            }),
        }
    }

    pub fn session(&self) -> &SessionId {
        &self.inner.session
    }

    /// Append a job; starts the drain task unless one is already running.
    pub async fn enqueue(&self, job: Arc<dyn QueueJob>, max_retries: u32) -> QueueTicket {
        let (tx, rx) = oneshot::channel();
        let mut st = self.inner.state.lock().await;
        st.next_id += 1;
        let id = st.next_id;
        let kind = job.kind();
        st.items.push_back(QueueItem {
            id,
            kind,
            job,
            retry_count: 0,
            max_retries,
            state: ItemState::Pending,
            reply: Some(tx),
        });
        tracing::debug!(
            session = %self.inner.session,
            item = id,
            kind,
            depth = st.items.len(),
            "queued"
        );

        if !st.processing {
            st.processing = true;
            let queue = self.clone();
            tokio::spawn(async move { queue.drain().await });
        }

        QueueTicket {
            id,
            session: self.inner.session.clone(),
            rx,
        }
    }

    pub async fn len(&self) -> usize {
        self.inner.state.lock().await.items.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn is_processing(&self) -> bool {
        self.inner.state.lock().await.processing
    }

    pub async fn snapshot(&self) -> Vec<QueuedItemView> {
        let st = self.inner.state.lock().await;
        st.items
            .iter()
            .map(|item| QueuedItemView {
                id: item.id,
                kind: item.kind,
                state: item.state,
                retry_count: item.retry_count,
                max_retries: item.max_retries,
            })
            .collect()
    }

    async fn drain(self) {
        let session = &self.inner.session;
        loop {
            // Peek: the head stays queued until it settles.
            let (id, kind, job) = {
                let mut st = self.inner.state.lock().await;
                let Some(head) = st.items.front_mut() else {
                    st.processing = false;
                    return;
                };
                head.state = ItemState::Sending;
                (head.id, head.kind, head.job.clone())
            };

            if !self.inner.transport.is_ready().await {
                tracing::warn!(session = %session, item = id, kind, "session not connected, rejecting");
                self.settle(
                    ItemState::Failed,
                    Err(Error::SessionUnavailable(session.clone())),
                )
                .await;
                continue;
            }

            // Own task per attempt: a panicking adapter fails the attempt, not the drain loop.
            let err = match tokio::spawn(async move { job.run().await }).await {
                Ok(Ok(report)) => {
                    tracing::debug!(session = %session, item = id, kind, "delivered");
                    self.settle(ItemState::Done, Ok(report)).await;
                    continue;
                }
                Ok(Err(e)) => e,
                Err(join) => Error::External(format!("{kind} attempt panicked: {join}")),
            };

            // Ok: retry after a delay. Err: out of retries, with the attempt count.
            let next = {
                let mut st = self.inner.state.lock().await;
                let Some(head) = st.items.front_mut() else {
                    st.processing = false;
                    return;
                };
                head.retry_count += 1;
                if head.retry_count >= head.max_retries {
                    Err(head.retry_count)
                } else {
                    head.state = ItemState::Retrying;
                    Ok((head.retry_count, self.inner.policy.delay_for(head.retry_count)))
                }
            };

            match next {
                Ok((retry_count, delay)) => {
                    tracing::warn!(
                        session = %session,
                        item = id,
                        kind,
                        retry_count,
                        delay_ms = delay.as_millis() as u64,
                        retryable = err.is_retryable(),
                        error = %err,
                        "send failed, backing off"
                    );
                    sleep(delay).await;
                }
                Err(attempts) => {
                    tracing::error!(
                        session = %session,
                        item = id,
                        kind,
                        attempts,
                        error = %err,
                        "retries exhausted"
                    );
                    self.settle(
                        ItemState::Failed,
                        Err(Error::QueueExhausted {
                            attempts,
                            source: Box::new(err),
                        }),
                    )
                    .await;
                }
            }
        }
    }

    /// Pop the head item and deliver its result.
    async fn settle(&self, state: ItemState, result: Result<DeliveryReport>) {
        let item = {
            let mut st = self.inner.state.lock().await;
            st.items.pop_front()
        };
        let Some(mut item) = item else {
            return;
        };
        item.state = state;
        if let Some(reply) = item.reply.take() {
            // Receiver may have been dropped; the item is settled either way.
            let _ = reply.send(result);
        }
    }
}
