//! Test doubles shared by the unit tests.

use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::Utc;

use crate::{
    domain::{MessageId, OutboundMessage, RecipientAddress},
    errors::Error,
    ports::{SendOptions, SendReceipt, Transport},
    Result,
};

/// Transport that records every call and fails on demand.
#[derive(Default)]
pub(crate) struct RecordingTransport {
    calls: Mutex<Vec<SendOptions>>,
    channels: Mutex<Vec<RecipientAddress>>,
    not_ready: AtomicBool,
    omit_id: AtomicBool,
    fail_next: AtomicUsize,
    fail_at: Mutex<HashSet<usize>>,
    poisoned: Mutex<HashSet<RecipientAddress>>,
    latency: Mutex<Duration>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl RecordingTransport {
    pub(crate) fn calls(&self) -> Vec<SendOptions> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn channels(&self) -> Vec<RecipientAddress> {
        self.channels.lock().unwrap().clone()
    }

    pub(crate) fn call_sizes(&self) -> Vec<usize> {
        self.calls().iter().map(|c| c.recipients.len()).collect()
    }

    pub(crate) fn set_ready(&self, ready: bool) {
        self.not_ready.store(!ready, Ordering::SeqCst);
    }

    pub(crate) fn omit_ids(&self) {
        self.omit_id.store(true, Ordering::SeqCst);
    }

    /// Fail the next `n` calls.
    pub(crate) fn fail_next(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Fail the call with this zero-based index.
    pub(crate) fn fail_call(&self, index: usize) {
        self.fail_at.lock().unwrap().insert(index);
    }

    /// Fail any call whose recipients include `addr`.
    pub(crate) fn poison(&self, addr: RecipientAddress) {
        self.poisoned.lock().unwrap().insert(addr);
    }

    pub(crate) fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap() = latency;
    }

    pub(crate) fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn send(
        &self,
        channel: &RecipientAddress,
        _message: &OutboundMessage,
        opts: SendOptions,
    ) -> Result<SendReceipt> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let latency = *self.latency.lock().unwrap();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let index = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(opts.clone());
            self.channels.lock().unwrap().push(channel.clone());
            calls.len() - 1
        };
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let scripted = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        let poisoned = {
            let bad = self.poisoned.lock().unwrap();
            opts.recipients.iter().any(|r| bad.contains(r))
        };
        if scripted || poisoned || self.fail_at.lock().unwrap().contains(&index) {
            return Err(Error::External(format!("send #{index} rejected")));
        }

        let id = if self.omit_id.load(Ordering::SeqCst) {
            None
        } else {
            Some(
                opts.anchor_id
                    .clone()
                    .unwrap_or_else(|| MessageId(format!("MSG{index}"))),
            )
        };
        Ok(SendReceipt {
            id,
            timestamp: Utc::now(),
        })
    }

    async fn is_ready(&self) -> bool {
        !self.not_ready.load(Ordering::SeqCst)
    }
}

pub(crate) fn addrs(n: usize) -> Vec<RecipientAddress> {
    (0..n)
        .map(|i| RecipientAddress::new(format!("{}@s.whatsapp.net", 1000 + i)))
        .collect()
}
