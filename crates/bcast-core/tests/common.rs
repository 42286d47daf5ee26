#![allow(dead_code)]

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex,
};
use std::time::Duration;

use async_trait::async_trait;
use bcast_core::{
    config::Config,
    domain::{AccountContext, Contact, MessageId, OutboundMessage, RecipientAddress, SessionId},
    engine::BroadcastEngine,
    ports::{SendOptions, SendReceipt, Transport},
    store::InMemoryContactStore,
    Error, Result,
};
use chrono::Utc;

/// Transport fake that records calls and tracks overlapping sends.
#[derive(Default)]
pub struct FakeTransport {
    pub calls: Mutex<Vec<SendOptions>>,
    pub fail_calls: Mutex<Vec<usize>>,
    pub poisoned: Mutex<Vec<RecipientAddress>>,
    pub latency: Mutex<Duration>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl FakeTransport {
    pub fn with_latency(latency: Duration) -> Self {
        let t = Self::default();
        *t.latency.lock().unwrap() = latency;
        t
    }

    pub fn call_sizes(&self) -> Vec<usize> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|c| c.recipients.len())
            .collect()
    }

    pub fn fail_call(&self, index: usize) {
        self.fail_calls.lock().unwrap().push(index);
    }

    /// Refuse every call that includes `addr`.
    pub fn poison(&self, addr: RecipientAddress) {
        self.poisoned.lock().unwrap().push(addr);
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn send(
        &self,
        _channel: &RecipientAddress,
        _message: &OutboundMessage,
        opts: SendOptions,
    ) -> Result<SendReceipt> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let latency = *self.latency.lock().unwrap();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let index = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(opts.clone());
            calls.len() - 1
        };
        let poisoned = {
            let bad = self.poisoned.lock().unwrap();
            opts.recipients.iter().any(|r| bad.contains(r))
        };
        if poisoned || self.fail_calls.lock().unwrap().contains(&index) {
            return Err(Error::External(format!("call {index} refused")));
        }
        let id = opts
            .anchor_id
            .unwrap_or_else(|| MessageId(format!("WAMID-{index}")));
        Ok(SendReceipt {
            id: Some(id),
            timestamp: Utc::now(),
        })
    }

    async fn is_ready(&self) -> bool {
        true
    }
}

pub fn address(i: usize) -> RecipientAddress {
    RecipientAddress::new(format!("{}@s.whatsapp.net", 447_000_000 + i))
}

/// `n` named individual contacts for `session`.
pub async fn seed_contacts(store: &InMemoryContactStore, session: &SessionId, n: usize) {
    store
        .upsert_contacts(
            session,
            (0..n).map(|i| Contact::new(address(i)).with_display_name(format!("Contact {i}"))),
        )
        .await;
}

pub struct Harness {
    pub engine: BroadcastEngine,
    pub store: Arc<InMemoryContactStore>,
    pub transport: Arc<FakeTransport>,
    pub session: SessionId,
}

pub async fn harness(cfg: Config, transport: FakeTransport) -> Harness {
    let store = Arc::new(InMemoryContactStore::new());
    let engine = BroadcastEngine::new(Arc::new(cfg), store.clone());
    let transport = Arc::new(transport);
    let session = SessionId::new("acct-1");
    engine
        .register_session(
            AccountContext::new(session.clone()).with_own_address(address(999_999)),
            transport.clone(),
        )
        .await;
    Harness {
        engine,
        store,
        transport,
        session,
    }
}
