use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    domain::{Contact, MessageId, OutboundMessage, RecipientAddress, SessionId},
    Result,
};

/// Per-call options for [`Transport::send`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SendOptions {
    pub recipients: Vec<RecipientAddress>,
    /// Attribute this call to an existing message instead of creating a new one.
    pub anchor_id: Option<MessageId>,
}

/// What the transport reports back for one accepted call.
#[derive(Clone, Debug, PartialEq)]
pub struct SendReceipt {
    /// Absent when the transport accepted the call but assigned no id.
    pub id: Option<MessageId>,
    pub timestamp: DateTime<Utc>,
}

/// Outbound transport of one session.
///
/// Accepts a single outbound call at a time; callers serialize sends per
/// session. Oversized or malformed batches surface as errors.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(
        &self,
        channel: &RecipientAddress,
        message: &OutboundMessage,
        opts: SendOptions,
    ) -> Result<SendReceipt>;

    /// Whether the session is connected and able to send right now.
    async fn is_ready(&self) -> bool;
}

/// Read side of the contact/list store shared by all sessions.
#[async_trait]
pub trait ContactStore: Send + Sync {
    async fn contacts(&self, session: &SessionId) -> Result<Vec<Contact>>;

    /// Members of a named list, or `None` when no list has that name.
    async fn named_list(
        &self,
        session: &SessionId,
        name: &str,
    ) -> Result<Option<Vec<RecipientAddress>>>;

    /// Recipients appended to every broadcast of the session.
    async fn standing_recipients(&self, session: &SessionId) -> Result<Vec<RecipientAddress>>;
}
