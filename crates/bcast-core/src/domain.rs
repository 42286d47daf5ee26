use std::{fmt, sync::OnceLock};

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{errors::Error, Result};

/// Sending session (one connected account with its own transport handle).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What kind of destination an address points at, derived from its domain.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddressKind {
    Individual,
    Group,
    BroadcastList,
    Channel,
}

/// Fully-qualified destination address (`<id>@<domain>`).
///
/// Equality is exact-string, so construct through [`RecipientAddress::normalize`]
/// when the input may be a bare identifier.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecipientAddress(String);

impl RecipientAddress {
    /// Wrap an already-qualified address without validation.
    pub fn new(addr: impl Into<String>) -> Self {
        Self(addr.into())
    }

    /// Normalize user input into an address.
    ///
    /// Qualified input (anything containing `@`) passes through trimmed. Bare
    /// identifiers lose phone-style separators, must then be all digits, and get
    /// `@{default_domain}` appended.
    pub fn normalize(raw: &str, default_domain: &str) -> Result<Self> {
        let trimmed = raw.trim();
        if trimmed.contains('@') {
            return Ok(Self(trimmed.to_string()));
        }

        static SEPARATORS: OnceLock<Regex> = OnceLock::new();
        let re = SEPARATORS.get_or_init(|| Regex::new(r"[+\s\-().]").expect("valid regex"));
        let digits = re.replace_all(trimmed, "");
        if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
            return Err(Error::InvalidAddress(raw.to_string()));
        }

        Ok(Self(format!("{digits}@{default_domain}")))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn kind(&self) -> AddressKind {
        match self.0.rsplit_once('@').map(|(_, domain)| domain) {
            Some("g.us") => AddressKind::Group,
            Some("broadcast") => AddressKind::BroadcastList,
            Some("newsletter") => AddressKind::Channel,
            _ => AddressKind::Individual,
        }
    }
}

impl fmt::Display for RecipientAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Transport-assigned message id.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub String);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Shared identity of one broadcast, taken from the first send and replayed
/// on every later batch.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageAnchor {
    id: MessageId,
    created_at: DateTime<Utc>,
}

impl MessageAnchor {
    pub fn new(id: MessageId, created_at: DateTime<Utc>) -> Self {
        Self { id, created_at }
    }

    pub fn id(&self) -> &MessageId {
        &self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

/// Protocol-agnostic message body handed to the transport as-is.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub content: serde_json::Value,
}

impl OutboundMessage {
    pub fn new(content: serde_json::Value) -> Self {
        Self { content }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: serde_json::json!({ "text": text.into() }),
        }
    }
}

/// A known contact as reported by the contact store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub address: RecipientAddress,
    /// Name set by the account owner.
    pub display_name: Option<String>,
    /// Name assigned by contact sync (push name / verified name).
    pub sync_label: Option<String>,
}

impl Contact {
    pub fn new(address: RecipientAddress) -> Self {
        Self {
            address,
            display_name: None,
            sync_label: None,
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    pub fn with_sync_label(mut self, label: impl Into<String>) -> Self {
        self.sync_label = Some(label.into());
        self
    }

    pub fn is_named(&self) -> bool {
        let present = |v: &Option<String>| v.as_deref().is_some_and(|s| !s.trim().is_empty());
        present(&self.display_name) || present(&self.sync_label)
    }
}

/// Who is sending: the session plus the account's own address, if known.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AccountContext {
    pub session_id: SessionId,
    pub own_address: Option<RecipientAddress>,
}

impl AccountContext {
    pub fn new(session_id: SessionId) -> Self {
        Self {
            session_id,
            own_address: None,
        }
    }

    pub fn with_own_address(mut self, addr: RecipientAddress) -> Self {
        self.own_address = Some(addr);
        self
    }
}
