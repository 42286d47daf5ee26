//! In-memory contact/list store.
//!
//! Shared by all sessions. Contact-sync events upsert with last-writer-wins
//! semantics; readers get a point-in-time copy.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::{
    domain::{Contact, RecipientAddress, SessionId},
    ports::ContactStore,
    Result,
};

#[derive(Debug, Default)]
struct AddressBook {
    contacts: Vec<Contact>,
    lists: HashMap<String, Vec<RecipientAddress>>,
    standing: Vec<RecipientAddress>,
}

#[derive(Debug, Default)]
pub struct InMemoryContactStore {
    books: RwLock<HashMap<SessionId, AddressBook>>,
}

impl InMemoryContactStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a contact, keeping its original position.
    pub async fn upsert_contact(&self, session: &SessionId, contact: Contact) {
        let mut books = self.books.write().await;
        let book = books.entry(session.clone()).or_default();
        match book
            .contacts
            .iter_mut()
            .find(|c| c.address == contact.address)
        {
            Some(existing) => *existing = contact,
            None => book.contacts.push(contact),
        }
    }

    pub async fn upsert_contacts(
        &self,
        session: &SessionId,
        contacts: impl IntoIterator<Item = Contact>,
    ) {
        for contact in contacts {
            self.upsert_contact(session, contact).await;
        }
    }

    pub async fn remove_contact(&self, session: &SessionId, address: &RecipientAddress) -> bool {
        let mut books = self.books.write().await;
        let Some(book) = books.get_mut(session) else {
            return false;
        };
        let before = book.contacts.len();
        book.contacts.retain(|c| &c.address != address);
        before != book.contacts.len()
    }

    pub async fn set_named_list(
        &self,
        session: &SessionId,
        name: impl Into<String>,
        members: Vec<RecipientAddress>,
    ) {
        let mut books = self.books.write().await;
        books
            .entry(session.clone())
            .or_default()
            .lists
            .insert(name.into(), members);
    }

    pub async fn remove_named_list(&self, session: &SessionId, name: &str) -> bool {
        let mut books = self.books.write().await;
        books
            .get_mut(session)
            .is_some_and(|b| b.lists.remove(name).is_some())
    }

    pub async fn set_standing_recipients(
        &self,
        session: &SessionId,
        recipients: Vec<RecipientAddress>,
    ) {
        let mut books = self.books.write().await;
        books.entry(session.clone()).or_default().standing = recipients;
    }
}

#[async_trait]
impl ContactStore for InMemoryContactStore {
    async fn contacts(&self, session: &SessionId) -> Result<Vec<Contact>> {
        let books = self.books.read().await;
        Ok(books
            .get(session)
            .map(|b| b.contacts.clone())
            .unwrap_or_default())
    }

    async fn named_list(
        &self,
        session: &SessionId,
        name: &str,
    ) -> Result<Option<Vec<RecipientAddress>>> {
        let books = self.books.read().await;
        Ok(books.get(session).and_then(|b| b.lists.get(name).cloned()))
    }

    async fn standing_recipients(&self, session: &SessionId) -> Result<Vec<RecipientAddress>> {
        let books = self.books.read().await;
        Ok(books
            .get(session)
            .map(|b| b.standing.clone())
            .unwrap_or_default())
    }
}
