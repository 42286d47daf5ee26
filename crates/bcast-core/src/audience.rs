//! Recipient resolution.
//!
//! Turns an audience description into a deduplicated, ordered address list.
//! Branches, first match wins: named list, all known contacts (also when no
//! audience is given), explicit empty list, explicit list. Standing recipients
//! are appended and the sender's own address prepended afterwards.

use std::{collections::HashSet, sync::Arc};

use crate::{
    config::{Config, MissingListPolicy},
    domain::{AccountContext, AddressKind, RecipientAddress},
    errors::Error,
    ports::ContactStore,
    Result,
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Audience {
    /// Raw entries; bare identifiers are normalized against the default domain.
    ExplicitList(Vec<String>),
    AllKnown,
    NamedList(String),
    EmptyExplicit,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AudienceSpec {
    /// `None` behaves like [`Audience::AllKnown`].
    pub audience: Option<Audience>,
    pub include_self: bool,
    pub include_standing: bool,
}

impl AudienceSpec {
    pub fn all_known() -> Self {
        Self::of(Audience::AllKnown)
    }

    pub fn explicit<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::of(Audience::ExplicitList(
            entries.into_iter().map(Into::into).collect(),
        ))
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self::of(Audience::NamedList(name.into()))
    }

    pub fn nobody() -> Self {
        Self::of(Audience::EmptyExplicit)
    }

    pub fn of(audience: Audience) -> Self {
        Self {
            audience: Some(audience),
            ..Self::default()
        }
    }

    pub fn with_self(mut self) -> Self {
        self.include_self = true;
        self
    }

    pub fn with_standing(mut self) -> Self {
        self.include_standing = true;
        self
    }
}

pub struct RecipientResolver {
    contacts: Arc<dyn ContactStore>,
    default_domain: String,
    missing_list: MissingListPolicy,
}

impl RecipientResolver {
    pub fn new(
        contacts: Arc<dyn ContactStore>,
        default_domain: impl Into<String>,
        missing_list: MissingListPolicy,
    ) -> Self {
        Self {
            contacts,
            default_domain: default_domain.into(),
            missing_list,
        }
    }

    pub fn from_config(cfg: &Config, contacts: Arc<dyn ContactStore>) -> Self {
        Self::new(contacts, cfg.default_domain.clone(), cfg.missing_list)
    }

    pub async fn resolve(
        &self,
        spec: &AudienceSpec,
        ctx: &AccountContext,
    ) -> Result<Vec<RecipientAddress>> {
        let session = &ctx.session_id;
        let mut out = match &spec.audience {
            Some(Audience::NamedList(name)) => {
                match self.contacts.named_list(session, name).await? {
                    Some(members) => dedup(members),
                    None => match self.missing_list {
                        MissingListPolicy::Reject => {
                            return Err(Error::NamedListNotFound(name.clone()))
                        }
                        MissingListPolicy::FallThrough => {
                            tracing::warn!(
                                session = %session,
                                list = %name,
                                "named list not found, falling back to all known contacts"
                            );
                            self.all_known(ctx).await?
                        }
                    },
                }
            }
            None | Some(Audience::AllKnown) => self.all_known(ctx).await?,
            Some(Audience::EmptyExplicit) => Vec::new(),
            Some(Audience::ExplicitList(entries)) => {
                let mut normalized = Vec::with_capacity(entries.len());
                for entry in entries.iter().filter(|e| !e.trim().is_empty()) {
                    normalized.push(RecipientAddress::normalize(entry, &self.default_domain)?);
                }
                dedup(normalized)
            }
        };

        if spec.include_standing {
            let standing = self.contacts.standing_recipients(session).await?;
            let mut seen: HashSet<_> = out.iter().cloned().collect();
            out.extend(standing.into_iter().filter(|a| seen.insert(a.clone())));
        }

        if spec.include_self {
            match &ctx.own_address {
                Some(own) => {
                    out.retain(|a| a != own);
                    out.insert(0, own.clone());
                }
                None => {
                    tracing::warn!(session = %session, "include_self requested but own address is unknown");
                }
            }
        }

        tracing::debug!(session = %session, recipients = out.len(), "audience resolved");
        Ok(out)
    }

    /// Named, individually addressable contacts of the account.
    async fn all_known(&self, ctx: &AccountContext) -> Result<Vec<RecipientAddress>> {
        let contacts = self.contacts.contacts(&ctx.session_id).await?;
        Ok(dedup(
            contacts
                .into_iter()
                .filter(|c| c.address.kind() == AddressKind::Individual && c.is_named())
                .map(|c| c.address),
        ))
    }
}

fn dedup(addrs: impl IntoIterator<Item = RecipientAddress>) -> Vec<RecipientAddress> {
    let mut seen = HashSet::new();
    addrs
        .into_iter()
        .filter(|a| seen.insert(a.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Contact, SessionId};
    use crate::store::InMemoryContactStore;

    const DOMAIN: &str = "s.whatsapp.net";

    fn addr(s: &str) -> RecipientAddress {
        RecipientAddress::new(s)
    }

    fn ctx() -> AccountContext {
        AccountContext::new(SessionId::new("s1")).with_own_address(addr("999@s.whatsapp.net"))
    }

    async fn seeded() -> Arc<InMemoryContactStore> {
        let store = Arc::new(InMemoryContactStore::new());
        let s = SessionId::new("s1");
        store
            .upsert_contacts(
                &s,
                [
                    Contact::new(addr("1@s.whatsapp.net")).with_display_name("Ann"),
                    Contact::new(addr("2@s.whatsapp.net")),
                    Contact::new(addr("3@s.whatsapp.net")).with_sync_label("Cy"),
                    Contact::new(addr("123-456@g.us")).with_display_name("Family"),
                    Contact::new(addr("status@broadcast")).with_display_name("Status"),
                    Contact::new(addr("777@newsletter")).with_display_name("News"),
                ],
            )
            .await;
        store
            .set_named_list(
                &s,
                "vip",
                vec![addr("3@s.whatsapp.net"), addr("1@s.whatsapp.net"), addr("3@s.whatsapp.net")],
            )
            .await;
        store
            .set_standing_recipients(&s, vec![addr("1@s.whatsapp.net"), addr("50@s.whatsapp.net")])
            .await;
        store
    }

    fn resolver(store: Arc<InMemoryContactStore>, policy: MissingListPolicy) -> RecipientResolver {
        RecipientResolver::new(store, DOMAIN, policy)
    }

    #[tokio::test]
    async fn all_known_keeps_named_individuals_only() {
        let r = resolver(seeded().await, MissingListPolicy::Reject);
        let out = r.resolve(&AudienceSpec::all_known(), &ctx()).await.unwrap();
        assert_eq!(out, vec![addr("1@s.whatsapp.net"), addr("3@s.whatsapp.net")]);

        let absent = r.resolve(&AudienceSpec::default(), &ctx()).await.unwrap();
        assert_eq!(absent, out);
    }

    #[tokio::test]
    async fn named_list_wins_and_is_deduplicated() {
        let r = resolver(seeded().await, MissingListPolicy::Reject);
        let out = r.resolve(&AudienceSpec::named("vip"), &ctx()).await.unwrap();
        assert_eq!(out, vec![addr("3@s.whatsapp.net"), addr("1@s.whatsapp.net")]);
    }

    #[tokio::test]
    async fn missing_named_list_follows_policy() {
        let reject = resolver(seeded().await, MissingListPolicy::Reject);
        assert!(matches!(
            reject.resolve(&AudienceSpec::named("nope"), &ctx()).await,
            Err(Error::NamedListNotFound(name)) if name == "nope"
        ));

        let fall = resolver(seeded().await, MissingListPolicy::FallThrough);
        let out = fall.resolve(&AudienceSpec::named("nope"), &ctx()).await.unwrap();
        assert_eq!(out, vec![addr("1@s.whatsapp.net"), addr("3@s.whatsapp.net")]);
    }

    #[tokio::test]
    async fn explicit_empty_means_nobody() {
        let r = resolver(seeded().await, MissingListPolicy::Reject);
        assert!(r.resolve(&AudienceSpec::nobody(), &ctx()).await.unwrap().is_empty());
        let empty: [&str; 0] = [];
        assert!(r
            .resolve(&AudienceSpec::explicit(empty), &ctx())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn explicit_entries_are_normalized_and_deduplicated() {
        let r = resolver(seeded().await, MissingListPolicy::Reject);
        let spec = AudienceSpec::explicit(["+44 20 7946", "447946@s.whatsapp.net", "", "120@g.us"]);
        let out = r.resolve(&spec, &ctx()).await.unwrap();
        // "+44 20 7946" and "447946@..." are different addresses after normalization
        assert_eq!(
            out,
            vec![
                addr("44207946@s.whatsapp.net"),
                addr("447946@s.whatsapp.net"),
                addr("120@g.us"),
            ]
        );

        let dupes = AudienceSpec::explicit(["5", "5@s.whatsapp.net"]);
        assert_eq!(
            r.resolve(&dupes, &ctx()).await.unwrap(),
            vec![addr("5@s.whatsapp.net")]
        );

        let bad = AudienceSpec::explicit(["not-a-number"]);
        assert!(matches!(
            r.resolve(&bad, &ctx()).await,
            Err(Error::InvalidAddress(_))
        ));
    }

    #[tokio::test]
    async fn standing_appended_and_self_prepended() {
        let r = resolver(seeded().await, MissingListPolicy::Reject);
        let spec = AudienceSpec::explicit(["7", "999"]).with_standing().with_self();
        let out = r.resolve(&spec, &ctx()).await.unwrap();
        assert_eq!(
            out,
            vec![
                addr("999@s.whatsapp.net"),
                addr("7@s.whatsapp.net"),
                addr("1@s.whatsapp.net"),
                addr("50@s.whatsapp.net"),
            ]
        );
    }

    #[tokio::test]
    async fn modifiers_apply_to_empty_audience() {
        let r = resolver(seeded().await, MissingListPolicy::Reject);
        let out = r
            .resolve(&AudienceSpec::nobody().with_self(), &ctx())
            .await
            .unwrap();
        assert_eq!(out, vec![addr("999@s.whatsapp.net")]);

        let no_self = AccountContext::new(SessionId::new("s1"));
        let out = r
            .resolve(&AudienceSpec::nobody().with_self(), &no_self)
            .await
            .unwrap();
        assert!(out.is_empty());
    }
}
