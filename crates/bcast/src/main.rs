mod sim;

use std::sync::Arc;

use bcast_core::{
    audience::AudienceSpec,
    config::Config,
    domain::{AccountContext, Contact, OutboundMessage, RecipientAddress, SessionId},
    engine::BroadcastEngine,
    learning::LearningStore,
    store::InMemoryContactStore,
    Error,
};
use sim::SimulatedTransport;

const DEFAULT_CONTACTS: usize = 2500;

#[tokio::main]
async fn main() -> Result<(), Error> {
    bcast_core::logging::init("bcast")?;

    let contacts = match std::env::args().nth(1) {
        Some(raw) => raw.parse::<usize>().map_err(|_| {
            Error::Config(format!("contact count must be a number, got {raw:?}"))
        })?,
        None => DEFAULT_CONTACTS,
    };

    let cfg = Arc::new(Config::load()?);
    let learning = Arc::new(LearningStore::new(cfg.learning_ttl, cfg.latency_smoothing));
    if let Some(path) = &cfg.learning_snapshot {
        let restored = learning.load_snapshot(path).await?;
        tracing::info!(path = %path.display(), restored, "learning snapshot loaded");
    }

    let session = SessionId::new("demo");
    let own = address(&cfg, 0);
    let store = Arc::new(InMemoryContactStore::new());
    store
        .upsert_contacts(
            &session,
            (1..=contacts).map(|i| {
                Contact::new(address(&cfg, i)).with_display_name(format!("Contact {i}"))
            }),
        )
        .await;
    store
        .set_named_list(&session, "team", (8..=32).map(|i| address(&cfg, i)).collect())
        .await;
    store
        .set_standing_recipients(&session, vec![address(&cfg, contacts + 1)])
        .await;

    let blocked = address(&cfg, 7);
    let engine = BroadcastEngine::with_learning(cfg.clone(), store, learning.clone());
    engine
        .register_session(
            AccountContext::new(session.clone()).with_own_address(own),
            Arc::new(SimulatedTransport::new(4000).block(blocked.clone())),
        )
        .await;

    let announcement = OutboundMessage::text("Service window tonight at 22:00 UTC");
    let everyone = engine
        .broadcast(&announcement, &AudienceSpec::all_known().with_self(), &session)
        .await;
    match &everyone {
        Ok(report) => print_json("all_known", report)?,
        Err(e) => tracing::warn!(error = %e, "broadcast to all contacts failed"),
    }

    let ticket = engine
        .enqueue_broadcast_default(
            OutboundMessage::text("Standup moved to 10:30"),
            AudienceSpec::named("team").with_standing(),
            &session,
        )
        .await?;
    match ticket.wait().await {
        Ok(report) => print_json("team", &report)?,
        Err(e) => tracing::warn!(error = %e, "queued broadcast failed"),
    }

    let suspects: Vec<RecipientAddress> = (1..=12).map(|i| address(&cfg, i)).collect();
    let anchor = match &everyone {
        Ok(report) => report.anchor.as_ref().map(|a| a.id().clone()),
        Err(Error::BatchTransport { anchor, .. }) => anchor.clone(),
        Err(_) => None,
    };
    let isolation = engine
        .isolate_failures(&session, &announcement, &suspects, anchor)
        .await?;
    print_json(
        "isolation",
        &serde_json::json!({
            "succeeded": isolation.succeeded.len(),
            "problematic": isolation.problematic,
            "attempts": isolation.attempts,
            "depth_exceeded": isolation.depth_exceeded.len(),
        }),
    )?;

    if let Some(path) = &cfg.learning_snapshot {
        let saved = learning.save_snapshot(path).await?;
        tracing::info!(path = %path.display(), saved, "learning snapshot written");
    }
    Ok(())
}

fn address(cfg: &Config, i: usize) -> RecipientAddress {
    RecipientAddress::new(format!("{}@{}", 15_550_000_000u64 + i as u64, cfg.default_domain))
}

fn print_json<T: serde::Serialize>(label: &str, value: &T) -> Result<(), Error> {
    println!("{label}: {}", serde_json::to_string_pretty(value)?);
    Ok(())
}
