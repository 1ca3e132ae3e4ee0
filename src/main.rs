use std::{sync::Arc, time::Duration};

use anyhow::Context as _;
use ds::{MemoryTransport, MemoryTransportFactory, Priority};
use log::{info, warn};

use station_client::{
    protocol::HandshakeTitle,
    terminal_actor::{CheckDelivery, Connect, CurrentState, Disconnect, GroupInvite, Login, SendContent},
    ClientConfig, ClientContext, Command, Content, Directory, Document, DocumentType, EntityId,
    EnvelopeCodec, InstantMessage, JsonCodec, LocalUser, MemoryDirectory, Meta, SessionStateKind,
    StaticIdentity, StationConfig, Terminal,
};

fn local_user(name: &str, address: &str, now: u64) -> LocalUser {
    let id = EntityId::user(name, address);
    LocalUser {
        meta: Meta {
            public_key: format!("pk-{name}"),
            seed: Some(name.to_string()),
        },
        visa: Document::new(id.clone(), DocumentType::Visa, now)
            .with_property("key", serde_json::json!(format!("ek-{name}"))),
        id,
    }
}

/// Stand in for the station: accept the first handshake we see.
async fn accept_handshake(transport: &MemoryTransport, user: &EntityId) -> anyhow::Result<()> {
    for _ in 0..100 {
        if !transport.pushed().is_empty() {
            let reply = Command::Handshake {
                title: HandshakeTitle::Success,
                session: Some(uuid::Uuid::new_v4().to_string()),
            };
            let content = Content::command(reply, chrono::Utc::now().timestamp_millis() as u64);
            let msg = InstantMessage::new(EntityId::any_station(), user.clone(), content);
            transport.deliver(JsonCodec.encode(&msg)?);
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    anyhow::bail!("no handshake was pushed")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let config = ClientConfig::from_env().context("Failed to load client config")?;
    let station = StationConfig::from_env().unwrap_or_else(|e| {
        warn!("{e:#}, using a local station");
        StationConfig {
            host: "127.0.0.1".to_string(),
            port: 9394,
        }
    });

    let now = chrono::Utc::now().timestamp_millis() as u64;
    let alice = local_user("alice", "moky", now);
    let bob = local_user("bob", "moky", now);
    let group = EntityId::group("demo", "moky");

    let directory = Arc::new(MemoryDirectory::new());
    directory.set_owner(&group, &alice.id);
    directory.set_assistants(&group, &[EntityId::bot("assistant", "moky")]);
    directory.save_meta(&group, alice.meta.clone());
    directory.save_document(bob.visa.clone());

    let identity = Arc::new(StaticIdentity::new(Some(alice.clone())));
    let ctx = ClientContext::new(config, directory, identity);
    let factory = Arc::new(MemoryTransportFactory::new());
    let terminal = kameo::spawn(Terminal::new(ctx, factory.clone()));

    let session_id = terminal
        .ask(Connect {
            host: station.host.clone(),
            port: station.port,
        })
        .await?;
    info!("Connected to {}:{} as session {session_id}", station.host, station.port);
    terminal.ask(Login { identity: None }).await?;

    let transport = factory.last().context("No transport was created")?;
    accept_handshake(&transport, &alice.id).await?;

    for _ in 0..100 {
        let state = terminal.ask(CurrentState).await?;
        if state.is_some_and(|s| s.kind == SessionStateKind::Running) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let handle = terminal
        .ask(SendContent {
            content: Content::text("hello bob", chrono::Utc::now().timestamp_millis() as u64),
            sender: None,
            receiver: bob.id.clone(),
            priority: Priority::DEFAULT,
        })
        .await?;
    let invited = terminal
        .ask(GroupInvite {
            group: group.clone(),
            members: vec![bob.id.clone()],
        })
        .await?;
    info!("Invited bob into {group}: {invited}");

    tokio::time::sleep(Duration::from_millis(500)).await;
    if let Some(message) = handle {
        let status = terminal.ask(CheckDelivery { message }).await?;
        info!("Delivery status: {status:?}");
    }
    info!("Station received {} shipments", transport.pushed().len());

    terminal.ask(Disconnect).await?;
    Ok(())
}
