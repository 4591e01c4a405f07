use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::{bail, Context, Result};
use clap::Parser;
use client_core::{
    ClientLifecycle, ConversationDirectory, ConversationSession, DirectoryEvent,
    InitializeOptions, SessionEvent,
};
use protocol_client::{
    loopback::{LoopbackNetwork, LoopbackSigner},
    ClientFactory, ClientOptions, ProtocolClient,
};
use serde::Serialize;
use shared::{
    domain::Identifier,
    protocol::{ConversationRecord, CreateGroupOptions, ListConversationsOptions, MessageRecord},
};
use tokio::sync::broadcast;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod config;

use config::{decode_db_key, load_settings, parse_env, parse_log_level};

/// Runs a sync session against an in-process network: lists, streams and
/// opens conversations while a simulated peer writes to them.
#[derive(Parser, Debug)]
struct Args {
    #[arg(long, default_value = "sync_cli.toml")]
    config: PathBuf,
    #[arg(long)]
    env: Option<String>,
    #[arg(long)]
    log_level: Option<String>,
    /// Base64 database encryption key.
    #[arg(long)]
    db_key: Option<String>,
    /// Account address to sign in with.
    #[arg(long)]
    address: Option<String>,
    #[arg(long, default_value = "0xb0b")]
    peer: String,
    #[arg(long, default_value_t = 2000)]
    wait_ms: u64,
    /// Print the final state as JSON.
    #[arg(long)]
    json: bool,
}

#[derive(Serialize)]
struct Summary {
    inbox_id: String,
    conversations: Vec<ConversationRecord>,
    open_conversation: Option<String>,
    title: Option<String>,
    messages: Vec<MessageRecord>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let mut settings = load_settings(&args.config)?;
    if let Some(env) = &args.env {
        settings.env = parse_env(env)?;
    }
    if let Some(level) = &args.log_level {
        settings.logging_level = Some(parse_log_level(level)?);
    }
    if let Some(key) = &args.db_key {
        settings.db_encryption_key = Some(key.clone());
    }
    if let Some(address) = &args.address {
        settings.inbox_seed = address.clone();
    }

    let default_filter = settings
        .logging_level
        .map(|level| level.as_filter())
        .unwrap_or("info");
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    let db_encryption_key = settings
        .db_encryption_key
        .as_deref()
        .map(decode_db_key)
        .transpose()?;
    let wait = Duration::from_millis(args.wait_ms);

    let network = LoopbackNetwork::new();
    let factory = network.factory();
    let peer = factory
        .create(
            Arc::new(LoopbackSigner::new(Identifier::ethereum(args.peer.as_str()))),
            ClientOptions::default(),
        )
        .await
        .context("failed to create peer client")?;

    let lifecycle = ClientLifecycle::new(Arc::new(factory));
    let options = InitializeOptions {
        env: settings.env,
        logging_level: settings.logging_level,
        db_encryption_key,
        ..InitializeOptions::new(Arc::new(LoopbackSigner::new(Identifier::ethereum(
            settings.inbox_seed.as_str(),
        ))))
    };
    let Some(client) = lifecycle.initialize(options).await? else {
        bail!("client creation already in progress");
    };
    info!(inbox_id = %client.inbox_id(), env = %settings.env, "sync_cli: signed in");

    let welcome = peer
        .new_group(
            &[client.inbox_id()],
            &CreateGroupOptions {
                name: Some("release planning".to_string()),
                ..CreateGroupOptions::default()
            },
        )
        .await?;
    peer.new_dm(&client.inbox_id()).await?;
    network
        .publish_text(&welcome.id, &peer.inbox_id(), "kickoff at ten")
        .await?;

    let directory = ConversationDirectory::new(Some(client.clone()));
    let listed = directory
        .list(&ListConversationsOptions::default(), true)
        .await?;
    println!("listed {} conversations", listed.len());
    for conversation in &listed {
        println!("  {} {}", conversation.id, conversation.display_name());
    }

    let mut directory_events = directory.subscribe_events();
    directory.stream_new_conversations().await?;
    let late = peer
        .new_group(&[client.inbox_id()], &CreateGroupOptions::default())
        .await?;
    match wait_for_conversation(&mut directory_events, wait).await {
        Some(record) => println!("streamed new conversation {} {}", record.id, record.display_name()),
        None => println!("no conversation arrived within {wait:?}"),
    }
    if let Some(found) = directory.get_conversation_by_id(&late.id).await? {
        println!("lookup {} -> {}", found.id, found.display_name());
    }

    let own = directory
        .new_dm_with_identifier(&peer.account_identifier())
        .await?;
    if let Some(own) = &own {
        println!("opened dm {} (not cached until listed)", own.id);
    }
    directory.sync_all().await?;

    let session = ConversationSession::new(Some(client.clone()));
    let mut session_events = session.subscribe_events();
    if let Some(target) = listed.iter().find(|record| record.id == welcome.id) {
        let outcome = session.open(target.clone()).await?;
        println!("session {} -> {outcome:?}", target.id);

        let sent = network
            .publish_text(&welcome.id, &peer.inbox_id(), "agenda attached")
            .await?;
        match wait_for_message(&mut session_events, wait).await {
            Some(message) => println!(
                "streamed message {}: {}",
                message.id,
                message.text().unwrap_or_default()
            ),
            None => println!("no message arrived within {wait:?}"),
        }
        if let Some(found) = directory.get_message_by_id(&sent.id).await? {
            println!("lookup message {} from {}", found.id, found.sender_inbox_id);
        }

        let outcome = session.resync().await?;
        println!("resync -> {outcome:?}");
    }

    let summary = Summary {
        inbox_id: client.inbox_id().to_string(),
        conversations: directory.conversations().await,
        open_conversation: session.target().await.map(|target| target.id.to_string()),
        title: session.title().await,
        messages: session.messages().await,
    };
    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!(
            "{} conversations cached, {:?} open with {} messages",
            summary.conversations.len(),
            summary.title,
            summary.messages.len()
        );
        for message in &summary.messages {
            println!(
                "  [{}] {}: {}",
                message.sent_at.format("%H:%M:%S"),
                message.sender_inbox_id,
                message.text().unwrap_or_else(|| message.content_type.type_id().to_string())
            );
        }
    }

    session.close().await;
    directory.shutdown().await;
    lifecycle.disconnect().await;
    peer.close().await;
    Ok(())
}

async fn wait_for_conversation(
    events: &mut broadcast::Receiver<DirectoryEvent>,
    wait: Duration,
) -> Option<ConversationRecord> {
    tokio::time::timeout(wait, async {
        loop {
            match events.recv().await {
                Ok(DirectoryEvent::ConversationAdded(record)) => return Some(record),
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
    .await
    .ok()
    .flatten()
}

async fn wait_for_message(
    events: &mut broadcast::Receiver<SessionEvent>,
    wait: Duration,
) -> Option<MessageRecord> {
    tokio::time::timeout(wait, async {
        loop {
            match events.recv().await {
                Ok(SessionEvent::MessageAppended(message)) => return Some(message),
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
    .await
    .ok()
    .flatten()
}
