use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use shared::domain::{ConversationId, UserId};
use storage::Storage;
use sync_core::{
    rest::{RestMediaUploader, RestRemoteStore},
    ws::WsRealtimeConnector,
    ChatStore, ConnectionMonitor, ConnectionState, MediaPayload, OutgoingMessage, StoreEvent,
};
use tracing::info;

mod config;

#[derive(Parser, Debug)]
#[command(about = "Chat sync client")]
struct Args {
    /// Acting user id.
    #[arg(long)]
    user: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List conversations, most recent activity first.
    Conversations,
    /// Send a text message.
    Send {
        #[arg(long)]
        conversation: String,
        #[arg(long)]
        message: String,
    },
    /// Upload a file and send a message referencing it.
    SendFile {
        #[arg(long)]
        conversation: String,
        #[arg(long)]
        path: PathBuf,
    },
    /// Replay any queued offline sends.
    Drain,
    /// Stream a conversation until interrupted.
    Watch {
        #[arg(long)]
        conversation: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().init();
    let args = Args::parse();
    let settings = config::load_settings();

    let storage = Storage::new(&settings.database_url)
        .await
        .with_context(|| format!("failed to open local storage at {}", settings.database_url))?;
    let store = ChatStore::new(
        Arc::new(RestRemoteStore::new(settings.server_url.clone())),
        Arc::new(RestMediaUploader::new(settings.server_url.clone())),
        Arc::new(WsRealtimeConnector::new(settings.server_url.clone())),
        storage,
        ConnectionMonitor::new(ConnectionState::Online),
    );
    store.start().await;

    let user = UserId(args.user);
    match args.command {
        Command::Conversations => {
            store.load_conversations(&user).await?;
            for conversation in store.conversations_snapshot().await {
                let preview = conversation
                    .last_message
                    .as_ref()
                    .map(|m| m.content.as_str())
                    .unwrap_or("<no messages>");
                println!(
                    "{}  unread={}  {}",
                    conversation.id, conversation.unread_count, preview
                );
            }
        }
        Command::Send {
            conversation,
            message,
        } => {
            let row = store
                .send_message(OutgoingMessage::text(
                    ConversationId(conversation),
                    user,
                    message,
                ))
                .await?;
            println!("delivered as {}", row.id);
        }
        Command::SendFile { conversation, path } => {
            let bytes = tokio::fs::read(&path)
                .await
                .with_context(|| format!("failed to read {}", path.display()))?;
            let filename = path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| "attachment.bin".to_string());
            let row = store
                .send_attachment(
                    ConversationId(conversation),
                    user,
                    MediaPayload { bytes, filename },
                )
                .await?;
            println!("uploaded and delivered as {}", row.id);
        }
        Command::Drain => {
            store.process_offline_queue().await;
            let pending = store.storage().outbox_all().await?;
            println!("{} item(s) still queued", pending.len());
        }
        Command::Watch { conversation } => {
            let conversation = ConversationId(conversation);
            store.load_messages(&conversation, None, false).await?;
            for message in store.messages_snapshot(&conversation).await {
                println!("{}: {}", message.sender_id, message.content);
            }
            store.subscribe_to_messages(conversation.clone()).await?;
            info!(conversation_id = %conversation, "watching; ctrl-c to stop");

            let mut events = store.subscribe_events();
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    event = events.recv() => match event {
                        Ok(StoreEvent::MessagesUpdated { conversation_id })
                            if conversation_id == conversation =>
                        {
                            if let Some(message) =
                                store.messages_snapshot(&conversation).await.last()
                            {
                                println!("{}: {}", message.sender_id, message.content);
                            }
                        }
                        Ok(_) => {}
                        Err(_) => break,
                    },
                }
            }
            store.unsubscribe_from_messages().await;
        }
    }

    Ok(())
}
