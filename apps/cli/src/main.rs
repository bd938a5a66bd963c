use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use uuid::Uuid;

use client_core::{RealtimeSession, SessionConfig, SyncEvent};
use shared::domain::{ChatId, UserId};
use storage::{KeyValueStore, SqliteKeyValueStore};

#[derive(Parser, Debug)]
struct Args {
    #[arg(long)]
    server_url: String,
    #[arg(long)]
    token: String,
    #[arg(long)]
    user_id: Uuid,
    /// Chat to send into; omit to just watch the event stream.
    #[arg(long)]
    chat_id: Option<Uuid>,
    #[arg(long)]
    message: Option<String>,
    #[arg(long, default_value = "sqlite://client_state.db")]
    database_url: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().init();
    let args = Args::parse();

    let store: Arc<dyn KeyValueStore> =
        Arc::new(SqliteKeyValueStore::new(&args.database_url).await?);

    let session = RealtimeSession::new(
        SessionConfig {
            server_url: args.server_url,
            token: args.token,
            user_id: UserId(args.user_id),
        },
        store,
    )?;
    let mut events = session.sync().subscribe_events();
    session.init().await.context("session startup failed")?;
    info!("session started");

    if let (Some(chat_id), Some(message)) = (args.chat_id, args.message) {
        let pending = session
            .sync()
            .send(ChatId(chat_id), &message)
            .await
            .context("send failed")?;
        if pending.queued_offline {
            println!("queued offline as {}", pending.temp_id);
        } else {
            println!("sent as {}", pending.temp_id);
        }
    }

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(SyncEvent::MessageAdded { message }) => {
                    println!(
                        "[{}] {}: {}",
                        message.chat_id,
                        message.sender_id,
                        message.text.as_deref().unwrap_or("<no content>")
                    );
                }
                Ok(SyncEvent::Error(reason)) => eprintln!("error: {reason}"),
                Ok(_) => {}
                Err(_) => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    session.shutdown().await;
    Ok(())
}
