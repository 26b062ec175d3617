use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use chat_sync::{
    config::{load_settings, load_settings_from},
    ChangeFeed, HttpRestClient, MissingChangeFeed, PollingChangeFeed, PushChannel, RestClient,
    SessionEvent, SyncClient, Transports, WebSocketPushChannel,
};
use clap::Parser;
use shared::domain::{ConversationId, MembershipState, UserId};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
struct Args {
    /// Overrides `server_url` from the config file and environment.
    #[arg(long)]
    server_url: Option<String>,
    #[arg(long)]
    user_id: Option<String>,
    #[arg(long)]
    conversation: String,
    /// Sent once the conversation is joined.
    #[arg(long)]
    message: Option<String>,
    /// How long to keep printing events before leaving.
    #[arg(long, default_value_t = 10)]
    listen_secs: u64,
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let args = Args::parse();

    let mut settings = match &args.config {
        Some(path) => load_settings_from(path, |name| std::env::var(name).ok())?,
        None => load_settings()?,
    };
    if let Some(server_url) = args.server_url.clone() {
        settings.server_url = server_url;
    }
    let user_id = args
        .user_id
        .clone()
        .or_else(|| settings.user_id.clone())
        .context("no user id: pass --user-id or set APP__USER_ID")?;
    let user_id = UserId::new(user_id);

    let rest: Arc<dyn RestClient> = Arc::new(
        HttpRestClient::new(&settings.server_url, settings.request_timeout())
            .context("failed to build REST client")?,
    );
    let push: Arc<dyn PushChannel> = Arc::new(
        WebSocketPushChannel::connect(&settings.server_url, &user_id)
            .await
            .context("failed to connect push channel")?,
    );
    let feed: Arc<dyn ChangeFeed> = match settings.feed_poll_interval() {
        Some(interval) => Arc::new(PollingChangeFeed::new(Arc::clone(&rest), interval)),
        None => Arc::new(MissingChangeFeed),
    };
    let transports = Transports::new(push, rest).with_change_feed(feed);
    let client = SyncClient::new(
        user_id,
        transports,
        settings.registry(),
        settings.session_settings(),
    );

    let conversation_id = ConversationId::new(args.conversation.clone());
    let session = client.session(&conversation_id).await;
    let mut events = session.subscribe_events();
    session.join().await?;
    info!(conversation_id = %conversation_id, "cli: join requested");

    let mut pending_message = args.message.clone();
    let listen = tokio::time::sleep(Duration::from_secs(args.listen_secs));
    tokio::pin!(listen);
    loop {
        tokio::select! {
            _ = &mut listen => break,
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(SessionEvent::MembershipChanged(state)) => {
                    println!("membership: {state}");
                    if state == MembershipState::Joined {
                        if let Some(content) = pending_message.take() {
                            let message = session.send_text(content).await?;
                            println!("sending: {}", serde_json::to_string(&message)?);
                        }
                    }
                }
                Ok(SessionEvent::MessagesChanged(messages)) => {
                    println!("messages ({}):", messages.len());
                    for message in &messages {
                        println!("  [{:?}] {} {}", message.status, message.id, message.content);
                    }
                }
                Ok(SessionEvent::ConversationChanged(conversation)) => {
                    println!(
                        "conversation: {} (unread {})",
                        conversation.title, conversation.unread_count
                    );
                }
                Ok(SessionEvent::TypingChanged { user_id, active }) => {
                    println!("typing: {user_id} {active}");
                }
                Ok(SessionEvent::Error(err)) => warn!("cli: session error: {err}"),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "cli: dropped session events"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    client.logout().await;
    Ok(())
}
