/// MatchLink messaging core - demo client entry point
use matchlink_core::realtime::WsTransport;
use matchlink_core::{AccountStatus, Config, HttpApi, MessagingApi, MessagingSession, StoreEvent};
use std::env;
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info"))
        )
        .init();

    // Parse configuration
    let args: Vec<String> = env::args().collect();
    let config = Config::from_args(&args)
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;
    let token = config
        .token
        .clone()
        .ok_or_else(|| anyhow::anyhow!("A session token is required (--token or MATCHLINK_TOKEN)"))?;

    let transport = Arc::new(WsTransport::new(config.connect_timeout));
    let session = MessagingSession::new(
        config.connection_config(),
        config.ledger_capacity,
        transport,
        None,
    );
    // REST calls follow the gate's token, rotations included
    let api: Arc<dyn MessagingApi> = Arc::new(
        HttpApi::new(&config.base_url, session.gate().watch_token(), config.connect_timeout)
            .map_err(|e| anyhow::anyhow!("HTTP client error: {}", e))?,
    );
    let session = session.with_api(api);
    session.set_current_user(config.user_id.clone()).await;

    info!("🚀 Starting MatchLink messaging client");
    info!("   Server: {}", config.base_url);

    let mut events = session.subscribe();
    let gate = session.gate();
    gate.set_account_status(AccountStatus::Activated).await;
    gate.set_token(Some(token)).await;
    gate.set_messaging_capability(true).await;

    match session.refresh_conversations().await {
        Ok(list) => info!("Loaded {} conversations", list.len()),
        Err(e) => warn!("Conversation refresh failed: {}", e),
    }

    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("Ctrl+C received");
                break;
            }
            event = events.recv() => match event {
                Ok(StoreEvent::ConversationChanged { conversation_id }) => {
                    if let Some(state) = session.conversation(&conversation_id).await {
                        let unread = session.store().read().await.unread_count(&conversation_id);
                        info!(
                            "Conversation {} updated: {} messages, {} unread",
                            conversation_id,
                            state.messages.len(),
                            unread
                        );
                    }
                }
                Ok(StoreEvent::ConnectionStatus { status }) => info!("Connection {:?}", status),
                Ok(StoreEvent::ServerError { message }) => warn!("Server error: {}", message),
                Ok(StoreEvent::Reset) => info!("Conversation state wiped"),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Skipped {} events", n);
                }
                Err(_) => break,
            }
        }
    }

    session.shutdown().await;
    Ok(())
}
