use std::sync::Arc;
use tracing::{error, info, warn};

use chatrelay::{
    bus::EventBus,
    config::Config,
    http::server::{router, AppState},
    interface::telegram::{BotApi, TelegramBot},
    store::Store,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file
    if let Err(e) = dotenvy::dotenv() {
        info!("No .env file found or failed to load: {}", e);
    }

    // Initialize logging with default filter if RUST_LOG is not set
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    info!("Chat relay starting...");

    let config = Arc::new(Config::from_env()?);
    let bus = Arc::new(EventBus::new());

    info!("Initializing store at {}", config.db_path.display());
    let store = Store::new(&config.db_path).await?;
    store.init().await?;

    let bot: Option<Arc<dyn BotApi>> = match config.bot_token.as_deref() {
        Some(token) => {
            let telegram = TelegramBot::new(token)?;
            if config.register_webhook {
                match config.webhook_url() {
                    Some(url) => {
                        if let Err(e) = telegram
                            .register_webhook(&url, config.webhook_secret.as_deref())
                            .await
                        {
                            error!("Failed to register Telegram webhook: {:#}", e);
                        }
                    }
                    None => warn!("TELEGRAM_REGISTER_WEBHOOK is set but PUBLIC_BASE_URL is missing"),
                }
            }
            Some(Arc::new(telegram) as Arc<dyn BotApi>)
        }
        None => {
            info!("No Telegram token found, visitor messages will be stored without notification.");
            None
        }
    };

    if config.operator_chat_id.is_none() {
        warn!("TELEGRAM_CHAT_ID is not set, operator notifications are disabled");
    }

    let state = Arc::new(AppState::new(store, bus, bot, config.clone()));
    let app = router(state);

    let port = config.port;
    info!("Starting chat relay on port {}", port);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
        res = axum::serve(listener, app) => {
            if let Err(e) = res {
                error!("Server stopped with error: {}", e);
            }
        }
    }

    Ok(())
}
