use std::sync::Arc;

use supportline::attachment::BlobStore;
use supportline::bus::{ChatEvent, EventBus};
use supportline::config::Config;
use supportline::http::ApiServer;
use supportline::registry::SessionRegistry;
use supportline::store::Store;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};

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

    info!("Supportline starting...");

    let config = Config::from_env()?;

    let bus = Arc::new(EventBus::new());

    info!("Initializing store at {}", config.db_path.display());
    let store = Store::new(&config.db_path).await?;
    store.init().await?;

    info!("Storing attachments under {}", config.upload_dir.display());
    let blobs = BlobStore::new(&config.upload_dir);

    let audit_handle = tokio::spawn(audit_log(bus.clone()));

    let registry = Arc::new(SessionRegistry::new(
        store,
        blobs,
        config.attachments.clone(),
        bus.clone(),
    ));

    let server = ApiServer::new(registry, Arc::new(config.tokens.clone()));
    let app = server.router();

    info!("Starting API server on {}", config.bind);
    let listener = tokio::net::TcpListener::bind(config.bind).await?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
        res = axum::serve(listener, app) => {
            if let Err(e) = res {
                error!("Server stopped with error: {}", e);
            }
        }
        _ = audit_handle => {
            error!("Audit logger finished unexpectedly");
        }
    }

    Ok(())
}

/// Writes one line per lifecycle event. Staff notifiers hook in the same way.
async fn audit_log(bus: Arc<EventBus>) {
    let mut rx = bus.subscribe();
    loop {
        match rx.recv().await {
            Ok(ChatEvent::SessionCreated(session)) => {
                info!(chat_id = %session.id, customer = %session.customer_id, "Chat opened: {}", session.title);
            }
            Ok(ChatEvent::MessagePosted(message)) => {
                info!(chat_id = %message.chat_id, sender = %message.sender_id, kind = message.kind.as_str(), "Message posted");
            }
            Ok(ChatEvent::SessionAssigned { chat_id, admin_id }) => {
                info!(%chat_id, %admin_id, "Chat assigned");
            }
            Ok(ChatEvent::SessionClosed {
                chat_id,
                closed_by,
                was_unassigned,
            }) => {
                if was_unassigned {
                    warn!(%chat_id, %closed_by, "Chat closed before any admin picked it up");
                } else {
                    info!(%chat_id, %closed_by, "Chat closed");
                }
            }
            Ok(ChatEvent::SessionDeleted {
                chat_id,
                deleted_by,
            }) => {
                info!(%chat_id, %deleted_by, "Chat deleted");
            }
            Err(RecvError::Lagged(n)) => {
                warn!("Audit logger lagged, skipped {} events", n);
            }
            Err(RecvError::Closed) => break,
        }
    }
}
