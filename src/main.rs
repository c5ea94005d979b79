use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use staffchat::config::{Config, DEFAULT_PATH};
use staffchat::coordinator::Coordinator;
use staffchat::messaging::{self, LocalBus, Messaging};
use staffchat::presentation::FeedPresenter;
use staffchat::storage::{self, Storage};
use staffchat::{api, AppState};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    let config_path = PathBuf::from(dotenv::var("STAFFCHAT_CONFIG").unwrap_or_else(|_| DEFAULT_PATH.to_owned()));
    let config = Config::read(&config_path)?;

    let directive = if config.debug { "staffchat=debug" } else { "staffchat=info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(directive.parse()?))
        .init();
    config.validate()?;

    let identity = config.server_identity(&config_path)?;
    tracing::info!(server_id = %identity.id, server_name = %identity.name, "starting relay");

    let mut storages: Vec<Arc<dyn Storage>> = Vec::new();
    for (name, kind) in config.storage_engines() {
        match storage::connect(name, kind, &config.storage.settings, &identity).await {
            Ok(storage) => storages.push(storage),
            Err(err) => tracing::error!(storage = %name, "could not connect, skipping: {err}"),
        }
    }
    if storages.is_empty() {
        bail!("no storage engine could be connected");
    }

    let bus = LocalBus::new();
    let mut transports: Vec<Arc<dyn Messaging>> = Vec::new();
    for (name, kind) in config.messaging_engines() {
        let connected = messaging::connect(
            name,
            kind,
            &config.messaging.channel_prefix,
            &config.messaging.settings,
            identity.id,
            &bus,
        )
        .await;
        match connected {
            Ok(messaging) => transports.push(messaging),
            Err(err) => tracing::error!(messaging = %name, "could not connect, skipping: {err}"),
        }
    }

    let presenter = Arc::new(FeedPresenter::new(&config.chat.format, config.chat.allow_markdown));
    let coordinator = Coordinator::new(identity, storages, transports, presenter.clone());
    if let Err(err) = coordinator.announce_servers().await {
        tracing::warn!("could not announce server to every peer: {err}");
    }

    let cancel = CancellationToken::new();
    let poller = coordinator.spawn_poller(Duration::from_secs(config.poll.interval_secs), cancel.clone());

    let listen = dotenv::var("STAFFCHAT_LISTEN").unwrap_or_else(|_| config.http.listen.clone());
    let listener = tokio::net::TcpListener::bind(&listen).await.with_context(|| format!("could not bind {listen}"))?;
    tracing::info!("HTTP/WebSocket listening on {listen}");

    let app = api::router(AppState { coordinator: coordinator.clone(), presenter });
    let shutdown = cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => tracing::info!("received SIGINT, shutting down"),
                _ = shutdown.cancelled() => {}
            }
        })
        .await?;

    cancel.cancel();
    if let Err(err) = poller.await {
        tracing::warn!("poller ended abnormally: {err}");
    }
    coordinator.close().await;
    Ok(())
}
