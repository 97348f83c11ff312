//! Chat relay between a browser and a local llama.cpp server

use llama_chat_relay::api;
use llama_chat_relay::config::AppConfig;
use llama_chat_relay::core::inference::LlamaInferenceClient;
use llama_chat_relay::core::services::{MyConversationService, MySettingsService};
use llama_chat_relay::core::session::SessionRegistry;
use llama_chat_relay::infrastructure::database::{DatabaseConnection, ensure_database_dir};
use llama_chat_relay::infrastructure::repositories::{DbConversationRepository, DbSettingsRepository};

use anyhow::{Context, anyhow};
use axum::http::{HeaderValue, Method};
use di::{Injectable, ServiceCollection, ServiceProvider, existing_as_self};
use di_axum::RouterServiceProviderExtensions;
use log::{info, warn};
use tokio::runtime::{Builder, Runtime};
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};

fn main() -> anyhow::Result<()> {
    // initialize tracing
    tracing_subscriber::fmt::init();

    let config = AppConfig::from_env()?;
    ensure_database_dir(&config.database_url)
        .with_context(|| format!("cannot create the directory for {}", config.database_url))?;

    let runtime: Runtime = Builder::new_multi_thread().enable_all().build()?;

    runtime.block_on(web_server_task(config))
}

fn build_provider(config: AppConfig) -> anyhow::Result<ServiceProvider> {
    let provider = ServiceCollection::new()
        .add(existing_as_self(config))
        .add(DatabaseConnection::singleton())
        .add(DbConversationRepository::scoped())
        .add(DbSettingsRepository::scoped())
        .add(MyConversationService::scoped())
        .add(MySettingsService::scoped())
        .add(LlamaInferenceClient::singleton())
        .add(SessionRegistry::singleton())
        .build_provider()
        .map_err(|e| anyhow!("invalid service registrations: {e:?}"))?;

    Ok(provider)
}

fn cors(config: &AppConfig) -> CorsLayer {
    let origins: Vec<HeaderValue> = config
        .allowed_origins
        .iter()
        .filter_map(|origin| match origin.parse::<HeaderValue>() {
            Ok(origin) => Some(origin),
            Err(_) => {
                warn!("ignoring invalid origin `{origin}`");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_headers(Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_origin(origins)
}

async fn web_server_task(config: AppConfig) -> anyhow::Result<()> {
    let provider = build_provider(config.clone())?;

    provider
        .get_required::<DatabaseConnection>()
        .migrate()
        .await
        .context("failed to run database migrations")?;

    let sessions = provider.get_required::<SessionRegistry>();

    let app = api::router()
        .layer(ServiceBuilder::new().layer(cors(&config)))
        .with_provider(provider);

    let listener = tokio::net::TcpListener::bind(config.bind_address()).await?;
    info!("listening on {}", listener.local_addr()?);
    info!("relaying to {}", config.llama_url);
    if !config.allowed_servers.is_empty() {
        info!("users may also select {}", config.allowed_servers.join(", "));
    }

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("cannot listen for ctrl-c: {e}");
                std::future::pending::<()>().await;
            }
            info!("Shutting down...");
            sessions.cancel_all();
        })
        .await?;

    Ok(())
}
