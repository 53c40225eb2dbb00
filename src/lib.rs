use config::Config;
use service::Service;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{util::SubscriberInitExt, EnvFilter, FmtSubscriber};

pub mod config;
pub mod db;
pub mod dispatch;
pub mod error;
pub mod reaper;
pub mod retry;
pub mod service;
pub mod statement;

pub use dispatch::{
    CustomPersonTokens, DispatchQueueItem, DispatchType, MessageType, RecipientQueue,
    SendingContext,
};
pub use error::Error;
pub use retry::{RetryPolicy, Transient, TransientFault};

/// Installs the global `tracing` subscriber, filtered by `DISPATCHQ_LOG`.
pub fn init_tracing() -> eyre::Result<()> {
    #[cfg(debug_assertions)]
    FmtSubscriber::builder()
        .pretty()
        .with_env_filter(
            EnvFilter::builder()
                .with_env_var("DISPATCHQ_LOG")
                .with_default_directive(LevelFilter::INFO.into())
                .from_env()?,
        )
        .finish()
        .try_init()?;

    #[cfg(not(debug_assertions))]
    FmtSubscriber::builder()
        .json()
        .with_env_filter(
            EnvFilter::builder()
                .with_env_var("DISPATCHQ_LOG")
                .with_default_directive(LevelFilter::INFO.into())
                .from_env()?,
        )
        .finish()
        .try_init()?;

    Ok(())
}

/// Returns a builder for the stale claim sweeper. Without a `config`, it is loaded from the
/// environment.
#[bon::builder(finish_fn = start)]
pub async fn run(config: Option<Config>) -> eyre::Result<()> {
    init_tracing()?;

    let config = match config {
        Some(config) => config,
        None => Config::load()?,
    };

    let service = Service::connect_with().config(config.clone()).call().await?;

    tracing::info!(
        db_path = config.db_path().unwrap_or(":memory:"),
        retry = ?service.retry_policy(),
        "Dispatch queue sweeper started"
    );

    reaper::run(
        &service,
        config.stale_timeout(),
        config.sweep_interval(),
        async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {e}");
            }
        },
    )
    .await;

    Ok(())
}
