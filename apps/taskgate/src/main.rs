use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tower_http::trace::TraceLayer;
use tracing::info;

use taskgate_core::{ChannelLookup, Core, Stores};
use taskgate_provider_impl::AdaptorRegistry;
use taskgate_storage::GatewayStorage;

mod cli;
mod config;

use crate::cli::Cli;

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    init_tracing(cli.log_json);
    if let Err(err) = run(cli).await {
        eprintln!("taskgate failed: {err:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let gateway_config = config::load(&cli.config)
        .with_context(|| format!("failed to load config {}", cli.config.display()))?;
    info!(
        config = %cli.config.display(),
        channels = gateway_config.channels.len(),
        units_per_dollar = gateway_config.quota.units_per_dollar,
        yuan_per_dollar = gateway_config.quota.yuan_per_dollar,
        "config loaded"
    );

    let stores = open_stores(&cli).await?;

    let registry = Arc::new(AdaptorRegistry::from_channels(
        gateway_config.channel_contexts(),
    ));
    info!(channels = ?registry.channel_ids(), "registry ready");

    let lookup: ChannelLookup = {
        let registry = registry.clone();
        Arc::new(move |channel_id: i64| registry.get(channel_id))
    };

    let core = Core::new(lookup, stores, gateway_config.quota);
    let app = core.router().layer(TraceLayer::new_for_http());

    let bind = cli.bind_addr();
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("failed to bind {bind}"))?;
    info!(addr = %bind, "listening");
    axum::serve(listener, app).await?;

    Ok(())
}

async fn open_stores(cli: &Cli) -> anyhow::Result<Stores> {
    if cli.uses_memory_store() {
        info!("using in-memory store");
        return Ok(Stores::memory());
    }
    let dsn = resolve_dsn(&cli.dsn)?;
    let storage = GatewayStorage::connect(&dsn)
        .await
        .with_context(|| format!("failed to connect {dsn}"))?;
    info!(dsn = %dsn, "db connected");
    storage.sync().await.context("schema sync failed")?;
    Ok(Stores::from_backend(Arc::new(storage)))
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("taskgate=info,sea_orm=warn"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

pub(crate) fn resolve_dsn(input: &str) -> anyhow::Result<String> {
    if !input.trim().is_empty() {
        return Ok(input.to_string());
    }

    let exe = std::env::current_exe()?;
    let dir = exe
        .parent()
        .context("failed to resolve executable directory")?;
    let db_path = dir.join("taskgate.db");
    let db_path = db_path.to_string_lossy();
    let dsn = if db_path.starts_with('/') {
        let trimmed = db_path.trim_start_matches('/');
        format!("sqlite:///{trimmed}?mode=rwc")
    } else {
        format!("sqlite://{db_path}?mode=rwc")
    };
    Ok(dsn)
}
