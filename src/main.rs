use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use marketplace_webhooks::handlers::{marketplace_registry, LoggingActions};
use marketplace_webhooks::http_server::{self, ServerState};
use marketplace_webhooks::monitor::WebhookMonitor;
use marketplace_webhooks::retry_worker::RetryProcessor;
use marketplace_webhooks::store::{JsonFileStore, WebhookEventStore};
use marketplace_webhooks::{AppConfig, RetryManager, WebhookProcessor};

#[derive(Parser, Debug)]
#[command(name = "marketplace-webhooks", about = "Signed webhook receiver with retry and dead-letter queue")]
struct Cli {
    /// Address to listen on (overrides WEBHOOKS__SERVER__BIND_ADDR).
    #[arg(long)]
    bind: Option<String>,

    /// Directory for the JSON event store (overrides WEBHOOKS__STORAGE__DATA_DIR).
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Emit logs as JSON lines.
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = AppConfig::load().context("loading configuration")?;
    if let Some(bind) = cli.bind {
        config.server.bind_addr = bind;
    }
    if let Some(dir) = cli.data_dir {
        config.storage.data_dir = dir;
    }
    config.log_json |= cli.log_json;

    init_tracing(config.log_json);

    let store: Arc<dyn WebhookEventStore> = if config.storage.in_memory {
        tracing::warn!("using in-memory webhook store; events are lost on restart");
        Arc::new(JsonFileStore::in_memory())
    } else {
        Arc::new(
            JsonFileStore::open(&config.storage.data_dir)
                .await
                .with_context(|| format!("opening store in {}", config.storage.data_dir.display()))?,
        )
    };

    let retry = RetryManager::new(store.clone(), config.retry.policy());
    let processor = WebhookProcessor::new(store.clone(), retry.clone());
    let registry = Arc::new(marketplace_registry(Arc::new(LoggingActions)));
    let retry_processor = RetryProcessor::new(
        processor.clone(),
        registry.clone(),
        config.retry.batch_size,
        config.retry.stale_after(),
    );

    for source in marketplace_webhooks::WebhookSource::ALL {
        if config.secrets.for_source(source).is_none() {
            tracing::warn!(%source, "no webhook secret configured; deliveries will be rejected");
        }
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let schedule = retry_processor
        .clone()
        .spawn_schedule(config.retry.interval(), shutdown_rx);

    let state = ServerState {
        processor,
        registry,
        monitor: WebhookMonitor::new(store, retry),
        retry_processor,
        secrets: Arc::new(config.secrets.clone()),
        admin_token: config.admin.token.as_deref().filter(|t| !t.is_empty()).map(Arc::from),
    };

    http_server::serve(&config.server.bind_addr, state, async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for shutdown signal");
        }
        tracing::info!("shutdown requested");
        let _ = shutdown_tx.send(true);
    })
    .await
    .with_context(|| format!("serving on {}", config.server.bind_addr))?;

    schedule.await.context("retry schedule task panicked")?;
    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("marketplace_webhooks=info"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}
