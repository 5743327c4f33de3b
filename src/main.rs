use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use teams_moderator::api::{ApiState, router};
use teams_moderator::config::{IngestMode, ModeratorConfig};
use teams_moderator::llm::create_provider;
use teams_moderator::moderation::{ContentSafetyClassifier, ContextualJudge, LlmJudge};
use teams_moderator::notify::{
    EmailChannel, NotificationChannel, NotificationComposer, WebhookChannel,
};
use teams_moderator::pipeline::{
    ActionExecutor, InMemoryQueue, ModerationPipeline, PollingMonitor, ProcessedLedger,
    QueueIngestor,
};
use teams_moderator::platform::GraphClient;
use teams_moderator::policy::refresher::{ConfigRefresher, bootstrap_store};
use teams_moderator::policy::source::{
    ConfigSource, LayeredConfigSource, LocalFileSource, RemoteConfigSource,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install rustls crypto provider"))?;

    dotenvy::dotenv().ok();
    let config = ModeratorConfig::from_env()?;
    let _log_guard = init_tracing(&config);

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        mode = ?config.mode,
        dry_run = config.dry_run,
        ingest_mode = ?config.ingest_mode,
        http_port = config.http_port,
        "Teams Moderator starting"
    );

    // ── Config ──────────────────────────────────────────────────────────
    let local: Arc<dyn ConfigSource> = Arc::new(LocalFileSource::new(&config.config_dir));
    let remote: Option<Arc<dyn ConfigSource>> = match &config.remote_config {
        Some(remote) => Some(Arc::new(RemoteConfigSource::new(
            &remote.endpoint,
            remote.token.clone(),
            config.external_timeout,
        )?)),
        None => None,
    };
    let source: Arc<dyn ConfigSource> = Arc::new(LayeredConfigSource::new(remote, local));
    let store = Arc::new(bootstrap_store(source.as_ref()).await?);

    // ── Services ────────────────────────────────────────────────────────
    let platform = Arc::new(GraphClient::new(config.graph.clone())?);
    let classifier = Arc::new(ContentSafetyClassifier::new(&config.content_safety)?);
    let llm = create_provider(&config.llm)?;
    let judge: Arc<dyn ContextualJudge> = Arc::new(LlmJudge::new(llm));

    let mut channels: Vec<Arc<dyn NotificationChannel>> = Vec::new();
    if let Some(url) = &config.webhook_url {
        channels.push(Arc::new(WebhookChannel::new(url, config.external_timeout)?));
        tracing::info!(channel = "webhook", "Notification channel enabled");
    }
    if let Some(email) = &config.email {
        tracing::info!(
            channel = "email",
            recipients = email.recipients.len(),
            "Notification channel enabled"
        );
        channels.push(Arc::new(EmailChannel::new(email.clone())));
    }
    if channels.is_empty() {
        tracing::warn!("No notification channel configured; alerts will only be logged");
    }

    // ── Pipeline ────────────────────────────────────────────────────────
    let ledger = Arc::new(ProcessedLedger::new(config.dedup_capacity));
    let pipeline = Arc::new(ModerationPipeline::new(
        store.clone(),
        classifier,
        judge.clone(),
        ActionExecutor::new(platform.clone(), config.external_timeout),
        NotificationComposer::new(Some(judge), channels, config.external_timeout),
        ledger.clone(),
        config.pipeline_settings(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks: Vec<JoinHandle<()>> = Vec::new();

    tasks.push(
        ConfigRefresher::new(
            source.clone(),
            store.clone(),
            config.config_refresh_interval,
        )
        .spawn(shutdown_rx.clone()),
    );

    let queue = match config.ingest_mode {
        IngestMode::Poll => {
            let monitor = Arc::new(PollingMonitor::new(
                pipeline.clone(),
                platform.clone(),
                store.clone(),
                config.ingest_settings(),
            ));
            tasks.push(monitor.spawn(shutdown_rx.clone()));
            None
        }
        IngestMode::Queue => {
            let queue = Arc::new(InMemoryQueue::default());
            let ingestor = Arc::new(QueueIngestor::new(
                pipeline.clone(),
                platform.clone(),
                queue.clone(),
                config.ingest_settings(),
            ));
            tasks.extend(ingestor.spawn(shutdown_rx.clone()));
            Some(queue)
        }
    };

    // ── HTTP ────────────────────────────────────────────────────────────
    let app = router(ApiState {
        store,
        config_source: source,
        ledger,
        queue,
    });
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.http_port)).await?;
    tracing::info!(port = config.http_port, "HTTP server started");

    let mut server_shutdown = shutdown_rx.clone();
    let server = tokio::spawn(async move {
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = server_shutdown.changed().await;
            })
            .await;
        if let Err(e) = result {
            tracing::error!(error = %e, "HTTP server failed");
        }
    });
    tasks.push(server);

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown requested, draining in-flight work");
    let _ = shutdown_tx.send(true);

    let drain = futures::future::join_all(tasks);
    if tokio::time::timeout(config.shutdown_grace, drain).await.is_err() {
        tracing::warn!(
            grace_secs = config.shutdown_grace.as_secs(),
            "Shutdown grace period elapsed with tasks still running"
        );
    }

    tracing::info!("Teams Moderator stopped");
    Ok(())
}

/// Console logging, plus daily-rotated JSON files when `LOG_FILE` is set.
fn init_tracing(config: &ModeratorConfig) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    let console = tracing_subscriber::fmt::layer().with_target(false);

    match &config.log_file {
        Some(path) => {
            let dir = path.parent().filter(|p| !p.as_os_str().is_empty());
            let file_name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "teams-moderator.log".to_string());
            let appender = tracing_appender::rolling::daily(
                dir.unwrap_or_else(|| std::path::Path::new(".")),
                file_name,
            );
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(console)
                .with(tracing_subscriber::fmt::layer().json().with_writer(writer))
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(console)
                .init();
            None
        }
    }
}
