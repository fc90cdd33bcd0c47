use anyhow::Context;
use clap::{Parser, Subcommand};
use crm_webhook_pipeline::config::{ConfigError, RegistrationArgs, ServeArgs};
use crm_webhook_pipeline::coordination::{CoordinationStore, InMemoryStore};
use crm_webhook_pipeline::dispatch::{EventApplier, HttpApplier, LogApplier, Processor};
use crm_webhook_pipeline::http_server::{self, AppState};
use crm_webhook_pipeline::logging::{init_logging, LogFormat};
use crm_webhook_pipeline::metrics::PipelineMetrics;
use crm_webhook_pipeline::normalize::Normalizer;
use crm_webhook_pipeline::registration::{RegistrationClient, RegistrationManager, SubscriptionStore};
use crm_webhook_pipeline::types::EventType;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};

#[derive(Parser)]
#[command(name = "crm-webhook-pipeline", version, about)]
struct Cli {
    #[arg(long, global = true, env = "WEBHOOK_LOG_FORMAT", value_enum, default_value_t = LogFormat::Plain)]
    log_format: LogFormat,

    /// Default level when neither WEBHOOK_LOG nor RUST_LOG is set.
    #[arg(long, global = true, default_value_t = Level::INFO)]
    log_level: Level,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the webhook receiver and the dispatch workers.
    Serve(ServeArgs),

    /// Subscribe a CRM module and store the issued secret.
    Subscribe {
        #[command(flatten)]
        api: RegistrationArgs,

        module: String,

        /// Repeat for several kinds; all kinds when omitted.
        #[arg(long = "event", value_parser = parse_event_type)]
        events: Vec<EventType>,
    },

    /// Remove a subscription remotely and locally.
    Unsubscribe {
        #[command(flatten)]
        api: RegistrationArgs,

        id: String,
    },

    /// List stored subscriptions.
    Subscriptions {
        #[arg(long, env = "WEBHOOK_DATA_DIR", default_value = ".")]
        data_dir: PathBuf,
    },
}

fn parse_event_type(raw: &str) -> Result<EventType, String> {
    EventType::from_wire(raw).ok_or_else(|| format!("unknown event type {raw:?}"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_format, cli.log_level)?;

    match cli.command {
        Command::Serve(args) => serve(args).await,
        Command::Subscribe {
            api,
            module,
            events,
        } => {
            let mut manager = manager(&api)?;
            let sub = manager.register(&module, &events).await?;
            println!("{}\t{}\t{}", sub.id, sub.module, sub.remote_webhook_id);
            Ok(())
        }
        Command::Unsubscribe { api, id } => {
            let mut manager = manager(&api)?;
            let sub = manager.deregister(&id).await?;
            println!("removed {} ({})", sub.id, sub.module);
            Ok(())
        }
        Command::Subscriptions { data_dir } => {
            let store = SubscriptionStore::open(data_dir)?;
            for sub in store.list() {
                let kinds: Vec<&str> = sub.event_types.iter().map(EventType::as_str).collect();
                println!(
                    "{}\t{}\t{}\t{}\t{}",
                    sub.id,
                    sub.module,
                    kinds.join(","),
                    sub.status,
                    sub.created_at
                );
            }
            Ok(())
        }
    }
}

fn manager(api: &RegistrationArgs) -> anyhow::Result<RegistrationManager> {
    let client = RegistrationClient::new(&api.api_base, &api.api_token, api.request_timeout())?;
    let store = SubscriptionStore::open(&api.data_dir)?;
    Ok(RegistrationManager::new(client, store, &api.callback_url))
}

// ─── serve ──────────────────────────────────────────────────────────────────

async fn serve(args: ServeArgs) -> anyhow::Result<()> {
    let config = args.pipeline_config();
    config.validate().context("invalid configuration")?;

    let subscriptions = SubscriptionStore::open(&args.data_dir)
        .with_context(|| format!("failed to load subscriptions from {}", args.data_dir.display()))?;
    let mut secrets = subscriptions.active_secrets();
    if let Some(secret) = args.webhook_secret.as_deref().filter(|s| !s.is_empty()) {
        secrets.push(secret.as_bytes().to_vec());
    }
    if !args.no_ingress && secrets.is_empty() {
        return Err(ConfigError::NoSecrets.into());
    }
    let modules = subscriptions.active_modules();
    if modules.is_empty() {
        info!("no active subscriptions; accepting events for every module");
    }

    let store = connect_store(args.redis_url.as_deref()).await?;
    let metrics = Arc::new(PipelineMetrics::new());
    let shutdown = CancellationToken::new();
    tokio::spawn(watch_signals(shutdown.clone()));

    let processor = if args.no_workers {
        None
    } else {
        let applier: Arc<dyn EventApplier> = match &args.apply_url {
            Some(url) => Arc::new(HttpApplier::new(url.as_str(), config.apply_timeout)?),
            None => {
                warn!("no apply URL configured; events will only be logged");
                Arc::new(LogApplier)
            }
        };
        Some(Processor::new(store.clone(), applier, metrics.clone(), config.clone()).start())
    };

    if args.no_ingress {
        shutdown.cancelled().await;
    } else {
        let listener = TcpListener::bind(args.listen)
            .await
            .with_context(|| format!("failed to bind {}", args.listen))?;
        let state = AppState::new(store, Normalizer::new(&modules), secrets, metrics, config)
            .with_admin_token(args.admin_token.clone());
        let token = shutdown.clone();
        http_server::serve(listener, state, async move { token.cancelled().await })
            .await
            .context("HTTP server failed")?;
    }

    if let Some(processor) = processor {
        processor.shutdown().await;
    }
    info!("shutdown complete");
    Ok(())
}

async fn connect_store(redis_url: Option<&str>) -> anyhow::Result<Arc<dyn CoordinationStore>> {
    match redis_url {
        #[cfg(feature = "redis")]
        Some(url) => {
            let store = crm_webhook_pipeline::coordination::RedisStore::connect(url)
                .await
                .context("failed to connect to the coordination store")?;
            info!("using shared coordination store");
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "redis"))]
        Some(_) => anyhow::bail!("--redis-url needs a build with the `redis` feature"),
        None => {
            warn!("no redis URL; using an in-process store, which cannot be shared between processes");
            Ok(Arc::new(InMemoryStore::new()))
        }
    }
}

async fn watch_signals(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown signal received");
    shutdown.cancel();
}
