use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

use mail_intake::attachments::AttachmentPipeline;
use mail_intake::auth::{AuthConfig, OAuthTokenSource, TokenSource, spawn_token_refresher};
use mail_intake::bundle::{Bundle, BundleStore, Marker, ReadinessConfig, complete_stage2};
use mail_intake::config::{self, DEFAULT_DATA_DIR, IntakeConfig, env_or};
use mail_intake::llm::{EnrichmentConfig, OpenAiEnricher};
use mail_intake::mailbox::{
    ConnectionManager, ImapConfig, ImapMailbox, reset_mailbox, spawn_connection_manager,
};
use mail_intake::pipeline::MessageProcessor;
use mail_intake::retry::RetryPolicy;
use mail_intake::sink::SinkConfig;
use mail_intake::worker::{WorkerCoordinator, WorkerDeps, WorkerTask, run_task};

/// How long shutdown waits for the connection manager to stop.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(name = "mail-intake", version, about = "Watch a mailbox and turn offers into structured records")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Watch the mailbox and process messages (default).
    Run,
    /// Mark every message unread and delete all bundles.
    Reset {
        /// Confirm the reset.
        #[arg(long)]
        yes: bool,
    },
    /// Enrich and commit one bundle directory, re-combining it if needed.
    Enrich {
        bundle: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    let _log_guard = init_logging(config::log_dir().as_deref())?;

    let cli = Cli::parse();
    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run().await,
        Command::Reset { yes } => reset(yes).await,
        Command::Enrich { bundle } => enrich(bundle).await,
    }
}

/// Console logging, plus daily rolling files when a log directory is set.
fn init_logging(log_dir: Option<&Path>) -> anyhow::Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let console = tracing_subscriber::fmt::layer().with_target(false);

    let Some(dir) = log_dir else {
        tracing_subscriber::registry().with(filter).with(console).init();
        return Ok(None);
    };

    std::fs::create_dir_all(dir)
        .with_context(|| format!("creating log directory {}", dir.display()))?;
    let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, "intake.log"));
    let file = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_ansi(false)
        .with_writer(writer);
    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file)
        .init();
    Ok(Some(guard))
}

async fn run() -> anyhow::Result<()> {
    let config = IntakeConfig::from_env()?;

    eprintln!("📬 mail-intake v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Mailbox: {}@{}/{}", config.imap.user, config.imap.host, config.imap.folder);
    eprintln!("   Bundles: {}", config.data_dir.display());
    eprintln!("   Workers: {}", config.workers.max_workers);

    let store = BundleStore::new(&config.data_dir);
    store
        .ensure_root()
        .await
        .with_context(|| format!("creating bundle root {}", config.data_dir.display()))?;

    // ── Credentials ─────────────────────────────────────────────────────
    let oauth = OAuthTokenSource::load(config.auth).await?;
    let refresher = spawn_token_refresher(Arc::clone(&oauth));
    let tokens: Arc<dyn TokenSource> = oauth;

    // ── Worker side ─────────────────────────────────────────────────────
    let deps = WorkerDeps {
        enricher: Arc::new(OpenAiEnricher::new(&config.enrichment)?),
        sink: config.sink.build(Some(Arc::clone(&tokens)))?,
        readiness: config.readiness,
        retry: config.retry,
    };
    let coordinator = Arc::new(WorkerCoordinator::new(config.workers, deps));

    // ── Producer side ───────────────────────────────────────────────────
    let attachments = Arc::new(AttachmentPipeline::new(&config.extraction)?);
    let processor = Arc::new(MessageProcessor::new(
        store,
        attachments,
        coordinator.clone(),
        config.workers.admission_timeout,
    ));
    let manager = Arc::new(ConnectionManager::new(
        Arc::new(ImapMailbox::new(config.imap)),
        tokens,
        processor,
        config.reconnect_delay,
    ));
    let (manager_handle, shutdown) = spawn_connection_manager(manager);

    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    info!("Shutdown requested");

    let _ = shutdown.send(true);
    coordinator.shutdown().await;
    refresher.abort();
    if tokio::time::timeout(SHUTDOWN_GRACE, manager_handle).await.is_err() {
        warn!("Connection manager did not stop in time");
    }
    info!("Stopped");
    Ok(())
}

async fn reset(confirmed: bool) -> anyhow::Result<()> {
    let data_dir = PathBuf::from(env_or("INTAKE_DATA_DIR", DEFAULT_DATA_DIR));
    if !confirmed {
        bail!(
            "reset marks every message in the watched folder unread and deletes {}; pass --yes to confirm",
            data_dir.display()
        );
    }

    let imap = ImapConfig::from_env()?;
    let tokens = OAuthTokenSource::load(AuthConfig::from_env()?).await?;
    let store = BundleStore::new(data_dir);

    let count = reset_mailbox(&ImapMailbox::new(imap), tokens.as_ref(), &store).await?;
    info!(count, "Mailbox reset; all messages will be reprocessed");
    Ok(())
}

async fn enrich(dir: PathBuf) -> anyhow::Result<()> {
    let bundle = Bundle::new(&dir);
    if bundle.has_marker(Marker::Stage1).await? && !bundle.has_marker(Marker::Stage2).await? {
        info!(bundle = %dir.display(), "Stage 2 missing, re-running combine");
        complete_stage2(&bundle).await?;
    }

    let sink = SinkConfig::from_env()?;
    let tokens: Option<Arc<dyn TokenSource>> = if sink.requires_credentials() {
        Some(OAuthTokenSource::load(AuthConfig::from_env()?).await?)
    } else {
        None
    };
    let deps = WorkerDeps {
        enricher: Arc::new(OpenAiEnricher::new(&EnrichmentConfig::from_env()?)?),
        sink: sink.build(tokens)?,
        readiness: ReadinessConfig::from_env()?,
        retry: RetryPolicy::from_env()?,
    };

    let task = WorkerTask::new(&dir, Duration::ZERO);
    let ack = run_task(&task, &deps)
        .await
        .with_context(|| format!("enriching {}", dir.display()))?;
    info!(bundle = %dir.display(), location = %ack.location, "Bundle enriched and committed");
    Ok(())
}
