//! `inspectd` process entry point: wires `RuntimeConfig` from the
//! environment, starts the webhook/health/analysis HTTP server, and runs the
//! queue consumer loop that drives the Orchestrator. One process hosts both
//! the ingress surface and the analysis worker; §5 keeps it this way so
//! there is a single deployable unit behind the health check.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use inspectd::engine::Orchestrator;
use inspectd::queue::{self, InMemoryQueue, Queue};
use inspectd::reporter::{RecordingReporter, Reporter};
use inspectd::server::{self, AppState};
use inspectd_config::{LogFormat, QueueKind, RuntimeConfig};
use inspectd_installation::InstallationRegistry;
use inspectd_store::AnalysisStore;
use inspectd_types::{ShutdownState, Tool};

/// Preset tools run when a repository carries no `.inspector.toml`, or one
/// without a `tools` override. A small, stable golint/govet set — per §3's
/// invariant that tool ids stay stable across runs.
fn preset_tools() -> Vec<Tool> {
    vec![
        Tool {
            id: "golint".into(),
            name: "golint".into(),
            path: "/usr/bin/golint".into(),
            args: vec!["./...".into()],
            regex: None,
        },
        Tool {
            id: "govet".into(),
            name: "go vet".into(),
            path: "/usr/bin/go".into(),
            args: vec!["vet".into(), "./...".into()],
            regex: None,
        },
    ]
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = RuntimeConfig::from_env().context("failed to load runtime configuration")?;
    init_tracing(&config);

    if config.queue != QueueKind::Memory {
        anyhow::bail!("QUEUE={:?} is not yet implemented; only the in-memory queue ships today", config.queue);
    }

    info!(bind = %config.http_bind_addr, "starting inspectd");

    let store = Arc::new(AnalysisStore::new());
    let installations = Arc::new(InstallationRegistry::new());
    let shutdown = ShutdownState::new();
    let queue: Arc<dyn Queue> = Arc::new(InMemoryQueue::new());

    let sandbox_base = sandbox_base_dir();
    let command_log_dir = command_log_dir();
    // A real deployment swaps this for a GitHub-API-backed Reporter; the
    // recording implementation is the in-process stand-in the Non-goals
    // leave in place of a live code-host client.
    let reporter: Arc<Mutex<dyn Reporter + Send>> = Arc::new(Mutex::new(RecordingReporter::new()));
    let orchestrator = Arc::new(Orchestrator::new(
        Arc::clone(&store),
        preset_tools(),
        sandbox_base,
        config.analyser_memory_limit_mib,
        Arc::clone(&reporter),
        command_log_dir.clone(),
    ));

    let (inbox_tx, inbox_rx) = mpsc::channel(64);
    let app_state = AppState {
        queue: Arc::clone(&queue),
        store: Arc::clone(&store),
        installations: Arc::clone(&installations),
        shutdown: shutdown.clone(),
        webhook_secret: config.github_webhook_secret.clone(),
    };

    // The HTTP layer enqueues directly onto `queue` (see server::webhook_handler);
    // `inbox_tx`/`inbox_rx` back the producer pump for a future out-of-process
    // queue (`QUEUE=gcppubsub`) that cannot be enqueued to synchronously.
    drop(inbox_tx);
    let producer = tokio::spawn(queue::run_producer_pump(
        Arc::clone(&queue),
        inbox_rx,
        shutdown.clone(),
    ));

    let janitor = tokio::spawn(inspectd_store::run_janitor(
        command_log_dir,
        inspectd_store::JANITOR_INTERVAL,
        inspectd_store::JANITOR_MAX_AGE,
        shutdown.clone(),
    ));

    let consumer_queue = Arc::clone(&queue);
    let consumer_shutdown = shutdown.clone();
    let consumer = tokio::spawn(async move {
        let handler = |job| {
            let orchestrator = Arc::clone(&orchestrator);
            let analysis = tokio::task::block_in_place(move || orchestrator.run(&job));
            info!(analysis_id = analysis.id, status = %analysis.status, "analysis finished");
        };
        queue::run_consumer_loop(consumer_queue, consumer_shutdown, handler).await;
    });

    let listener = tokio::net::TcpListener::bind(&config.http_bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.http_bind_addr))?;
    let router = server::build_router(app_state);
    let server_shutdown = shutdown.clone();
    let server_task = tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(wait_for_shutdown_signal(server_shutdown))
            .await
    });

    wait_for_terminal_signal(shutdown.clone()).await?;

    let _ = server_task.await;
    let _ = producer.await;
    let _ = consumer.await;
    // The janitor only sleeps between sweeps; there's nothing to drain, so
    // it's aborted rather than awaited like the queue tasks above.
    janitor.abort();

    info!("inspectd stopped");
    Ok(())
}

fn sandbox_base_dir() -> PathBuf {
    std::env::var("INSPECTD_SANDBOX_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| std::env::temp_dir().join("inspectd-sandboxes"))
}

fn command_log_dir() -> PathBuf {
    std::env::var("INSPECTD_COMMAND_LOG_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| std::env::temp_dir().join("inspectd-command-logs"))
}

fn init_tracing(config: &RuntimeConfig) {
    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    match config.log_format {
        LogFormat::Json => subscriber.json().init(),
        LogFormat::Pretty => subscriber.init(),
    }
}

/// Resolves once axum should stop accepting new connections: either signal
/// fires this, same as [`wait_for_terminal_signal`], but `axum::serve`'s
/// graceful-shutdown future only needs to resolve once, not distinguish a
/// forced second signal.
async fn wait_for_shutdown_signal(shutdown: ShutdownState) {
    loop {
        if shutdown.is_shutting_down() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// SIGTERM/SIGINT both begin graceful shutdown; a second signal within one
/// second forces immediate exit per §5, since an operator sending a signal
/// twice in a row means "I already asked nicely."
async fn wait_for_terminal_signal(shutdown: ShutdownState) -> Result<()> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
        _ = sigint.recv() => info!("received SIGINT, shutting down"),
    }
    shutdown.begin_shutdown();

    let second_signal = async {
        tokio::select! {
            _ = sigterm.recv() => {}
            _ = sigint.recv() => {}
        }
    };
    if tokio::time::timeout(Duration::from_secs(1), second_signal).await.is_ok() {
        error!("received a second shutdown signal within one second, forcing exit");
        std::process::exit(130);
    }
    Ok(())
}
