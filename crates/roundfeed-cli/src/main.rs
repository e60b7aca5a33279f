//! roundfeed - watch a remote discussion thread as a live round feed.

/// Application configuration (TOML).
mod config;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use roundfeed_api::ContentApiClient;
use roundfeed_core::{
    ClientTimerSync, EventRegistry, PollSynchronizer, RequestScheduler, StatusState, TimerEvent,
    UpdateEvent, UpdatePayload,
};
use tokio::sync::{broadcast, mpsc};
use tracing::instrument;
use tracing_subscriber::filter::EnvFilter;
#[cfg(not(feature = "otel"))]
use tracing_subscriber::fmt;
#[cfg(feature = "otel")]
use tracing_subscriber::layer::SubscriberExt;
#[cfg(feature = "otel")]
use tracing_subscriber::util::SubscriberInitExt;
use url::Url;

use crate::config::{AppConfig, resolve_config_path};

/// CLI argument parser.
#[derive(Parser)]
#[command(about, version)]
struct Cli {
    /// Override config directory.
    #[arg(long, global = true)]
    dir: Option<PathBuf>,

    /// Subcommand to run.
    #[command(subcommand)]
    command: Commands,
}

/// Available subcommands.
#[derive(Subcommand)]
enum Commands {
    /// Write a config file with default settings.
    Init(InitArgs),
    /// Poll a thread and print its round updates until Ctrl-C.
    Watch(WatchArgs),
}

/// Arguments for `init`.
#[derive(Args)]
struct InitArgs {
    /// Content API base URL to store in the config.
    #[arg(long)]
    base_url: Option<String>,

    /// Overwrite an existing config file.
    #[arg(long)]
    force: bool,
}

/// Arguments for `watch`.
#[derive(Args)]
struct WatchArgs {
    /// Thread to follow.
    #[arg(long)]
    thread: String,

    /// Content API base URL (overrides `[api].base_url`).
    #[arg(long)]
    base_url: Option<String>,
}

/// Runs the `init` subcommand.
///
/// # Errors
///
/// Returns an error if the config file exists without `--force` or cannot be written.
#[instrument(skip_all)]
fn run_init(args: &InitArgs, dir: Option<&PathBuf>) -> Result<()> {
    let path = resolve_config_path(dir)?;
    if path.exists() && !args.force {
        bail!(
            "{} already exists (use --force to overwrite)",
            path.display()
        );
    }

    let mut config = AppConfig::default();
    if let Some(base_url) = &args.base_url {
        Url::parse(base_url).with_context(|| format!("invalid base URL: {base_url}"))?;
        config.api.base_url = Some(base_url.clone());
    }
    config.save(&path)?;

    tracing::info!("Wrote {}", path.display());
    Ok(())
}

/// Builds a `ContentApiClient` from the CLI override or the config file.
///
/// # Errors
///
/// Returns an error if no base URL is configured, it does not parse, or the
/// client fails to build.
fn build_content_client(base_url: Option<&str>, config: &AppConfig) -> Result<ContentApiClient> {
    let raw = base_url
        .or(config.api.base_url.as_deref())
        .context("content API base URL is required: pass --base-url or set [api].base_url")?;
    let url = Url::parse(raw).with_context(|| format!("invalid base URL: {raw}"))?;

    ContentApiClient::builder()
        .base_url(url)
        .user_agent(config.api.user_agent.as_str())
        .timeout(Duration::from_secs(config.api.timeout_secs))
        .build()
        .context("failed to build content API client")
}

/// Logs one update event.
fn log_update(event: &UpdateEvent) {
    match &event.payload {
        UpdatePayload::SessionStart {
            round,
            duration_secs,
            prompt,
        } => tracing::info!(
            round = ?round,
            duration_secs = ?duration_secs,
            "Round started: {}",
            prompt.as_deref().unwrap_or("-")
        ),
        UpdatePayload::SessionEnd {
            round,
            winner,
            points,
        } => tracing::info!(
            round = ?round,
            points = ?points,
            "Round ended, winner: {}",
            winner.as_deref().unwrap_or("-")
        ),
        UpdatePayload::Submission {
            author,
            text,
            round,
            ..
        } => tracing::info!(round = ?round, "{author}: {text}"),
        UpdatePayload::Standings { rows } => {
            tracing::info!("Standings ({} rows)", rows.len());
            for row in rows {
                tracing::info!(
                    "{}\t{}\t{}",
                    row.rank.map_or_else(|| String::from("-"), |r| r.to_string()),
                    row.name,
                    row.score.map_or_else(|| String::from("-"), |s| s.to_string())
                );
            }
        }
        UpdatePayload::Timer { remaining_secs } => {
            tracing::info!("Announced time left: {remaining_secs}s");
        }
        UpdatePayload::Status { state, message } => tracing::info!(
            state = ?state,
            "Status: {}",
            message.as_deref().unwrap_or("-")
        ),
    }
}

/// Adjusts the countdown for a round-level event.
///
/// Returns `false` once the feed has ended.
async fn drive_timer(
    event: &UpdateEvent,
    timer: &ClientTimerSync<ContentApiClient>,
    thread_id: &str,
) -> bool {
    match &event.payload {
        UpdatePayload::SessionStart {
            duration_secs: Some(duration_secs),
            ..
        } => {
            timer.start(*duration_secs, event.timestamp);
            match timer.synchronize(thread_id).await {
                Ok(result) => tracing::debug!(
                    server_offset_ms = result.server_offset_ms,
                    remaining_secs = ?result.remaining_secs,
                    "countdown synchronized"
                ),
                Err(e) => tracing::warn!("Countdown sync failed, using local clock: {e}"),
            }
        }
        UpdatePayload::Timer { remaining_secs } if !timer.is_running() => {
            timer.start(*remaining_secs, event.timestamp);
        }
        UpdatePayload::SessionEnd { .. } => timer.stop(),
        UpdatePayload::Status { state, .. } => match state {
            StatusState::Paused | StatusState::Closed => timer.stop(),
            StatusState::ConnectionLost => {
                timer.stop();
                return false;
            }
            StatusState::Open => {}
        },
        _ => {}
    }
    true
}

/// Runs the `watch` subcommand.
///
/// # Errors
///
/// Returns an error if the config cannot be loaded, the client fails to
/// build, or the connection to the thread is lost.
#[instrument(skip_all, fields(thread_id = %args.thread))]
async fn run_watch(args: &WatchArgs, dir: Option<&PathBuf>) -> Result<()> {
    let config_path = resolve_config_path(dir)?;
    let config = AppConfig::load(&config_path)?;
    let client = Arc::new(build_content_client(args.base_url.as_deref(), &config)?);

    let scheduler = RequestScheduler::new(config.sync.rate_limit.clone());
    let synchronizer = PollSynchronizer::new(
        scheduler.clone(),
        Arc::clone(&client),
        config.sync.polling.clone(),
    );
    let timer = ClientTimerSync::new(scheduler.clone(), client, config.sync.timer.clone());
    timer.keep_synchronized(&args.thread);

    let (tx, mut rx) = mpsc::unbounded_channel();
    let registry = EventRegistry::new();
    let logger = registry.subscribe_all(log_update);
    let forwarder = registry.subscribe_all(move |event| {
        // The receiver only goes away once the loop below has returned.
        let _ = tx.send(event.clone());
    });

    synchronizer.start_session(&args.thread, registry.sink())?;
    let limits = scheduler.config();
    tracing::info!(
        per_minute = limits.max_requests_per_minute,
        per_hour = limits.max_requests_per_hour,
        "Watching thread {}",
        args.thread
    );

    let mut ticks = timer.subscribe();
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    let outcome = loop {
        tokio::select! {
            result = &mut shutdown => {
                result.context("failed to listen for Ctrl-C")?;
                tracing::info!("Interrupted, shutting down");
                break Ok(());
            }
            Some(event) = rx.recv() => {
                if !drive_timer(&event, &timer, &args.thread).await {
                    break Err(anyhow::anyhow!("lost connection to thread {}", args.thread));
                }
            }
            tick = ticks.recv() => match tick {
                Ok(TimerEvent::Tick { remaining_secs }) => {
                    tracing::debug!(remaining_secs, "tick");
                }
                Ok(TimerEvent::Expired) => tracing::info!("Time is up"),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "timer events lagged");
                }
                Err(broadcast::error::RecvError::Closed) => {}
            },
        }
    };

    let stopped = synchronizer.stop_all();
    timer.stop();
    scheduler.shutdown().await;
    logger.unsubscribe();
    forwarder.unsubscribe();

    let stats = scheduler.statistics();
    tracing::info!(
        stopped,
        total_requests = stats.total_requests,
        success_rate = stats.success_rate,
        "Stopped"
    );
    outcome
}

/// Entry point.
///
/// # Errors
///
/// Returns an error if subcommand execution fails.
#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    #[cfg(not(feature = "otel"))]
    {
        fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
            )
            .with_target(false)
            .init();
    }

    #[cfg(feature = "otel")]
    {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let fmt_layer = tracing_subscriber::fmt::layer().with_target(false);

        // Export spans only when a collector is configured.
        let otel_layer = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
            .ok()
            .and_then(|_| {
                let exporter = opentelemetry_otlp::SpanExporter::builder()
                    .with_http()
                    .build()
                    .ok()?;

                let tracer_provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
                    .with_simple_exporter(exporter)
                    .build();

                let tracer = opentelemetry::trace::TracerProvider::tracer(
                    &tracer_provider,
                    env!("CARGO_PKG_NAME"),
                );
                opentelemetry::global::set_tracer_provider(tracer_provider);

                Some(tracing_opentelemetry::layer().with_tracer(tracer))
            });

        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .with(otel_layer)
            .init();
    }

    let cli = Cli::parse();
    match cli.command {
        Commands::Init(args) => run_init(&args, cli.dir.as_ref()),
        Commands::Watch(args) => run_watch(&args, cli.dir.as_ref()).await,
    }
}
