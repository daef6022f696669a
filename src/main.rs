//! cpsens-stream - CP-SENS per-channel stream processor
//!
//! Subscribes to sensor topics through a bus bridge, runs one processing
//! stage (detrend or Kalman integration) per stream key and republishes the
//! results.
//!
//! # Usage
//!
//! ```bash
//! # Bridge piped through stdin/stdout
//! mqtt-bridge --sub 'cpsns/#' | cpsens-stream --stdin | mqtt-bridge --pub
//!
//! # Bridge over TCP, integration stage
//! cpsens-stream --stage integrate --subscribe-tcp 127.0.0.1:7000 --publish-tcp 127.0.0.1:7001
//! ```
//!
//! # Environment Variables
//!
//! - `CPSENS_CONFIG`: Path to the TOML configuration file
//! - `CPSENS_SERVER_ADDR`: Status API bind address
//! - `RUST_LOG`: Logging level (default: info)
//!
//! Logs go to stderr; stdout is reserved for outbound envelopes.

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use cpsens_stream::api::{create_app, DashboardState};
use cpsens_stream::config::defaults::IDLE_SWEEP_INTERVAL_SECS;
use cpsens_stream::config::{RetentionKind, StreamConfig};
use cpsens_stream::pipeline::source::{
    MessageSink, MessageSource, StdinSource, StdoutSink, TcpSink, TcpSource,
};
use cpsens_stream::pipeline::{AppState, Dispatcher, ProcessingLoop, SystemStatus};
use cpsens_stream::transform::StageKind;

// ============================================================================
// CLI Arguments
// ============================================================================

#[derive(Parser, Debug)]
#[command(name = "cpsens-stream")]
#[command(about = "CP-SENS per-channel detrend and Kalman integration stage")]
#[command(version)]
struct CliArgs {
    /// Path to a TOML config file (overrides CPSENS_CONFIG and ./cpsens_stream.toml)
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Processing stage (overrides [stage].kind)
    #[arg(long, value_enum)]
    stage: Option<StageArg>,

    /// Read bridge envelopes from stdin
    #[arg(long, conflicts_with = "subscribe_tcp")]
    stdin: bool,

    /// Read bridge envelopes from a TCP endpoint
    #[arg(long, value_name = "HOST:PORT")]
    subscribe_tcp: Option<String>,

    /// Publish envelopes to a TCP endpoint instead of stdout
    #[arg(long, value_name = "HOST:PORT")]
    publish_tcp: Option<String>,

    /// Override the status server address
    #[arg(short, long, env = "CPSENS_SERVER_ADDR")]
    addr: Option<String>,

    /// Do not start the status server
    #[arg(long)]
    no_server: bool,

    #[arg(long, value_enum, default_value = "text")]
    log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum StageArg {
    Detrend,
    Integrate,
}

impl From<StageArg> for StageKind {
    fn from(arg: StageArg) -> Self {
        match arg {
            StageArg::Detrend => StageKind::Detrend,
            StageArg::Integrate => StageKind::Integrate,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

// ============================================================================
// Task Supervision
// ============================================================================

#[derive(Debug, Clone, Copy)]
enum TaskName {
    HttpServer,
    StreamProcessor,
}

impl std::fmt::Display for TaskName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskName::HttpServer => write!(f, "HttpServer"),
            TaskName::StreamProcessor => write!(f, "StreamProcessor"),
        }
    }
}

fn init_logging(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

/// Load the config file, then apply CLI overrides and re-validate.
fn resolve_config(args: &CliArgs) -> Result<StreamConfig> {
    let mut config = match &args.config {
        Some(path) => StreamConfig::load_from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => StreamConfig::load(),
    };

    if let Some(stage) = args.stage {
        config.stage.kind = stage.into();
    }
    if let Some(addr) = &args.addr {
        config.server.addr.clone_from(addr);
    }
    if args.no_server {
        config.server.enabled = false;
    }

    config.validate().context("Invalid configuration")?;
    Ok(config)
}

/// Spawn the HTTP server task into the JoinSet.
fn spawn_http_server(
    task_set: &mut JoinSet<Result<TaskName>>,
    listener: tokio::net::TcpListener,
    app: axum::Router,
    cancel_token: CancellationToken,
) {
    task_set.spawn(async move {
        info!("[HttpServer] Task starting");

        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                cancel_token.cancelled().await;
                info!("[HttpServer] Received shutdown signal");
            })
            .await;

        match result {
            Ok(()) => {
                info!("[HttpServer] Graceful shutdown complete");
                Ok(TaskName::HttpServer)
            }
            Err(e) => {
                error!("[HttpServer] Server error: {}", e);
                Err(anyhow::anyhow!("HTTP server error: {}", e))
            }
        }
    });
}

/// Map the loop's final status to the task result the supervisor sees.
fn processor_result(status: SystemStatus) -> Result<TaskName> {
    match status {
        SystemStatus::Error => Err(anyhow::anyhow!(
            "stream processor stopped after a source or sink failure"
        )),
        _ => Ok(TaskName::StreamProcessor),
    }
}

/// Monitor tasks until all finish. A failed task cancels the rest; the
/// processor finishing (source exhausted) also shuts the server down.
async fn run_supervisor(
    task_set: &mut JoinSet<Result<TaskName>>,
    cancel_token: CancellationToken,
) -> Result<()> {
    info!("🔒 Supervisor: All tasks spawned, monitoring...");

    while let Some(result) = task_set.join_next().await {
        match result {
            Ok(Ok(task_name)) => {
                info!("🔒 Supervisor: Task {} completed normally", task_name);
                if matches!(task_name, TaskName::StreamProcessor) {
                    cancel_token.cancel();
                }
            }
            Ok(Err(e)) => {
                error!("🔒 Supervisor: Task failed with error: {:#}", e);
                cancel_token.cancel();
                return Err(e);
            }
            Err(e) => {
                error!("🔒 Supervisor: Task panicked: {}", e);
                cancel_token.cancel();
                return Err(anyhow::anyhow!("Task panicked: {}", e));
            }
        }
    }

    info!("🔒 Supervisor: All tasks completed");
    Ok(())
}

async fn open_source(args: &CliArgs) -> Result<Box<dyn MessageSource>> {
    if let Some(addr) = &args.subscribe_tcp {
        info!("📥 Input: bridge TCP ({})", addr);
        let source = TcpSource::connect(addr)
            .await
            .with_context(|| format!("Failed to connect to {}", addr))?;
        Ok(Box::new(source))
    } else if args.stdin {
        info!("📥 Input: stdin (bridge envelopes)");
        Ok(Box::new(StdinSource::new()))
    } else {
        anyhow::bail!("No input selected: pass --stdin or --subscribe-tcp HOST:PORT")
    }
}

async fn open_sink(args: &CliArgs) -> Result<Box<dyn MessageSink>> {
    if let Some(addr) = &args.publish_tcp {
        info!("📤 Output: bridge TCP ({})", addr);
        let sink = TcpSink::connect(addr)
            .await
            .with_context(|| format!("Failed to connect to {}", addr))?;
        Ok(Box::new(sink))
    } else {
        info!("📤 Output: stdout (bridge envelopes)");
        Ok(Box::new(StdoutSink::new()))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();
    init_logging(args.log_format);

    let config = resolve_config(&args)?;
    let stage = config.stage();

    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    info!("  CP-SENS Stream Processor");
    info!("  Stage: {} | Rewrite: {}", stage.kind, stage.rewrite);
    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    if stage.kind == StageKind::Integrate {
        info!(
            "   Kalman: Q={:e} R={:e} output={} boundary={:?}",
            stage.kalman.process_noise,
            stage.kalman.measurement_noise,
            stage.kalman.output.quantity(),
            stage.kalman.boundary
        );
    }
    info!("   Subscriptions: {}", config.stage.subscribe.join(", "));
    info!("   Retention: {:?}", config.retention_policy());
    info!("");

    // Graceful shutdown via Ctrl+C
    let cancel_token = CancellationToken::new();
    let shutdown_token = cancel_token.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("🛑 Received Ctrl+C, initiating shutdown...");
        shutdown_token.cancel();
    });

    let mut source = open_source(&args).await?;
    let mut sink = open_sink(&args).await?;

    let app_state = Arc::new(RwLock::new(AppState::for_stage(stage.kind)));
    let mut task_set: JoinSet<Result<TaskName>> = JoinSet::new();

    if config.server.enabled {
        let listener = tokio::net::TcpListener::bind(&config.server.addr)
            .await
            .with_context(|| format!("Failed to bind to {}", config.server.addr))?;
        info!("✓ Status API listening on http://{}/api/v1", config.server.addr);
        let app = create_app(DashboardState::new(Arc::clone(&app_state)));
        spawn_http_server(&mut task_set, listener, app, cancel_token.clone());
    } else {
        info!("Status API disabled");
    }

    let sweep_interval = match config.registry.retention {
        RetentionKind::Idle => IDLE_SWEEP_INTERVAL_SECS.min(config.registry.idle_secs),
        _ => IDLE_SWEEP_INTERVAL_SECS,
    };
    let processing_loop = ProcessingLoop::new(
        Dispatcher::from_config(&config),
        Arc::clone(&app_state),
        cancel_token.clone(),
    )
    .with_progress_every(config.bridge.progress_every)
    .with_sweep_interval(Duration::from_secs(sweep_interval));

    let processor_state = Arc::clone(&app_state);
    task_set.spawn(async move {
        info!("[StreamProcessor] Task starting");
        let _stats = processing_loop.run(source.as_mut(), sink.as_mut()).await;
        let status = processor_state.read().await.status;
        processor_result(status)
    });

    run_supervisor(&mut task_set, cancel_token).await
}
